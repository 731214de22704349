use crate::error::{RateWatchError, Result};
use crate::pipeline::broadcast::Broadcaster;
use crate::pipeline::ledger::Ledger;
use crate::pipeline::scheduler::Scheduler;
use crate::types::{AlertPayload, Event};
use futures_util::stream;
use hyper::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CACHE_CONTROL, CONNECTION, CONTENT_TYPE, HeaderValue,
};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{error, info};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub ledger: Arc<Ledger>,
    pub broadcaster: Arc<Broadcaster>,
}

pub async fn serve(addr: SocketAddr, state: AppState) -> Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| route(state.clone(), req))) }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!("HTTP server listening on http://{}", addr);
    server.await?;
    Ok(())
}

async fn route(
    state: AppState,
    req: Request<Body>,
) -> std::result::Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/api/current") => current(&state),
        (&Method::GET, "/api/rates/history") => history(&state).await,
        (&Method::GET, "/api/events") => events(&state),
        (&Method::GET, "/api/status") => status(&state),
        (&Method::POST, "/api/fetch-realtime") => {
            fetch(&state, "Rates fetched and real-time data updated successfully").await
        }
        (&Method::POST, "/api/rates/fetch") => {
            fetch(&state, "Rates fetched and stored successfully").await
        }
        (&Method::POST, "/webhook/alert") => webhook_alert(&state),
        (&Method::GET, "/favicon.ico") => empty(StatusCode::NO_CONTENT),
        (&Method::OPTIONS, _) => empty(StatusCode::NO_CONTENT),
        _ => json_response(StatusCode::NOT_FOUND, &json!({ "error": "Not found" })),
    };
    Ok(response)
}

fn current(state: &AppState) -> Response<Body> {
    match state.broadcaster.cache().current() {
        Some(cached) => json_response(
            StatusCode::OK,
            &json!({
                "success": true,
                "data": cached.snapshot,
                "lastUpdate": cached.updated_at,
            }),
        ),
        None => json_response(
            StatusCode::NOT_FOUND,
            &json!({ "error": "No data available yet", "status": "no_data" }),
        ),
    }
}

async fn history(state: &AppState) -> Response<Body> {
    match state.ledger.history().await {
        Ok(entries) => json_response(
            StatusCode::OK,
            &json!({ "success": true, "count": entries.len(), "data": entries }),
        ),
        Err(e) => error_response(e),
    }
}

async fn fetch(state: &AppState, message: &str) -> Response<Body> {
    match state.scheduler.trigger().await {
        Ok(entry) => json_response(StatusCode::OK, &json!({ "message": message, "rates": entry })),
        Err(e) => error_response(e),
    }
}

fn status(state: &AppState) -> Response<Body> {
    json_response(
        StatusCode::OK,
        &json!({
            "stage": state.scheduler.stage().to_string(),
            "subscribers": state.broadcaster.len(),
        }),
    )
}

fn webhook_alert(state: &AppState) -> Response<Body> {
    state
        .broadcaster
        .publish(&Event::alert(AlertPayload::triggered()));
    json_response(
        StatusCode::OK,
        &json!({ "status": "Webhook processed successfully" }),
    )
}

fn events(state: &AppState) -> Response<Body> {
    let subscription = state.broadcaster.subscribe();
    // The subscription lives inside the body; hyper drops it when the client goes away.
    let frames = stream::unfold(subscription, |mut sub| async move {
        let frame = sub.recv().await?;
        Some((Ok::<_, Infallible>(format!("data: {}\n\n", frame)), sub))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .header(CONNECTION, "keep-alive")
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header("X-Accel-Buffering", "no")
        .body(Body::wrap_stream(frames))
        .unwrap_or_else(|e| {
            error!("Failed to build event stream response: {}", e);
            empty(StatusCode::INTERNAL_SERVER_ERROR)
        })
}

fn error_response(err: RateWatchError) -> Response<Body> {
    error!("Request failed: {}", err);
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &json!({ "error": err.to_string() }))
}

fn json_response(status: StatusCode, body: &Value) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    add_cors(headers);
    response
}

fn empty(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    add_cors(response.headers_mut());
    response
}

fn add_cors(headers: &mut hyper::HeaderMap) {
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThresholdConfig;
    use crate::pipeline::alerts::ThresholdEvaluator;
    use crate::pipeline::cache::LatestStateCache;
    use crate::pipeline::fetcher::tests::StaticProvider;
    use crate::pipeline::fetcher::RateFetcher;
    use crate::pipeline::notifier::Notifier;
    use crate::pipeline::scheduler::Pipeline;
    use crate::pipeline::store::MemoryStore;
    use chrono::NaiveTime;
    use hyper::body::HttpBody;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn state(provider: StaticProvider) -> AppState {
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::new(LatestStateCache::new()),
            Duration::from_secs(25),
        ));
        let ledger = Arc::new(Ledger::new(Arc::new(MemoryStore::new())));
        let pipeline = Arc::new(Pipeline::new(
            RateFetcher::new(Arc::new(provider)),
            ThresholdEvaluator::new(Arc::new(Notifier::disabled()), broadcaster.clone()),
            ledger.clone(),
            broadcaster.clone(),
            Arc::new(ThresholdConfig::default()),
        ));
        AppState {
            scheduler: Arc::new(Scheduler::new(pipeline, NaiveTime::from_hms_opt(9, 0, 0).unwrap())),
            ledger,
            broadcaster,
        }
    }

    async fn call(state: &AppState, method: Method, path: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let resp = route(state.clone(), req).await.unwrap();
        let status = resp.status();
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn current_before_any_run_is_no_data() {
        let state = state(StaticProvider::lkr_quotes());
        let (status, body) = call(&state, Method::GET, "/api/current").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            body,
            json!({ "error": "No data available yet", "status": "no_data" })
        );
    }

    #[tokio::test]
    async fn fetch_then_current_and_history() {
        let state = state(StaticProvider::lkr_quotes());

        let (status, body) = call(&state, Method::POST, "/api/fetch-realtime").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rates"]["USD"], json!(330.03));

        let (status, body) = call(&state, Method::GET, "/api/current").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["data"]["EUR"], json!(781.25));
        assert!(body["lastUpdate"].is_string());

        call(&state, Method::POST, "/api/rates/fetch").await;
        let (status, body) = call(&state, Method::GET, "/api/rates/history").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], json!(2));
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn provider_failure_is_an_error_payload() {
        let state = state(StaticProvider::failing());
        let (status, body) = call(&state, Method::POST, "/api/fetch-realtime").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn webhook_alert_reaches_subscribers() {
        let state = state(StaticProvider::lkr_quotes());
        let mut sub = state.broadcaster.subscribe();
        sub.recv().await.unwrap();

        let (status, body) = call(&state, Method::POST, "/webhook/alert").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("Webhook processed successfully"));

        let frame: Value = serde_json::from_str(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], json!("alert"));
        assert_eq!(frame["data"]["message"], json!("Threshold alert triggered"));
    }

    #[tokio::test]
    async fn event_stream_opens_with_connected() {
        let state = state(StaticProvider::lkr_quotes());
        let req = Request::builder()
            .uri("/api/events")
            .body(Body::empty())
            .unwrap();
        let resp = route(state.clone(), req).await.unwrap();
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/event-stream");
        assert_eq!(state.broadcaster.len(), 1);

        let mut body = resp.into_body();
        let chunk = body.data().await.unwrap().unwrap();
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        assert!(text.starts_with("data: "));
        assert!(text.ends_with("\n\n"));
        assert!(text.contains("\"type\":\"connected\""));

        drop(body);
        assert_eq!(state.broadcaster.len(), 0);
    }

    #[tokio::test]
    async fn status_reports_stage_and_subscribers() {
        let state = state(StaticProvider::lkr_quotes());
        let _sub = state.broadcaster.subscribe();
        let (status, body) = call(&state, Method::GET, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "stage": "idle", "subscribers": 1 }));
    }

    #[tokio::test]
    async fn unknown_route_and_favicon() {
        let state = state(StaticProvider::lkr_quotes());
        let (status, body) = call(&state, Method::GET, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "error": "Not found" }));

        let (status, _) = call(&state, Method::GET, "/favicon.ico").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}
