use crate::config::MailConfig;
use crate::error::{RateWatchError, Result};
use crate::types::BASE_CURRENCY;
use async_trait::async_trait;
use chrono::Local;
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<()>;
}

/// Posts messages as JSON to an HTTP mail relay.
pub struct HttpMailRelay {
    url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl HttpMailRelay {
    pub fn new(url: String, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { url, token, http })
    }
}

#[async_trait]
impl MailTransport for HttpMailRelay {
    async fn send(&self, message: &MailMessage) -> Result<()> {
        let mut request = self.http.post(&self.url).json(message);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RateWatchError::Notify(format!(
                "mail relay returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

struct Route {
    transport: Arc<dyn MailTransport>,
    sender: String,
    recipient: String,
}

/// Sends threshold alert emails. Never fails: delivery problems come back as `false`.
pub struct Notifier {
    route: Option<Route>,
}

impl Notifier {
    pub fn new(transport: Arc<dyn MailTransport>, sender: String, recipient: String) -> Self {
        Self {
            route: Some(Route {
                transport,
                sender,
                recipient,
            }),
        }
    }

    pub fn disabled() -> Self {
        Self { route: None }
    }

    pub fn from_config(mail: Option<&MailConfig>) -> Result<Self> {
        match mail {
            Some(mail) => {
                let relay = HttpMailRelay::new(mail.relay_url.clone(), mail.relay_token.clone())?;
                Ok(Self::new(Arc::new(relay), mail.sender.clone(), mail.recipient.clone()))
            }
            None => Ok(Self::disabled()),
        }
    }

    pub async fn alert(&self, currency: &str, rate: f64, threshold: f64) -> bool {
        let Some(route) = &self.route else {
            return false;
        };

        let message = MailMessage {
            from: route.sender.clone(),
            to: route.recipient.clone(),
            subject: format!("Currency Alert: {} Rate High!", currency),
            html: alert_body(currency, rate, threshold),
        };

        match route.transport.send(&message).await {
            Ok(()) => {
                info!("Alert email sent for {} ({} > {})", currency, rate, threshold);
                true
            }
            Err(e) => {
                warn!("Error sending alert email for {}: {}", currency, e);
                false
            }
        }
    }
}

fn alert_body(currency: &str, rate: f64, threshold: f64) -> String {
    format!(
        r#"<div style="font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto;">
  <h2 style="color: #dc3545;">Currency Exchange Alert</h2>
  <div style="background: #fff5f5; padding: 20px; border-radius: 5px; border-left: 4px solid #dc3545;">
    <h3 style="color: #dc3545; margin-top: 0;">{currency} Rate Alert</h3>
    <p><strong>Currency:</strong> {currency}</p>
    <p><strong>Current Rate:</strong> <span style="color: #dc3545; font-weight: bold;">{rate} {base}</span></p>
    <p><strong>Threshold:</strong> {threshold} {base}</p>
    <p><strong>Time:</strong> {time}</p>
  </div>
  <p style="color: #666; font-size: 14px; margin-top: 20px;">
    This alert was triggered because the {currency} exchange rate has crossed your defined threshold.
  </p>
</div>"#,
        currency = currency,
        rate = rate,
        threshold = threshold,
        base = BASE_CURRENCY,
        time = Local::now().format("%Y-%m-%d %H:%M:%S"),
    )
}
