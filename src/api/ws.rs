use crate::error::Result;
use crate::pipeline::broadcast::Broadcaster;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Pause after an accept error that is not about a single aborted connection.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[async_trait]
trait Acceptor: Send {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Accepts WebSocket subscribers; each gets the same event stream as `/api/events`.
pub async fn serve(listener: TcpListener, broadcaster: Arc<Broadcaster>) -> Result<()> {
    info!("WebSocket subscribers on ws://{}", listener.local_addr()?);
    accept_loop(listener, broadcaster).await
}

async fn accept_loop<A: Acceptor>(mut acceptor: A, broadcaster: Arc<Broadcaster>) -> Result<()> {
    loop {
        let (stream, peer) = match acceptor.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                match e.kind() {
                    io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::Interrupted => {
                        debug!("WebSocket accept skipped: {}", e);
                    }
                    // EMFILE and friends: give descriptors a moment to free up.
                    _ => {
                        error!("WebSocket accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
                continue;
            }
        };
        let broadcaster = broadcaster.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_subscriber(stream, peer, broadcaster).await {
                warn!("WebSocket subscriber {} closed with error: {}", peer, e);
            }
        });
    }
}

async fn handle_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    broadcaster: Arc<Broadcaster>,
) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();
    let mut subscription = broadcaster.subscribe();
    debug!(
        "WebSocket {} bound to session {} ({} live)",
        peer,
        subscription.id(),
        broadcaster.len()
    );

    loop {
        tokio::select! {
            frame = subscription.recv() => match frame {
                Some(frame) => write.send(Message::Text(frame.to_string())).await?,
                None => {
                    // Session dropped by the broadcaster.
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => {
                    info!("WebSocket connection closed by {}", peer);
                    broadcaster.unsubscribe(subscription.id());
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    broadcaster.unsubscribe(subscription.id());
                    return Err(e.into());
                }
            },
        }
    }

    Ok(())
}
