//! Singleton network listener.
//!
//! One HTTP+WebSocket listener per daemon process, bound on localhost.
//! Concurrent `start()` calls share a single in-flight bind via a cached
//! shared future — never a second socket. Plain HTTP serves `/health` and
//! `/debug/agents`; WebSocket upgrades are accepted unconditionally and
//! handed to the protocol handler. A bind failure is logged and cached as
//! "no listener" — the daemon keeps running.

use crate::protocol::{OutboundSender, ProtocolHandler};
use crate::AppContext;
use anyhow::Result;
use futures_util::future::{BoxFuture, Shared};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

enum ListenerState {
    NotStarted,
    Starting(Shared<BoxFuture<'static, Option<u16>>>),
    Started(Option<u16>),
}

pub struct Listener {
    ctx: Arc<AppContext>,
    handler: Arc<ProtocolHandler>,
    state: Mutex<ListenerState>,
}

impl Listener {
    pub fn new(ctx: Arc<AppContext>) -> Arc<Self> {
        let handler = Arc::new(ProtocolHandler::new(Arc::clone(&ctx.spawner)));
        Arc::new(Self {
            ctx,
            handler,
            state: Mutex::new(ListenerState::NotStarted),
        })
    }

    /// Bind the listener, or return the cached outcome.
    ///
    /// Callers racing through `Starting` await the same in-flight bind;
    /// once resolved the port (or `None` after a bind failure) is cached
    /// and no rebind is attempted.
    pub async fn start(self: &Arc<Self>) -> Option<u16> {
        let pending = {
            let mut state = self.state.lock().await;
            let current = std::mem::replace(&mut *state, ListenerState::NotStarted);
            match current {
                ListenerState::Started(port) => {
                    *state = ListenerState::Started(port);
                    return port;
                }
                ListenerState::Starting(fut) => {
                    *state = ListenerState::Starting(fut.clone());
                    fut
                }
                ListenerState::NotStarted => {
                    let this = Arc::clone(self);
                    let fut = async move { this.bind_and_serve().await }.boxed().shared();
                    *state = ListenerState::Starting(fut.clone());
                    fut
                }
            }
        };

        let port = pending.await;
        *self.state.lock().await = ListenerState::Started(port);
        port
    }

    async fn bind_and_serve(self: Arc<Self>) -> Option<u16> {
        let addr = format!("127.0.0.1:{}", self.ctx.config.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                // No retry, no fallback port — the daemon runs without a listener.
                error!(addr = %addr, err = %e, "failed to bind listener");
                return None;
            }
        };
        let port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.ctx.config.port);
        info!(port, "listener bound (WebSocket + HTTP health on same port)");

        let this = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new connection");
                let this = Arc::clone(&this);
                tokio::spawn(async move {
                    if let Err(e) = this.handle_connection(stream).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        });

        Some(port)
    }

    /// Route one accepted connection: WebSocket upgrade, health/debug HTTP,
    /// or 404. Both protocols share the single port, so we peek at the
    /// request head without consuming it.
    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let mut peek_buf = [0u8; 2048];
        let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
        let head = String::from_utf8_lossy(&peek_buf[..n]).to_string();

        if head.to_ascii_lowercase().contains("upgrade: websocket") {
            return self.websocket_session(stream).await;
        }
        if head.starts_with("GET /health") {
            let body = json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "uptime": self.ctx.started_at.elapsed().as_secs(),
            });
            return respond_json(stream, "200 OK", &body).await;
        }
        if head.starts_with("GET /debug/agents") {
            let agents = self.ctx.spawner.list_agents().await;
            let count = agents.len();
            let body = json!({
                "agents": agents,
                "count": count,
                "uptime": self.ctx.started_at.elapsed().as_secs(),
            });
            return respond_json(stream, "200 OK", &body).await;
        }

        respond_json(stream, "404 Not Found", &json!({ "error": "not found" })).await
    }

    async fn websocket_session(&self, stream: TcpStream) -> Result<()> {
        let ws = accept_async(stream).await?;
        let (mut sink, mut stream) = ws.split();

        // Outbound frames funnel through one writer task; once the socket
        // is gone the channel closes and later sends become no-ops.
        let (out, mut rx) = OutboundSender::channel();
        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => self.handler.handle_frame(&text, &out).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(err = %e, "websocket read ended");
                    break;
                }
            }
        }

        writer.abort();
        Ok(())
    }
}

async fn respond_json(mut stream: TcpStream, status: &str, body: &Value) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Consume the request — routing already happened on the peeked head.
    let mut req_buf = vec![0u8; 2048];
    let _ = stream.read(&mut req_buf).await;

    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body_str.len(),
        body_str
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
