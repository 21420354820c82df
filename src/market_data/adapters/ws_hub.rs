// Streaming hub transport over a single websocket connection

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch, OnceCell};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, trace, warn};

use super::hub_types::OutboundCall;
use super::Transport;
use crate::error::{SyncError, SyncResult};
use crate::market_data::decoder::{decode_frame, HubMessage};
use crate::market_data::router::DeltaRouter;

pub const DEFAULT_WS_URL: &str = "wss://socket.bittrex.com/signalr";

#[derive(Debug, Clone, Default)]
pub struct HubHeaders {
    pub user_agent: Option<String>,
    pub cookie: Option<String>,
}

/// Lifecycle of the single hub connection. There is no reconnect, so `Lost`
/// is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connected,
    Lost,
}

type Reply = oneshot::Sender<Result<Value, String>>;

// `closed` flips under the same lock that registers calls, so no call can
// slip in after the reader has given up.
#[derive(Default)]
struct PendingCalls {
    calls: AHashMap<u64, Reply>,
    closed: bool,
}

type SharedPending = Arc<Mutex<PendingCalls>>;

/// What the reader task needs to hand frames off.
#[derive(Clone)]
struct Inbound {
    pending: SharedPending,
    router: Arc<DeltaRouter>,
    messages: broadcast::Sender<HubMessage>,
    link: Arc<watch::Sender<LinkState>>,
}

struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Hub transport over tokio-tungstenite.
///
/// Calls are correlated with their replies by invocation id. Pushed exchange
/// deltas go straight to the [`DeltaRouter`]; every other pushed message is
/// rebroadcast on [`WsHubTransport::messages`]. When the socket goes away the
/// transport turns [`LinkState::Lost`], fails every call in flight and later
/// ones, broadcasts [`HubMessage::Disconnected`] and marks every routed
/// engine stale.
pub struct WsHubTransport {
    url: String,
    headers: HubHeaders,
    inbound: Inbound,
    connection: OnceCell<Connection>,
    next_id: AtomicU64,
}

impl WsHubTransport {
    pub fn new(url: &str, headers: HubHeaders, router: Arc<DeltaRouter>) -> Self {
        let (messages, _) = broadcast::channel(256);
        let (link, _) = watch::channel(LinkState::Idle);
        Self {
            url: url.to_string(),
            headers,
            inbound: Inbound { pending: SharedPending::default(), router, messages, link: Arc::new(link) },
            connection: OnceCell::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Summary and other non-delta pushes, plus the final `Disconnected`.
    pub fn messages(&self) -> broadcast::Receiver<HubMessage> {
        self.inbound.messages.subscribe()
    }

    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.inbound.link.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.inbound.link.borrow() == LinkState::Connected
    }

    #[instrument(skip(self), fields(url = %self.url))]
    async fn open(&self) -> SyncResult<Connection> {
        let mut request = self.url.as_str().into_client_request().map_err(SyncError::transport)?;
        if let Some(agent) = &self.headers.user_agent {
            request.headers_mut().insert(USER_AGENT, HeaderValue::from_str(agent).map_err(SyncError::transport)?);
        }
        if let Some(cookie) = &self.headers.cookie {
            request.headers_mut().insert(COOKIE, HeaderValue::from_str(cookie).map_err(SyncError::transport)?);
        }

        let (ws_stream, response) = tokio_tungstenite::connect_async(request).await.map_err(|e| {
            error!(error = %e, "Failed to connect to hub");
            SyncError::transport(e)
        })?;
        info!(status = %response.status(), "Connected to hub");

        let (mut write, read) = ws_stream.split();
        let (outbound, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    warn!(error = %e, "Failed to write to hub socket");
                    break;
                }
            }
        });

        // before the reader starts, so a fast `Lost` is never overwritten
        self.inbound.link.send_replace(LinkState::Connected);
        let reader = tokio::spawn(read_loop(read, self.inbound.clone()));

        Ok(Connection { outbound, reader, writer })
    }
}

async fn read_loop<S>(mut read: S, inbound: Inbound)
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let reason = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => handle_text(&text, &inbound),
            Some(Ok(Message::Close(frame))) => {
                info!(?frame, "Hub connection closed by server");
                break match frame {
                    Some(frame) if !frame.reason.is_empty() => format!("closed by server: {}", frame.reason),
                    _ => "closed by server".to_string(),
                };
            }
            Some(Ok(other)) => trace!(?other, "Ignoring non-text frame"),
            Some(Err(e)) => {
                error!(error = %e, "Error reading from hub socket");
                break e.to_string();
            }
            None => break "stream ended".to_string(),
        }
    };
    connection_lost(&inbound, reason);
}

fn connection_lost(inbound: &Inbound, reason: String) {
    let abandoned = {
        let mut pending = inbound.pending.lock();
        pending.closed = true;
        std::mem::take(&mut pending.calls)
    };
    // dropping the senders fails every call still waiting for a reply
    if !abandoned.is_empty() {
        warn!(calls = abandoned.len(), "Connection lost with calls in flight");
    }
    drop(abandoned);

    let engines = inbound.router.disconnect_all(SyncError::Transport(format!("hub connection lost: {reason}")));
    warn!(%reason, engines, "Hub connection lost");
    let _ = inbound.messages.send(HubMessage::Disconnected { reason });
    inbound.link.send_replace(LinkState::Lost);
}

fn handle_text(text: &str, inbound: &Inbound) {
    let decoded = match decode_frame(text) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(error = %e, "Dropping malformed hub frame");
            metrics::counter!("lobx_frames_malformed_total").increment(1);
            return;
        }
    };

    for message in decoded {
        match message {
            HubMessage::Response { id, result } => {
                let reply = inbound.pending.lock().calls.remove(&id);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => debug!(id, "Response for unknown invocation"),
                }
            }
            HubMessage::ExchangeDelta(delta) => {
                let market = delta.market.clone();
                let delivered = inbound.router.dispatch(delta);
                trace!(%market, delivered, "Routed exchange delta");
            }
            HubMessage::Malformed { market, error } => {
                warn!(?market, error = %error, "Dropping undecodable hub message");
                metrics::counter!("lobx_frames_malformed_total").increment(1);
                if let Some(market) = market {
                    inbound.router.report(&market, error);
                }
            }
            other => {
                let _ = inbound.messages.send(other);
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for WsHubTransport {
    /// Connects once. After the link is lost this keeps failing.
    async fn connect(&self) -> SyncResult<()> {
        self.connection.get_or_try_init(|| self.open()).await?;
        if self.inbound.pending.lock().closed {
            return Err(SyncError::Transport("hub connection closed".into()));
        }
        Ok(())
    }

    async fn call(&self, hub: &str, method: &str, args: Vec<Value>) -> SyncResult<Value> {
        let connection = self.connection.get().ok_or(SyncError::NotConnected)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_string(&OutboundCall {
            hub,
            method,
            args: &args,
            invocation_id: id.to_string(),
        })?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inbound.pending.lock();
            if pending.closed {
                return Err(SyncError::Transport("hub connection closed".into()));
            }
            pending.calls.insert(id, tx);
        }
        debug!(id, hub, method, "Invoking hub method");

        if connection.outbound.send(Message::Text(frame)).is_err() {
            self.inbound.pending.lock().calls.remove(&id);
            return Err(SyncError::Transport("hub connection closed".into()));
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(SyncError::Transport(format!("{method} failed: {message}"))),
            Err(_) => Err(SyncError::Transport(format!("connection lost before {method} replied"))),
        }
    }
}
