//! STOMP 1.2 over a WebSocket.
//!
//! DESIGN
//! ======
//! A background task owns the socket. Callers talk to it through an
//! unbounded command channel, so publish and subscribe never wait on I/O.
//! The subscription registry lives outside the task so inbound MESSAGE
//! frames can be routed by their `subscription` header, and so the task can
//! replay every live SUBSCRIBE after a reconnect (STOMP subscriptions are
//! scoped to one connection).
//!
//! LIFECYCLE
//! =========
//! 1. `activate` spawns the task and waits on a oneshot for the first outcome
//! 2. Task: socket connect → CONNECT (bearer token, heart-beat) → CONNECTED
//! 3. SUBSCRIBE every registered subscription, then relay until the socket drops
//! 4. Drop → sleep `reconnect_delay` → step 2 with the same credential
//! 5. `deactivate` → DISCONNECT, close, task exits

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::{FrameHandler, LinkState, RawSubscription, Transport, TransportError};
use crate::auth::bearer_header;
use crate::config::ChatConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `deactivate` waits for a clean DISCONNECT before aborting the task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

enum ConnCmd {
    Send(stomp::Frame),
    Subscribe(String),
    Unsubscribe(String),
    Shutdown,
}

enum Exit {
    Shutdown,
    Dropped(String),
}

struct SubEntry {
    destination: String,
    handler: FrameHandler,
}

struct Running {
    cmd_tx: mpsc::UnboundedSender<ConnCmd>,
    task: JoinHandle<()>,
}

/// [`Transport`] over `tokio-tungstenite`.
pub struct WsTransport {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: String,
    host: String,
    reconnect_delay: Duration,
    heartbeat: Duration,
    subs: Mutex<HashMap<String, SubEntry>>,
    next_id: AtomicU64,
    link: watch::Sender<LinkState>,
    running: Mutex<Option<Running>>,
    activation: tokio::sync::Mutex<()>,
}

// =============================================================================
// CONSTRUCTION
// =============================================================================

impl WsTransport {
    /// Transport for the broker endpoint described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidEndpoint`] if the configured URL has
    /// no usable scheme or host.
    pub fn new(config: &ChatConfig) -> Result<Self, TransportError> {
        let endpoint = config
            .ws_endpoint()
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        Self::with_endpoint(endpoint, config.reconnect_delay, config.heartbeat)
    }

    /// Transport for an explicit `ws://` or `wss://` URL.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidEndpoint`] if no host can be read
    /// from `endpoint`.
    pub fn with_endpoint(
        endpoint: impl Into<String>,
        reconnect_delay: Duration,
        heartbeat: Duration,
    ) -> Result<Self, TransportError> {
        let endpoint = endpoint.into();
        let host = host_of(&endpoint).ok_or_else(|| TransportError::InvalidEndpoint(endpoint.clone()))?;
        let (link, _) = watch::channel(LinkState::Down);
        Ok(Self {
            inner: Arc::new(Inner {
                endpoint,
                host,
                reconnect_delay,
                heartbeat,
                subs: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                link,
                running: Mutex::new(None),
                activation: tokio::sync::Mutex::new(()),
            }),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }
}

fn host_of(endpoint: &str) -> Option<String> {
    let rest = endpoint
        .strip_prefix("ws://")
        .or_else(|| endpoint.strip_prefix("wss://"))?;
    let authority = rest.split('/').next().unwrap_or_default();
    let host = if authority.ends_with(']') {
        authority
    } else {
        authority.rsplit_once(':').map_or(authority, |(host, _)| host)
    };
    if host.is_empty() {
        return None;
    }
    Some(host.to_owned())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// TRANSPORT
// =============================================================================

#[async_trait]
impl Transport for WsTransport {
    async fn activate(&self, credential: &str) -> Result<(), TransportError> {
        let _guard = self.inner.activation.lock().await;
        if self.inner.is_running() {
            return Ok(());
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(connection_task(
            Arc::clone(&self.inner),
            credential.to_owned(),
            cmd_rx,
            ready_tx,
        ));
        // Registered before the handshake so subscriptions made while
        // connecting reach the task.
        *lock(&self.inner.running) = Some(Running { cmd_tx, task });

        let outcome = ready_rx.await.unwrap_or(Err(TransportError::Closed));
        if outcome.is_err() {
            lock(&self.inner.running).take();
        }
        outcome
    }

    async fn deactivate(&self) {
        let _guard = self.inner.activation.lock().await;
        let running = lock(&self.inner.running).take();
        lock(&self.inner.subs).clear();

        if let Some(Running { cmd_tx, mut task }) = running {
            let _ = cmd_tx.send(ConnCmd::Shutdown);
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!(endpoint = %self.inner.endpoint, "transport: shutdown timed out; aborting");
                task.abort();
            }
        }
        self.inner.link.send_replace(LinkState::Down);
    }

    fn publish(&self, destination: &str, body: &serde_json::Value) -> Result<(), TransportError> {
        let json = serde_json::to_string(body)?;
        self.inner.command(ConnCmd::Send(stomp::send_frame(destination, json)))
    }

    fn subscribe_raw(&self, destination: &str, on_frame: FrameHandler) -> RawSubscription {
        let id = format!("sub-{}", self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.subs).insert(
            id.clone(),
            SubEntry { destination: destination.to_owned(), handler: on_frame },
        );
        // Not running: the registry entry is replayed on the next connect.
        let _ = self.inner.command(ConnCmd::Subscribe(id.clone()));
        debug!(%id, %destination, "transport: subscribe");
        RawSubscription { id, destination: destination.to_owned() }
    }

    fn unsubscribe_raw(&self, subscription: &RawSubscription) {
        if lock(&self.inner.subs).remove(&subscription.id).is_none() {
            return;
        }
        let _ = self.inner.command(ConnCmd::Unsubscribe(subscription.id.clone()));
        debug!(id = %subscription.id, destination = %subscription.destination, "transport: unsubscribe");
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.inner.link.subscribe()
    }
}

impl Inner {
    fn is_running(&self) -> bool {
        lock(&self.running).as_ref().is_some_and(|r| !r.task.is_finished())
    }

    fn command(&self, cmd: ConnCmd) -> Result<(), TransportError> {
        let running = lock(&self.running);
        let Some(running) = running.as_ref() else {
            return Err(TransportError::Closed);
        };
        running.cmd_tx.send(cmd).map_err(|_| TransportError::Closed)
    }

    fn destination_of(&self, id: &str) -> Option<String> {
        lock(&self.subs).get(id).map(|e| e.destination.clone())
    }

    fn set_link(&self, state: LinkState) {
        self.link.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    /// Route one inbound text message. Handlers run outside the registry lock.
    fn dispatch(&self, text: &str) {
        if stomp::is_heartbeat(text) {
            return;
        }
        let frame = match stomp::decode_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "transport: undecodable frame");
                return;
            }
        };

        match frame.command {
            stomp::Command::Message => {
                let Some(sub_id) = frame.header(stomp::HEADER_SUBSCRIPTION) else {
                    warn!("transport: MESSAGE without subscription header");
                    return;
                };
                let handler = lock(&self.subs).get(sub_id).map(|e| Arc::clone(&e.handler));
                match handler {
                    Some(handler) => handler(&frame.body),
                    None => debug!(%sub_id, "transport: message for released subscription"),
                }
            }
            stomp::Command::Error => {
                let message = frame.header(stomp::HEADER_MESSAGE).unwrap_or(frame.body.as_str());
                warn!(%message, "transport: broker error frame");
            }
            other => debug!(command = %other, "transport: ignoring frame"),
        }
    }
}

// =============================================================================
// CONNECTION TASK
// =============================================================================

async fn connection_task(
    inner: Arc<Inner>,
    credential: String,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
    ready_tx: oneshot::Sender<Result<(), TransportError>>,
) {
    let mut ready_tx = Some(ready_tx);

    loop {
        inner.set_link(LinkState::Connecting);
        match establish(&inner, &credential).await {
            Ok((mut stream, heartbeat)) => {
                let mut active = HashSet::new();
                if let Err(e) = resubscribe_all(&inner, &mut stream, &mut active).await {
                    warn!(error = %e, "transport: resubscribe failed");
                } else {
                    inner.set_link(LinkState::Up);
                    match ready_tx.take() {
                        Some(tx) => {
                            info!(endpoint = %inner.endpoint, "transport: connected");
                            let _ = tx.send(Ok(()));
                        }
                        None => info!(endpoint = %inner.endpoint, subscriptions = active.len(), "transport: reconnected"),
                    }

                    match run_connection(&inner, &mut stream, &mut cmd_rx, &mut active, heartbeat).await {
                        Exit::Shutdown => {
                            let _ = send_frame(&mut stream, &stomp::disconnect_frame()).await;
                            let _ = stream.close(None).await;
                            inner.set_link(LinkState::Down);
                            info!(endpoint = %inner.endpoint, "transport: disconnected");
                            return;
                        }
                        Exit::Dropped(reason) => {
                            warn!(%reason, delay = ?inner.reconnect_delay, "transport: connection lost");
                        }
                    }
                }
            }
            Err(e) => {
                if let Some(tx) = ready_tx.take() {
                    warn!(endpoint = %inner.endpoint, error = %e, "transport: connect failed");
                    inner.set_link(LinkState::Down);
                    let _ = tx.send(Err(e));
                    return;
                }
                warn!(error = %e, delay = ?inner.reconnect_delay, "transport: reconnect attempt failed");
            }
        }

        inner.set_link(LinkState::Down);
        if !wait_before_retry(&inner, &mut cmd_rx).await {
            return;
        }
    }
}

/// Sleep out the retry delay, draining commands. Returns false on shutdown.
async fn wait_before_retry(inner: &Inner, cmd_rx: &mut mpsc::UnboundedReceiver<ConnCmd>) -> bool {
    let sleep = tokio::time::sleep(inner.reconnect_delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            () = &mut sleep => return true,
            cmd = cmd_rx.recv() => match cmd {
                Some(ConnCmd::Shutdown) | None => return false,
                Some(ConnCmd::Send(frame)) => {
                    debug!(destination = frame.header(stomp::HEADER_DESTINATION).unwrap_or_default(), "transport: dropping frame while reconnecting");
                }
                // The registry is replayed on reconnect.
                Some(ConnCmd::Subscribe(_) | ConnCmd::Unsubscribe(_)) => {}
            },
        }
    }
}

/// Open the socket and complete the STOMP handshake. Returns the stream and
/// the negotiated outgoing heart-beat period (zero when disabled).
async fn establish(inner: &Inner, credential: &str) -> Result<(WsStream, Duration), TransportError> {
    let (mut stream, _) = connect_async(inner.endpoint.as_str()).await?;

    let authorization = bearer_header(credential);
    let heartbeat_ms = u64::try_from(inner.heartbeat.as_millis()).unwrap_or(u64::MAX);
    let connect = stomp::connect_frame(&inner.host, Some(&authorization), (heartbeat_ms, 0));
    send_frame(&mut stream, &connect).await?;

    loop {
        let Some(message) = stream.next().await else {
            return Err(TransportError::Handshake { message: "connection closed during handshake".to_owned() });
        };
        let text = match message? {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Close(_) => {
                return Err(TransportError::Handshake { message: "connection closed during handshake".to_owned() });
            }
            _ => continue,
        };
        if stomp::is_heartbeat(&text) {
            continue;
        }

        let frame = stomp::decode_frame(&text).map_err(|e| TransportError::Handshake { message: e.to_string() })?;
        match frame.command {
            stomp::Command::Connected => {
                let (_, server_wants) = frame
                    .header(stomp::HEADER_HEART_BEAT)
                    .and_then(stomp::parse_heartbeat)
                    .unwrap_or((0, 0));
                let heartbeat = if heartbeat_ms == 0 || server_wants == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(heartbeat_ms.max(server_wants))
                };
                return Ok((stream, heartbeat));
            }
            stomp::Command::Error => {
                let message = frame
                    .header(stomp::HEADER_MESSAGE)
                    .map_or_else(|| frame.body.trim().to_owned(), ToOwned::to_owned);
                return Err(TransportError::Handshake { message });
            }
            other => debug!(command = %other, "transport: frame before CONNECTED ignored"),
        }
    }
}

async fn resubscribe_all(
    inner: &Inner,
    stream: &mut WsStream,
    active: &mut HashSet<String>,
) -> Result<(), TransportError> {
    let entries: Vec<(String, String)> = lock(&inner.subs)
        .iter()
        .map(|(id, e)| (id.clone(), e.destination.clone()))
        .collect();
    for (id, destination) in entries {
        send_frame(stream, &stomp::subscribe_frame(&id, &destination)).await?;
        active.insert(id);
    }
    Ok(())
}

async fn run_connection(
    inner: &Inner,
    stream: &mut WsStream,
    cmd_rx: &mut mpsc::UnboundedReceiver<ConnCmd>,
    active: &mut HashSet<String>,
    heartbeat: Duration,
) -> Exit {
    let heartbeat_enabled = !heartbeat.is_zero();
    let period = if heartbeat_enabled { heartbeat } else { Duration::from_secs(3600) };
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else {
                    return Exit::Dropped("stream ended".to_owned());
                };
                match msg {
                    Ok(Message::Text(text)) => inner.dispatch(text.as_str()),
                    Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                        Ok(text) => inner.dispatch(text),
                        Err(_) => warn!("transport: non-utf8 binary frame"),
                    },
                    Ok(Message::Close(_)) => return Exit::Dropped("closed by broker".to_owned()),
                    Ok(_) => {}
                    Err(e) => return Exit::Dropped(e.to_string()),
                }
            }
            cmd = cmd_rx.recv() => {
                let frame = match cmd {
                    Some(ConnCmd::Shutdown) | None => return Exit::Shutdown,
                    Some(ConnCmd::Send(frame)) => frame,
                    Some(ConnCmd::Subscribe(id)) => {
                        let Some(destination) = inner.destination_of(&id) else { continue };
                        if !active.insert(id.clone()) {
                            continue;
                        }
                        stomp::subscribe_frame(&id, &destination)
                    }
                    Some(ConnCmd::Unsubscribe(id)) => {
                        if !active.remove(&id) {
                            continue;
                        }
                        stomp::unsubscribe_frame(&id)
                    }
                };
                if let Err(e) = send_frame(stream, &frame).await {
                    return Exit::Dropped(e.to_string());
                }
            }
            _ = ticker.tick(), if heartbeat_enabled => {
                if let Err(e) = stream.send(Message::text("\n")).await {
                    return Exit::Dropped(e.to_string());
                }
            }
        }
    }
}

async fn send_frame(stream: &mut WsStream, frame: &stomp::Frame) -> Result<(), TransportError> {
    stream.send(Message::text(stomp::encode_frame(frame))).await?;
    Ok(())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
