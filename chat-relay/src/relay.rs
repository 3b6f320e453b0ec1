use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    net::TcpListener,
    select,
    sync::{Mutex, broadcast, watch},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::message::Envelope;

pub type SessionId = u64;

/// Default number of frames buffered per session before it starts lagging.
pub const DEFAULT_CAPACITY: usize = 128;

/// Upper bound on the per-session buffer. The channel preallocates every slot,
/// and tokio rejects anything above `usize::MAX >> 1` outright.
pub const MAX_CAPACITY: usize = 1 << 16;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5000)),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl Relay {
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self::new(listener, config.capacity))
    }

    pub fn new(listener: TcpListener, capacity: usize) -> Self {
        Self {
            listener,
            state: Arc::new(RelayState::new(capacity)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    /// Serves sessions until `shutdown` resolves, then asks every open session
    /// to close.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Relay { listener, state } = self;
        let app = router(Arc::clone(&state));

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            handle_shutdown(&state);
        })
        .await
        .context("relay server failed")?;

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_shutdown(state: &RelayState) {
    info!("relay shutting down");
    state.shutdown.send_replace(true);
}

/// Routes served by the relay: the WebSocket endpoint and a health probe,
/// open to every origin.
pub fn router(state: Arc<RelayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

pub struct RelayState {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
    broadcaster: broadcast::Sender<String>,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
struct SessionRecord {
    peer: SocketAddr,
}

impl RelayState {
    pub fn new(capacity: usize) -> Self {
        let (broadcaster, _) = broadcast::channel(capacity.clamp(1, MAX_CAPACITY));
        let (shutdown, _) = watch::channel(false);
        Self {
            sessions: Mutex::new(HashMap::new()),
            broadcaster,
            next_id: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Queues `frame` for every subscribed session, sender included, and
    /// returns how many sessions it was queued for.
    pub fn broadcast(&self, frame: String) -> usize {
        match self.broadcaster.send(frame) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("no sessions connected; dropping frame");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.broadcaster.subscribe()
    }

    pub async fn connected(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn register_session(&self, peer: SocketAddr) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().await.insert(id, SessionRecord { peer });
        id
    }

    async fn remove_session(&self, id: SessionId) -> Option<SessionRecord> {
        self.sessions.lock().await.remove(&id)
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<RelayState>>,
) -> Response {
    // Subscribe before the upgrade response goes out so nothing broadcast
    // after the client's handshake completes can be missed.
    let inbox = state.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, peer, inbox, state))
}

async fn handle_socket(
    socket: WebSocket,
    peer: SocketAddr,
    mut inbox: broadcast::Receiver<String>,
    state: Arc<RelayState>,
) {
    let session = state.register_session(peer).await;
    info!(session, %peer, "connection");

    let (mut sender, mut receiver) = socket.split();
    if let Err(error) = run_session(&state, session, &mut sender, &mut receiver, &mut inbox).await
    {
        debug!(session, ?error, "session ended with error");
    }

    cleanup_session(&state, session).await;
}

async fn run_session(
    state: &RelayState,
    session: SessionId,
    sender: &mut SplitSink<WebSocket, WsMessage>,
    receiver: &mut SplitStream<WebSocket>,
    inbox: &mut broadcast::Receiver<String>,
) -> Result<()> {
    let mut shutdown = state.shutdown.subscribe();
    let stopping = *shutdown.borrow();
    if stopping {
        let _ = sender.send(WsMessage::Close(None)).await;
        return Ok(());
    }

    loop {
        select! {
            frame = receiver.next() => {
                if !handle_client_frame(frame, state, session)? {
                    break;
                }
            }
            outbound = inbox.recv() => {
                if !handle_broadcast_frame(outbound, sender, session).await? {
                    break;
                }
            }
            _ = shutdown.changed() => {
                let _ = sender.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }

    Ok(())
}

fn handle_client_frame(
    frame: Option<Result<WsMessage, axum::Error>>,
    state: &RelayState,
    session: SessionId,
) -> Result<bool> {
    match frame {
        Some(Ok(WsMessage::Text(text))) => {
            dispatch_frame(state, session, text);
            Ok(true)
        }
        Some(Ok(WsMessage::Close(_))) | None => Ok(false),
        // Pings are answered by the socket itself; binary frames carry no events.
        Some(Ok(_)) => Ok(true),
        Some(Err(err)) => Err(err).context("failed to read from session"),
    }
}

/// Rebroadcasts `message` events verbatim. Anything else is dropped.
fn dispatch_frame(state: &RelayState, session: SessionId, text: String) {
    match Envelope::decode(&text) {
        Ok(envelope) if envelope.is_message() => {
            let receivers = state.broadcast(text);
            debug!(session, receivers, "relayed message");
        }
        Ok(envelope) => {
            debug!(session, event = %envelope.event, "ignoring event");
        }
        Err(error) => {
            debug!(session, ?error, "dropping undecodable frame");
        }
    }
}

async fn handle_broadcast_frame(
    outbound: Result<String, broadcast::error::RecvError>,
    sender: &mut SplitSink<WebSocket, WsMessage>,
    session: SessionId,
) -> Result<bool> {
    match outbound {
        Ok(frame) => {
            if let Err(err) = sender.send(WsMessage::Text(frame)).await {
                debug!(session, ?err, "failed to deliver frame to session");
                return Ok(false);
            }
            Ok(true)
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(session, skipped, "session lagged behind; frames dropped");
            Ok(true)
        }
        Err(broadcast::error::RecvError::Closed) => Ok(false),
    }
}

async fn cleanup_session(state: &RelayState, session: SessionId) {
    if let Some(SessionRecord { peer }) = state.remove_session(session).await {
        info!(session, %peer, "disconnect");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::util::ServiceExt;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    #[tokio::test]
    async fn broadcast_delivers_to_multiple_sessions() {
        let state = RelayState::new(DEFAULT_CAPACITY);
        let mut rx_one = state.subscribe();
        let mut rx_two = state.subscribe();

        let queued = state.broadcast(r#"{"event":"message","data":"hi"}"#.into());
        assert_eq!(queued, 2);

        let first = rx_one.recv().await.expect("first receiver");
        let second = rx_two.recv().await.expect("second receiver");
        assert_eq!(first, r#"{"event":"message","data":"hi"}"#);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn oversized_capacity_is_clamped() {
        let state = RelayState::new(usize::MAX);
        let mut rx = state.subscribe();
        assert_eq!(state.broadcast("{}".into()), 1);
        assert_eq!(rx.recv().await.expect("frame"), "{}");
    }

    #[tokio::test]
    async fn broadcast_without_sessions_is_not_an_error() {
        let state = RelayState::new(DEFAULT_CAPACITY);
        assert_eq!(state.broadcast("{}".into()), 0);
    }

    #[tokio::test]
    async fn sessions_get_sequential_ids_and_are_removed() {
        let state = RelayState::new(DEFAULT_CAPACITY);
        let first = state.register_session(peer()).await;
        let second = state.register_session(peer()).await;
        assert_eq!((first, second), (1, 2));
        assert_eq!(state.connected().await, 2);

        assert!(state.remove_session(first).await.is_some());
        assert!(state.remove_session(first).await.is_none());
        assert_eq!(state.connected().await, 1);
    }

    #[tokio::test]
    async fn dispatch_forwards_message_frames_verbatim() {
        let state = RelayState::new(DEFAULT_CAPACITY);
        let mut rx = state.subscribe();
        let frame = r#"{"event":"message","data":{"z":1,"a":[true,null]},"extra":"kept"}"#;

        dispatch_frame(&state, 1, frame.to_string());
        assert_eq!(rx.recv().await.expect("relayed frame"), frame);
    }

    #[tokio::test]
    async fn dispatch_drops_other_events_and_garbage() {
        let state = RelayState::new(DEFAULT_CAPACITY);
        let mut rx = state.subscribe();

        dispatch_frame(&state, 1, r#"{"event":"typing","data":{}}"#.into());
        dispatch_frame(&state, 1, "definitely not json".into());
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn late_session_is_closed_when_already_shutting_down() {
        use tokio_tungstenite::{connect_async, tungstenite::Message as ClientMessage};

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(RelayState::new(DEFAULT_CAPACITY));
        handle_shutdown(&state);

        let app = router(Arc::clone(&state));
        tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });

        let (mut socket, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect");
        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), socket.next())
            .await
            .expect("relay answers")
            .expect("frame")
            .expect("valid frame");
        assert!(matches!(frame, ClientMessage::Close(_)), "got {frame:?}");
    }

    #[tokio::test]
    async fn health_allows_any_origin() {
        let app = router(Arc::new(RelayState::new(DEFAULT_CAPACITY)));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("origin", "http://example.com")
                    .body(Body::empty())
                    .expect("build request"),
            )
            .await
            .expect("health response");

        assert!(response.status().is_success());
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .map(|value| value.as_bytes()),
            Some(&b"*"[..])
        );
    }
}
