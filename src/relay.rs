//! Peer registry, fan-out broadcast, and inbound frame dispatch.
//!
//! Every connected endpoint (instrumented app or inspector) is a peer.  Each
//! peer owns one WebSocket task; outbound frames are queued through a
//! per-peer unbounded channel so a slow peer never blocks dispatch, and a
//! peer whose channel is gone is dropped from the registry without
//! disturbing delivery to the rest.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::history::NetworkHistory;
use crate::logging;
use crate::protocol::{Message, NetworkEventType, NetworkRequestRecord};
use crate::rlog;

/// Shared relay state: the peer registry and the network history store.
///
/// Both are mutated only under one lock; broadcast snapshots the peer set
/// before delivering so the registry is never iterated while being mutated.
#[derive(Clone)]
pub struct RelayState {
    inner: Arc<Mutex<RelayInner>>,
}

struct RelayInner {
    peers: HashMap<u64, PeerHandle>,
    next_conn_id: u64,
    history: NetworkHistory,
}

struct PeerHandle {
    tx: mpsc::UnboundedSender<String>,
}

pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(healthcheck))
        .with_state(state)
}

impl RelayState {
    pub fn new(history_capacity: usize) -> Self {
        RelayState {
            inner: Arc::new(Mutex::new(RelayInner {
                peers: HashMap::new(),
                next_conn_id: 0,
                history: NetworkHistory::new(history_capacity),
            })),
        }
    }

    /// Register a new peer; returns its connection id and the outbound
    /// frame queue feeding its socket task.
    pub async fn register_peer(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        let id = inner.next_conn_id;
        inner.next_conn_id += 1;
        inner.peers.insert(id, PeerHandle { tx });
        (id, rx)
    }

    pub async fn remove_peer(&self, conn_id: u64) {
        let mut inner = self.inner.lock().await;
        inner.peers.remove(&conn_id);
    }

    /// Drop every peer.  Each connection task sees its queue close and shuts
    /// its socket down.
    pub async fn clear_peers(&self) {
        let mut inner = self.inner.lock().await;
        inner.peers.clear();
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.lock().await.peers.len()
    }

    /// Sorted snapshot of the history store under its current default sort.
    pub async fn history_snapshot(&self) -> Vec<NetworkRequestRecord> {
        self.inner.lock().await.history.query(None)
    }

    /// Deliver one frame to every registered peer except `exclude`.
    ///
    /// Failed sends remove that peer and delivery continues with the
    /// remainder; nothing propagates to the caller.
    pub async fn broadcast_frame(&self, frame: &str, exclude: Option<u64>) {
        let targets: Vec<(u64, mpsc::UnboundedSender<String>)> = {
            let inner = self.inner.lock().await;
            inner
                .peers
                .iter()
                .filter(|(id, _)| Some(**id) != exclude)
                .map(|(id, peer)| (*id, peer.tx.clone()))
                .collect()
        };

        let mut failed = Vec::new();
        for (id, tx) in targets {
            if tx.send(frame.to_string()).is_err() {
                failed.push(id);
            }
        }

        if !failed.is_empty() {
            let mut inner = self.inner.lock().await;
            for id in failed {
                if inner.peers.remove(&id).is_some() {
                    rlog!("relay: dropping unreachable peer {}", logging::conn_id(id));
                }
            }
        }
    }

    /// Frames a freshly accepted peer receives before any broadcast traffic:
    /// a `GET_STORAGE` prompt, then a history snapshot when one exists.
    async fn bootstrap_frames(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut frames = vec![Message::GetStorage.to_frame()];
        if !inner.history.is_empty() {
            frames.push(
                Message::NetworkHistory {
                    data: inner.history.query(None),
                }
                .to_frame(),
            );
        }
        frames
    }

    /// Classify and dispatch one inbound text frame from `conn_id`.
    ///
    /// Network lifecycle and sort frames are consumed; everything else that
    /// parses as JSON is fanned out verbatim to the other peers.  Frames
    /// that are not JSON, and `NETWORK_EVENT` frames that fail to decode,
    /// are dropped with a diagnostic log.
    pub async fn handle_frame(&self, conn_id: u64, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(error) => {
                rlog!(
                    "relay: dropping unparseable frame from {}: {error}",
                    logging::conn_id(conn_id)
                );
                return;
            }
        };

        match serde_json::from_value::<Message>(value.clone()) {
            Ok(Message::NetworkEvent { event_type, data }) => {
                self.handle_network_event(conn_id, event_type, data, text).await;
            }
            Ok(Message::NetworkSort { data }) => {
                // Not relayed; the requester gets the re-sorted snapshot too.
                let frame = {
                    let mut inner = self.inner.lock().await;
                    inner.history.set_sort_order(data);
                    Message::NetworkHistory {
                        data: inner.history.query(None),
                    }
                    .to_frame()
                };
                self.broadcast_frame(&frame, None).await;
            }
            Ok(Message::NetworkRefresh) => {
                self.broadcast_frame(&Message::RequestRefresh.to_frame(), Some(conn_id))
                    .await;
            }
            Ok(_) => {
                // Storage traffic and the relay's own frame kinds echoed back
                // by a peer: no store-side effect, forward the original bytes.
                self.broadcast_frame(text, Some(conn_id)).await;
            }
            Err(error) => {
                let kind = value
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("<untyped>");
                // A NETWORK_EVENT that fails to decode (missing data, unknown
                // eventType) is malformed, not merely unrecognized; relaying
                // it would hand inspectors an event the store refused.
                if kind == "NETWORK_EVENT" {
                    rlog!(
                        "relay: dropping malformed NETWORK_EVENT from {}: {error}",
                        logging::conn_id(conn_id)
                    );
                    return;
                }
                rlog!(
                    "relay: forwarding unrecognized frame kind {kind} from {}",
                    logging::conn_id(conn_id)
                );
                self.broadcast_frame(text, Some(conn_id)).await;
            }
        }
    }

    async fn handle_network_event(
        &self,
        conn_id: u64,
        event_type: NetworkEventType,
        data: Value,
        raw_frame: &str,
    ) {
        // A lifecycle event without an id can never be merged or displayed;
        // it is dropped entirely, not relayed.
        if event_type != NetworkEventType::ClearNetworkHistory && data.get("id").is_none() {
            rlog!(
                "relay: dropping NETWORK_EVENT without id from {}",
                logging::conn_id(conn_id)
            );
            return;
        }

        let history_frame = {
            let mut inner = self.inner.lock().await;
            inner.history.record_event(event_type, data);
            Message::NetworkHistory {
                data: inner.history.query(None),
            }
            .to_frame()
        };

        // The event itself goes out verbatim, followed by the refreshed
        // snapshot so inspectors never have to re-derive merge state.
        self.broadcast_frame(raw_frame, Some(conn_id)).await;
        self.broadcast_frame(&history_frame, Some(conn_id)).await;
    }
}

async fn healthcheck() -> impl IntoResponse {
    StatusCode::OK
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    let ip = addr.ip().to_string();
    ws.on_upgrade(move |socket| handle_ws_connection(socket, ip, state))
}

async fn handle_ws_connection(mut socket: WebSocket, ip: String, state: RelayState) {
    let (conn_id, mut rx) = state.register_peer().await;
    rlog!(
        "relay: peer {} connected from {ip}",
        logging::conn_id(conn_id)
    );

    // New peers never start from an empty view when history exists.
    for frame in state.bootstrap_frames().await {
        if socket.send(WsMessage::Text(frame)).await.is_err() {
            state.remove_peer(conn_id).await;
            return;
        }
    }

    loop {
        tokio::select! {
            queued = rx.recv() => {
                match queued {
                    Some(frame) => {
                        if socket.send(WsMessage::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    // Queue closed: the registry dropped us (stop/restart).
                    None => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        state.handle_frame(conn_id, &text).await;
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if socket.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.remove_peer(conn_id).await;
    rlog!("relay: peer {} disconnected", logging::conn_id(conn_id));
}
