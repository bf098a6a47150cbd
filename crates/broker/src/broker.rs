use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use castcore_protocol::SignalingMessage;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::{Duration, Instant};

/// Outbound channel into a connected WebSocket task.
pub type OutboundTx = mpsc::UnboundedSender<SignalingMessage>;

/// Identity of a WebSocket connection, independent of the role it ends up
/// playing. Assigned the moment the socket upgrades, before any message has
/// been read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

const PENDING_OFFER_TTL: Duration = Duration::from_secs(10);
const VIEWER_JOINED_DELAY: Duration = Duration::from_millis(100);

struct BroadcasterConn {
    conn_id: ConnId,
    tx: OutboundTx,
    /// Notified to tell a replaced broadcaster's WebSocket task to close.
    kick: Arc<Notify>,
}

struct ViewerConn {
    conn_id: ConnId,
    stream_id: String,
    tx: OutboundTx,
    ready: bool,
}

struct PendingOffer {
    sdp: String,
    created_at: Instant,
}

#[derive(Default)]
struct BrokerState {
    streams: HashMap<String, BroadcasterConn>,
    viewers: HashMap<String, ViewerConn>,
    pending_offers: HashMap<String, PendingOffer>,
    /// Last viewer_id a connection registered, so a second `join` on the same
    /// socket purges the prior viewer before creating a new one.
    conn_viewer: HashMap<ConnId, String>,
}

/// In-memory router for the signaling protocol. One instance per broker
/// process; all state lives here, nothing is persisted.
pub struct Broker {
    state: Mutex<BrokerState>,
    next_conn_id: AtomicU64,
    next_viewer_seq: AtomicU64,
}

impl Broker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            next_conn_id: AtomicU64::new(1),
            next_viewer_seq: AtomicU64::new(1),
        })
    }

    pub fn new_conn_id(&self) -> ConnId {
        ConnId(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a broadcaster for `stream_id`, replacing and kicking any
    /// prior broadcaster on a different connection.
    pub async fn register_broadcaster(
        &self,
        conn_id: ConnId,
        stream_id: String,
        tx: OutboundTx,
    ) -> Arc<Notify> {
        let kick = Arc::new(Notify::new());
        let mut state = self.state.lock().await;
        if let Some(old) = state.streams.remove(&stream_id) {
            tracing::info!(%stream_id, "Replacing existing broadcaster registration");
            old.kick.notify_one();
        }
        state.streams.insert(
            stream_id.clone(),
            BroadcasterConn {
                conn_id,
                tx,
                kick: Arc::clone(&kick),
            },
        );
        kick
    }

    /// Handle a `join` from a viewer socket. Returns the `joined` reply to
    /// send immediately, or an `error` if the stream doesn't exist.
    pub async fn join(
        &self,
        conn_id: ConnId,
        stream_id: String,
        tx: OutboundTx,
    ) -> SignalingMessage {
        let mut state = self.state.lock().await;

        if !state.streams.contains_key(&stream_id) {
            return SignalingMessage::Error {
                message: format!("Stream not found: {stream_id}"),
            };
        }

        // A socket rejoining (e.g. switching streams) purges its prior viewer.
        if let Some(old_viewer_id) = state.conn_viewer.remove(&conn_id) {
            self.purge_viewer_locked(&mut state, &old_viewer_id);
        }

        let seq = self.next_viewer_seq.fetch_add(1, Ordering::Relaxed);
        let viewer_id = format!("viewer-{seq}");

        state.viewers.insert(
            viewer_id.clone(),
            ViewerConn {
                conn_id,
                stream_id: stream_id.clone(),
                tx,
                ready: false,
            },
        );
        state.conn_viewer.insert(conn_id, viewer_id.clone());

        SignalingMessage::Joined {
            viewer_id,
            stream_id,
        }
    }

    /// Spawns the delayed `viewer-joined` notification to the broadcaster.
    /// Must be called right after `join` returns its reply to the viewer, so
    /// the viewer has a head start to send `viewer-ready`.
    pub fn notify_viewer_joined(self: &Arc<Self>, viewer_id: String) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(VIEWER_JOINED_DELAY).await;
            let state = broker.state.lock().await;
            let Some(viewer) = state.viewers.get(&viewer_id) else {
                return;
            };
            if let Some(broadcaster) = state.streams.get(&viewer.stream_id) {
                let _ = broadcaster.tx.send(SignalingMessage::ViewerJoined {
                    viewer_id: viewer_id.clone(),
                });
            }
        });
    }

    /// Mark a viewer ready and flush any buffered offer immediately.
    pub async fn viewer_ready(&self, viewer_id: &str) {
        let mut state = self.state.lock().await;
        let Some(viewer) = state.viewers.get_mut(viewer_id) else {
            return;
        };
        viewer.ready = true;
        let tx = viewer.tx.clone();

        if let Some(offer) = state.pending_offers.remove(viewer_id) {
            let _ = tx.send(SignalingMessage::Offer {
                to: None,
                from: Some(viewer.stream_id.clone()),
                sdp: offer.sdp,
            });
        }
    }

    /// Forward an offer from the broadcaster to a viewer, buffering it if the
    /// viewer isn't ready (or doesn't exist yet).
    pub async fn forward_offer(&self, from_stream_id: &str, to_viewer_id: &str, sdp: String) {
        let mut state = self.state.lock().await;
        let deliverable = state
            .viewers
            .get(to_viewer_id)
            .filter(|v| v.ready)
            .map(|v| v.tx.clone());

        match deliverable {
            Some(tx) => {
                let _ = tx.send(SignalingMessage::Offer {
                    to: None,
                    from: Some(from_stream_id.to_string()),
                    sdp,
                });
            }
            None => {
                state.pending_offers.insert(
                    to_viewer_id.to_string(),
                    PendingOffer {
                        sdp,
                        created_at: Instant::now(),
                    },
                );
            }
        }
    }

    /// Forward an answer from a viewer to its stream's broadcaster.
    pub async fn forward_answer(&self, from_viewer_id: &str, to_stream_id: &str, sdp: String) {
        let state = self.state.lock().await;
        if let Some(broadcaster) = state.streams.get(to_stream_id) {
            let _ = broadcaster.tx.send(SignalingMessage::Answer {
                to: None,
                from: Some(from_viewer_id.to_string()),
                sdp,
            });
        }
    }

    /// Forward an ICE candidate, inferring direction from whether `to` names
    /// a stream or a viewer.
    pub async fn forward_ice_candidate(&self, from: Option<String>, to: &str, msg: SignalingMessage) {
        let state = self.state.lock().await;
        let msg = match &msg {
            SignalingMessage::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
                ..
            } => SignalingMessage::IceCandidate {
                to: None,
                from,
                candidate: candidate.clone(),
                sdp_mid: sdp_mid.clone(),
                sdp_mline_index: *sdp_mline_index,
            },
            other => other.clone(),
        };

        if let Some(broadcaster) = state.streams.get(to) {
            let _ = broadcaster.tx.send(msg);
            return;
        }
        if let Some(viewer) = state.viewers.get(to) {
            let _ = viewer.tx.send(msg);
            return;
        }
        tracing::debug!(to, "ice-candidate target not found, dropping");
    }

    /// Remove a broadcaster on socket close, notifying its viewers.
    pub async fn broadcaster_disconnected(&self, stream_id: &str, conn_id: ConnId) {
        let mut state = self.state.lock().await;
        // Only remove if this connection still owns the registration — a
        // replaced broadcaster's old connection closing must not clobber the
        // new one.
        let still_owns = state
            .streams
            .get(stream_id)
            .map(|b| b.conn_id == conn_id)
            .unwrap_or(false);
        if !still_owns {
            return;
        }
        state.streams.remove(stream_id);
        let viewer_txs: Vec<OutboundTx> = state
            .viewers
            .values()
            .filter(|v| v.stream_id == stream_id)
            .map(|v| v.tx.clone())
            .collect();
        for tx in viewer_txs {
            let _ = tx.send(SignalingMessage::BroadcasterLeft {});
        }
    }

    /// Remove a viewer on socket close, notifying its broadcaster.
    pub async fn viewer_disconnected(&self, viewer_id: &str, conn_id: ConnId) {
        let mut state = self.state.lock().await;
        let still_owns = state
            .viewers
            .get(viewer_id)
            .map(|v| v.conn_id == conn_id)
            .unwrap_or(false);
        if !still_owns {
            return;
        }
        state.conn_viewer.remove(&conn_id);
        self.purge_viewer_locked(&mut state, viewer_id);
    }

    fn purge_viewer_locked(&self, state: &mut BrokerState, viewer_id: &str) {
        let Some(viewer) = state.viewers.remove(viewer_id) else {
            return;
        };
        state.pending_offers.remove(viewer_id);
        if let Some(broadcaster) = state.streams.get(&viewer.stream_id) {
            let _ = broadcaster.tx.send(SignalingMessage::ViewerLeft {
                viewer_id: viewer_id.to_string(),
            });
        }
    }

    /// Periodically sweep pending offers older than their TTL. Intended to be
    /// spawned once for the lifetime of the process.
    pub async fn run_pending_offer_sweep(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(2));
        loop {
            tick.tick().await;
            let mut state = self.state.lock().await;
            let now = Instant::now();
            state
                .pending_offers
                .retain(|_, offer| now.duration_since(offer.created_at) < PENDING_OFFER_TTL);
        }
    }

    pub async fn status(&self) -> BrokerStatus {
        let state = self.state.lock().await;
        BrokerStatus {
            broadcasters: state.streams.keys().cloned().collect(),
            viewer_count: state.viewers.len(),
        }
    }
}

pub struct BrokerStatus {
    pub broadcasters: Vec<String>,
    pub viewer_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tx() -> (OutboundTx, mpsc::UnboundedReceiver<SignalingMessage>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn join_missing_stream_returns_error() {
        let broker = Broker::new();
        let conn = broker.new_conn_id();
        let (tx, _rx) = make_tx();
        let reply = broker.join(conn, "missing".to_string(), tx).await;
        match reply {
            SignalingMessage::Error { message } => {
                assert_eq!(message, "Stream not found: missing");
            }
            _ => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn join_existing_stream_mints_viewer_id() {
        let broker = Broker::new();
        let broadcaster_conn = broker.new_conn_id();
        let (btx, _brx) = make_tx();
        broker
            .register_broadcaster(broadcaster_conn, "s1".to_string(), btx)
            .await;

        let viewer_conn = broker.new_conn_id();
        let (vtx, _vrx) = make_tx();
        let reply = broker.join(viewer_conn, "s1".to_string(), vtx).await;
        match reply {
            SignalingMessage::Joined {
                viewer_id,
                stream_id,
            } => {
                assert_eq!(viewer_id, "viewer-1");
                assert_eq!(stream_id, "s1");
            }
            _ => panic!("expected joined"),
        }
    }

    #[tokio::test]
    async fn offer_buffered_until_ready_then_flushed() {
        let broker = Broker::new();
        let broadcaster_conn = broker.new_conn_id();
        let (btx, _brx) = make_tx();
        broker
            .register_broadcaster(broadcaster_conn, "s1".to_string(), btx)
            .await;

        let viewer_conn = broker.new_conn_id();
        let (vtx, mut vrx) = make_tx();
        let reply = broker.join(viewer_conn, "s1".to_string(), vtx).await;
        let viewer_id = match reply {
            SignalingMessage::Joined { viewer_id, .. } => viewer_id,
            _ => panic!("expected joined"),
        };

        broker
            .forward_offer("s1", &viewer_id, "v=0...".to_string())
            .await;
        // Not ready yet — nothing delivered.
        assert!(vrx.try_recv().is_err());

        broker.viewer_ready(&viewer_id).await;
        let msg = vrx.try_recv().expect("offer should be flushed");
        match msg {
            SignalingMessage::Offer { sdp, from, .. } => {
                assert_eq!(sdp, "v=0...");
                assert_eq!(from.as_deref(), Some("s1"));
            }
            _ => panic!("expected offer"),
        }
    }

    #[tokio::test]
    async fn broadcaster_disconnect_notifies_viewers() {
        let broker = Broker::new();
        let broadcaster_conn = broker.new_conn_id();
        let (btx, _brx) = make_tx();
        broker
            .register_broadcaster(broadcaster_conn, "s1".to_string(), btx)
            .await;

        let viewer_conn = broker.new_conn_id();
        let (vtx, mut vrx) = make_tx();
        broker.join(viewer_conn, "s1".to_string(), vtx).await;

        broker.broadcaster_disconnected("s1", broadcaster_conn).await;
        let msg = vrx.try_recv().expect("should receive broadcaster-left");
        assert!(matches!(msg, SignalingMessage::BroadcasterLeft {}));
    }

    #[tokio::test]
    async fn viewer_disconnect_notifies_broadcaster() {
        let broker = Broker::new();
        let broadcaster_conn = broker.new_conn_id();
        let (btx, mut brx) = make_tx();
        broker
            .register_broadcaster(broadcaster_conn, "s1".to_string(), btx)
            .await;

        let viewer_conn = broker.new_conn_id();
        let (vtx, _vrx) = make_tx();
        let reply = broker.join(viewer_conn, "s1".to_string(), vtx).await;
        let viewer_id = match reply {
            SignalingMessage::Joined { viewer_id, .. } => viewer_id,
            _ => panic!("expected joined"),
        };

        broker.viewer_disconnected(&viewer_id, viewer_conn).await;
        let msg = brx.try_recv().expect("should receive viewer-left");
        match msg {
            SignalingMessage::ViewerLeft { viewer_id: id } => assert_eq!(id, viewer_id),
            _ => panic!("expected viewer-left"),
        }
    }

    #[tokio::test]
    async fn register_replaces_and_kicks_old_broadcaster() {
        let broker = Broker::new();
        let old_conn = broker.new_conn_id();
        let (old_tx, _old_rx) = make_tx();
        let old_kick = broker
            .register_broadcaster(old_conn, "s1".to_string(), old_tx)
            .await;

        let new_conn = broker.new_conn_id();
        let (new_tx, _new_rx) = make_tx();
        broker
            .register_broadcaster(new_conn, "s1".to_string(), new_tx)
            .await;

        // The old broadcaster's kick notify should have fired.
        tokio::time::timeout(Duration::from_millis(100), old_kick.notified())
            .await
            .expect("old broadcaster should be kicked");
    }

    #[tokio::test]
    async fn ice_candidate_routes_to_viewer_by_to_field() {
        let broker = Broker::new();
        let broadcaster_conn = broker.new_conn_id();
        let (btx, _brx) = make_tx();
        broker
            .register_broadcaster(broadcaster_conn, "s1".to_string(), btx)
            .await;

        let viewer_conn = broker.new_conn_id();
        let (vtx, mut vrx) = make_tx();
        let reply = broker.join(viewer_conn, "s1".to_string(), vtx).await;
        let viewer_id = match reply {
            SignalingMessage::Joined { viewer_id, .. } => viewer_id,
            _ => panic!("expected joined"),
        };

        let candidate = SignalingMessage::ice_candidate(
            None,
            None,
            "candidate:1 1 UDP 1 1.2.3.4 1 typ host".to_string(),
            None,
            Some(0),
        );
        broker
            .forward_ice_candidate(Some("s1".to_string()), &viewer_id, candidate)
            .await;
        let msg = vrx.try_recv().expect("viewer should receive candidate");
        assert!(matches!(msg, SignalingMessage::IceCandidate { .. }));
    }
}
