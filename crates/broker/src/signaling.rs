use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use castcore_protocol::{Role, SignalingMessage};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, interval};

use crate::broker::{Broker, ConnId};

/// Interval between WebSocket ping frames.
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum time to wait for a pong response before considering the connection
/// dead. Allows 3 missed pings (3 * 30s = 90s).
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(90);

/// The role a socket settles into once its first message is read. A socket
/// that never sends `register`/`join` stays `Unknown` until it disconnects.
enum Identity {
    Unknown,
    Broadcaster { stream_id: String },
    Viewer { viewer_id: String },
}

/// Drive a single signaling WebSocket end to end: read the first message to
/// decide broadcaster vs. viewer, then relay messages through the broker
/// until the socket closes or is kicked by a replacement registration.
pub async fn handle_socket(mut socket: WebSocket, broker: Arc<Broker>) {
    let conn_id = broker.new_conn_id();
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();

    let mut identity = Identity::Unknown;
    let mut kick: Option<Arc<tokio::sync::Notify>> = None;

    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await; // consume the immediate first tick
    let mut last_pong = Instant::now();

    loop {
        let kicked = async {
            match &kick {
                Some(n) => n.notified().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = kicked => {
                tracing::info!(conn = conn_id.raw(), "connection replaced, closing");
                let msg = SignalingMessage::Error { message: "replaced".to_string() };
                if let Ok(json) = serde_json::to_string(&msg) {
                    let _ = socket.send(Message::Text(json.into())).await;
                }
                break;
            }
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    tracing::debug!("ping timeout, closing socket");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            outbound = rx.recv() => {
                let Some(msg) = outbound else { break };
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("failed to serialize outbound message: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                let Some(result) = incoming else { break };
                match result {
                    Ok(Message::Text(text)) => {
                        handle_text(&text, &broker, conn_id, &tx, &mut identity, &mut kick, &mut socket).await;
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Err(_) => break,
                    _ => {}
                }
            }
        }
    }

    match identity {
        Identity::Broadcaster { stream_id } => {
            broker.broadcaster_disconnected(&stream_id, conn_id).await;
        }
        Identity::Viewer { viewer_id } => {
            broker.viewer_disconnected(&viewer_id, conn_id).await;
        }
        Identity::Unknown => {}
    }
}

async fn handle_text(
    text: &str,
    broker: &Arc<Broker>,
    conn_id: ConnId,
    tx: &mpsc::UnboundedSender<SignalingMessage>,
    identity: &mut Identity,
    kick: &mut Option<Arc<tokio::sync::Notify>>,
    socket: &mut WebSocket,
) {
    let msg: SignalingMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            let err = SignalingMessage::Error {
                message: format!("invalid message: {e}"),
            };
            if let Ok(json) = serde_json::to_string(&err) {
                let _ = socket.send(Message::Text(json.into())).await;
            }
            return;
        }
    };

    match msg {
        SignalingMessage::Register { stream_id, role } => {
            let Role::Broadcaster = role;
            let notify = broker
                .register_broadcaster(conn_id, stream_id.clone(), tx.clone())
                .await;
            *kick = Some(notify);
            *identity = Identity::Broadcaster { stream_id: stream_id.clone() };
            let reply = SignalingMessage::Registered { stream_id };
            if let Ok(json) = serde_json::to_string(&reply) {
                let _ = socket.send(Message::Text(json.into())).await;
            }
        }
        SignalingMessage::Join { stream_id } => {
            let reply = broker.join(conn_id, stream_id, tx.clone()).await;
            if let SignalingMessage::Joined { viewer_id, .. } = &reply {
                *identity = Identity::Viewer {
                    viewer_id: viewer_id.clone(),
                };
                broker.notify_viewer_joined(viewer_id.clone());
            }
            if let Ok(json) = serde_json::to_string(&reply) {
                let _ = socket.send(Message::Text(json.into())).await;
            }
        }
        SignalingMessage::ViewerReady {} => {
            if let Identity::Viewer { viewer_id } = identity {
                broker.viewer_ready(viewer_id).await;
            }
        }
        SignalingMessage::Offer { to, sdp, .. } => {
            let (Identity::Broadcaster { stream_id }, Some(to)) = (&*identity, to) else {
                return;
            };
            broker.forward_offer(stream_id, &to, sdp).await;
        }
        SignalingMessage::Answer { to, sdp, .. } => {
            let (Identity::Viewer { viewer_id }, Some(to)) = (&*identity, to) else {
                return;
            };
            broker.forward_answer(viewer_id, &to, sdp).await;
        }
        candidate @ SignalingMessage::IceCandidate { .. } => {
            let to = match &candidate {
                SignalingMessage::IceCandidate { to: Some(to), .. } => to.clone(),
                _ => return,
            };
            let from = match &*identity {
                Identity::Broadcaster { stream_id } => Some(stream_id.clone()),
                Identity::Viewer { viewer_id } => Some(viewer_id.clone()),
                Identity::Unknown => None,
            };
            broker.forward_ice_candidate(from, &to, candidate).await;
        }
        SignalingMessage::Registered { .. }
        | SignalingMessage::Joined { .. }
        | SignalingMessage::ViewerJoined { .. }
        | SignalingMessage::ViewerLeft { .. }
        | SignalingMessage::BroadcasterLeft {}
        | SignalingMessage::Error { .. } => {
            tracing::debug!("ignoring server-originated message type from client");
        }
    }
}
