use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use castcore_protocol::SignalingMessage;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub(crate) type WsSender = mpsc::UnboundedSender<SignalingMessage>;

/// Shared context for the signaling WebSocket connection to the broker.
pub(crate) struct SignalingCtx<'a> {
    pub signaling_url: &'a str,
    pub stream_id: &'a str,
    pub on_message: Arc<dyn Fn(SignalingMessage) + Send + Sync>,
}

/// Run the signaling WebSocket connection with exponential-backoff reconnect.
/// `outbox_rx` receives outgoing messages produced by the peer session layer
/// (offers, ICE candidates); incoming messages are dispatched to `on_message`.
pub(crate) async fn run_signaling(ctx: &SignalingCtx<'_>, outbox_rx: &mut mpsc::UnboundedReceiver<SignalingMessage>) {
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(60);
    loop {
        info!(url = ctx.signaling_url, "Connecting to signaling broker");
        match connect_and_handle(ctx, outbox_rx).await {
            Ok(()) => {
                info!("Signaling connection closed cleanly");
                break;
            }
            Err(e) => {
                warn!("Signaling connection error: {e:#}");
                info!("Reconnecting in {}s", backoff.as_secs());
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
}

fn build_tls_connector() -> tokio_tungstenite::Connector {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().expect("Could not load platform certs") {
        let _ = root_store.add(cert);
    }
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    tokio_tungstenite::Connector::Rustls(Arc::new(tls_config))
}

async fn connect_and_handle(
    ctx: &SignalingCtx<'_>,
    outbox_rx: &mut mpsc::UnboundedReceiver<SignalingMessage>,
) -> anyhow::Result<()> {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let connector = build_tls_connector();
    let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
    ws_config.max_message_size = Some(64 * 1024);
    let (ws_stream, _) = tokio_tungstenite::connect_async_tls_with_config(
        ctx.signaling_url,
        Some(ws_config),
        false,
        Some(connector),
    )
    .await
    .context("WebSocket connection to broker failed")?;

    info!("Connected to signaling broker");
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let register = SignalingMessage::Register {
        stream_id: ctx.stream_id.to_string(),
        role: castcore_protocol::Role::Broadcaster,
    };
    ws_tx
        .send(Message::Text(serde_json::to_string(&register)?.into()))
        .await
        .context("Failed to send register message")?;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalingMessage>(&text) {
                            Ok(parsed) => (ctx.on_message)(parsed),
                            Err(e) => warn!("Invalid message from broker: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    _ => {}
                }
            }
            Some(msg) = outbox_rx.recv() => {
                let json = serde_json::to_string(&msg)?;
                ws_tx.send(Message::Text(json.into())).await?;
            }
        }
    }
}
