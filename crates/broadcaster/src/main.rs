mod branch;
mod cli;
mod h264;
mod peer;
mod pipeline;
mod signaling;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use branch::Branch;
use castcore_protocol::{IceServerEntry, SignalingMessage};
use peer::PeerSession;
use pipeline::MediaPipeline;
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info, warn};

/// A connected viewer: its media branch and its WebRTC peer session.
/// Kept together so tearing one down always tears down the other.
struct ViewerState {
    branch: Arc<Branch>,
    peer: Arc<PeerSession>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    gstreamer::init().context("Failed to initialize GStreamer")?;

    let config = cli::parse_args()?;
    if let Err(issues) = config.validate() {
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                error!("{issue}");
            } else {
                warn!("{issue}");
            }
        }
        if issues.iter().any(|i| i.starts_with("ERROR:")) {
            std::process::exit(1);
        }
    }

    info!(
        stream_id = %config.stream_id,
        signaling_url = %config.signaling_url,
        video_device = %config.video_device_path,
        "Starting castcore-broadcaster"
    );

    let pipeline = Arc::new(MediaPipeline::build(
        config.camera_kind,
        &config.video_device_path,
        config.audio_device_path.as_deref(),
        1920,
        1080,
        cli::DEFAULT_FRAMERATE,
        cli::DEFAULT_BITRATE,
    )?);

    let ice_servers: Vec<IceServerEntry> = {
        let http_client = reqwest::Client::new();
        let dynamic = castcore_protocol::fetch_dynamic_credentials(&http_client, &config.ice.dynamic_turn)
            .await
            .unwrap_or(None);
        castcore_protocol::build_ice_servers(&config.ice.static_servers, dynamic)
    };

    let viewers: Arc<Mutex<HashMap<String, ViewerState>>> = Arc::new(Mutex::new(HashMap::new()));
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<SignalingMessage>();

    let has_audio = config.audio_device_path.is_some();
    let on_message = {
        let viewers = Arc::clone(&viewers);
        let pipeline = Arc::clone(&pipeline);
        let outbox_tx = outbox_tx.clone();
        let ice_servers = ice_servers.clone();

        Arc::new(move |msg: SignalingMessage| {
            let viewers = Arc::clone(&viewers);
            let pipeline = Arc::clone(&pipeline);
            let outbox_tx = outbox_tx.clone();
            let ice_servers = ice_servers.clone();

            tokio::spawn(async move {
                match msg {
                    SignalingMessage::Registered { stream_id } => {
                        info!(stream_id, "Registered with broker");
                    }
                    SignalingMessage::ViewerJoined { viewer_id } => {
                        if let Err(e) = spawn_viewer(
                            viewer_id.clone(),
                            &pipeline,
                            ice_servers.clone(),
                            has_audio,
                            &viewers,
                            &outbox_tx,
                        )
                        .await
                        {
                            error!(viewer_id, "Failed to set up viewer: {e:#}");
                        }
                    }
                    SignalingMessage::Answer { from: Some(viewer_id), sdp, .. } => {
                        let viewers = viewers.lock().await;
                        if let Some(state) = viewers.get(&viewer_id) {
                            match state.peer.set_remote_answer(&sdp).await {
                                Ok(()) => {
                                    // The viewer's decoder can't do anything with frames
                                    // before this point; force one now that it has a peer
                                    // connection to receive it on.
                                    pipeline.force_keyframe();
                                }
                                Err(e) => {
                                    warn!(viewer_id, "Failed to set remote answer: {e:#}");
                                }
                            }
                        }
                    }
                    SignalingMessage::IceCandidate {
                        from: Some(viewer_id),
                        candidate,
                        sdp_mid,
                        sdp_mline_index,
                        ..
                    } => {
                        let viewers = viewers.lock().await;
                        if let Some(state) = viewers.get(&viewer_id)
                            && let Err(e) = state
                                .peer
                                .add_remote_ice_candidate(&candidate, sdp_mid.as_deref(), Some(sdp_mline_index))
                                .await
                        {
                            warn!(viewer_id, "Failed to add ICE candidate: {e:#}");
                        }
                    }
                    SignalingMessage::ViewerLeft { viewer_id } => {
                        let mut viewers = viewers.lock().await;
                        if let Some(state) = viewers.remove(&viewer_id) {
                            state.branch.detach();
                            let _ = state.peer.close().await;
                            info!(viewer_id, "Viewer torn down");
                        }
                    }
                    SignalingMessage::Error { message } => {
                        warn!("Broker error: {message}");
                    }
                    _ => {}
                }
            });
        })
    };

    let ctx = signaling::SignalingCtx {
        signaling_url: &config.signaling_url,
        stream_id: &config.stream_id,
        on_message,
    };

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = signaling::run_signaling(&ctx, &mut outbox_rx) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    }

    let mut viewers = viewers.lock().await;
    for (viewer_id, state) in viewers.drain() {
        state.branch.detach();
        let _ = state.peer.close().await;
        info!(viewer_id, "Viewer torn down on shutdown");
    }

    info!("castcore-broadcaster shut down cleanly");
    Ok(())
}

/// Attach a branch for a newly joined viewer, create its peer session,
/// generate an offer, and spawn the task that pumps encoded samples from
/// the branch into the peer's tracks.
async fn spawn_viewer(
    viewer_id: String,
    pipeline: &Arc<MediaPipeline>,
    ice_servers: Vec<IceServerEntry>,
    has_audio: bool,
    viewers: &Arc<Mutex<HashMap<String, ViewerState>>>,
    outbox_tx: &mpsc::UnboundedSender<SignalingMessage>,
) -> anyhow::Result<()> {
    let branch = Arc::new(pipeline.attach_branch(&viewer_id)?);
    let (peer, offer_sdp) = PeerSession::new(ice_servers, has_audio).await?;

    let ice_tx = outbox_tx.clone();
    let ice_viewer_id = viewer_id.clone();
    peer.on_ice_candidate(move |candidate, sdp_mid, sdp_mline_index| {
        let msg = SignalingMessage::ice_candidate(
            Some(ice_viewer_id.clone()),
            None,
            candidate,
            sdp_mid,
            sdp_mline_index,
        );
        let _ = ice_tx.send(msg);
    });

    let pipeline_kf = Arc::clone(pipeline);
    peer.start_rtcp_reader(move || {
        pipeline_kf.force_keyframe();
    });

    outbox_tx.send(SignalingMessage::Offer {
        to: Some(viewer_id.clone()),
        from: None,
        sdp: offer_sdp,
    })?;

    spawn_sample_pump(&viewer_id, &branch, &peer);

    let mut viewers = viewers.lock().await;
    viewers.insert(viewer_id.clone(), ViewerState { branch, peer });
    info!(viewer_id, "Viewer offer sent");
    Ok(())
}

/// Pull encoded samples from a viewer's branch and write them into its
/// peer's tracks. Runs until the branch is detached and dropped, at which
/// point its channel senders close and `pull_video`/`pull_audio` stay empty
/// forever, so the loop is ended explicitly via `detached()` instead.
fn spawn_sample_pump(viewer_id: &str, branch: &Arc<Branch>, peer: &Arc<PeerSession>) {
    let peer = Arc::clone(peer);
    let branch = Arc::clone(branch);
    let viewer_id = viewer_id.to_string();
    let video_frame_ns = 1_000_000_000 / cli::DEFAULT_FRAMERATE as u64;

    tokio::spawn(async move {
        while !branch.is_detached() {
            let mut pulled_any = false;
            if let Some(data) = branch.pull_video() {
                pulled_any = true;
                if let Err(e) = peer.write_video_sample(data, video_frame_ns).await {
                    warn!(viewer_id, "Failed to write video sample: {e:#}");
                    break;
                }
            }
            if let Some(data) = branch.pull_audio() {
                pulled_any = true;
                if let Err(e) = peer.write_audio_sample(data, 20_000_000).await {
                    warn!(viewer_id, "Failed to write audio sample: {e:#}");
                }
            }
            if !pulled_any {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
    });
}
