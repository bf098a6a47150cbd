use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use castcore_protocol::IceServerEntry;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

static SESSION_GENERATION: AtomicU64 = AtomicU64::new(0);

/// The SDP/ICE phase a peer session moves through. Any state can transition
/// to `Closed`; the forward path otherwise only moves left to right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpPhase {
    New,
    LocalOfferPending,
    LocalOffer,
    RemoteAnswerSet,
    Connected,
    Closed,
}

/// One viewer's WebRTC peer connection. Media is written into its tracks by
/// the branch-pulling task in main.rs; ICE candidates learned before the
/// remote description is set are buffered and flushed once it is.
pub struct PeerSession {
    peer_connection: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    audio_track: Option<Arc<TrackLocalStaticSample>>,
    video_sender: Arc<RTCRtpSender>,
    phase: Mutex<SdpPhase>,
    pending_remote_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    pub generation: u64,
}

impl PeerSession {
    /// Build a new peer session and immediately generate the local offer —
    /// the broadcaster is the offering side in this protocol, unlike a
    /// browser-initiates-the-call design.
    pub async fn new(ice_servers: Vec<IceServerEntry>, with_audio: bool) -> anyhow::Result<(Arc<Self>, String)> {
        let mut media_engine = MediaEngine::default();

        let h264_feedback = vec![
            RTCPFeedback { typ: "goog-remb".into(), parameter: "".into() },
            RTCPFeedback { typ: "ccm".into(), parameter: "fir".into() },
            RTCPFeedback { typ: "nack".into(), parameter: "".into() },
            RTCPFeedback { typ: "nack".into(), parameter: "pli".into() },
            RTCPFeedback { typ: "transport-cc".into(), parameter: "".into() },
        ];

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_string(),
                    rtcp_feedback: h264_feedback,
                },
                payload_type: 125,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        if with_audio {
            media_engine.register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_string(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )?;
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_ice_servers: Vec<RTCIceServer> = ice_servers
            .into_iter()
            .map(|s| RTCIceServer {
                urls: s.urls,
                username: s.username.unwrap_or_default(),
                credential: s.credential.unwrap_or_default(),
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "castcore".to_string(),
        ));

        let video_sender = peer_connection
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add video track")?;

        let audio_track = if with_audio {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                "audio".to_string(),
                "castcore".to_string(),
            ));
            peer_connection
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .context("Failed to add audio track")?;
            Some(track)
        } else {
            None
        };

        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Failed => warn!("Peer connection failed"),
                RTCPeerConnectionState::Disconnected => warn!("Peer connection disconnected"),
                _ => info!(?state, "Peer connection state changed"),
            }
            Box::pin(async {})
        }));

        let generation = SESSION_GENERATION.fetch_add(1, Ordering::Relaxed) + 1;

        let session = Arc::new(Self {
            peer_connection: Arc::clone(&peer_connection),
            video_track,
            audio_track,
            video_sender,
            phase: Mutex::new(SdpPhase::LocalOfferPending),
            pending_remote_candidates: Mutex::new(Vec::new()),
            generation,
        });

        let offer = peer_connection
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        peer_connection
            .set_local_description(offer.clone())
            .await
            .context("Failed to set local description")?;
        *session.phase.lock().await = SdpPhase::LocalOffer;

        Ok((session, offer.sdp))
    }

    pub async fn phase(&self) -> SdpPhase {
        *self.phase.lock().await
    }

    /// Accept the viewer's answer and flush any ICE candidates queued while
    /// waiting for it.
    pub async fn set_remote_answer(&self, sdp: &str) -> anyhow::Result<()> {
        let answer =
            RTCSessionDescription::answer(sdp.to_string()).context("Failed to parse SDP answer")?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .context("Failed to set remote description")?;
        *self.phase.lock().await = SdpPhase::RemoteAnswerSet;

        let mut pending = self.pending_remote_candidates.lock().await;
        for candidate in pending.drain(..) {
            if let Err(e) = self.peer_connection.add_ice_candidate(candidate).await {
                warn!("Failed to add buffered ICE candidate: {e}");
            }
        }
        Ok(())
    }

    /// Queue an ICE candidate if the remote description isn't set yet,
    /// otherwise add it immediately.
    pub async fn add_remote_ice_candidate(
        &self,
        candidate: &str,
        sdp_mid: Option<&str>,
        sdp_mline_index: Option<u16>,
    ) -> anyhow::Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: sdp_mid.map(|s| s.to_string()),
            sdp_mline_index,
            ..Default::default()
        };

        let phase = *self.phase.lock().await;
        if matches!(phase, SdpPhase::RemoteAnswerSet | SdpPhase::Connected) {
            self.peer_connection
                .add_ice_candidate(init)
                .await
                .context("Failed to add ICE candidate")?;
        } else {
            self.pending_remote_candidates.lock().await.push(init);
        }
        Ok(())
    }

    pub fn on_ice_candidate(
        &self,
        callback: impl Fn(String, Option<String>, Option<u16>) + Send + Sync + 'static,
    ) {
        let callback = Arc::new(callback);
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(json) => {
                            let cb = Arc::clone(&callback);
                            cb(json.candidate, json.sdp_mid, json.sdp_mline_index);
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                    }
                }
                Box::pin(async {})
            }));
    }

    pub fn start_rtcp_reader(&self, on_keyframe_request: impl Fn() + Send + Sync + 'static) {
        let sender = Arc::clone(&self.video_sender);
        tokio::spawn(async move {
            while let Ok((packets, _)) = sender.read_rtcp().await {
                for pkt in &packets {
                    let pkt_any = pkt.as_any();
                    if pkt_any.is::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                        || pkt_any.is::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>()
                    {
                        info!("Received PLI/FIR keyframe request from viewer");
                        on_keyframe_request();
                    }
                }
            }
        });
    }

    pub async fn write_video_sample(&self, data: Vec<u8>, duration_ns: u64) -> anyhow::Result<()> {
        self.video_track
            .write_sample(&webrtc::media::Sample {
                data: bytes::Bytes::from(data),
                duration: Duration::from_nanos(duration_ns),
                ..Default::default()
            })
            .await
            .context("Failed to write video sample")?;
        Ok(())
    }

    pub async fn write_audio_sample(&self, data: Vec<u8>, duration_ns: u64) -> anyhow::Result<()> {
        let Some(track) = &self.audio_track else {
            return Ok(());
        };
        track
            .write_sample(&webrtc::media::Sample {
                data: bytes::Bytes::from(data),
                duration: Duration::from_nanos(duration_ns),
                ..Default::default()
            })
            .await
            .context("Failed to write audio sample")?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.peer_connection.connection_state() == RTCPeerConnectionState::Connected
    }

    pub async fn mark_connected_if_ice_ok(&self) {
        if self.is_connected() {
            let mut phase = self.phase.lock().await;
            if *phase == SdpPhase::RemoteAnswerSet {
                *phase = SdpPhase::Connected;
                debug!("Peer session connected");
            }
        }
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        *self.phase.lock().await = SdpPhase::Closed;
        self.peer_connection
            .close()
            .await
            .context("Failed to close peer connection")?;
        Ok(())
    }
}
