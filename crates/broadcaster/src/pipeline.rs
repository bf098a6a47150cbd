use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use castcore_protocol::CameraKind;
use gstreamer::prelude::*;
use gstreamer::{self as gst, ElementFactory};
use tracing::{debug, info, warn};

use crate::branch::Branch;

/// Shared capture + encode pipeline feeding one `tee` per media kind.
///
/// Structure (video side):
///   source ! videoconvert ! encoder ! h264parse ! tee name=video_tee
///       video_tee. ! queue ! fakesink sync=false     (permanent null branch)
///
/// Every viewer attaches its own `queue ! appsink` branch to `video_tee`
/// (and, if an audio device is configured, to `audio_tee`) via request pads.
/// A single encode runs regardless of viewer count; fan-out is free.
pub struct MediaPipeline {
    pipeline: gst::Pipeline,
    video_tee: gst::Element,
    audio_tee: Option<gst::Element>,
    _bus_watch: gst::bus::BusWatchGuard,
    pipeline_error: Arc<AtomicBool>,
}

impl MediaPipeline {
    pub fn build(
        camera_kind: CameraKind,
        video_device_path: &str,
        audio_device_path: Option<&str>,
        width: u32,
        height: u32,
        framerate: u32,
        bitrate_kbps: u32,
    ) -> anyhow::Result<Self> {
        let pipeline = gst::Pipeline::new();

        let video_source = build_video_source(camera_kind, video_device_path)?;
        let convert = ElementFactory::make("videoconvert")
            .build()
            .context("Failed to create videoconvert")?;
        let caps_filter = gst::Caps::builder("video/x-raw")
            .field("width", width as i32)
            .field("height", height as i32)
            .field("framerate", gst::Fraction::new(framerate as i32, 1))
            .build();
        let capsfilter = ElementFactory::make("capsfilter")
            .property("caps", &caps_filter)
            .build()
            .context("Failed to create capsfilter")?;

        let encoder = ElementFactory::make("x264enc")
            .property_from_str("tune", "zerolatency")
            .property_from_str("speed-preset", "ultrafast")
            .property("bitrate", bitrate_kbps)
            .property("key-int-max", framerate * 2)
            .property("bframes", 0u32)
            .build()
            .context("Failed to create x264enc")?;

        let profile_caps = gst::Caps::builder("video/x-h264")
            .field("profile", "constrained-baseline")
            .build();
        let profile_filter = ElementFactory::make("capsfilter")
            .property("caps", &profile_caps)
            .build()
            .context("Failed to create profile capsfilter")?;

        let parser = ElementFactory::make("h264parse")
            .property_from_str("config-interval", "-1")
            .build()
            .context("Failed to create h264parse")?;

        let parse_caps = gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        let parse_capsfilter = ElementFactory::make("capsfilter")
            .property("caps", &parse_caps)
            .build()
            .context("Failed to create parser output capsfilter")?;

        let video_tee = ElementFactory::make("tee")
            .name("video_tee")
            .property("allow-not-linked", true)
            .build()
            .context("Failed to create video tee")?;

        pipeline
            .add_many([
                &video_source,
                &convert,
                &capsfilter,
                &encoder,
                &profile_filter,
                &parser,
                &parse_capsfilter,
                &video_tee,
            ])
            .context("Failed to add video elements")?;
        gst::Element::link_many([
            &video_source,
            &convert,
            &capsfilter,
            &encoder,
            &profile_filter,
            &parser,
            &parse_capsfilter,
            &video_tee,
        ])
        .context("Failed to link video elements")?;

        attach_null_branch(&pipeline, &video_tee, "video-null")?;

        let audio_tee = match audio_device_path {
            Some(device) => {
                let audio_source = ElementFactory::make("alsasrc")
                    .property("device", device)
                    .build()
                    .context("Failed to create alsasrc")?;
                let audio_convert = ElementFactory::make("audioconvert")
                    .build()
                    .context("Failed to create audioconvert")?;
                let audio_resample = ElementFactory::make("audioresample")
                    .build()
                    .context("Failed to create audioresample")?;
                let opus_enc = ElementFactory::make("opusenc")
                    .property("bitrate", 64_000i32)
                    .build()
                    .context("Failed to create opusenc")?;
                let audio_tee = ElementFactory::make("tee")
                    .name("audio_tee")
                    .property("allow-not-linked", true)
                    .build()
                    .context("Failed to create audio tee")?;

                pipeline
                    .add_many([
                        &audio_source,
                        &audio_convert,
                        &audio_resample,
                        &opus_enc,
                        &audio_tee,
                    ])
                    .context("Failed to add audio elements")?;
                gst::Element::link_many([
                    &audio_source,
                    &audio_convert,
                    &audio_resample,
                    &opus_enc,
                    &audio_tee,
                ])
                .context("Failed to link audio elements")?;

                attach_null_branch(&pipeline, &audio_tee, "audio-null")?;
                Some(audio_tee)
            }
            None => {
                info!("No audio device configured, broadcasting video-only");
                None
            }
        };

        let pipeline_error = Arc::new(AtomicBool::new(false));
        let error_flag = Arc::clone(&pipeline_error);
        let bus = pipeline.bus().context("Failed to get pipeline bus")?;
        let bus_watch_pipeline = pipeline.clone();
        let _bus_watch = bus
            .add_watch(move |_, msg| {
                use gst::MessageView;
                match msg.view() {
                    MessageView::Error(err) => {
                        tracing::error!(
                            source = ?err.src().map(|s| s.name().to_string()),
                            error = %err.error(),
                            "Pipeline error"
                        );
                        error_flag.store(true, Ordering::Relaxed);
                    }
                    MessageView::Warning(warn) => {
                        warn!(warning = %warn.error(), "Pipeline warning");
                    }
                    MessageView::StateChanged(state) => {
                        if state
                            .src()
                            .map(|s| s.name() == bus_watch_pipeline.name())
                            .unwrap_or(false)
                        {
                            debug!(
                                old = ?state.old(),
                                new = ?state.current(),
                                "Pipeline state changed"
                            );
                        }
                    }
                    MessageView::Latency(_) => {
                        debug!("Latency changed, recalculating");
                        let _ = bus_watch_pipeline.recalculate_latency();
                    }
                    _ => {}
                }
                gst::glib::ControlFlow::Continue
            })
            .context("Failed to add bus watch")?;

        pipeline
            .set_state(gst::State::Playing)
            .context("Failed to set pipeline to Playing")?;

        info!(width, height, framerate, bitrate_kbps, "Media pipeline started");

        Ok(Self {
            pipeline,
            video_tee,
            audio_tee,
            _bus_watch,
            pipeline_error,
        })
    }

    pub fn has_error(&self) -> bool {
        self.pipeline_error.load(Ordering::Relaxed)
    }

    /// Attach a new viewer branch: a `queue ! appsink` fed by a tee request pad,
    /// for each media kind the pipeline has.
    pub fn attach_branch(&self, viewer_id: &str) -> anyhow::Result<Branch> {
        let video = Branch::attach_leg(&self.pipeline, &self.video_tee, viewer_id, "video")?;
        let audio = match &self.audio_tee {
            Some(tee) => Some(Branch::attach_leg(&self.pipeline, tee, viewer_id, "audio")?),
            None => None,
        };
        info!(viewer_id, "Branch attached");
        Ok(Branch::new(video, audio))
    }

    /// Force the next frame to be an IDR keyframe (e.g. right after SDP
    /// negotiation completes for a new viewer, so its decoder can start).
    pub fn force_keyframe(&self) {
        if let Some(src) = self.pipeline.by_name("video_tee") {
            let event = gstreamer_video::UpstreamForceKeyUnitEvent::builder()
                .all_headers(true)
                .build();
            src.send_event(event);
            debug!("Forced IDR keyframe");
        }
    }
}

fn build_video_source(kind: CameraKind, device_path: &str) -> anyhow::Result<gst::Element> {
    match kind {
        CameraKind::PiModern => ElementFactory::make("libcamerasrc")
            .build()
            .context("Failed to create libcamerasrc (Pi camera stack)"),
        CameraKind::PiLegacy | CameraKind::Usb => ElementFactory::make("v4l2src")
            .property("device", device_path)
            .build()
            .context("Failed to create v4l2src"),
    }
}

/// Every tee needs at least one permanently-linked branch so the pipeline
/// doesn't stall with zero consumers while no viewer is attached.
fn attach_null_branch(pipeline: &gst::Pipeline, tee: &gst::Element, name_prefix: &str) -> anyhow::Result<()> {
    let queue = ElementFactory::make("queue")
        .name(format!("{name_prefix}-queue"))
        .build()
        .context("Failed to create null-branch queue")?;
    let sink = ElementFactory::make("fakesink")
        .name(format!("{name_prefix}-sink"))
        .property("sync", false)
        .build()
        .context("Failed to create null-branch fakesink")?;

    pipeline
        .add_many([&queue, &sink])
        .context("Failed to add null branch")?;
    gst::Element::link_many([&queue, &sink]).context("Failed to link null branch")?;

    let tee_pad = tee
        .request_pad_simple("src_%u")
        .context("Failed to request tee pad for null branch")?;
    let queue_pad = queue
        .static_pad("sink")
        .context("queue has no sink pad")?;
    tee_pad
        .link(&queue_pad)
        .context("Failed to link tee to null-branch queue")?;

    queue.sync_state_with_parent().ok();
    sink.sync_state_with_parent().ok();

    Ok(())
}

impl Drop for MediaPipeline {
    fn drop(&mut self) {
        info!("MediaPipeline::drop() - setting pipeline to Null");
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
