use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use anyhow::Context;
use gstreamer::prelude::*;
use gstreamer::{self as gst, ElementFactory, FlowError};
use gstreamer_app::{AppSink, AppSinkCallbacks};
use tracing::{debug, info, warn};

/// One tee-fed leg: `queue ! appsink`, attached via a tee request pad.
/// `pull_sample` drains encoded buffers pushed by the appsink callback.
pub struct BranchLeg {
    pipeline: gst::Pipeline,
    tee: gst::Element,
    tee_pad: gst::Pad,
    queue: gst::Element,
    appsink: AppSink,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    detached: AtomicBool,
}

impl BranchLeg {
    pub fn pull_sample(&self) -> Option<Vec<u8>> {
        let rx = self.rx.lock().unwrap_or_else(|e| e.into_inner());
        rx.try_recv().ok()
    }
}

/// A per-viewer branch pair: a video leg, and an audio leg if the pipeline
/// has an audio tee. Detach is idempotent — calling it twice is a no-op,
/// since a viewer's socket close and its pipeline bus error can both race to
/// tear down the same branch.
pub struct Branch {
    video: BranchLeg,
    audio: Option<BranchLeg>,
    cleaned_up: AtomicBool,
}

impl Branch {
    pub fn new(video: BranchLeg, audio: Option<BranchLeg>) -> Self {
        Self {
            video,
            audio,
            cleaned_up: AtomicBool::new(false),
        }
    }

    pub fn attach_leg(
        pipeline: &gst::Pipeline,
        tee: &gst::Element,
        viewer_id: &str,
        kind: &str,
    ) -> anyhow::Result<BranchLeg> {
        let queue = ElementFactory::make("queue")
            .name(format!("{kind}-queue-{viewer_id}"))
            .property("leaky", 2u32) // downstream: drop old buffers under backpressure
            .property("max-size-buffers", 4u32)
            .build()
            .context("Failed to create branch queue")?;

        let appsink_elem = ElementFactory::make("appsink")
            .name(format!("{kind}-sink-{viewer_id}"))
            .property("sync", false)
            .property("async", false)
            .property("emit-signals", true)
            .property("max-buffers", 2u32)
            .property("drop", true)
            .build()
            .context("Failed to create branch appsink")?;
        let appsink = appsink_elem
            .dynamic_cast::<AppSink>()
            .map_err(|_| anyhow::anyhow!("Failed to cast to AppSink"))?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| FlowError::Error)?;
                    let _ = tx.send(map.to_vec());
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .add_many([&queue, appsink.upcast_ref()])
            .context("Failed to add branch elements")?;
        gst::Element::link_many([&queue, appsink.upcast_ref()])
            .context("Failed to link branch elements")?;

        let tee_pad = tee
            .request_pad_simple("src_%u")
            .context("Failed to request tee pad for branch")?;
        let queue_pad = queue.static_pad("sink").context("queue has no sink pad")?;
        tee_pad
            .link(&queue_pad)
            .context("Failed to link tee to branch queue")?;

        queue.sync_state_with_parent().ok();
        appsink.sync_state_with_parent().ok();

        debug!(viewer_id, kind, "Branch leg attached");

        Ok(BranchLeg {
            pipeline: pipeline.clone(),
            tee: tee.clone(),
            tee_pad,
            queue,
            appsink,
            rx: Mutex::new(rx),
            detached: AtomicBool::new(false),
        })
    }

    pub fn pull_video(&self) -> Option<Vec<u8>> {
        self.video.pull_sample()
    }

    pub fn pull_audio(&self) -> Option<Vec<u8>> {
        self.audio.as_ref().and_then(|a| a.pull_sample())
    }

    pub fn is_detached(&self) -> bool {
        self.cleaned_up.load(Ordering::SeqCst)
    }

    /// Tear down both legs: unlink the tee pad, set the branch elements to
    /// Null, remove them from the pipeline, and release the request pad.
    /// Safe to call more than once.
    pub fn detach(&self) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }
        detach_leg(&self.video);
        if let Some(audio) = &self.audio {
            detach_leg(audio);
        }
    }
}

fn detach_leg(leg: &BranchLeg) {
    if leg.detached.swap(true, Ordering::SeqCst) {
        return;
    }
    leg.tee_pad.unlink(&leg.queue.static_pad("sink").unwrap()).ok();
    leg.tee.release_request_pad(&leg.tee_pad);
    let _ = leg.queue.set_state(gst::State::Null);
    let _ = leg.appsink.set_state(gst::State::Null);
    let _ = leg.pipeline.remove_many([&leg.queue, leg.appsink.upcast_ref()]);
    debug!("Branch leg detached");
}

impl Drop for Branch {
    fn drop(&mut self) {
        if !self.cleaned_up.load(Ordering::SeqCst) {
            warn!("Branch dropped without explicit detach, cleaning up now");
            self.detach();
        }
    }
}
