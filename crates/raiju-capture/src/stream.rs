//! Stream lifecycle manager
//!
//! Owns the media pipeline's running/stopped/null state machine, the
//! background sample-pulling thread and periodic health checking. Pulled
//! packets are reassembled into frame-aligned groups and handed to the
//! sink synchronously on the pull thread, so back-pressure from the
//! radio link flows straight into the pull loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use raiju_core::FragmentGroup;
use tracing::{debug, error, warn};

use crate::pipeline::{Pipeline, PipelineEngine, PipelineState};
use crate::reassembly::FrameReassembler;
use crate::rtp;

/// Bounded wait per pull attempt, the only blocking point in the hot path.
const PULL_TIMEOUT: Duration = Duration::from_millis(100);

/// Bound on state changes and state queries against the engine.
const STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(1);

/// Video codec produced by the encode pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    /// End-of-frame predicate for RTP packets of this codec.
    pub fn end_of_frame(self) -> fn(&[u8]) -> bool {
        match self {
            VideoCodec::H264 => rtp::h264_end_of_frame,
            VideoCodec::H265 => rtp::h265_end_of_frame,
        }
    }

    fn encode_and_pay(self, bitrate_kbps: u32, mtu: u32) -> String {
        match self {
            VideoCodec::H264 => format!(
                "x264enc tune=zerolatency speed-preset=superfast bitrate={bitrate_kbps} ! \
                 h264parse ! rtph264pay config-interval=-1 mtu={mtu}"
            ),
            VideoCodec::H265 => format!(
                "x265enc tune=zerolatency speed-preset=superfast bitrate={bitrate_kbps} ! \
                 h265parse ! rtph265pay config-interval=-1 mtu={mtu}"
            ),
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "h264"),
            VideoCodec::H265 => write!(f, "h265"),
        }
    }
}

/// Capture and encode configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Capture device
    pub device: String,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frames per second
    pub fps: u32,
    /// Encoder codec
    pub codec: VideoCodec,
    /// Encoder bitrate in bits per second
    pub bitrate_bps: u32,
    /// RTP payload MTU in bytes
    pub payload_mtu: u32,
    /// Grace period after setup during which health checks never restart
    pub warmup: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 1920,
            height: 1080,
            fps: 30,
            codec: VideoCodec::H265,
            bitrate_bps: 8_000_000,
            payload_mtu: 1024,
            warmup: Duration::from_secs(5),
        }
    }
}

impl StreamConfig {
    /// Build the capture → encode → payload pipeline description.
    pub fn pipeline_description(&self) -> String {
        format!(
            "v4l2src device={} ! \
             video/x-raw,width={},height={},framerate={}/1 ! \
             videoconvert ! queue ! {} ! \
             rtpstreampay ! fdsink fd=1",
            self.device,
            self.width,
            self.height,
            self.fps,
            self.codec.encode_and_pay(self.bitrate_bps / 1000, self.payload_mtu),
        )
    }
}

/// Counters kept by the pull loop, surfaced through `debug_state`.
#[derive(Default)]
struct PullStats {
    fragments: AtomicU64,
    frames: AtomicU64,
    bytes: AtomicU64,
    forced_emits: AtomicU64,
}

type FrameSink = Arc<dyn Fn(FragmentGroup) + Send + Sync>;

struct Inner {
    /// The owned pipeline, if one is constructed
    pipeline: Option<Arc<dyn Pipeline>>,
    /// When the current pipeline was constructed (warm-up reference)
    created_at: Instant,
    /// Run flag for the current pull thread
    pull_run: Arc<AtomicBool>,
    pull_thread: Option<JoinHandle<()>>,
}

/// Manages one video stream end to end.
///
/// All cross-thread access to the pipeline handle goes through the
/// internal mutex; long bounded operations (state queries) clone the
/// handle under the lock and run after releasing it, so a concurrent
/// restart can never tear the pipeline down underneath them.
pub struct VideoStream {
    engine: Arc<dyn PipelineEngine>,
    config: StreamConfig,
    sink: FrameSink,
    inner: Mutex<Inner>,
    restart_in_flight: AtomicBool,
    stats: Arc<PullStats>,
}

impl VideoStream {
    /// `sink` receives every completed fragment group, synchronously on
    /// the pull thread.
    pub fn new(
        engine: Arc<dyn PipelineEngine>,
        config: StreamConfig,
        sink: impl Fn(FragmentGroup) + Send + Sync + 'static,
    ) -> Self {
        Self {
            engine,
            config,
            sink: Arc::new(sink),
            inner: Mutex::new(Inner {
                pipeline: None,
                created_at: Instant::now(),
                pull_run: Arc::new(AtomicBool::new(false)),
                pull_thread: None,
            }),
            restart_in_flight: AtomicBool::new(false),
            stats: Arc::new(PullStats::default()),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Construct the pipeline and spawn the pull thread.
    ///
    /// Fails without touching anything when a pipeline already exists;
    /// the previous one must be torn down first. Construction errors
    /// leave the stream without a pipeline; the caller may retry via
    /// `restart`.
    pub fn setup(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        self.setup_locked(&mut inner)
    }

    /// Set the pipeline to playing. Warns and returns when no pipeline
    /// exists.
    pub fn start(&self) {
        let mut inner = self.lock_inner();
        self.start_locked(&mut inner);
    }

    /// Set the pipeline to paused. Warns and returns when no pipeline
    /// exists.
    pub fn stop(&self) {
        let mut inner = self.lock_inner();
        self.stop_locked(&mut inner);
    }

    /// Stop the pull thread, tear the pipeline down and release it.
    /// Safe to call when already cleaned up.
    pub fn cleanup(&self) {
        let mut inner = self.lock_inner();
        self.cleanup_locked(&mut inner);
    }

    /// Full stop → cleanup → setup → start sequence, serialized against
    /// every other lifecycle operation and debug read.
    pub fn restart(&self) {
        let mut inner = self.lock_inner();
        debug!("restarting video stream");
        self.stop_locked(&mut inner);
        self.cleanup_locked(&mut inner);
        if let Err(e) = self.setup_locked(&mut inner) {
            error!("restart: pipeline setup failed: {:#}", e);
            return;
        }
        self.start_locked(&mut inner);
        debug!("video stream restarted");
    }

    /// Dispatch a restart to a worker thread and return immediately.
    ///
    /// At most one dispatched restart is in flight at a time; returns
    /// whether this call scheduled one.
    pub fn request_restart(self: &Arc<Self>) -> bool {
        if self
            .restart_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("restart already in flight");
            return false;
        }
        let this = Arc::clone(self);
        thread::spawn(move || {
            this.restart();
            this.restart_in_flight.store(false, Ordering::SeqCst);
        });
        true
    }

    /// Restart the stream if the pipeline reports failure.
    ///
    /// Meant to be called periodically (about once per second). Within
    /// the warm-up window after setup this never restarts, since the capture
    /// device may legitimately still be initializing.
    pub fn health_check(&self) {
        let (pipeline, created_at) = {
            let inner = self.lock_inner();
            match inner.pipeline.as_ref() {
                None => {
                    debug!("health check: no pipeline");
                    return;
                }
                Some(pipeline) => (Arc::clone(pipeline), inner.created_at),
            }
        };
        if created_at.elapsed() < self.config.warmup {
            return;
        }
        if pipeline.query_state(STATE_CHANGE_TIMEOUT).is_failed() {
            warn!("pipeline is not running, restarting video stream (check camera / parameters)");
            self.restart();
        }
    }

    /// Bounded-time snapshot of the pipeline state and pull counters.
    pub fn debug_state(&self) -> String {
        let pipeline = {
            let inner = self.lock_inner();
            inner.pipeline.as_ref().map(Arc::clone)
        };
        let stats = format!(
            "pulled {} pkts / {} frames / {} bytes, {} forced emits",
            self.stats.fragments.load(Ordering::Relaxed),
            self.stats.frames.load(Ordering::Relaxed),
            self.stats.bytes.load(Ordering::Relaxed),
            self.stats.forced_emits.load(Ordering::Relaxed),
        );
        match pipeline {
            Some(pipeline) => format!(
                "VideoStream {} | {}",
                pipeline.query_state(STATE_CHANGE_TIMEOUT),
                stats
            ),
            None => format!("VideoStream no pipeline | {}", stats),
        }
    }

    fn setup_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.pipeline.is_some() {
            warn!("setup: pipeline already exists, cleanup first");
            bail!("pipeline already exists");
        }

        let description = self.config.pipeline_description();
        debug!("starting pipeline [{}]", description);

        let pipeline = match self.engine.build(&description) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                error!("failed to create pipeline: {:#}", e);
                return Err(e);
            }
        };
        inner.created_at = Instant::now();

        let run = Arc::new(AtomicBool::new(true));
        let handle = {
            let pipeline = Arc::clone(&pipeline);
            let run = Arc::clone(&run);
            let sink = Arc::clone(&self.sink);
            let stats = Arc::clone(&self.stats);
            let reassembler = FrameReassembler::new(self.config.codec.end_of_frame());
            thread::spawn(move || pull_loop(pipeline, run, reassembler, sink, stats))
        };

        inner.pipeline = Some(pipeline);
        inner.pull_run = run;
        inner.pull_thread = Some(handle);
        Ok(())
    }

    fn start_locked(&self, inner: &mut Inner) {
        let Some(pipeline) = inner.pipeline.as_ref() else {
            warn!("start: no pipeline");
            return;
        };
        if let Err(e) = pipeline.set_state(PipelineState::Playing, STATE_CHANGE_TIMEOUT) {
            warn!("failed to set pipeline playing: {:#}", e);
        }
        debug!("{}", pipeline.query_state(STATE_CHANGE_TIMEOUT));
    }

    fn stop_locked(&self, inner: &mut Inner) {
        let Some(pipeline) = inner.pipeline.as_ref() else {
            warn!("stop: no pipeline");
            return;
        };
        if let Err(e) = pipeline.set_state(PipelineState::Paused, STATE_CHANGE_TIMEOUT) {
            warn!("failed to pause pipeline: {:#}", e);
        }
        debug!("{}", pipeline.query_state(STATE_CHANGE_TIMEOUT));
    }

    fn cleanup_locked(&self, inner: &mut Inner) {
        inner.pull_run.store(false, Ordering::Relaxed);
        if let Some(handle) = inner.pull_thread.take() {
            debug!("terminating pull thread");
            let _ = handle.join();
        }
        // The pull thread is joined before the pipeline is released, so
        // no pull can ever touch a freed pipeline.
        match inner.pipeline.take() {
            None => debug!("cleanup: no pipeline"),
            Some(pipeline) => {
                if let Err(e) = pipeline.set_state(PipelineState::Null, STATE_CHANGE_TIMEOUT) {
                    warn!("failed to tear down pipeline: {:#}", e);
                }
            }
        }
    }
}

impl Drop for VideoStream {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Pull one packet at a time off the pipeline and feed the reassembler;
/// completed groups go to the sink synchronously. Pull timeouts just
/// loop; the run flag ends the loop and discards any partial frame.
fn pull_loop(
    pipeline: Arc<dyn Pipeline>,
    run: Arc<AtomicBool>,
    mut reassembler: FrameReassembler,
    sink: FrameSink,
    stats: Arc<PullStats>,
) {
    while run.load(Ordering::Relaxed) {
        let Some(fragment) = pipeline.try_pull(PULL_TIMEOUT) else {
            continue;
        };
        stats.fragments.fetch_add(1, Ordering::Relaxed);
        stats.bytes.fetch_add(fragment.len() as u64, Ordering::Relaxed);

        if let Some(group) = reassembler.on_fragment(fragment.payload, fragment.dts_us) {
            stats.frames.fetch_add(1, Ordering::Relaxed);
            stats
                .forced_emits
                .store(reassembler.forced_emits(), Ordering::Relaxed);
            (sink)(group);
        }
    }
    reassembler.reset();
}
