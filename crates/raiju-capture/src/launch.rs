//! `gst-launch` child-process pipeline engine
//!
//! Production [`PipelineEngine`] that runs a pipeline description through
//! `gst-launch-1.0` and reads the encoded packet stream off the child's
//! stdout. Descriptions built for this engine terminate in
//! `rtpstreampay ! fdsink fd=1`, so stdout carries RTP packets with the
//! RFC 4571 two-byte length prefix; a reader thread deframes them,
//! stamps a decode timestamp and feeds a bounded sample queue.
//!
//! PAUSED is approximated by discarding samples at the reader (the
//! source keeps producing); NULL kills the child and joins the reader.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use raiju_core::FrameFragment;
use tracing::{debug, warn};

use crate::pipeline::{Pipeline, PipelineEngine, PipelineState, StateChange, StateQuery};

/// Bounded sample queue between the reader thread and `try_pull`.
/// When the puller falls behind, new packets are dropped and counted.
const SAMPLE_QUEUE_DEPTH: usize = 256;

/// Builds pipelines by spawning `gst-launch-1.0`.
pub struct GstLaunchEngine {
    binary: String,
}

impl GstLaunchEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Default for GstLaunchEngine {
    fn default() -> Self {
        Self::new("gst-launch-1.0")
    }
}

impl PipelineEngine for GstLaunchEngine {
    fn build(&self, description: &str) -> Result<Arc<dyn Pipeline>> {
        Ok(Arc::new(LaunchedPipeline::spawn(&self.binary, description)?))
    }
}

/// A running `gst-launch` child plus its packet reader thread.
struct LaunchedPipeline {
    child: Mutex<Child>,
    samples: Mutex<Receiver<FrameFragment>>,
    /// Playing gate: while false, the reader discards packets
    forwarding: Arc<AtomicBool>,
    target: Mutex<PipelineState>,
    reader: Mutex<Option<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
}

impl LaunchedPipeline {
    fn spawn(binary: &str, description: &str) -> Result<Self> {
        if description.trim().is_empty() {
            bail!("empty pipeline description");
        }
        debug!("launching pipeline [{} -q {}]", binary, description);

        let mut child = Command::new(binary)
            .arg("-q")
            .args(description.split_whitespace())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn {binary}. Is GStreamer installed?"))?;

        let stdout = child
            .stdout
            .take()
            .context("failed to capture pipeline stdout")?;

        let (tx, rx) = mpsc::sync_channel(SAMPLE_QUEUE_DEPTH);
        let forwarding = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));

        let reader = {
            let forwarding = Arc::clone(&forwarding);
            let dropped = Arc::clone(&dropped);
            thread::spawn(move || read_packet_stream(stdout, tx, forwarding, dropped))
        };

        Ok(Self {
            child: Mutex::new(child),
            samples: Mutex::new(rx),
            forwarding,
            target: Mutex::new(PipelineState::Paused),
            reader: Mutex::new(Some(reader)),
            dropped,
        })
    }

    fn shutdown(&self) {
        self.forwarding.store(false, Ordering::Relaxed);
        {
            let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Ok(None) = child.try_wait() {
                if let Err(e) = child.kill() {
                    warn!("failed to kill pipeline process: {}", e);
                }
            }
            let _ = child.wait();
        }
        // Killing the child closes its stdout, so the reader exits on EOF
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Pipeline for LaunchedPipeline {
    // State changes on the launcher take effect immediately, so the
    // timeout only bounds `try_pull`.
    fn set_state(&self, target: PipelineState, _timeout: Duration) -> Result<()> {
        match target {
            PipelineState::Playing => self.forwarding.store(true, Ordering::Relaxed),
            PipelineState::Paused => self.forwarding.store(false, Ordering::Relaxed),
            PipelineState::Null => self.shutdown(),
        }
        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = target;
        Ok(())
    }

    fn query_state(&self, _timeout: Duration) -> StateQuery {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match child.try_wait() {
            Ok(None) => StateQuery {
                result: StateChange::Success,
                current: *self.target.lock().unwrap_or_else(PoisonError::into_inner),
                pending: None,
            },
            // Exited on its own or unreachable: the pipeline is gone
            _ => StateQuery {
                result: StateChange::Failure,
                current: PipelineState::Null,
                pending: None,
            },
        }
    }

    fn try_pull(&self, timeout: Duration) -> Option<FrameFragment> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv_timeout(timeout)
            .ok()
    }
}

impl Drop for LaunchedPipeline {
    fn drop(&mut self) {
        self.shutdown();
        let n = self.dropped.load(Ordering::Relaxed);
        if n > 0 {
            debug!("pipeline dropped {} packets at the sample queue", n);
        }
    }
}

/// Deframe the RFC 4571 length-prefixed packet stream coming out of
/// `rtpstreampay` and forward packets into the sample queue.
fn read_packet_stream<R: Read>(
    mut reader: R,
    tx: SyncSender<FrameFragment>,
    forwarding: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
) {
    let epoch = Instant::now();
    let mut header = [0u8; 2];
    let mut packets = 0u64;

    loop {
        if let Err(e) = reader.read_exact(&mut header) {
            debug!("packet stream ended: {}", e);
            break;
        }
        let len = u16::from_be_bytes(header) as usize;
        if len == 0 {
            continue;
        }
        let mut payload = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut payload) {
            warn!("truncated packet (expected {} bytes): {}", len, e);
            break;
        }
        packets += 1;

        if !forwarding.load(Ordering::Relaxed) {
            // paused: the source keeps producing, we discard
            continue;
        }

        let fragment = FrameFragment::new(Bytes::from(payload), epoch.elapsed().as_micros() as u64);
        match tx.try_send(fragment) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }

    debug!("packet reader finished after {} packets", packets);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn framed(packets: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in packets {
            out.extend_from_slice(&(p.len() as u16).to_be_bytes());
            out.extend_from_slice(p);
        }
        out
    }

    #[test]
    fn deframes_length_prefixed_packets() {
        let stream = framed(&[b"hello", b"world!!"]);
        let (tx, rx) = mpsc::sync_channel(8);
        let forwarding = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));

        read_packet_stream(Cursor::new(stream), tx, forwarding, Arc::clone(&dropped));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(&first.payload[..], b"hello");
        assert_eq!(&second.payload[..], b"world!!");
        assert!(rx.try_recv().is_err());
        assert_eq!(dropped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn discards_packets_while_paused() {
        let stream = framed(&[b"discarded", b"also discarded"]);
        let (tx, rx) = mpsc::sync_channel(8);
        let forwarding = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));

        read_packet_stream(Cursor::new(stream), tx, forwarding, dropped);

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn counts_drops_when_queue_full() {
        let stream = framed(&[b"a", b"b", b"c"]);
        let (tx, rx) = mpsc::sync_channel(1);
        let forwarding = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));

        read_packet_stream(Cursor::new(stream), tx, forwarding, Arc::clone(&dropped));

        // One packet fits, the other two are dropped
        assert!(rx.try_recv().is_ok());
        assert_eq!(dropped.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn stops_cleanly_on_truncated_stream() {
        let mut stream = framed(&[b"ok"]);
        stream.extend_from_slice(&100u16.to_be_bytes());
        stream.extend_from_slice(b"short");

        let (tx, rx) = mpsc::sync_channel(8);
        let forwarding = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));

        read_packet_stream(Cursor::new(stream), tx, forwarding, dropped);

        assert_eq!(&rx.try_recv().unwrap().payload[..], b"ok");
        assert!(rx.try_recv().is_err());
    }
}
