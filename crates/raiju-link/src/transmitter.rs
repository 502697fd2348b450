//! FEC transmitter contract and the queued production implementation
//!
//! The FEC encoding and the radiotap/injection wire side live in the
//! downstream encoder daemon; this module consumes it through the
//! [`Injector`] seam. [`QueuedTransmitter`] owns the bounded block queue
//! in front of it: enqueue is best-effort with a bounded wait, and on a
//! full queue the frame is dropped; stale video is worthless, so there
//! is no retry.

use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use raiju_core::{FecParams, FragmentGroup};
use tracing::{debug, info, warn};

/// Radiotap header parameters handed to the encoder at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadiotapParams {
    pub bandwidth_mhz: u32,
    pub short_gi: bool,
    pub stbc: u8,
    pub ldpc: bool,
    pub mcs_index: u8,
}

impl Default for RadiotapParams {
    fn default() -> Self {
        Self {
            bandwidth_mhz: 20,
            short_gi: false,
            stbc: 0,
            ldpc: false,
            mcs_index: 3,
        }
    }
}

/// Transmission options fixed at construction time.
#[derive(Debug, Clone)]
pub struct TransmitterOptions {
    /// Interface the encoder injects on
    pub interface: String,
    /// Radio port (stream id on the link)
    pub radio_port: u8,
    /// FEC redundancy overhead in percent
    pub fec_overhead_percentage: u32,
    /// Fixed FEC block length k; 0 selects variable block length
    pub fixed_k: u32,
    /// Queueing mode: enqueue blocks to a worker instead of injecting on
    /// the caller's thread
    pub use_block_queue: bool,
    /// Depth of the block queue
    pub queue_depth: usize,
    /// Local UDP port the encoder daemon listens on
    pub encoder_port: u16,
}

impl Default for TransmitterOptions {
    fn default() -> Self {
        Self {
            interface: "wlan0".to_string(),
            radio_port: 60,
            fec_overhead_percentage: 50,
            fixed_k: 0,
            use_block_queue: true,
            queue_depth: 64,
            encoder_port: 5602,
        }
    }
}

/// The enqueue-block contract against the external FEC transmitter.
pub trait FecTransmitter: Send + Sync {
    /// Enqueue one frame's fragments, waiting at most `timeout` for
    /// queue space. Returns whether the block was accepted.
    fn try_enqueue_block(&self, group: FragmentGroup, timeout: Duration) -> bool;

    /// Live parameter updates; each returns whether the change was
    /// accepted.
    fn update_mcs_index(&self, mcs: u8) -> bool;
    fn update_fec_k(&self, block_length: u32) -> bool;
    fn update_fec_percentage(&self, percentage: u32) -> bool;
    fn update_variable_bitrate(&self, enable: bool) -> bool;
    fn update_max_block_size(&self, max: u32) -> bool;

    /// Human-readable statistics snapshot.
    fn debug_state(&self) -> String;
}

/// Hands one link-layer payload to the encoder. The wire format past
/// this seam belongs to the encoder daemon.
pub trait Injector: Send + Sync {
    fn inject(&self, payload: &[u8]) -> io::Result<usize>;
}

/// Feeds the local encoder daemon over UDP datagrams.
pub struct UdpInjector {
    socket: UdpSocket,
}

impl UdpInjector {
    pub fn local(port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(("127.0.0.1", 0))?;
        socket.connect(("127.0.0.1", port))?;
        Ok(Self { socket })
    }
}

impl Injector for UdpInjector {
    fn inject(&self, payload: &[u8]) -> io::Result<usize> {
        self.socket.send(payload)
    }
}

struct TxParams {
    mcs_index: u8,
    fec: FecParams,
}

#[derive(Default)]
struct TxCounters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    packets: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
}

struct TxShared {
    params: Mutex<TxParams>,
    counters: TxCounters,
}

/// Production transmitter: bounded block queue plus a worker thread
/// draining frames into the injector.
pub struct QueuedTransmitter {
    /// None in direct mode (injection happens on the caller's thread)
    queue: Option<SyncSender<FragmentGroup>>,
    injector: Arc<dyn Injector>,
    shared: Arc<TxShared>,
    worker: Option<JoinHandle<()>>,
}

impl QueuedTransmitter {
    /// Construct against the local encoder daemon.
    pub fn spawn(options: &TransmitterOptions, radiotap: &RadiotapParams) -> Result<Self> {
        let injector = UdpInjector::local(options.encoder_port)
            .with_context(|| format!("failed to open encoder socket :{}", options.encoder_port))?;
        Self::with_injector(options, radiotap, Arc::new(injector))
    }

    /// Construct with a specific injector (used by tests and alternate
    /// encoder transports).
    pub fn with_injector(
        options: &TransmitterOptions,
        radiotap: &RadiotapParams,
        injector: Arc<dyn Injector>,
    ) -> Result<Self> {
        let shared = Arc::new(TxShared {
            params: Mutex::new(TxParams {
                mcs_index: radiotap.mcs_index,
                fec: FecParams {
                    block_length: options.fixed_k,
                    fec_percentage: options.fec_overhead_percentage,
                    ..Default::default()
                },
            }),
            counters: TxCounters::default(),
        });

        let (queue, worker) = if options.use_block_queue {
            let (tx, rx) = mpsc::sync_channel(options.queue_depth.max(1));
            let worker = {
                let injector = Arc::clone(&injector);
                let shared = Arc::clone(&shared);
                thread::spawn(move || drain_blocks(rx, injector, shared))
            };
            (Some(tx), Some(worker))
        } else {
            (None, None)
        };

        info!(
            "transmitter ready on {} (radio port {}, fec {}%, encoder :{})",
            options.interface, options.radio_port, options.fec_overhead_percentage,
            options.encoder_port,
        );

        Ok(Self {
            queue,
            injector,
            shared,
            worker,
        })
    }
}

impl FecTransmitter for QueuedTransmitter {
    fn try_enqueue_block(&self, group: FragmentGroup, timeout: Duration) -> bool {
        let counters = &self.shared.counters;
        let Some(queue) = self.queue.as_ref() else {
            inject_group(&group, self.injector.as_ref(), &self.shared);
            counters.enqueued.fetch_add(1, Ordering::Relaxed);
            return true;
        };

        let deadline = Instant::now() + timeout;
        let mut group = group;
        loop {
            match queue.try_send(group) {
                Ok(()) => {
                    counters.enqueued.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(TrySendError::Full(returned)) => {
                    if Instant::now() >= deadline {
                        counters.dropped.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                    group = returned;
                    thread::sleep(Duration::from_millis(1));
                }
                Err(TrySendError::Disconnected(_)) => {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
        }
    }

    fn update_mcs_index(&self, mcs: u8) -> bool {
        debug!("update_mcs_index {}", mcs);
        self.lock_params().mcs_index = mcs;
        true
    }

    fn update_fec_k(&self, block_length: u32) -> bool {
        debug!("update_fec_k {}", block_length);
        self.lock_params().fec.block_length = block_length;
        true
    }

    fn update_fec_percentage(&self, percentage: u32) -> bool {
        debug!("update_fec_percentage {}", percentage);
        self.lock_params().fec.fec_percentage = percentage;
        true
    }

    fn update_variable_bitrate(&self, enable: bool) -> bool {
        debug!("update_variable_bitrate {}", enable);
        self.lock_params().fec.variable_bitrate = enable;
        true
    }

    fn update_max_block_size(&self, max: u32) -> bool {
        if max == 0 {
            warn!("rejecting max block size 0");
            return false;
        }
        debug!("update_max_block_size {}", max);
        self.lock_params().fec.max_block_size = max;
        true
    }

    fn debug_state(&self) -> String {
        let (mcs, fec) = {
            let params = self.lock_params();
            (params.mcs_index, params.fec.clone())
        };
        let counters = &self.shared.counters;
        format!(
            "enqueued {} blocks ({} dropped), injected {} pkts / {} bytes ({} errors) | \
             mcs {} k {} fec {}% vbr {} max {}",
            counters.enqueued.load(Ordering::Relaxed),
            counters.dropped.load(Ordering::Relaxed),
            counters.packets.load(Ordering::Relaxed),
            counters.bytes.load(Ordering::Relaxed),
            counters.errors.load(Ordering::Relaxed),
            mcs,
            fec.block_length,
            fec.fec_percentage,
            fec.variable_bitrate,
            fec.max_block_size,
        )
    }
}

impl QueuedTransmitter {
    fn lock_params(&self) -> std::sync::MutexGuard<'_, TxParams> {
        self.shared
            .params
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for QueuedTransmitter {
    fn drop(&mut self) {
        // Closing the queue ends the worker loop once it has drained
        self.queue = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn drain_blocks(rx: Receiver<FragmentGroup>, injector: Arc<dyn Injector>, shared: Arc<TxShared>) {
    while let Ok(group) = rx.recv() {
        inject_group(&group, injector.as_ref(), &shared);
    }
    debug!("transmitter worker finished");
}

fn inject_group(group: &FragmentGroup, injector: &dyn Injector, shared: &TxShared) {
    let max = {
        let params = shared
            .params
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        params.fec.max_block_size.max(1) as usize
    };
    if group.len() > max {
        debug!(
            "frame of {} fragments exceeds max block size {}",
            group.len(),
            max
        );
    }
    for fragment in group.fragments() {
        match injector.inject(&fragment.payload) {
            Ok(n) => {
                shared.counters.packets.fetch_add(1, Ordering::Relaxed);
                shared.counters.bytes.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                let errors = shared.counters.errors.fetch_add(1, Ordering::Relaxed) + 1;
                if errors % 100 == 1 {
                    warn!("packet injection failed: {}", e);
                }
            }
        }
    }
}
