//! Frame reassembly
//!
//! Regroups the RTP packets pulled off the pipeline into complete
//! access units. A group is complete when the codec-specific
//! end-of-frame predicate fires on the newest fragment, or when the
//! fragment-count safety ceiling is reached (malformed streams that
//! never produce a detectable frame boundary must not accumulate
//! without bound).

use bytes::Bytes;
use raiju_core::{FragmentGroup, FrameFragment};
use tracing::warn;

/// Safety ceiling on fragments accumulated for a single frame.
pub const MAX_FRAGMENTS_PER_FRAME: usize = 1000;

/// Accumulates fragments into frame-aligned groups.
///
/// Fully synchronous: the caller (the pull loop) feeds fragments one at
/// a time and forwards each completed group before feeding the next, so
/// at most one group is ever in flight.
pub struct FrameReassembler {
    end_of_frame: fn(&[u8]) -> bool,
    fragments: Vec<FrameFragment>,
    forced_emits: u64,
}

impl FrameReassembler {
    pub fn new(end_of_frame: fn(&[u8]) -> bool) -> Self {
        Self {
            end_of_frame,
            fragments: Vec::new(),
            forced_emits: 0,
        }
    }

    /// Append one pulled fragment; returns the completed group when this
    /// fragment finishes a frame.
    pub fn on_fragment(&mut self, payload: Bytes, dts_us: u64) -> Option<FragmentGroup> {
        let is_last = (self.end_of_frame)(&payload);
        self.fragments.push(FrameFragment::new(payload, dts_us));

        if is_last {
            return Some(self.take_group());
        }
        if self.fragments.len() >= MAX_FRAGMENTS_PER_FRAME {
            warn!(
                "no end-of-frame marker after {} fragments, forcing emit",
                self.fragments.len()
            );
            self.forced_emits += 1;
            return Some(self.take_group());
        }
        None
    }

    /// Number of fragments accumulated for the in-progress frame
    pub fn pending(&self) -> usize {
        self.fragments.len()
    }

    /// How often the safety ceiling forced a group out
    pub fn forced_emits(&self) -> u64 {
        self.forced_emits
    }

    /// Discard any partially accumulated frame.
    pub fn reset(&mut self) {
        self.fragments.clear();
    }

    fn take_group(&mut self) -> FragmentGroup {
        FragmentGroup::from_fragments(std::mem::take(&mut self.fragments))
    }
}
