//! Frame fragment types
//!
//! The video pipeline produces encoded access units as a sequence of RTP
//! packets. Each packet pulled off the pipeline is a [`FrameFragment`];
//! the fragments of one complete access unit form a [`FragmentGroup`],
//! which is the unit handed to the radio link for transmission.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One raw buffer pulled from the media pipeline, not yet known to be a
/// complete frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFragment {
    /// Encoded payload (one RTP packet)
    pub payload: Bytes,
    /// Decode timestamp in microseconds
    pub dts_us: u64,
}

impl FrameFragment {
    pub fn new(payload: Bytes, dts_us: u64) -> Self {
        Self { payload, dts_us }
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A complete frame's worth of ordered fragments.
///
/// Groups are produced by the frame reassembler and are never empty:
/// one is emitted only once an end-of-frame marker is seen (or the
/// fragment-count safety ceiling is hit), so it holds at least the
/// fragment that completed it. Fragment order is arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentGroup {
    fragments: Vec<FrameFragment>,
}

impl FragmentGroup {
    /// Build a group from already-ordered fragments.
    pub fn from_fragments(fragments: Vec<FrameFragment>) -> Self {
        debug_assert!(!fragments.is_empty(), "fragment groups are never empty");
        Self { fragments }
    }

    /// Number of fragments in this group
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Sum of all fragment payload sizes in bytes
    pub fn total_bytes(&self) -> usize {
        self.fragments.iter().map(FrameFragment::len).sum()
    }

    /// Decode timestamp of the first fragment (the frame's timestamp)
    pub fn dts_us(&self) -> Option<u64> {
        self.fragments.first().map(|f| f.dts_us)
    }

    pub fn fragments(&self) -> &[FrameFragment] {
        &self.fragments
    }

    pub fn into_fragments(self) -> Vec<FrameFragment> {
        self.fragments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(data: &'static [u8], dts_us: u64) -> FrameFragment {
        FrameFragment::new(Bytes::from_static(data), dts_us)
    }

    #[test]
    fn group_preserves_fragment_order() {
        let group = FragmentGroup::from_fragments(vec![
            fragment(b"AAA", 1),
            fragment(b"BBB", 2),
            fragment(b"CCC", 3),
        ]);
        let payloads: Vec<&[u8]> = group.fragments().iter().map(|f| &f.payload[..]).collect();
        assert_eq!(payloads, vec![b"AAA" as &[u8], b"BBB", b"CCC"]);
    }

    #[test]
    fn group_total_bytes() {
        let group = FragmentGroup::from_fragments(vec![fragment(b"AAAA", 1), fragment(b"BB", 2)]);
        assert_eq!(group.total_bytes(), 6);
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn group_dts_is_first_fragment() {
        let group = FragmentGroup::from_fragments(vec![fragment(b"A", 42), fragment(b"B", 43)]);
        assert_eq!(group.dts_us(), Some(42));
    }
}
