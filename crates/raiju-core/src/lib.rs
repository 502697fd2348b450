//! Core types for the Raiju FPV air unit
//!
//! This crate contains the foundational types shared by the capture and
//! link crates:
//! - Frame fragments and fragment groups (the transmission unit)
//! - Radio and FEC parameter sets

mod frame;
mod params;

pub use frame::{FragmentGroup, FrameFragment};
pub use params::{FecParams, RadioParams};
