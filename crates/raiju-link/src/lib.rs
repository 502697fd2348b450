//! Wireless link management for the Raiju air unit
//!
//! This crate takes ownership of the monitor-mode interface(s) and owns
//! the transmit path:
//! - Shell command execution for interface management
//! - Interface takeover (host management, rf-kill, monitor mode) and RF
//!   parameter application
//! - Driver detection for capability-gated tuning (MCS override,
//!   tx-power strategy)
//! - The FEC transmitter contract and the queued production
//!   implementation feeding the local encoder
//! - The link manager tying it all together

pub mod command;
pub mod hardware;
pub mod interface;
pub mod link;
pub mod transmitter;

// Re-export commonly used types
pub use command::{CommandRunner, SystemRunner};
pub use hardware::WifiDriver;
pub use interface::InterfaceControl;
pub use link::{LinkConfig, WirelessLink};
pub use transmitter::{
    FecTransmitter, Injector, QueuedTransmitter, RadiotapParams, TransmitterOptions, UdpInjector,
};
