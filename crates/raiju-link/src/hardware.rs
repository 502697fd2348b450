//! Wireless driver detection
//!
//! Some tunables are driver-specific: only the rtl8812au out-of-tree
//! driver honors a per-packet MCS override, and it reads the `iw
//! txpower fixed` value as a power-table index instead of mBm. The
//! driver name comes from the interface's sysfs uevent file.

use std::fmt;
use std::fs;
use std::path::Path;

use tracing::debug;

/// Driver family behind a wireless interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiDriver {
    /// rtl8812au / rtl8812bu out-of-tree family (88XXau and friends)
    Rtl8812au,
    /// Atheros ath9k_htc (ar9271 and friends)
    Ath9kHtc,
    /// Anything else, by reported driver name
    Other(String),
    /// No driver information available
    Unknown,
}

impl WifiDriver {
    /// Detect the driver behind `interface` from sysfs.
    pub fn detect(interface: &str) -> Self {
        let path = format!("/sys/class/net/{}/device/uevent", interface);
        let driver = Self::detect_from_uevent(Path::new(&path));
        debug!("detected driver for {}: {}", interface, driver);
        driver
    }

    /// Detect from a specific uevent file (separated out for tests).
    pub fn detect_from_uevent(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => Self::parse_uevent(&content),
            Err(_) => WifiDriver::Unknown,
        }
    }

    fn parse_uevent(content: &str) -> Self {
        content
            .lines()
            .find_map(|line| line.strip_prefix("DRIVER="))
            .map(Self::from_name)
            .unwrap_or(WifiDriver::Unknown)
    }

    fn from_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.contains("8812au") || lower.contains("88xxau") {
            WifiDriver::Rtl8812au
        } else if lower == "ath9k_htc" {
            WifiDriver::Ath9kHtc
        } else {
            WifiDriver::Other(name.to_string())
        }
    }

    /// Whether the driver honors a per-packet MCS override.
    pub fn supports_mcs_override(&self) -> bool {
        matches!(self, WifiDriver::Rtl8812au)
    }

    /// Whether tx power is applied as a driver power-table index rather
    /// than an mBm value.
    pub fn uses_tx_power_index(&self) -> bool {
        matches!(self, WifiDriver::Rtl8812au)
    }
}

impl fmt::Display for WifiDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WifiDriver::Rtl8812au => write!(f, "rtl8812au"),
            WifiDriver::Ath9kHtc => write!(f, "ath9k_htc"),
            WifiDriver::Other(name) => write!(f, "{}", name),
            WifiDriver::Unknown => write!(f, "unknown"),
        }
    }
}
