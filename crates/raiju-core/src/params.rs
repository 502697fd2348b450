//! Radio and FEC parameter sets
//!
//! These describe the tunable state of the wireless link. Radio
//! parameters are applied to the interface itself; FEC parameters are
//! forwarded to the transmitter and can be changed live without a link
//! restart.

use serde::{Deserialize, Serialize};

/// RF configuration for the monitor-mode interface(s).
///
/// Both tx-power representations are carried because the application
/// strategy depends on the detected driver: the rtl8812au family reads
/// the `iw txpower fixed` value as a driver power-table index, everything
/// else takes a proper mBm value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioParams {
    /// Center frequency in MHz
    pub frequency_mhz: u32,
    /// Channel width in MHz (5, 10, 20 or 40)
    pub channel_width_mhz: u32,
    /// Transmit power in mBm (100 * dBm), used by mainline drivers
    pub tx_power_mbm: u32,
    /// Driver power-table index, used by the rtl8812au family
    pub tx_power_index: u32,
    /// Modulation and coding scheme index
    pub mcs_index: u8,
}

impl Default for RadioParams {
    fn default() -> Self {
        Self {
            frequency_mhz: 5745,
            channel_width_mhz: 20,
            tx_power_mbm: 2200,
            tx_power_index: 22,
            mcs_index: 3,
        }
    }
}

/// Live-tunable FEC parameters, owned by the link manager and forwarded
/// to the transmitter on change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FecParams {
    /// FEC block length (k). 0 selects variable block length.
    pub block_length: u32,
    /// Redundancy overhead in percent
    pub fec_percentage: u32,
    /// Whether the encoder may vary the video bitrate
    pub variable_bitrate: bool,
    /// Platform ceiling on fragments per FEC block
    pub max_block_size: u32,
}

impl Default for FecParams {
    fn default() -> Self {
        Self {
            block_length: 8,
            fec_percentage: 50,
            variable_bitrate: false,
            max_block_size: 80,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radio_defaults_are_5ghz_ht20() {
        let radio = RadioParams::default();
        assert_eq!(radio.frequency_mhz, 5745);
        assert_eq!(radio.channel_width_mhz, 20);
        assert_eq!(radio.mcs_index, 3);
    }

    #[test]
    fn fec_defaults() {
        let fec = FecParams::default();
        assert_eq!(fec.block_length, 8);
        assert_eq!(fec.fec_percentage, 50);
        assert!(!fec.variable_bitrate);
        assert_eq!(fec.max_block_size, 80);
    }
}
