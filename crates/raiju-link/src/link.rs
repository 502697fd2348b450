//! Wireless link manager
//!
//! Takes the configured card(s) over into monitor mode, applies the RF
//! parameters and owns the transmitter. The first configured interface
//! is the primary (transmit + receive); any extra interfaces are
//! receive-only and are configured but never driven by the transmit
//! path.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{ensure, Result};
use raiju_core::{FragmentGroup, RadioParams};
use tracing::{debug, info, warn};

use crate::hardware::WifiDriver;
use crate::interface::InterfaceControl;
use crate::transmitter::{FecTransmitter, QueuedTransmitter, RadiotapParams, TransmitterOptions};

/// Bounded wait when handing a frame to the transmitter. Past this the
/// frame is dropped instead of blocking the pull thread.
const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

/// Highest HT MCS index accepted by `set_mcs_index`.
const MAX_MCS_INDEX: u8 = 31;

/// Everything needed to bring the link up.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Monitor-mode capable interfaces; the first one transmits
    pub interfaces: Vec<String>,
    pub radio: RadioParams,
    pub radiotap: RadiotapParams,
    pub options: TransmitterOptions,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            interfaces: vec!["wlan0".to_string()],
            radio: RadioParams::default(),
            radiotap: RadiotapParams::default(),
            options: TransmitterOptions::default(),
        }
    }
}

/// Owns the configured interfaces and the transmit path.
pub struct WirelessLink {
    interfaces: Vec<String>,
    radio: Mutex<RadioParams>,
    driver: WifiDriver,
    ifctl: InterfaceControl,
    /// Released first on drop, before the cards go back to the host
    transmitter: Option<Box<dyn FecTransmitter>>,
}

impl WirelessLink {
    pub fn new(config: LinkConfig) -> Result<Self> {
        ensure!(
            !config.interfaces.is_empty(),
            "at least one wireless interface is required"
        );
        let driver = WifiDriver::detect(&config.interfaces[0]);
        Self::assemble(config, InterfaceControl::new(), driver, |options, radiotap| {
            Ok(Box::new(QueuedTransmitter::spawn(options, radiotap)?) as Box<dyn FecTransmitter>)
        })
    }

    /// Construction order is significant: takeover and monitor mode
    /// first, then RF parameters, then the transmitter.
    fn assemble(
        config: LinkConfig,
        ifctl: InterfaceControl,
        driver: WifiDriver,
        make_transmitter: impl FnOnce(&TransmitterOptions, &RadiotapParams) -> Result<Box<dyn FecTransmitter>>,
    ) -> Result<Self> {
        ensure!(
            !config.interfaces.is_empty(),
            "at least one wireless interface is required"
        );
        let LinkConfig {
            interfaces,
            radio,
            radiotap,
            mut options,
        } = config;
        options.interface = interfaces[0].clone();
        info!("broadcast card: {} (driver {})", options.interface, driver);

        for device in &interfaces {
            if !ifctl.takeover(device) {
                warn!("takeover degraded on {}", device);
            }
        }

        let mut link = Self {
            interfaces,
            radio: Mutex::new(radio),
            driver,
            ifctl,
            transmitter: None,
        };
        link.configure_cards();
        link.transmitter = Some(make_transmitter(&options, &radiotap)?);
        Ok(link)
    }

    fn lock_radio(&self) -> MutexGuard<'_, RadioParams> {
        self.radio.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tx(&self) -> Option<&dyn FecTransmitter> {
        self.transmitter.as_deref()
    }

    fn configure_cards(&self) {
        debug!("configure_cards begin");
        let radio = self.lock_radio().clone();
        for device in &self.interfaces {
            self.ifctl
                .set_frequency_and_width(device, radio.frequency_mhz, radio.channel_width_mhz);
        }
        self.apply_tx_power(&radio);
        debug!("configure_cards end");
    }

    fn apply_tx_power(&self, radio: &RadioParams) -> bool {
        let before = Instant::now();
        let mut ok = true;
        for device in &self.interfaces {
            ok &= if self.driver.uses_tx_power_index() {
                self.ifctl.set_tx_power_index(device, radio.tx_power_index)
            } else {
                self.ifctl.set_tx_power_mbm(device, radio.tx_power_mbm)
            };
        }
        debug!("changing tx power took {:?}", before.elapsed());
        ok
    }

    /// Hand one frame's fragments to the transmitter; returns whether
    /// the block was accepted (a full queue drops it, no retry).
    pub fn transmit(&self, group: FragmentGroup) -> bool {
        match self.tx() {
            Some(tx) => tx.try_enqueue_block(group, ENQUEUE_TIMEOUT),
            None => {
                debug!("no transmit interface");
                false
            }
        }
    }

    /// Change the MCS index without a link restart.
    ///
    /// Only supported by drivers with a per-packet MCS override; when
    /// unsupported, nothing is touched and false is returned.
    pub fn set_mcs_index(&self, mcs: u8) -> bool {
        if !self.driver.supports_mcs_override() {
            debug!("mcs override not supported by {}", self.driver);
            return false;
        }
        if mcs > MAX_MCS_INDEX {
            warn!("mcs index {} out of range", mcs);
            return false;
        }
        debug!("set_mcs_index {}", mcs);
        let Some(tx) = self.tx() else { return false };
        if tx.update_mcs_index(mcs) {
            self.lock_radio().mcs_index = mcs;
            true
        } else {
            false
        }
    }

    pub fn set_video_fec_block_length(&self, block_length: u32) -> bool {
        debug!("set_video_fec_block_length {}", block_length);
        self.tx()
            .map(|tx| tx.update_fec_k(block_length))
            .unwrap_or(false)
    }

    pub fn set_video_fec_percentage(&self, percentage: u32) -> bool {
        debug!("set_video_fec_percentage {}", percentage);
        self.tx()
            .map(|tx| tx.update_fec_percentage(percentage))
            .unwrap_or(false)
    }

    pub fn set_enable_variable_bitrate(&self, enable: bool) -> bool {
        debug!("set_enable_variable_bitrate {}", enable);
        self.tx()
            .map(|tx| tx.update_variable_bitrate(enable))
            .unwrap_or(false)
    }

    pub fn set_max_fec_block_size(&self, max: u32) -> bool {
        debug!("set_max_fec_block_size {}", max);
        self.tx()
            .map(|tx| tx.update_max_block_size(max))
            .unwrap_or(false)
    }

    /// Apply a new tx power to all cards. The value is interpreted per
    /// driver family: a power-table index for rtl8812au, mBm otherwise.
    pub fn set_tx_power(&self, value: u32) -> bool {
        {
            let mut radio = self.lock_radio();
            if self.driver.uses_tx_power_index() {
                radio.tx_power_index = value;
            } else {
                radio.tx_power_mbm = value;
            }
        }
        let radio = self.lock_radio().clone();
        self.apply_tx_power(&radio)
    }

    pub fn driver(&self) -> &WifiDriver {
        &self.driver
    }

    /// Human-readable transmitter statistics snapshot.
    pub fn debug_state(&self) -> String {
        match self.tx() {
            Some(tx) => format!("VidTx: {}", tx.debug_state()),
            None => "VidTx: no transmitter".to_string(),
        }
    }
}

impl Drop for WirelessLink {
    fn drop(&mut self) {
        debug!("wireless link teardown begin");
        // The transmitter goes first so the cards are quiet before the
        // host gets them back
        self.transmitter = None;
        for device in &self.interfaces {
            self.ifctl.restore_host_management(device);
        }
        debug!("wireless link teardown end");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandRunner;
    use bytes::Bytes;
    use raiju_core::FrameFragment;
    use std::sync::Arc;

    /// Records every command line; fails the ones matching `fail_on`.
    struct RecordingRunner {
        calls: Mutex<Vec<String>>,
        fail_on: Vec<&'static str>,
    }

    impl RecordingRunner {
        fn new(fail_on: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_on,
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, program: &str, args: &[&str]) -> i32 {
            let line = format!("{} {}", program, args.join(" "));
            let failed = self.fail_on.iter().any(|needle| line.contains(needle));
            self.calls.lock().unwrap().push(line);
            if failed {
                1
            } else {
                0
            }
        }
    }

    #[derive(Default)]
    struct MockTxState {
        calls: Mutex<Vec<String>>,
        reject: bool,
    }

    struct MockTransmitter(Arc<MockTxState>);

    impl MockTxState {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) -> bool {
            self.calls.lock().unwrap().push(call);
            !self.reject
        }
    }

    impl FecTransmitter for MockTransmitter {
        fn try_enqueue_block(&self, group: FragmentGroup, _timeout: Duration) -> bool {
            self.0.record(format!("enqueue {}", group.len()))
        }
        fn update_mcs_index(&self, mcs: u8) -> bool {
            self.0.record(format!("mcs {}", mcs))
        }
        fn update_fec_k(&self, block_length: u32) -> bool {
            self.0.record(format!("k {}", block_length))
        }
        fn update_fec_percentage(&self, percentage: u32) -> bool {
            self.0.record(format!("fec {}", percentage))
        }
        fn update_variable_bitrate(&self, enable: bool) -> bool {
            self.0.record(format!("vbr {}", enable))
        }
        fn update_max_block_size(&self, max: u32) -> bool {
            self.0.record(format!("max {}", max))
        }
        fn debug_state(&self) -> String {
            "mock tx".to_string()
        }
    }

    fn config(interfaces: &[&str]) -> LinkConfig {
        LinkConfig {
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn build_link(
        runner: &Arc<RecordingRunner>,
        driver: WifiDriver,
        config: LinkConfig,
    ) -> (WirelessLink, Arc<MockTxState>) {
        let state = Arc::new(MockTxState::default());
        let tx_state = Arc::clone(&state);
        let ifctl = InterfaceControl::with_runner(Arc::clone(runner) as Arc<dyn CommandRunner>)
            .settle_delay(Duration::ZERO);
        let link = WirelessLink::assemble(config, ifctl, driver, move |_options, _radiotap| {
            Ok(Box::new(MockTransmitter(tx_state)) as Box<dyn FecTransmitter>)
        })
        .unwrap();
        (link, state)
    }

    fn one_fragment_group() -> FragmentGroup {
        FragmentGroup::from_fragments(vec![FrameFragment::new(Bytes::from_static(b"frame"), 1)])
    }

    #[test]
    fn construction_runs_takeover_then_rf_then_transmitter() {
        let runner = RecordingRunner::new(vec![]);
        let (link, _state) = build_link(&runner, WifiDriver::Rtl8812au, config(&["wlan1"]));

        assert_eq!(
            runner.calls(),
            vec![
                "nmcli device set wlan1 managed no",
                "rfkill unblock all",
                "ip link set dev wlan1 down",
                "iw dev wlan1 set monitor otherbss",
                "ip link set dev wlan1 up",
                "iw dev wlan1 set freq 5745 HT20",
                "iw dev wlan1 set txpower fixed 22",
            ]
        );
        drop(link);
    }

    #[test]
    fn extra_interfaces_are_configured_but_not_primary() {
        let runner = RecordingRunner::new(vec![]);
        let (link, state) = build_link(
            &runner,
            WifiDriver::Rtl8812au,
            config(&["wlan1", "wlan2"]),
        );

        let calls = runner.calls();
        assert!(calls.contains(&"iw dev wlan2 set monitor otherbss".to_string()));
        assert!(calls.contains(&"iw dev wlan2 set freq 5745 HT20".to_string()));

        // Transmit path only ever touches the transmitter, which was
        // constructed on the primary card
        assert!(link.transmit(one_fragment_group()));
        assert_eq!(state.calls(), vec!["enqueue 1"]);
        drop(link);
    }

    #[test]
    fn monitor_mode_failure_degrades_but_still_configures_rf() {
        let runner = RecordingRunner::new(vec!["set monitor"]);
        let (link, _state) = build_link(&runner, WifiDriver::Rtl8812au, config(&["wlan1"]));

        let calls = runner.calls();
        assert!(calls.contains(&"ip link set dev wlan1 up".to_string()));
        assert!(calls.contains(&"iw dev wlan1 set freq 5745 HT20".to_string()));
        drop(link);
    }

    #[test]
    fn mcs_override_requires_driver_support() {
        let runner = RecordingRunner::new(vec![]);
        let (link, state) = build_link(
            &runner,
            WifiDriver::Other("iwlwifi".to_string()),
            config(&["wlan1"]),
        );

        assert!(!link.set_mcs_index(7));
        assert!(state.calls().is_empty(), "transmitter is left untouched");
        drop(link);
    }

    #[test]
    fn mcs_override_forwards_when_supported() {
        let runner = RecordingRunner::new(vec![]);
        let (link, state) = build_link(&runner, WifiDriver::Rtl8812au, config(&["wlan1"]));

        assert!(link.set_mcs_index(7));
        assert_eq!(state.calls(), vec!["mcs 7"]);

        assert!(!link.set_mcs_index(99), "out-of-range index is rejected");
        assert_eq!(state.calls().len(), 1);
        drop(link);
    }

    #[test]
    fn fec_setters_forward_to_transmitter() {
        let runner = RecordingRunner::new(vec![]);
        let (link, state) = build_link(&runner, WifiDriver::Rtl8812au, config(&["wlan1"]));

        assert!(link.set_video_fec_block_length(12));
        assert!(link.set_video_fec_percentage(30));
        assert!(link.set_enable_variable_bitrate(true));
        assert!(link.set_max_fec_block_size(100));

        assert_eq!(state.calls(), vec!["k 12", "fec 30", "vbr true", "max 100"]);
        drop(link);
    }

    #[test]
    fn tx_power_strategy_follows_driver_family() {
        let runner = RecordingRunner::new(vec![]);
        let (link, _state) = build_link(&runner, WifiDriver::Rtl8812au, config(&["wlan1"]));
        assert!(link.set_tx_power(30));
        assert_eq!(
            runner.calls().last().unwrap(),
            "iw dev wlan1 set txpower fixed 30"
        );
        drop(link);

        let runner = RecordingRunner::new(vec![]);
        let (link, _state) = build_link(
            &runner,
            WifiDriver::Other("iwlwifi".to_string()),
            config(&["wlan1"]),
        );
        assert!(link.set_tx_power(2500));
        assert_eq!(
            runner.calls().last().unwrap(),
            "iw dev wlan1 set txpower fixed 2500"
        );
        drop(link);
    }

    #[test]
    fn transmit_reports_transmitter_rejection() {
        let runner = RecordingRunner::new(vec![]);
        let state = Arc::new(MockTxState {
            reject: true,
            ..Default::default()
        });
        let tx_state = Arc::clone(&state);
        let ifctl = InterfaceControl::with_runner(Arc::clone(&runner) as Arc<dyn CommandRunner>)
            .settle_delay(Duration::ZERO);
        let link = WirelessLink::assemble(
            config(&["wlan1"]),
            ifctl,
            WifiDriver::Rtl8812au,
            move |_options, _radiotap| Ok(Box::new(MockTransmitter(tx_state)) as Box<dyn FecTransmitter>),
        )
        .unwrap();

        assert!(!link.transmit(one_fragment_group()));
        drop(link);
    }

    #[test]
    fn drop_restores_host_management_last() {
        let runner = RecordingRunner::new(vec![]);
        let (link, _state) = build_link(
            &runner,
            WifiDriver::Rtl8812au,
            config(&["wlan1", "wlan2"]),
        );
        drop(link);

        let calls = runner.calls();
        let n = calls.len();
        assert_eq!(calls[n - 2], "nmcli device set wlan1 managed yes");
        assert_eq!(calls[n - 1], "nmcli device set wlan2 managed yes");
    }

    #[test]
    fn debug_state_wraps_transmitter_state() {
        let runner = RecordingRunner::new(vec![]);
        let (link, _state) = build_link(&runner, WifiDriver::Rtl8812au, config(&["wlan1"]));
        assert_eq!(link.debug_state(), "VidTx: mock tx");
        drop(link);
    }
}
