//! Wireless interface takeover and RF configuration
//!
//! Detaches an interface from host network management, switches it into
//! monitor mode and applies RF parameters. Every operation is idempotent
//! and independently retryable: it returns success/failure and never
//! raises, so a partially failed takeover still leaves the system in a
//! usable (if degraded) state.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::command::{CommandRunner, SystemRunner};

/// Wait after detaching from network management before touching the
/// card. NetworkManager applies the managed flag asynchronously; this is
/// a timing workaround, not a correctness guarantee.
const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Shell-command wrappers for one or more wireless interfaces.
pub struct InterfaceControl {
    runner: Arc<dyn CommandRunner>,
    settle: Duration,
}

impl InterfaceControl {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemRunner))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            settle: SETTLE_DELAY,
        }
    }

    /// Override the post-detach settle delay.
    pub fn settle_delay(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn run_ok(&self, program: &str, args: &[&str]) -> bool {
        let code = self.runner.run(program, args);
        if code != 0 {
            warn!("command failed ({}): {} {}", code, program, args.join(" "));
        }
        code == 0
    }

    /// Tell NetworkManager to leave the interface alone.
    pub fn disable_host_management(&self, device: &str) -> bool {
        info!("disable_host_management {}", device);
        self.run_ok("nmcli", &["device", "set", device, "managed", "no"])
    }

    /// Hand the interface back to NetworkManager.
    pub fn restore_host_management(&self, device: &str) -> bool {
        info!("restore_host_management {}", device);
        self.run_ok("nmcli", &["device", "set", device, "managed", "yes"])
    }

    pub fn unblock_rfkill(&self) -> bool {
        info!("unblock_rfkill");
        self.run_ok("rfkill", &["unblock", "all"])
    }

    pub fn set_card_state(&self, device: &str, up: bool) -> bool {
        info!("set_card_state {} up {}", device, up);
        let state = if up { "up" } else { "down" };
        self.run_ok("ip", &["link", "set", "dev", device, state])
    }

    pub fn enable_monitor_mode(&self, device: &str) -> bool {
        info!("enable_monitor_mode {}", device);
        self.run_ok("iw", &["dev", device, "set", "monitor", "otherbss"])
    }

    pub fn set_frequency_and_width(&self, device: &str, freq_mhz: u32, width_mhz: u32) -> bool {
        let width = channel_width_argument(width_mhz);
        info!("set_frequency_and_width {} {}MHz {}", device, freq_mhz, width);
        let freq = freq_mhz.to_string();
        if !self.run_ok("iw", &["dev", device, "set", "freq", &freq, width]) {
            warn!("{}MHz@{}MHz not supported on {}", freq_mhz, width_mhz, device);
            return false;
        }
        true
    }

    /// Set tx power as a proper mBm value (mainline drivers).
    pub fn set_tx_power_mbm(&self, device: &str, mbm: u32) -> bool {
        info!("set_tx_power {} {} mBm", device, mbm);
        let value = mbm.to_string();
        self.run_ok("iw", &["dev", device, "set", "txpower", "fixed", &value])
    }

    /// Set tx power as a driver power-table index. The rtl8812au family
    /// repurposes the fixed txpower value as an index.
    pub fn set_tx_power_index(&self, device: &str, index: u32) -> bool {
        info!("set_tx_power {} index {}", device, index);
        let value = index.to_string();
        self.run_ok("iw", &["dev", device, "set", "txpower", "fixed", &value])
    }

    /// Take ownership of the interface for monitor-mode operation.
    ///
    /// Runs detach → rf-kill unblock → settle → down → monitor → up.
    /// Individual failures are logged and the sequence continues; the
    /// return value is true only when every step succeeded. Callers
    /// treat a false return as degraded, not fatal.
    pub fn takeover(&self, device: &str) -> bool {
        info!("takeover {} begin", device);
        let mut ok = self.disable_host_management(device);
        ok &= self.unblock_rfkill();
        thread::sleep(self.settle);
        ok &= self.set_card_state(device, false);
        ok &= self.enable_monitor_mode(device);
        ok &= self.set_card_state(device, true);
        info!("takeover {} end (ok: {})", device, ok);
        ok
    }
}

impl Default for InterfaceControl {
    fn default() -> Self {
        Self::new()
    }
}

fn channel_width_argument(width_mhz: u32) -> &'static str {
    match width_mhz {
        5 => "5MHz",
        10 => "10MHz",
        20 => "HT20",
        40 => "HT40+",
        other => {
            info!("invalid channel width {}, assuming HT20", other);
            "HT20"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every invocation and fails the ones matching `fail_on`.
    struct ScriptedRunner {
        calls: Mutex<Vec<String>>,
        fail_on: Vec<&'static str>,
    }

    impl ScriptedRunner {
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

    impl CommandRunner for ScriptedRunner {
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

    fn control(runner: Arc<ScriptedRunner>) -> InterfaceControl {
        InterfaceControl::with_runner(runner).settle_delay(Duration::ZERO)
    }

    #[test]
    fn takeover_runs_full_sequence_in_order() {
        let runner = ScriptedRunner::new(vec![]);
        let ctl = control(Arc::clone(&runner));

        assert!(ctl.takeover("wlan1"));
        assert_eq!(
            runner.calls(),
            vec![
                "nmcli device set wlan1 managed no",
                "rfkill unblock all",
                "ip link set dev wlan1 down",
                "iw dev wlan1 set monitor otherbss",
                "ip link set dev wlan1 up",
            ]
        );
    }

    #[test]
    fn takeover_continues_past_monitor_mode_failure() {
        let runner = ScriptedRunner::new(vec!["set monitor"]);
        let ctl = control(Arc::clone(&runner));

        assert!(!ctl.takeover("wlan1"), "overall result reports the failure");

        // The card is still brought back up after the failed step
        let calls = runner.calls();
        assert_eq!(calls.last().unwrap(), "ip link set dev wlan1 up");
        assert_eq!(calls.len(), 5);
    }

    #[test]
    fn frequency_maps_channel_width() {
        let runner = ScriptedRunner::new(vec![]);
        let ctl = control(Arc::clone(&runner));

        assert!(ctl.set_frequency_and_width("wlan1", 5745, 20));
        assert!(ctl.set_frequency_and_width("wlan1", 5745, 40));
        assert!(ctl.set_frequency_and_width("wlan1", 2412, 5));
        // Unknown width falls back to HT20
        assert!(ctl.set_frequency_and_width("wlan1", 5745, 80));

        assert_eq!(
            runner.calls(),
            vec![
                "iw dev wlan1 set freq 5745 HT20",
                "iw dev wlan1 set freq 5745 HT40+",
                "iw dev wlan1 set freq 2412 5MHz",
                "iw dev wlan1 set freq 5745 HT20",
            ]
        );
    }

    #[test]
    fn unsupported_frequency_reports_failure() {
        let runner = ScriptedRunner::new(vec!["set freq"]);
        let ctl = control(runner);
        assert!(!ctl.set_frequency_and_width("wlan1", 9999, 20));
    }

    #[test]
    fn tx_power_variants_use_fixed_setting() {
        let runner = ScriptedRunner::new(vec![]);
        let ctl = control(Arc::clone(&runner));

        assert!(ctl.set_tx_power_mbm("wlan1", 2200));
        assert!(ctl.set_tx_power_index("wlan1", 22));

        assert_eq!(
            runner.calls(),
            vec![
                "iw dev wlan1 set txpower fixed 2200",
                "iw dev wlan1 set txpower fixed 22",
            ]
        );
    }
}
