//! Shell command execution for interface management
//!
//! Interface takeover shells out to the usual Linux tooling (`nmcli`,
//! `rfkill`, `ip`, `iw`). Commands are run synchronously; any non-zero
//! exit is treated as failure and logged with the attempted command
//! line, never raised.

use std::process::Command;
use tracing::{debug, warn};

/// Runs one command to completion and reports its exit code.
pub trait CommandRunner: Send + Sync {
    /// Returns the process exit code; -1 when the process could not be
    /// spawned or was killed by a signal.
    fn run(&self, program: &str, args: &[&str]) -> i32;
}

/// Production runner backed by `std::process::Command`.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> i32 {
        debug!("run command [{} {}]", program, args.join(" "));
        match Command::new(program).args(args).status() {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                warn!("failed to spawn {}: {}", program, e);
                -1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_reports_failure() {
        let runner = SystemRunner;
        assert_eq!(runner.run("raiju-no-such-binary", &[]), -1);
    }

    #[test]
    fn true_exits_zero() {
        let runner = SystemRunner;
        assert_eq!(runner.run("true", &[]), 0);
    }

    #[test]
    fn false_exits_nonzero() {
        let runner = SystemRunner;
        assert_ne!(runner.run("false", &[]), 0);
    }
}
