/// Core types shared across the compartmentd subsystems
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Compartment lifecycle states.
///
/// Transitions are driven exclusively by the lifecycle engine; see
/// `compartment::Compartment::set_state` for the observer contract.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CompartmentState {
    Stopped,
    Starting,
    /// Provisioning boot: the child runs the setup init instead of the
    /// regular one and never reaches `Running`.
    Setup,
    Booting,
    Running,
    Freezing,
    Frozen,
    ShuttingDown,
    /// Child could not be reaped during teardown.
    Zombie,
    Rebooting,
}

impl CompartmentState {
    /// True while the compartment has (or is about to have) a live child
    /// that kernel objects may be attached to.
    pub fn accepts_devices(self) -> bool {
        matches!(
            self,
            CompartmentState::Starting | CompartmentState::Booting | CompartmentState::Running
        )
    }

    /// True if a stop request makes sense in this state.
    pub fn stoppable(self) -> bool {
        !matches!(
            self,
            CompartmentState::Stopped | CompartmentState::ShuttingDown | CompartmentState::Zombie
        )
    }
}

impl std::fmt::Display for CompartmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompartmentState::Stopped => "stopped",
            CompartmentState::Starting => "starting",
            CompartmentState::Setup => "setup",
            CompartmentState::Booting => "booting",
            CompartmentState::Running => "running",
            CompartmentState::Freezing => "freezing",
            CompartmentState::Frozen => "frozen",
            CompartmentState::ShuttingDown => "shutting_down",
            CompartmentState::Zombie => "zombie",
            CompartmentState::Rebooting => "rebooting",
        };
        write!(f, "{}", s)
    }
}

/// Custom error types for compartmentd.
///
/// Hook failures carry one of these kinds; the lifecycle engine recovers
/// from all of them by unwinding, they never abort the daemon.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("resource busy: {0}")]
    ResourceBusy(String),

    #[error("credential operation failed: {0}")]
    Credential(String),

    #[error("kernel operation failed: {op} (errno {errno})")]
    Kernel { op: String, errno: i32 },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a failed syscall with the captured errno.
    pub fn kernel(op: impl Into<String>, errno: nix::errno::Errno) -> Self {
        Error::Kernel {
            op: op.into(),
            errno: errno as i32,
        }
    }

    /// Capture `errno` from the calling thread for a raw libc failure.
    pub fn kernel_last(op: impl Into<String>) -> Self {
        Error::Kernel {
            op: op.into(),
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Kernel {
            op: "io".to_string(),
            errno: err.raw_os_error().unwrap_or(0),
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Error::Kernel {
            op: "syscall".to_string(),
            errno: err as i32,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ConfigInvalid(err.to_string())
    }
}

/// Result type alias for compartmentd operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_acceptance_matches_lifecycle_window() {
        assert!(CompartmentState::Starting.accepts_devices());
        assert!(CompartmentState::Booting.accepts_devices());
        assert!(CompartmentState::Running.accepts_devices());
        assert!(!CompartmentState::Stopped.accepts_devices());
        assert!(!CompartmentState::Frozen.accepts_devices());
        assert!(!CompartmentState::ShuttingDown.accepts_devices());
    }

    #[test]
    fn kernel_error_keeps_errno() {
        let err = Error::kernel("mount", nix::errno::Errno::EPERM);
        match err {
            Error::Kernel { errno, .. } => assert_eq!(errno, libc::EPERM),
            _ => panic!("expected kernel error"),
        }
    }
}
