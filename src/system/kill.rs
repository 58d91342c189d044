use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::{info, warn};

use super::platform::{self, SignalError};

pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TerminationError {
    #[error("Process {0} not found")]
    NotFound(u32),
    #[error("Access denied when trying to terminate process {0}")]
    AccessDenied(u32),
    #[error("Error: {0}")]
    Other(String),
}

impl TerminationError {
    fn from_signal(pid: u32, err: SignalError) -> Self {
        match err {
            SignalError::NotFound => TerminationError::NotFound(pid),
            SignalError::AccessDenied => TerminationError::AccessDenied(pid),
            SignalError::Other(reason) => TerminationError::Other(reason),
        }
    }
}

/// Terminal states of one termination request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminationState {
    Terminated,
    ForceKilled,
    Failed(TerminationError),
}

impl fmt::Display for TerminationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationState::Terminated => f.write_str("terminated"),
            TerminationState::ForceKilled => f.write_str("force_killed"),
            TerminationState::Failed(_) => f.write_str("failed"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TerminationOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip)]
    pub state: TerminationState,
}

impl TerminationOutcome {
    fn terminated(pid: u32, name: &str) -> Self {
        Self {
            success: true,
            message: format!("Process {pid} ({name}) terminated successfully"),
            state: TerminationState::Terminated,
        }
    }

    fn force_killed(pid: u32, name: &str) -> Self {
        Self {
            success: true,
            message: format!("Process {pid} ({name}) forcefully killed"),
            state: TerminationState::ForceKilled,
        }
    }

    pub fn failed(err: TerminationError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            state: TerminationState::Failed(err),
        }
    }
}

/// Runs the terminate, wait, escalate sequence against live processes.
#[derive(Clone, Debug)]
pub struct TerminationController {
    timeout: Duration,
}

impl Default for TerminationController {
    fn default() -> Self {
        Self::new(DEFAULT_TERMINATE_TIMEOUT)
    }
}

impl TerminationController {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Blocks for up to the configured timeout. With `force` the graceful
    /// request and the wait are skipped and the process is killed outright.
    pub fn terminate(&self, pid: u32, force: bool) -> TerminationOutcome {
        let mut sys = System::new();
        let Some(name) = live_process_name(&mut sys, pid) else {
            return TerminationOutcome::failed(TerminationError::NotFound(pid));
        };

        let outcome = if force {
            self.force_kill(pid, &name)
        } else {
            self.terminate_then_escalate(&mut sys, pid, &name)
        };
        match &outcome.state {
            TerminationState::Failed(err) => warn!(pid, %err, "termination failed"),
            state => info!(pid, %name, %state, "process stopped"),
        }
        outcome
    }

    fn force_kill(&self, pid: u32, name: &str) -> TerminationOutcome {
        match platform::kill(pid) {
            Ok(()) => TerminationOutcome::force_killed(pid, name),
            Err(err) => TerminationOutcome::failed(TerminationError::from_signal(pid, err)),
        }
    }

    fn terminate_then_escalate(
        &self,
        sys: &mut System,
        pid: u32,
        name: &str,
    ) -> TerminationOutcome {
        if let Err(err) = platform::terminate(pid) {
            return TerminationOutcome::failed(TerminationError::from_signal(pid, err));
        }

        let deadline = Instant::now() + self.timeout;
        while Instant::now() < deadline {
            if live_process_name(sys, pid).is_none() {
                return TerminationOutcome::terminated(pid, name);
            }
            thread::sleep(POLL_INTERVAL);
        }
        if live_process_name(sys, pid).is_none() {
            return TerminationOutcome::terminated(pid, name);
        }

        match platform::kill(pid) {
            Ok(()) => TerminationOutcome::force_killed(pid, name),
            // Exited between the last poll and the kill.
            Err(SignalError::NotFound) => TerminationOutcome::terminated(pid, name),
            Err(err) => TerminationOutcome::failed(TerminationError::from_signal(pid, err)),
        }
    }
}

/// Name of `pid` if it is still running; zombies count as gone.
fn live_process_name(sys: &mut System, pid: u32) -> Option<String> {
    let sysinfo_pid = Pid::from_u32(pid);
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sysinfo_pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    sys.process(sysinfo_pid)
        .filter(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
        .map(|p| p.name().to_string_lossy().to_string())
}
