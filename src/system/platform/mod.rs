use std::fmt;

/// Classified failure to deliver a signal to a process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalError {
    NotFound,
    AccessDenied,
    Other(String),
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalError::NotFound => f.write_str("no such process"),
            SignalError::AccessDenied => f.write_str("permission denied"),
            SignalError::Other(reason) => f.write_str(reason),
        }
    }
}

pub trait SignalDelivery {
    /// Ask the process to exit.
    fn terminate(pid: u32) -> Result<(), SignalError>;
    /// Kill the process without giving it a chance to clean up.
    fn kill(pid: u32) -> Result<(), SignalError>;
}

#[cfg(unix)]
mod unix;
#[cfg(target_os = "windows")]
mod windows;

#[cfg(unix)]
use unix as platform_impl;
#[cfg(target_os = "windows")]
use windows as platform_impl;

pub fn terminate(pid: u32) -> Result<(), SignalError> {
    platform_impl::Platform::terminate(pid)
}

pub fn kill(pid: u32) -> Result<(), SignalError> {
    platform_impl::Platform::kill(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signalling_missing_pid_reports_not_found() {
        assert_eq!(terminate(u32::MAX), Err(SignalError::NotFound));
        assert_eq!(kill(u32::MAX), Err(SignalError::NotFound));
    }

    #[test]
    fn pid_zero_is_never_signalled() {
        assert_eq!(terminate(0), Err(SignalError::NotFound));
    }
}
