use std::io;

use super::{SignalDelivery, SignalError};

pub struct Platform;

fn send(pid: u32, signal: libc::c_int) -> Result<(), SignalError> {
    // 0 addresses our own process group and anything above i32::MAX wraps to
    // a negative pid (a group, or every process for -1).
    let Ok(raw_pid) = libc::pid_t::try_from(pid) else {
        return Err(SignalError::NotFound);
    };
    if raw_pid <= 0 {
        return Err(SignalError::NotFound);
    }
    let rc = unsafe { libc::kill(raw_pid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Err(SignalError::NotFound),
        Some(libc::EPERM) => Err(SignalError::AccessDenied),
        _ => Err(SignalError::Other(err.to_string())),
    }
}

impl SignalDelivery for Platform {
    fn terminate(pid: u32) -> Result<(), SignalError> {
        send(pid, libc::SIGTERM)
    }

    fn kill(pid: u32) -> Result<(), SignalError> {
        send(pid, libc::SIGKILL)
    }
}
