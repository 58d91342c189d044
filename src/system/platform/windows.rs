use super::{SignalDelivery, SignalError};

pub struct Platform;

use windows_sys::Win32::{
    Foundation::{CloseHandle, ERROR_ACCESS_DENIED, ERROR_INVALID_PARAMETER, GetLastError},
    System::Threading::{OpenProcess, PROCESS_TERMINATE, TerminateProcess},
};

fn terminate_process(pid: u32) -> Result<(), SignalError> {
    if pid == 0 {
        return Err(SignalError::NotFound);
    }
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            return Err(match GetLastError() {
                ERROR_INVALID_PARAMETER => SignalError::NotFound,
                ERROR_ACCESS_DENIED => SignalError::AccessDenied,
                code => SignalError::Other(format!("OpenProcess failed with error {code}")),
            });
        }
        let ok = TerminateProcess(handle, 1);
        let code = GetLastError();
        CloseHandle(handle);
        if ok == 0 {
            return Err(match code {
                ERROR_ACCESS_DENIED => SignalError::AccessDenied,
                code => SignalError::Other(format!("TerminateProcess failed with error {code}")),
            });
        }
    }
    Ok(())
}

impl SignalDelivery for Platform {
    // Windows has no polite termination signal for arbitrary processes.
    fn terminate(pid: u32) -> Result<(), SignalError> {
        terminate_process(pid)
    }

    fn kill(pid: u32) -> Result<(), SignalError> {
        terminate_process(pid)
    }
}
