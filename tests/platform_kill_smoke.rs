use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use memwatch::system::kill::{TerminationController, TerminationError, TerminationState};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

fn spawn_long_lived_child() -> Child {
    #[cfg(windows)]
    let mut cmd = {
        let mut c = Command::new("powershell");
        c.args([
            "-NoProfile",
            "-NonInteractive",
            "-Command",
            "Start-Sleep -Seconds 30",
        ]);
        c
    };

    #[cfg(not(windows))]
    let mut cmd = {
        let mut c = Command::new("sh");
        c.args(["-c", "sleep 30"]);
        c
    };

    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn child process")
}

/// Spawns `sh` ignoring SIGTERM so only the escalation can stop it.
#[cfg(unix)]
fn spawn_term_ignoring_child() -> Child {
    Command::new("sh")
        .args(["-c", "trap '' TERM; while :; do sleep 1; done"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn child process")
}

fn wait_for_pid(pid: u32, timeout: Duration) -> bool {
    let mut sys = System::new();
    let sys_pid = Pid::from_u32(pid);
    let deadline = Instant::now() + timeout;
    loop {
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::nothing(),
        );
        if sys.process(sys_pid).is_some() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn reap(child: &mut Child) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
            Ok(None) => {
                let _ = child.kill();
                panic!("child process did not exit before timeout");
            }
            Err(err) => {
                let _ = child.kill();
                panic!("failed waiting for child exit: {err}");
            }
        }
    }
}

#[test]
fn terminate_nonexistent_pid_returns_not_found() {
    let outcome = TerminationController::default().terminate(u32::MAX, false);
    assert!(!outcome.success);
    assert!(outcome.message.contains("not found"));
    assert_eq!(
        outcome.state,
        TerminationState::Failed(TerminationError::NotFound(u32::MAX))
    );
}

#[test]
fn terminate_spawned_child() {
    let mut child = spawn_long_lived_child();
    let pid = child.id();
    if !wait_for_pid(pid, Duration::from_secs(3)) {
        let _ = child.kill();
        panic!("child process PID {pid} was not observed before terminate");
    }

    let outcome = TerminationController::new(Duration::from_secs(3)).terminate(pid, false);
    if !outcome.success {
        let _ = child.kill();
        panic!("terminate reported failure: {}", outcome.message);
    }
    assert!(matches!(
        outcome.state,
        TerminationState::Terminated | TerminationState::ForceKilled
    ));
    assert!(outcome.message.contains(&pid.to_string()));
    reap(&mut child);
}

#[test]
fn force_kills_without_waiting() {
    let mut child = spawn_long_lived_child();
    let pid = child.id();
    if !wait_for_pid(pid, Duration::from_secs(3)) {
        let _ = child.kill();
        panic!("child process PID {pid} was not observed before kill");
    }

    let started = Instant::now();
    let outcome = TerminationController::new(Duration::from_secs(30)).terminate(pid, true);
    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.state, TerminationState::ForceKilled);
    assert!(outcome.message.contains("forcefully killed"));
    assert!(started.elapsed() < Duration::from_secs(5));
    reap(&mut child);
}

#[cfg(unix)]
#[test]
fn escalates_when_terminate_is_ignored() {
    let mut child = spawn_term_ignoring_child();
    let pid = child.id();
    if !wait_for_pid(pid, Duration::from_secs(3)) {
        let _ = child.kill();
        panic!("child process PID {pid} was not observed before terminate");
    }
    // Let the shell install its trap before signalling.
    thread::sleep(Duration::from_millis(200));

    let outcome = TerminationController::new(Duration::from_millis(500)).terminate(pid, false);
    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.state, TerminationState::ForceKilled);
    reap(&mut child);
}
