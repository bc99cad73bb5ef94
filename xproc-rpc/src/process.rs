use std::{
    thread::sleep,
    time::{Duration, Instant},
};

use log::{debug, warn};
use nix::{
    errno::Errno,
    sys::{
        signal::{kill, Signal},
        wait::WaitStatus,
    },
    unistd::Pid,
};

/// Interval between reaping attempts
pub(crate) const REAP_INTERVAL: Duration = Duration::from_millis(20);
/// Time a child gets to exit after SIGTERM
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Exit code of a reaped child. Signals map to negative signal numbers
pub(crate) fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(-(signal as i32)),
        _ => None,
    }
}

/// Call `reap` until it reports the child gone or `timeout` elapses
pub(crate) fn wait_reaped(timeout: Duration, reap: &mut impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;

    loop {
        if reap() {
            return true;
        }

        if Instant::now() >= deadline {
            return false;
        }

        sleep(REAP_INTERVAL);
    }
}

/// SIGTERM the child, SIGKILL it if it's still running after `grace`.
/// `reap` does a non-blocking wait and returns `true` once the child is reaped
pub(crate) fn terminate(pid: Pid, grace: Duration, mut reap: impl FnMut() -> bool) {
    if reap() {
        return;
    }

    debug!("Sending SIGTERM to process {pid}");
    match kill(pid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            reap();
            return;
        }
        Err(e) => warn!("Failed to send SIGTERM to {pid}: {e}"),
    }

    if wait_reaped(grace, &mut reap) {
        debug!("Process {pid} terminated gracefully");
        return;
    }

    debug!("Process {pid} still running, sending SIGKILL");
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process {pid}: {e}"),
    }

    if !wait_reaped(grace, &mut reap) {
        warn!("Failed to reap process {pid}");
    }
}
