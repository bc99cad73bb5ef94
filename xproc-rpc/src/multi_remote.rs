use std::panic::{self, AssertUnwindSafe};

use log::{debug, info, warn};
use nix::{
    errno::Errno,
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::{fork, ForkResult, Pid},
};

use crate::process::{self, TERMINATE_GRACE};

/// Exit code of a forked child whose entry panicked
pub const PANIC_EXIT_CODE: i32 = 101;

/// Forked copy of the current process running a single entry function.
/// Unlike [crate::exec_remote::ExecRemote] the child output isn't relayed
pub struct MultiRemote {
    pid: Pid,
    exit_code: Option<i32>,
}

impl MultiRemote {
    /// Fork and run `entry` in the child. The child exits with the returned code.
    ///
    /// # Safety
    /// Only the calling thread survives in the child, so `entry` must not rely
    /// on locks or other state owned by the parent's threads. Fork before
    /// starting hosts, or have `entry` create everything it needs.
    pub unsafe fn spawn<F>(entry: F) -> crate::Result<Self>
    where
        F: FnOnce() -> i32,
    {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let code =
                    panic::catch_unwind(AssertUnwindSafe(entry)).unwrap_or(PANIC_EXIT_CODE);

                // Skip the parent's atexit handlers and destructors
                unsafe { libc::_exit(code) }
            }
            Ok(ForkResult::Parent { child }) => {
                info!("Forked child {child}");

                Ok(Self {
                    pid: child,
                    exit_code: None,
                })
            }
            Err(e) => Err(crate::Error::SpawnFailed(format!("fork: {e}"))),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_raw().unsigned_abs()
    }

    /// The child is running
    pub fn alive(&mut self) -> bool {
        !self.reap()
    }

    /// Exit code once the child is reaped. Signals are negative signal numbers
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Wait for the child to exit by itself. Returns the exit code
    pub fn join(&mut self) -> Option<i32> {
        if self.exit_code.is_none() {
            match waitpid(self.pid, None) {
                Ok(status) => self.exit_code = process::exit_code(status),
                Err(e) => {
                    warn!("Failed to wait for child {}: {e}", self.pid);
                    self.exit_code = Some(-1);
                }
            }
        }

        self.exit_code
    }

    /// SIGTERM the child, SIGKILL it after a grace period, and reap it
    pub fn finish(&mut self) {
        let pid = self.pid;
        process::terminate(pid, TERMINATE_GRACE, || self.reap());

        debug!("Child {pid} finished with {:?}", self.exit_code);
    }

    /// Non-blocking reap. Returns `true` if the child is gone
    fn reap(&mut self) -> bool {
        if self.exit_code.is_some() {
            return true;
        }

        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => false,
            Ok(status) => match process::exit_code(status) {
                Some(code) => {
                    self.exit_code = Some(code);
                    true
                }
                // Stopped or continued
                None => false,
            },
            Err(Errno::ECHILD) => {
                self.exit_code = Some(-1);
                true
            }
            Err(e) => {
                warn!("Failed to wait for child {}: {e}", self.pid);
                false
            }
        }
    }
}

impl Drop for MultiRemote {
    fn drop(&mut self) {
        self.finish()
    }
}
