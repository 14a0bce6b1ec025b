//! Signal delivery to the child by PID.
//!
//! The exit monitor owns the `Child` handle (and with it the reaping wait),
//! so stop has to signal by PID. ESRCH just means the child already exited
//! and is never an error.

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
use tracing::warn;

/// Ask the child to exit (SIGTERM on Unix, forceful on Windows).
pub(crate) fn terminate(pid: u32) {
    #[cfg(unix)]
    {
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            if e != Errno::ESRCH {
                warn!(pid, error = %e, "failed to send SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        // Windows has no graceful termination signal.
        kill(pid);
    }
}

/// Forcefully kill the child (SIGKILL on Unix, taskkill on Windows).
pub(crate) fn kill(pid: u32) {
    #[cfg(unix)]
    {
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            if e != Errno::ESRCH {
                warn!(pid, error = %e, "failed to send SIGKILL");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let result = std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .output();
        if let Err(e) = result {
            warn!(pid, error = %e, "taskkill failed");
        }
    }
}
