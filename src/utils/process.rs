//! Worker-process termination.

/// Hard-kill a worker process. Used only on explicit user abort; the normal
/// interruption path is cooperative (clear the queue, let workers drain).
#[cfg(unix)]
pub fn kill_pid(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn kill_pid(_pid: u32) {}
