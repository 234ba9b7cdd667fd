//! Process-group signalling.
//!
//! The agent is spawned as the leader of its own process group, so its pid
//! doubles as the group id and every helper it forks is reached too.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::domain::Result;

/// Send `signal` to the process group led by `pid`.
///
/// Returns `false` when the group no longer exists.
pub fn signal_group(pid: u32, signal: Signal) -> Result<bool> {
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(std::io::Error::from(errno).into()),
    }
}

pub fn terminate_group(pid: u32) -> Result<bool> {
    signal_group(pid, Signal::SIGTERM)
}

pub fn kill_group(pid: u32) -> Result<bool> {
    signal_group(pid, Signal::SIGKILL)
}
