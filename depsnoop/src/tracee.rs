//! Fork-and-park plumbing for the traced command.
//!
//! The kernel program needs to know the root pid *before* the root's
//! first exec runs, so the child is forked first, parked on a pipe
//! read, and released into `execvp` only once the programs are
//! attached.

use crate::wait_status::WaitStatus;
use anyhow::{Context, Result};
use nix::unistd::{fork, pipe, read, write, ForkResult, Pid};
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};

pub struct Tracee {
    pub pid: Pid,
    start_fd: OwnedFd,
}

/// Fork a child that blocks until [`Tracee::release`], then execs
/// `command`.
pub fn spawn_parked(command: &[String]) -> Result<Tracee> {
    let argv: Vec<CString> = command
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()
        .context("command contains a NUL byte")?;

    let (read_end, write_end) = pipe().context("pipe")?;
    match unsafe { fork() }.context("fork")? {
        ForkResult::Child => {
            drop(write_end);
            let mut byte = [0u8; 1];
            let _ = read(read_end.as_raw_fd(), &mut byte);
            drop(read_end);
            let _ = nix::unistd::execvp(&argv[0], &argv);
            // Reached only if the exec itself failed.
            std::process::exit(127);
        }
        ForkResult::Parent { child } => {
            drop(read_end);
            Ok(Tracee {
                pid: child,
                start_fd: write_end,
            })
        }
    }
}

impl Tracee {
    /// Release the parked child into its exec.
    pub fn release(&self) -> Result<()> {
        write(&self.start_fd, &[1u8]).context("release tracee")?;
        Ok(())
    }

    /// Non-blocking reap. Returns the wait status once the child has
    /// exited.
    pub fn try_wait(&self) -> Option<WaitStatus> {
        let mut raw_status: i32 = 0;
        let ret = unsafe { libc::waitpid(self.pid.as_raw(), &mut raw_status, libc::WNOHANG) };
        if ret == self.pid.as_raw() {
            Some(WaitStatus::new(raw_status))
        } else {
            None
        }
    }
}
