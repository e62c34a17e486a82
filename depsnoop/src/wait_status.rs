//! Thin wrapper around a raw `waitpid` status word, so callers deal
//! with one type instead of the libc macro zoo.

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct WaitStatus {
    status: i32,
}

impl WaitStatus {
    pub fn new(status: i32) -> WaitStatus {
        WaitStatus { status }
    }

    pub fn get(&self) -> i32 {
        self.status
    }

    /// Exit code, if the process exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        if libc::WIFEXITED(self.status) {
            Some(libc::WEXITSTATUS(self.status))
        } else {
            None
        }
    }

    /// Terminating signal, if the process was killed by one.
    pub fn fatal_sig(&self) -> Option<i32> {
        if libc::WIFSIGNALED(self.status) {
            Some(libc::WTERMSIG(self.status))
        } else {
            None
        }
    }

    /// The status a shell would report: the exit code itself, or
    /// 128 + signal for a signalled death.
    pub fn shell_exit_code(&self) -> i32 {
        if let Some(code) = self.exit_code() {
            code
        } else if let Some(sig) = self.fatal_sig() {
            128 + sig
        } else {
            self.status
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Raw status layout: exit code in bits 8..16, terminating signal
    // in bits 0..7.

    #[test]
    fn normal_exit() {
        let status = WaitStatus::new(3 << 8);
        assert_eq!(status.exit_code(), Some(3));
        assert_eq!(status.fatal_sig(), None);
        assert_eq!(status.shell_exit_code(), 3);
    }

    #[test]
    fn zero_exit() {
        let status = WaitStatus::new(0);
        assert_eq!(status.exit_code(), Some(0));
        assert_eq!(status.shell_exit_code(), 0);
    }

    #[test]
    fn signalled_death() {
        let status = WaitStatus::new(libc::SIGKILL);
        assert_eq!(status.exit_code(), None);
        assert_eq!(status.fatal_sig(), Some(libc::SIGKILL));
        assert_eq!(status.shell_exit_code(), 128 + libc::SIGKILL);
    }
}
