//! SIGCHLD watcher.
//!
//! A dedicated signal thread turns each SIGCHLD into one byte on a
//! non-blocking self-pipe, whose read end sits in the event loop's poll
//! set. The loop drains the pipe and reaps at the top of its iteration;
//! the signal thread itself never touches sessions, so all registry
//! mutation stays inside the loop.

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use signal_hook::iterator::Signals;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use telnetd_core::TelnetdResult;
use tracing::debug;

pub struct ChildWatcher {
    pipe_rd: File,
}

impl ChildWatcher {
    /// Install the SIGCHLD handler thread and hand back the poll handle.
    pub fn spawn() -> TelnetdResult<Self> {
        let (rd, wr) = nix::unistd::pipe().map_err(io::Error::from)?;
        let pipe_rd = File::from(rd);
        let pipe_wr = File::from(wr);
        crate::session::set_nonblocking(&pipe_rd)?;
        crate::session::set_nonblocking(&pipe_wr)?;

        let mut signals = Signals::new([libc::SIGCHLD])?;
        std::thread::spawn(move || {
            for _ in signals.forever() {
                // A full pipe already guarantees a wakeup; drop the byte.
                let _ = (&pipe_wr).write(&[1]);
            }
        });

        Ok(Self { pipe_rd })
    }

    /// Read end of the self-pipe, for the poll set.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.pipe_rd.as_fd()
    }

    /// Drain wakeup bytes and collect every child that has exited.
    pub fn reap(&mut self) -> Vec<Pid> {
        let mut buf = [0u8; 64];
        loop {
            match (&self.pipe_rd).read(&mut buf) {
                Ok(n) if n == buf.len() => continue,
                _ => break,
            }
        }

        let mut exited = Vec::new();
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => match status.pid() {
                    Some(pid) => {
                        debug!(pid = pid.as_raw(), "child exited");
                        exited.push(pid);
                    }
                    None => break,
                },
                // ECHILD: nothing left to reap.
                Err(_) => break,
            }
        }
        exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reap_is_quiet_without_children() {
        let mut watcher = ChildWatcher::spawn().unwrap();
        assert!(watcher.reap().is_empty());
    }
}
