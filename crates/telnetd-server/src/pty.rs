//! Pty allocation and login process spawn.
//!
//! The parent keeps the non-blocking master side; the child becomes a
//! session leader on the slave side and execs the login program with the
//! client-supplied name as its argument. Everything between fork and exec
//! sticks to raw async-signal-safe libc calls, so all allocation (issue
//! banner, argv strings) happens before the fork.

use crate::session::set_nonblocking;
use nix::unistd::{fork, ForkResult, Pid};
use std::ffi::CString;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;
use telnetd_core::{TelnetdError, TelnetdResult};
use tracing::{debug, info};

/// A spawned login process attached to a fresh pty.
pub struct LoginPty {
    /// Master side, non-blocking.
    pub master: File,
    pub child: Pid,
}

/// Allocate a pty and spawn `login_path` on its slave side.
///
/// `user` is passed as argv[1]; the contents of `issue_file` (if it
/// exists) are written to the tty before exec, like the banner of a
/// console getty.
pub fn spawn_login(login_path: &Path, issue_file: &Path, user: &[u8]) -> TelnetdResult<LoginPty> {
    let ends = nix::pty::openpty(None, None)
        .map_err(|e| TelnetdError::Pty(format!("openpty failed: {e}")))?;

    // Prepared before fork: no allocation is allowed afterwards in the child.
    let path_c = CString::new(login_path.as_os_str().as_encoded_bytes())
        .map_err(|_| TelnetdError::Spawn("login path contains NUL".into()))?;
    let user_c = CString::new(user.to_vec())
        .map_err(|_| TelnetdError::Spawn("login name contains NUL".into()))?;
    let issue = std::fs::read(issue_file).unwrap_or_default();

    match unsafe { fork() }.map_err(|e| TelnetdError::Spawn(format!("fork failed: {e}")))? {
        ForkResult::Parent { child } => {
            drop(ends.slave);
            let master = File::from(ends.master);
            set_nonblocking(&master)?;
            info!(pid = child.as_raw(), user = %String::from_utf8_lossy(user), "login process spawned");
            Ok(LoginPty { master, child })
        }
        ForkResult::Child => {
            let slave = ends.slave.as_raw_fd();
            let master = ends.master.as_raw_fd();
            unsafe {
                child_exec(slave, master, &path_c, &user_c, &issue);
            }
        }
    }
}

/// Child side: session setup, controlling tty, cooked-mode termios,
/// banner, exec. Never returns.
unsafe fn child_exec(slave: i32, master: i32, path: &CString, user: &CString, issue: &[u8]) -> ! {
    libc::close(master);
    libc::signal(libc::SIGCHLD, libc::SIG_DFL);
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);

    // New session, then make the slave our controlling tty and stdio.
    libc::setsid();
    libc::dup2(slave, 0);
    libc::dup2(slave, 1);
    libc::dup2(slave, 2);
    if slave > 2 {
        libc::close(slave);
    }
    libc::ioctl(0, libc::TIOCSCTTY, 0);
    libc::tcsetpgrp(0, libc::getpid());

    // Cooked mode with echo, NL→CRNL and tab expansion on output, CR→NL
    // on input, no output flow stop.
    let mut term: libc::termios = std::mem::zeroed();
    if libc::tcgetattr(0, &mut term) == 0 {
        term.c_lflag |= libc::ECHO;
        term.c_oflag |= libc::ONLCR | libc::XTABS;
        term.c_iflag |= libc::ICRNL;
        term.c_iflag &= !libc::IXOFF;
        libc::tcsetattr(0, libc::TCSANOW, &term);
    }

    if !issue.is_empty() {
        libc::write(1, issue.as_ptr().cast(), issue.len());
    }

    let argv: [*const libc::c_char; 3] = [path.as_ptr(), user.as_ptr(), std::ptr::null()];
    libc::execv(path.as_ptr(), argv.as_ptr());
    libc::_exit(127);
}

/// Apply a client-reported window size to the pty.
pub fn set_window_size(pty: &File, cols: u16, rows: u16) {
    let size = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let rc = unsafe { libc::ioctl(pty.as_raw_fd(), libc::TIOCSWINSZ, &size) };
    if rc != 0 {
        debug!(cols, rows, "TIOCSWINSZ failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitPidFlag};

    #[test]
    fn spawn_attaches_a_child_to_a_fresh_pty() {
        let lp = spawn_login(
            Path::new("/bin/sh"),
            Path::new("/nonexistent/issue"),
            b"tester",
        )
        .unwrap();
        assert!(lp.child.as_raw() > 0);

        unsafe { libc::kill(lp.child.as_raw(), libc::SIGKILL) };
        // Collect the child so the test leaves no zombie behind.
        let _ = waitpid(lp.child, Some(WaitPidFlag::empty()));
    }

    #[test]
    fn window_size_round_trips_through_the_master() {
        let ends = nix::pty::openpty(None, None).unwrap();
        let master = File::from(ends.master);
        set_window_size(&master, 132, 43);

        let mut size = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCGWINSZ, &mut size) };
        assert_eq!(rc, 0);
        assert_eq!((size.ws_col, size.ws_row), (132, 43));
    }
}
