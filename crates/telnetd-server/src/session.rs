//! Per-connection session state and the registry that owns every session.
//!
//! A session pairs a socket with (eventually) a pty running a login
//! process, bridged by two fixed-capacity ring buffers. Sessions are
//! created on accept with the telnet negotiation offer already queued,
//! and are destroyed only from inside the event loop.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use nix::unistd::Pid;
use telnetd_core::{Ring, NEGOTIATION_OFFER};
use tracing::error;

/// Capacity of each of the two per-session buffers: a session and its
/// buffers together stay within one 4 KiB allocation.
pub const BUF_CAPACITY: usize = 2 * 1024;

pub type SessionId = u64;

/// Protocol phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the login name line.
    Login,
    /// Login token seen; waiting for the password line.
    Password,
    /// Authenticated; consuming dialect commands.
    Command,
    /// Inside a crontab upload.
    Upload,
    /// Command conversation ended; every further line is refused.
    Done,
    /// Plain pty tunnel with only telnet filtering applied.
    Raw,
}

pub struct Session {
    pub id: SessionId,
    /// Socket handle; also the write side unless `sock_out` is set.
    pub sock_in: File,
    /// Separate output handle in inherited-connection mode (fd 0 in,
    /// fd 1 out).
    pub sock_out: Option<File>,
    /// Master side of the pty, present once a login process was spawned.
    pub pty: Option<File>,
    pub child: Option<Pid>,
    /// Set by the loop-top reap pass; removal happens in the same loop.
    pub child_exited: bool,
    pub phase: Phase,
    /// socket → pty.
    pub inbound: Ring,
    /// pty → socket.
    pub outbound: Ring,
}

impl Session {
    pub fn new(id: SessionId, sock_in: File, sock_out: Option<File>) -> Self {
        let mut outbound = Ring::new(BUF_CAPACITY);
        outbound
            .extend(&NEGOTIATION_OFFER)
            .expect("offer fits an empty buffer");
        Self {
            id,
            sock_in,
            sock_out,
            pty: None,
            child: None,
            child_exited: false,
            phase: Phase::Login,
            inbound: Ring::new(BUF_CAPACITY),
            outbound,
        }
    }

    /// The handle outbound bytes are written to.
    pub fn sock_writer(&self) -> &File {
        self.sock_out.as_ref().unwrap_or(&self.sock_in)
    }

    /// Queue a fixed response for the client. Responses are bounded by
    /// construction, so a full buffer means the sizing invariant is
    /// broken and the process must not keep running.
    pub fn send(&mut self, text: &str) {
        self.send_bytes(text.as_bytes());
    }

    pub fn send_bytes(&mut self, bytes: &[u8]) {
        if let Err(e) = self.outbound.extend(bytes) {
            error!(session = self.id, error = %e, "response does not fit outbound buffer");
            std::process::abort();
        }
    }
}

/// Owns all live sessions. Only the event loop mutates it.
pub struct Registry {
    sessions: Vec<Session>,
    next_id: SessionId,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: Vec::new(),
            next_id: 1,
        }
    }

    pub fn allocate_id(&mut self) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, session: Session) {
        self.sessions.push(session);
    }

    /// Remove a session; its handles close on drop.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let idx = self.sessions.iter().position(|s| s.id == id)?;
        Some(self.sessions.swap_remove(idx))
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

/// Put a descriptor into non-blocking mode; every handle the event loop
/// touches must fail with WouldBlock instead of stalling the loop.
pub fn set_nonblocking(fd: &impl AsRawFd) -> io::Result<()> {
    let fd = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
