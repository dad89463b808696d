//! Listener setup and the cooperative event loop.
//!
//! One poll(2) wait per iteration covers the listener, the SIGCHLD
//! self-pipe and every session descriptor the readiness predicates ask
//! for. Each live session is then worked through a fixed step order:
//! drain toward the pty, drain toward the socket, rewind empty buffers,
//! read the socket, run the dialect state machine, read the pty. A
//! would-block result defers a step to the next wakeup; any other I/O
//! failure tears the session down.

use crate::config::ServerConfig;
use crate::protocol::{self, AdminSlot, Disposition};
use crate::pty;
use crate::reaper::ChildWatcher;
use crate::session::{set_nonblocking, Phase, Registry, Session, SessionId};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{setsockopt, sockopt};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use telnetd_core::{command, telnet, TelnetdResult};
use tracing::{debug, info, warn};

/// Readiness reported for one session by the poll pass.
#[derive(Debug, Default, Clone, Copy)]
struct Ready {
    sock_r: bool,
    sock_w: bool,
    pty_r: bool,
    pty_w: bool,
}

/// What a poll entry belongs to.
enum Slot {
    Listener,
    Watcher,
    Sock(SessionId),
    SockOut(SessionId),
    Pty(SessionId),
}

pub struct Server {
    cfg: ServerConfig,
    listener: Option<TcpListener>,
    registry: Registry,
    admin: AdminSlot,
    watcher: Option<ChildWatcher>,
}

impl Server {
    pub fn new(cfg: ServerConfig) -> TelnetdResult<Self> {
        let watcher = if cfg.watch_child {
            Some(ChildWatcher::spawn()?)
        } else {
            None
        };

        let mut registry = Registry::new();
        let listener = if cfg.inherited {
            // Single pre-attached connection: fd 0 carries input, fd 1
            // output. Closing them on session teardown is fine, the
            // process exits with the session.
            let sock_in = unsafe { File::from_raw_fd(libc::STDIN_FILENO) };
            let sock_out = unsafe { File::from_raw_fd(libc::STDOUT_FILENO) };
            set_nonblocking(&sock_in)?;
            set_nonblocking(&sock_out)?;
            // Stdin is usually a socket here, but nobody guarantees it.
            let _ = setsockopt(&sock_in, sockopt::KeepAlive, &true);
            let id = registry.allocate_id();
            registry.insert(Session::new(id, sock_in, Some(sock_out)));
            info!("serving one inherited connection");
            None
        } else {
            let listener = bind_listener(&cfg)?;
            info!(addr = %cfg.addr, "listening");
            Some(listener)
        };

        Ok(Self {
            cfg,
            listener,
            registry,
            admin: AdminSlot::new(),
            watcher,
        })
    }

    pub fn run(&mut self) -> TelnetdResult<()> {
        loop {
            self.tick()?;
        }
    }

    /// One iteration: reap, wait, accept, then service every session.
    fn tick(&mut self) -> TelnetdResult<()> {
        if let Some(watcher) = &mut self.watcher {
            let exited = watcher.reap();
            if !exited.is_empty() {
                for ts in self.registry.iter_mut() {
                    if ts.child.is_some_and(|pid| exited.contains(&pid)) {
                        ts.child_exited = true;
                    }
                }
            }
        }
        let dead: Vec<SessionId> = self
            .registry
            .iter()
            .filter(|ts| ts.child_exited)
            .map(|ts| ts.id)
            .collect();
        for id in dead {
            info!(session = id, "login process exited, closing session");
            self.remove_session(id);
        }

        let (accept_ready, ready) = self.wait_for_readiness()?;

        if accept_ready {
            self.accept_one();
        }

        for (id, r) in ready {
            if self.service(id, r) == Disposition::Kill {
                self.remove_session(id);
            }
        }
        Ok(())
    }

    /// Block until any registered descriptor is ready. Returns whether
    /// the listener fired plus per-session readiness for every session
    /// that existed when the wait started.
    fn wait_for_readiness(&mut self) -> TelnetdResult<(bool, Vec<(SessionId, Ready)>)> {
        let mut ready: Vec<(SessionId, Ready)> = self
            .registry
            .iter()
            .map(|ts| (ts.id, Ready::default()))
            .collect();

        let mut fds: Vec<PollFd> = Vec::new();
        let mut slots: Vec<(Slot, PollFlags)> = Vec::new();

        if let Some(listener) = &self.listener {
            fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
            slots.push((Slot::Listener, PollFlags::POLLIN));
        }
        if let Some(watcher) = &self.watcher {
            fds.push(PollFd::new(watcher.fd(), PollFlags::POLLIN));
            slots.push((Slot::Watcher, PollFlags::POLLIN));
        }
        for ts in self.registry.iter() {
            let mut sock_ev = PollFlags::empty();
            if !ts.inbound.is_full() {
                sock_ev |= PollFlags::POLLIN;
            }
            if ts.sock_out.is_none() && !ts.outbound.is_empty() {
                sock_ev |= PollFlags::POLLOUT;
            }
            if !sock_ev.is_empty() {
                fds.push(PollFd::new(ts.sock_in.as_fd(), sock_ev));
                slots.push((Slot::Sock(ts.id), sock_ev));
            }
            if let Some(sock_out) = &ts.sock_out {
                if !ts.outbound.is_empty() {
                    fds.push(PollFd::new(sock_out.as_fd(), PollFlags::POLLOUT));
                    slots.push((Slot::SockOut(ts.id), PollFlags::POLLOUT));
                }
            }
            if let (Some(pty_fd), Phase::Raw) = (&ts.pty, ts.phase) {
                let mut pty_ev = PollFlags::empty();
                if !ts.inbound.is_empty() {
                    pty_ev |= PollFlags::POLLOUT;
                }
                if !ts.outbound.is_full() {
                    pty_ev |= PollFlags::POLLIN;
                }
                if !pty_ev.is_empty() {
                    fds.push(PollFd::new(pty_fd.as_fd(), pty_ev));
                    slots.push((Slot::Pty(ts.id), pty_ev));
                }
            }
        }

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok((false, Vec::new())),
            Err(e) => return Err(io::Error::from(e).into()),
        }

        let mut accept_ready = false;
        let read_hits = PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP;
        let write_hits = PollFlags::POLLOUT | PollFlags::POLLERR | PollFlags::POLLHUP;
        for (pfd, (slot, requested)) in fds.iter().zip(&slots) {
            let revents = pfd.revents().unwrap_or_else(PollFlags::empty);
            let can_read = requested.contains(PollFlags::POLLIN) && revents.intersects(read_hits);
            let can_write =
                requested.contains(PollFlags::POLLOUT) && revents.intersects(write_hits);
            match slot {
                Slot::Listener => accept_ready |= can_read,
                // Drained by the reap pass at the top of the next tick.
                Slot::Watcher => {}
                Slot::Sock(id) => {
                    if let Some(r) = mark(&mut ready, *id) {
                        r.sock_r |= can_read;
                        r.sock_w |= can_write;
                    }
                }
                Slot::SockOut(id) => {
                    if let Some(r) = mark(&mut ready, *id) {
                        r.sock_w |= can_write;
                    }
                }
                Slot::Pty(id) => {
                    if let Some(r) = mark(&mut ready, *id) {
                        r.pty_r |= can_read;
                        r.pty_w |= can_write;
                    }
                }
            }
        }
        Ok((accept_ready, ready))
    }

    /// Accept one pending connection, if any, and seed its session with
    /// the negotiation offer plus the login banner.
    fn accept_one(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!(%peer, error = %e, "cannot make socket non-blocking");
                    return;
                }
                if let Err(e) = setsockopt(&stream, sockopt::KeepAlive, &true) {
                    debug!(%peer, error = %e, "cannot enable keepalive");
                }
                let sock = File::from(OwnedFd::from(stream));
                let id = self.registry.allocate_id();
                let mut ts = Session::new(id, sock, None);
                let hostname = nix::unistd::gethostname()
                    .map(|h| h.to_string_lossy().into_owned())
                    .unwrap_or_default();
                ts.send(&format!(
                    "{}{}{}",
                    command::LOGIN_PREFIX,
                    hostname,
                    command::LOGIN_PROMPT
                ));
                info!(session = id, %peer, "accepted connection");
                self.registry.insert(ts);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }

    /// Work one session through the fixed step order.
    fn service(&mut self, id: SessionId, r: Ready) -> Disposition {
        let Server {
            registry,
            admin,
            cfg,
            ..
        } = self;
        let Some(ts) = registry.get_mut(id) else {
            return Disposition::Continue;
        };

        // (a) scrub and drain inbound toward the pty (raw tunnel only).
        if r.pty_w {
            let scrub = telnet::scrub(ts.inbound.readable_mut());
            ts.inbound.consume(scrub.removed());
            if let Some(ws) = scrub.window {
                if let Some(pty_fd) = &ts.pty {
                    pty::set_window_size(pty_fd, ws.cols, ws.rows);
                }
            }
            if scrub.kept > 0 {
                let wrote = match &ts.pty {
                    Some(pty_fd) => {
                        match write_some(pty_fd, &ts.inbound.readable()[..scrub.kept]) {
                            Ok(n) => n,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                            Err(e) => {
                                debug!(session = id, error = %e, "pty write failed");
                                return Disposition::Kill;
                            }
                        }
                    }
                    None => 0,
                };
                ts.inbound.consume(wrote);
            }
        }

        // (b) drain outbound toward the socket.
        if r.sock_w && !ts.outbound.is_empty() {
            match write_some(ts.sock_writer(), ts.outbound.readable()) {
                Ok(n) => ts.outbound.consume(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!(session = id, error = %e, "socket write failed");
                    return Disposition::Kill;
                }
            }
        }

        // (c) drained buffers rewind their cursors; the telnet filter's
        // scan window depends on this keeping wrapped spans rare.
        ts.inbound.reset_if_empty();
        ts.outbound.reset_if_empty();

        // (d) read the socket into the inbound buffer.
        if r.sock_r {
            match read_some(&ts.sock_in, ts.inbound.writable()) {
                Ok(0) => {
                    info!(session = id, "peer closed connection");
                    return Disposition::Kill;
                }
                Ok(n) => {
                    // Line-mode clients terminate with CR NUL; drop a
                    // trailing NUL so it never reaches the terminal.
                    let data = ts.inbound.writable();
                    let n = if data[n - 1] == 0 { n - 1 } else { n };
                    ts.inbound.produce(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!(session = id, error = %e, "socket read failed");
                    return Disposition::Kill;
                }
            }
        }

        // (e) outside the raw tunnel the dialect machine owns the bytes.
        if ts.phase != Phase::Raw && protocol::run(ts, admin, cfg) == Disposition::Kill {
            return Disposition::Kill;
        }

        // (f) read the pty into the outbound buffer (raw tunnel only).
        if ts.phase == Phase::Raw && r.pty_r {
            let result = match &ts.pty {
                Some(pty_fd) => read_some(pty_fd, ts.outbound.writable()),
                None => return Disposition::Continue,
            };
            match result {
                Ok(0) => {
                    info!(session = id, "pty closed");
                    return Disposition::Kill;
                }
                Ok(n) => ts.outbound.produce(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!(session = id, error = %e, "pty read failed");
                    return Disposition::Kill;
                }
            }
        }

        Disposition::Continue
    }

    /// Remove a session and everything attached to it. Only ever called
    /// from inside the loop iteration.
    fn remove_session(&mut self, id: SessionId) {
        self.admin.release(id);
        if self.registry.remove(id).is_some() {
            info!(session = id, "session closed");
        }
        if self.cfg.inherited {
            info!("inherited connection finished, exiting");
            std::process::exit(0);
        }
    }
}

fn mark(ready: &mut [(SessionId, Ready)], id: SessionId) -> Option<&mut Ready> {
    ready
        .iter_mut()
        .find(|(sid, _)| *sid == id)
        .map(|(_, r)| r)
}

/// `Read`/`Write` are implemented for `&File`, which issues plain
/// read(2)/write(2) on whatever descriptor is behind it, sockets and
/// pty masters included.
fn write_some(mut file: &File, buf: &[u8]) -> io::Result<usize> {
    file.write(buf)
}

fn read_some(mut file: &File, buf: &mut [u8]) -> io::Result<usize> {
    file.read(buf)
}

fn bind_listener(cfg: &ServerConfig) -> TelnetdResult<TcpListener> {
    let listener = TcpListener::bind(cfg.addr)?;
    // Re-issue listen(2) to shrink the kernel accept queue to a single
    // pending connection; the loop accepts one per wakeup anyway.
    if unsafe { libc::listen(listener.as_raw_fd(), 1) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    listener.set_nonblocking(true)?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpStream;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};
    use telnetd_core::NEGOTIATION_OFFER;

    fn test_config(login_path: &str) -> ServerConfig {
        ServerConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
            inherited: false,
            watch_child: false,
            login_path: PathBuf::from(login_path),
            issue_file: PathBuf::from("/nonexistent/issue"),
            session_id_file: PathBuf::from("/nonexistent/session-id"),
        }
    }

    /// Tick the server until `needle` shows up in the client's byte
    /// stream. Single-threaded: the poll wait only returns when there is
    /// actual work, and every queued byte eventually reaches the socket.
    fn drive_until(server: &mut Server, client: &mut TcpStream, got: &mut Vec<u8>, needle: &[u8]) {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut buf = [0u8; 1024];
        while !got.windows(needle.len().max(1)).any(|w| w == needle) {
            assert!(Instant::now() < deadline, "timed out waiting for {needle:?}");
            server.tick().unwrap();
            loop {
                match client.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => got.extend_from_slice(&buf[..n]),
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut
                            || e.kind() == io::ErrorKind::Interrupted =>
                    {
                        break
                    }
                    Err(e) => panic!("client read failed: {e}"),
                }
            }
        }
    }

    #[test]
    fn listener_backlog_accepts_and_defers() {
        let mut server = Server::new(test_config("/bin/true")).unwrap();
        let listener = server.listener.as_ref().unwrap();
        // Non-blocking listener with nothing pending.
        assert_eq!(
            listener.accept().unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        // accept_one on an idle listener must not panic or block.
        server.accept_one();
        assert_eq!(server.registry.len(), 0);
    }

    #[test]
    fn connect_negotiate_and_fail_password_keeps_session() {
        let mut server = Server::new(test_config("/bin/true")).unwrap();
        let addr = server.listener.as_ref().unwrap().local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut got = Vec::new();

        client.write_all(b"C_TO_P_TEST_V1\r\n").unwrap();
        drive_until(&mut server, &mut client, &mut got, b"Password: ");

        // The very first bytes on the wire are the fixed option offer,
        // then the login banner.
        assert!(got.starts_with(&NEGOTIATION_OFFER));
        let text = String::from_utf8_lossy(&got);
        assert!(text.contains("(telnet) "), "missing banner in {text:?}");
        assert!(text.contains(" login: "), "missing prompt in {text:?}");

        client.write_all(b"not-the-password\r\n").unwrap();
        drive_until(&mut server, &mut client, &mut got, b"BAD_PASSWORD\r\n\r\n");
        assert_eq!(server.registry.len(), 1, "session must survive a bad password");

        // The transition table still applies on the same connection.
        client.write_all(b"vuurwerk19\r\nSTATUS\r\n").unwrap();
        drive_until(&mut server, &mut client, &mut got, b"BAD_COMMAND\r\n\r\n");
        assert_eq!(server.registry.len(), 1);
    }

    #[test]
    fn raw_tunnel_bridges_socket_and_pty() {
        // `echo` stands in for login: it prints its argument (the name
        // the client sent) to the pty and exits.
        let mut server = Server::new(test_config("/bin/echo")).unwrap();
        let addr = server.listener.as_ref().unwrap().local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut got = Vec::new();

        client.write_all(b"guest\r\n").unwrap();
        drive_until(&mut server, &mut client, &mut got, b"guest\r\n");
    }
}
