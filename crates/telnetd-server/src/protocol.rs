//! The authentication/command state machine.
//!
//! While a session is in any phase other than the raw tunnel, the event
//! loop hands it here once per iteration instead of forwarding its bytes
//! to a pty. A pass keeps consuming complete lines until none remain,
//! the session drops into the raw tunnel, or it has to be killed; every
//! response goes straight into the session's outbound buffer.

use crate::auth;
use crate::config::ServerConfig;
use crate::crontab::{CrontabDraft, CrontabError};
use crate::pty;
use crate::session::{Phase, Session, SessionId};
use telnetd_core::{command, telnet, Command};
use tracing::{error, info, warn};

/// What the event loop should do with the session after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Kill,
}

/// The process-wide administrative slot: at most one session may author
/// crontabs, and the open draft travels with the slot, not the session.
/// Holding a session id rather than the session keeps ownership with the
/// registry.
pub struct AdminSlot {
    holder: Option<SessionId>,
    pub draft: Option<CrontabDraft>,
}

impl AdminSlot {
    pub fn new() -> Self {
        Self {
            holder: None,
            draft: None,
        }
    }

    pub fn is_holder(&self, id: SessionId) -> bool {
        self.holder == Some(id)
    }

    /// Claim the slot for `id`, evicting any previous holder. The evicted
    /// session keeps its transport but its open draft is discarded; its
    /// next command-phase pass will kill it.
    pub fn claim(&mut self, id: SessionId) {
        if let Some(old) = self.holder {
            info!(old_session = old, new_session = id, "taking over administrative session");
            if self.draft.take().is_some() {
                info!(old_session = old, "open crontab draft discarded");
            }
        }
        self.holder = Some(id);
    }

    /// Drop the claim on session removal.
    pub fn release(&mut self, id: SessionId) {
        if self.holder == Some(id) {
            if self.draft.take().is_some() {
                info!(session = id, "open crontab draft discarded");
            }
            self.holder = None;
        }
    }
}

/// Run one state-machine pass for a non-raw session.
pub fn run(ts: &mut Session, admin: &mut AdminSlot, cfg: &ServerConfig) -> Disposition {
    loop {
        match ts.phase {
            Phase::Raw => return Disposition::Continue,

            Phase::Login => {
                // Strip telnet noise before parsing, as the tunnel would;
                // there is no pty yet, so a window report has nowhere to go.
                let scrub = telnet::scrub(ts.inbound.readable_mut());
                ts.inbound.consume(scrub.removed());

                let Some(line) = next_line(ts) else {
                    return Disposition::Continue;
                };
                if line == command::LOGIN_TOKEN.as_bytes() {
                    ts.send(command::PASSWORD_PROMPT);
                    ts.phase = Phase::Password;
                    continue;
                }

                // An ordinary login name: echo it, then attach a real
                // login process and get out of the way.
                ts.send_bytes(&line);
                match pty::spawn_login(&cfg.login_path, &cfg.issue_file, &line) {
                    Ok(lp) => {
                        ts.pty = Some(lp.master);
                        ts.child = Some(lp.child);
                        ts.phase = Phase::Raw;
                        return Disposition::Continue;
                    }
                    Err(e) => {
                        error!(session = ts.id, error = %e, "cannot start login process");
                        return Disposition::Kill;
                    }
                }
            }

            Phase::Password => {
                let Some(line) = next_line(ts) else {
                    return Disposition::Continue;
                };
                if auth::matches_session_id(&cfg.session_id_file, &line)
                    || line == command::PASSWORD_TOKEN.as_bytes()
                {
                    admin.claim(ts.id);
                    ts.phase = Phase::Command;
                } else {
                    // Conventionally terminal: the client is expected to
                    // disconnect, but nothing forces it to.
                    ts.send(command::BAD_PASSWORD);
                }
            }

            Phase::Command | Phase::Upload | Phase::Done => {
                if !admin.is_holder(ts.id) {
                    warn!(session = ts.id, "superseded administrative session, closing");
                    return Disposition::Kill;
                }
                let Some(line) = next_line(ts) else {
                    return Disposition::Continue;
                };
                match ts.phase {
                    Phase::Command => {
                        if dispatch_command(ts, admin, &line) == CmdOutcome::Bad {
                            return Disposition::Continue;
                        }
                    }
                    Phase::Upload => {
                        if let Command::CronLine(text) = Command::parse(&line) {
                            append_to_draft(ts, admin, text);
                        } else {
                            // The line that ends the upload is already the
                            // next command; finish, then dispatch it.
                            finish_draft(ts, admin);
                            ts.phase = Phase::Command;
                            if dispatch_command(ts, admin, &line) == CmdOutcome::Bad {
                                return Disposition::Continue;
                            }
                        }
                    }
                    Phase::Done => ts.send(command::BAD_COMMAND),
                    _ => unreachable!("raw/login/password handled above"),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdOutcome {
    Handled,
    Bad,
}

fn dispatch_command(ts: &mut Session, admin: &mut AdminSlot, line: &[u8]) -> CmdOutcome {
    match Command::parse(line) {
        Command::CrontabOpen(name) => {
            if admin.draft.is_some() {
                ts.send(command::CRONTAB_BUSY);
                return CmdOutcome::Handled;
            }
            match CrontabDraft::open(name) {
                Ok(draft) => {
                    info!(session = ts.id, dir = %String::from_utf8_lossy(name),
                          "crontab upload started");
                    admin.draft = Some(draft);
                    ts.phase = Phase::Upload;
                }
                Err(e) => ts.send(response_for(&e)),
            }
            CmdOutcome::Handled
        }
        Command::Oneoff => {
            warn!(session = ts.id, "oneoff not implemented");
            CmdOutcome::Handled
        }
        Command::Empty => {
            ts.send(command::RESULT_OK);
            ts.phase = Phase::Done;
            CmdOutcome::Handled
        }
        Command::CronLine(_) | Command::Other => {
            ts.send(command::BAD_COMMAND);
            CmdOutcome::Bad
        }
    }
}

fn append_to_draft(ts: &mut Session, admin: &mut AdminSlot, text: &[u8]) {
    // A draft lost to an earlier I/O failure swallows the rest of the
    // upload silently; the error response already went out.
    let Some(draft) = admin.draft.as_mut() else {
        return;
    };
    if draft.append(text).is_err() {
        admin.draft = None;
        ts.send(command::IO_ERROR);
    }
}

fn finish_draft(ts: &mut Session, admin: &mut AdminSlot) {
    let Some(draft) = admin.draft.take() else {
        return;
    };
    match draft.finalize() {
        Ok(()) => info!(session = ts.id, "crontab installed"),
        Err(e) => ts.send(response_for(&e)),
    }
}

fn response_for(err: &CrontabError) -> &'static str {
    match err {
        CrontabError::NameTooLong => command::NAME_TOO_LONG,
        CrontabError::CreateFailed => command::CREATE_FAILED,
        CrontabError::Io => command::IO_ERROR,
    }
}

/// Take the next complete line, discarding malformed ones the way the
/// terminal path never could produce them: a line with an embedded NUL
/// is logged and dropped.
fn next_line(ts: &mut Session) -> Option<Vec<u8>> {
    let line = ts.inbound.take_line()?;
    if line.contains(&0) {
        warn!(session = ts.id, len = line.len(), "discarding malformed line");
        return None;
    }
    Some(line)
}
