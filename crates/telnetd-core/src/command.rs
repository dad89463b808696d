//! The line-oriented command dialect layered over authenticated sessions,
//! plus the fixed wire literals: prompts, credentials, and the status
//! blocks sent as responses.

/// Login name that switches a session into the command dialect instead of
/// spawning a login process.
pub const LOGIN_TOKEN: &str = "C_TO_P_TEST_V1";
/// Fixed password accepted alongside the session-id file token.
pub const PASSWORD_TOKEN: &str = "vuurwerk19";
/// Expected first-line prefix of the session-id file.
pub const SESSION_ID_PREFIX: &str = "SESSION_ID ";

pub const LOGIN_PREFIX: &str = "(telnet) ";
pub const LOGIN_PROMPT: &str = " login: ";
pub const PASSWORD_PROMPT: &str = "\r\nPassword: ";

const CMD_CRONTAB: &[u8] = b"CRONTAB ";
const CMD_CRONLINE: &[u8] = b"CRONLINE ";
const CMD_ONEOFF: &[u8] = b"ONEOFF";

/// Response blocks: one status line, then a blank line.
pub const RESULT_OK: &str = "OK\r\n\r\n";
pub const BAD_PASSWORD: &str = "BAD_PASSWORD\r\n\r\n";
pub const BAD_COMMAND: &str = "BAD_COMMAND\r\n\r\n";
pub const NAME_TOO_LONG: &str = "NAME_TOO_LONG\r\n\r\n";
pub const CRONTAB_BUSY: &str = "CRONTAB_BUSY\r\n\r\n";
pub const CREATE_FAILED: &str = "UNABLE_TO_CREATE_NEW_CRONTAB\r\n\r\n";
pub const IO_ERROR: &str = "IO_ERROR\r\n\r\n";

/// One parsed command line. Payloads borrow from the input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// `CRONTAB <name>`: open a crontab draft for directory `<name>`.
    CrontabOpen(&'a [u8]),
    /// `CRONLINE <text>`: one uploaded crontab line.
    CronLine(&'a [u8]),
    /// Reserved one-shot command, prefix-matched like the others.
    Oneoff,
    /// An empty line ends the command conversation.
    Empty,
    Other,
}

impl<'a> Command<'a> {
    pub fn parse(line: &'a [u8]) -> Self {
        if let Some(name) = line.strip_prefix(CMD_CRONTAB) {
            Command::CrontabOpen(name)
        } else if let Some(text) = line.strip_prefix(CMD_CRONLINE) {
            Command::CronLine(text)
        } else if line.starts_with(CMD_ONEOFF) {
            Command::Oneoff
        } else if line.is_empty() {
            Command::Empty
        } else {
            Command::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crontab_takes_the_rest_of_the_line() {
        assert_eq!(
            Command::parse(b"CRONTAB /var/spool/cron dir"),
            Command::CrontabOpen(b"/var/spool/cron dir")
        );
        assert_eq!(Command::parse(b"CRONTAB "), Command::CrontabOpen(b""));
    }

    #[test]
    fn cronline_preserves_payload_bytes() {
        assert_eq!(
            Command::parse(b"CRONLINE * * * * * true"),
            Command::CronLine(b"* * * * * true")
        );
    }

    #[test]
    fn oneoff_matches_on_prefix() {
        assert_eq!(Command::parse(b"ONEOFF"), Command::Oneoff);
        assert_eq!(Command::parse(b"ONEOFF whatever"), Command::Oneoff);
    }

    #[test]
    fn empty_and_unknown_lines() {
        assert_eq!(Command::parse(b""), Command::Empty);
        assert_eq!(Command::parse(b"CRONTAB"), Command::Other); // no space
        assert_eq!(Command::parse(b"STATUS"), Command::Other);
    }
}
