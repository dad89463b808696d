//! Session-id credential source.
//!
//! Besides the fixed password, a password line is accepted when it equals
//! the token published in an external session-id file whose first line
//! reads `SESSION_ID <token>`. Any problem reading or parsing the file is
//! logged and counts as a mismatch, never as an error for the client.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use telnetd_core::command::SESSION_ID_PREFIX;
use tracing::warn;

/// Does `candidate` match the token in the session-id file?
pub fn matches_session_id(path: &Path, candidate: &[u8]) -> bool {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unable to open session-id file");
            return false;
        }
    };

    let mut line = String::new();
    if let Err(e) = BufReader::new(file).read_line(&mut line) {
        warn!(path = %path.display(), error = %e, "unable to read session-id file");
        return false;
    }

    let Some(rest) = line.strip_prefix(SESSION_ID_PREFIX) else {
        warn!(path = %path.display(), "missing session-id prefix");
        return false;
    };
    let Some(token) = rest.strip_suffix('\n') else {
        warn!(path = %path.display(), "missing newline in session-id file");
        return false;
    };

    token.as_bytes() == candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn id_file(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn matches_first_line_token() {
        let f = id_file("SESSION_ID abc123\nsecond line\n");
        assert!(matches_session_id(f.path(), b"abc123"));
        assert!(!matches_session_id(f.path(), b"abc12"));
        assert!(!matches_session_id(f.path(), b"abc1234"));
    }

    #[test]
    fn rejects_missing_prefix_or_newline() {
        let f = id_file("TOKEN abc\n");
        assert!(!matches_session_id(f.path(), b"abc"));

        let f = id_file("SESSION_ID abc");
        assert!(!matches_session_id(f.path(), b"abc"));
    }

    #[test]
    fn missing_file_is_a_mismatch() {
        assert!(!matches_session_id(Path::new("/nonexistent/session"), b"x"));
    }
}
