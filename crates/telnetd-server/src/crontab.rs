//! Crontab drafts: staged upload, atomic replacement, reload trigger.
//!
//! An upload writes into `<dir>/root.new` and only a successful finalize
//! renames that over `<dir>/root`, so the canonical file is never seen
//! half-written. Finalize then appends a fixed line to `<dir>/cron.update`
//! so the cron daemon reloads; the append is verified against a concurrent
//! unlink through the file's link count and retried if it lost that race.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Crontabs are authored for root; these names mirror the cron daemon's
/// spool layout.
const STAGING_NAME: &str = "root.new";
const CANONICAL_NAME: &str = "root";
const UPDATE_NAME: &str = "cron.update";
const UPDATE_LINE: &[u8] = b"root\n";

/// Longest accepted directory name: paths are capped at 255 bytes, and
/// the name must leave room for the `/root.new` suffix.
pub const MAX_DIR_LEN: usize = 255 - STAGING_NAME.len() - 1;

#[derive(Debug, Error)]
pub enum CrontabError {
    #[error("crontab directory name too long")]
    NameTooLong,
    #[error("unable to create crontab staging file")]
    CreateFailed,
    #[error("crontab io failure")]
    Io,
}

/// An open staging file plus the directory it will be finalized into.
pub struct CrontabDraft {
    dir: PathBuf,
    file: BufWriter<File>,
}

impl CrontabDraft {
    /// Open `<name>/root.new` for a fresh upload.
    pub fn open(name: &[u8]) -> Result<CrontabDraft, CrontabError> {
        if name.len() > MAX_DIR_LEN {
            return Err(CrontabError::NameTooLong);
        }
        let dir = PathBuf::from(std::ffi::OsStr::from_bytes(name));
        let staging = dir.join(STAGING_NAME);
        let file = File::create(&staging).map_err(|e| {
            warn!(path = %staging.display(), error = %e, "cannot create staging file");
            CrontabError::CreateFailed
        })?;
        Ok(CrontabDraft {
            dir,
            file: BufWriter::new(file),
        })
    }

    /// Append one uploaded line.
    pub fn append(&mut self, text: &[u8]) -> Result<(), CrontabError> {
        self.file
            .write_all(text)
            .and_then(|()| self.file.write_all(b"\n"))
            .map_err(|e| {
                warn!(error = %e, "write to staging file failed");
                CrontabError::Io
            })
    }

    /// Close the staging file, move it into place and poke the reload
    /// trigger. Consumes the draft either way; on error the canonical
    /// file is left untouched.
    pub fn finalize(self) -> Result<(), CrontabError> {
        let CrontabDraft { dir, file } = self;

        let file = file.into_inner().map_err(|e| {
            warn!(error = %e, "flush of staging file failed");
            CrontabError::Io
        })?;
        drop(file);

        let staging = dir.join(STAGING_NAME);
        let canonical = dir.join(CANONICAL_NAME);
        std::fs::rename(&staging, &canonical).map_err(|e| {
            warn!(from = %staging.display(), to = %canonical.display(), error = %e,
                  "rename into place failed");
            CrontabError::Io
        })?;

        notify_reload(&dir)
    }
}

/// Append the update line to `<dir>/cron.update`. The cron daemon may
/// consume and unlink the file concurrently; a zero link count after the
/// write means our line went into an already-deleted inode, so the whole
/// open/write/check cycle is retried on a fresh file.
fn notify_reload(dir: &Path) -> Result<(), CrontabError> {
    let path = dir.join(UPDATE_NAME);
    loop {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| {
                warn!(path = %path.display(), error = %e, "cannot open reload trigger");
                CrontabError::CreateFailed
            })?;
        file.write_all(UPDATE_LINE).map_err(|e| {
            warn!(path = %path.display(), error = %e, "write to reload trigger failed");
            CrontabError::Io
        })?;
        let meta = file.metadata().map_err(|e| {
            warn!(path = %path.display(), error = %e, "fstat of reload trigger failed");
            CrontabError::Io
        })?;
        if meta.nlink() > 0 {
            return Ok(());
        }
        warn!(path = %path.display(), "reload trigger unlinked during write, retrying");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_lands_atomically_with_reload_line() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().as_os_str().as_bytes();

        let mut draft = CrontabDraft::open(dir).unwrap();
        draft.append(b"* * * * * true").unwrap();

        // Nothing canonical until finalize.
        assert!(tmp.path().join("root.new").exists());
        assert!(!tmp.path().join("root").exists());

        draft.finalize().unwrap();

        assert!(!tmp.path().join("root.new").exists());
        let body = std::fs::read(tmp.path().join("root")).unwrap();
        assert_eq!(body, b"* * * * * true\n");
        let update = std::fs::read(tmp.path().join("cron.update")).unwrap();
        assert_eq!(update, b"root\n");
    }

    #[test]
    fn second_upload_replaces_content_and_appends_trigger() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().as_os_str().as_bytes();

        let mut draft = CrontabDraft::open(dir).unwrap();
        draft.append(b"old").unwrap();
        draft.finalize().unwrap();

        let mut draft = CrontabDraft::open(dir).unwrap();
        draft.append(b"new one").unwrap();
        draft.append(b"new two").unwrap();
        draft.finalize().unwrap();

        let body = std::fs::read(tmp.path().join("root")).unwrap();
        assert_eq!(body, b"new one\nnew two\n");
        let update = std::fs::read(tmp.path().join("cron.update")).unwrap();
        assert_eq!(update, b"root\nroot\n");
    }

    #[test]
    fn overlong_name_is_rejected_before_touching_disk() {
        let name = vec![b'x'; MAX_DIR_LEN + 1];
        assert!(matches!(
            CrontabDraft::open(&name),
            Err(CrontabError::NameTooLong)
        ));
    }

    #[test]
    fn unwritable_directory_reports_create_failure() {
        assert!(matches!(
            CrontabDraft::open(b"/nonexistent-telnetd-test-dir"),
            Err(CrontabError::CreateFailed)
        ));
    }

    #[test]
    fn discarded_draft_leaves_canonical_file_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().as_os_str().as_bytes();

        let mut draft = CrontabDraft::open(dir).unwrap();
        draft.append(b"kept").unwrap();
        draft.finalize().unwrap();

        let mut draft = CrontabDraft::open(dir).unwrap();
        draft.append(b"abandoned").unwrap();
        drop(draft);

        let body = std::fs::read(tmp.path().join("root")).unwrap();
        assert_eq!(body, b"kept\n");
    }
}
