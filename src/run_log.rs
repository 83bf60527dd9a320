//! Append-only run log shared by every invocation.
//!
//! Each event is one `[YYYY-MM-DD HH:MM:SS] message` line in local time.
//! The monitor's own output is appended raw to the same file. After a run,
//! a log larger than the rotation threshold is renamed with a
//! `.backup.YYYYMMDD` suffix so the next write starts a fresh file.

use chrono::{DateTime, Local, NaiveDate, TimeZone};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Logs larger than this many bytes are rotated at the end of a run.
pub const ROTATE_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;

/// Handle to the run log file. Every write reopens the file in append mode,
/// so a rotation by another process never leaves this handle pointing at
/// the renamed backup.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, message: &str) {
        tracing::info!("{message}");
        self.write_line(message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!("{message}");
        self.write_line(&format!("WARNING: {message}"));
    }

    pub fn error(&self, message: &str) {
        tracing::error!("{message}");
        self.write_line(&format!("ERROR: {message}"));
    }

    /// Append captured command output verbatim, newline-terminated.
    pub fn append_raw(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut buf = text.to_string();
        if !buf.ends_with('\n') {
            buf.push('\n');
        }
        if let Err(e) = self.open_append().and_then(|mut f| f.write_all(buf.as_bytes())) {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to append to run log");
        }
    }

    /// Open the log for appending, creating it and its parent directory.
    /// Used as the stdout/stderr sink of child processes.
    pub fn open_append(&self) -> std::io::Result<File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        OpenOptions::new().create(true).append(true).open(&self.path)
    }

    /// Rename the log to its dated backup when it exceeds `threshold` bytes.
    ///
    /// Returns the backup path when a rotation happened. A missing log is
    /// not an error. An existing backup from the same day is replaced.
    pub fn rotate_if_needed(&self, threshold: u64) -> std::io::Result<Option<PathBuf>> {
        let size = match std::fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if size <= threshold {
            tracing::debug!(size, threshold, "run log below rotation threshold");
            return Ok(None);
        }

        let backup = backup_path(&self.path, Local::now().date_naive());
        std::fs::rename(&self.path, &backup)?;
        tracing::info!(
            size,
            backup = %backup.display(),
            "rotated run log"
        );
        Ok(Some(backup))
    }

    fn write_line(&self, message: &str) {
        let line = format_line(&Local::now(), message);
        if let Err(e) = self.open_append().and_then(|mut f| f.write_all(line.as_bytes())) {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to write run log");
        }
    }
}

/// Format one log line: `[YYYY-MM-DD HH:MM:SS] message\n`.
pub fn format_line<Tz: TimeZone>(at: &DateTime<Tz>, message: &str) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("[{}] {message}\n", at.format("%Y-%m-%d %H:%M:%S"))
}

/// `<log>.backup.YYYYMMDD` for the given day.
pub fn backup_path(log: &Path, date: NaiveDate) -> PathBuf {
    let mut name = log.as_os_str().to_owned();
    name.push(format!(".backup.{}", date.format("%Y%m%d")));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_format_line() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap();
        assert_eq!(
            format_line(&at, "Starting traffic monitor"),
            "[2024-03-07 09:05:01] Starting traffic monitor\n"
        );
    }

    #[test]
    fn test_backup_path() {
        let date = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
        assert_eq!(
            backup_path(Path::new("/var/log/traffic_monitor.log"), date),
            PathBuf::from("/var/log/traffic_monitor.log.backup.20241231")
        );
    }

    #[test]
    fn test_levels_are_tagged_and_appended() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path().join("run.log"));

        log.info("first");
        log.warn("second");
        log.error("third");

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('[') && lines[0].ends_with("] first"));
        assert!(lines[1].ends_with("] WARNING: second"));
        assert!(lines[2].ends_with("] ERROR: third"));
    }

    #[test]
    fn test_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path().join("logs/nested/run.log"));
        log.info("hello");
        assert!(log.path().exists());
    }

    #[test]
    fn test_append_raw_terminates_with_newline() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path().join("run.log"));
        log.append_raw("fatal: not a git repository");
        log.append_raw("");
        log.append_raw("line two\n");
        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(contents, "fatal: not a git repository\nline two\n");
    }

    #[test]
    fn test_rotate_missing_log_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path().join("absent.log"));
        assert!(log.rotate_if_needed(ROTATE_THRESHOLD_BYTES).unwrap().is_none());
    }

    #[test]
    fn test_rotate_at_threshold_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path().join("run.log"));
        std::fs::write(log.path(), vec![b'x'; 10]).unwrap();
        assert!(log.rotate_if_needed(10).unwrap().is_none());
        assert!(log.path().exists());
    }

    #[test]
    fn test_rotate_oversized_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path().join("run.log"));
        let file = log.open_append().unwrap();
        file.set_len(ROTATE_THRESHOLD_BYTES + 1).unwrap();
        drop(file);

        let backup = log
            .rotate_if_needed(ROTATE_THRESHOLD_BYTES)
            .unwrap()
            .expect("log should rotate");
        assert_eq!(backup, backup_path(log.path(), Local::now().date_naive()));
        assert!(!log.path().exists());
        assert_eq!(
            std::fs::metadata(&backup).unwrap().len(),
            ROTATE_THRESHOLD_BYTES + 1
        );

        log.info("fresh start");
        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert!(contents.ends_with("] fresh start\n"));
    }
}
