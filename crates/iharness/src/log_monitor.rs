//! Server log observation.
//!
//! A [`LogBookmark`] records the size of a log file at some moment; later
//! counts only consider bytes appended after it. Assertions against the log
//! are retried with [`delay_assert`] because the server flushes its log
//! asynchronously.

use regex::bytes::Regex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Prefix of rotating server log files inside a log directory.
pub const SERVER_LOG_PREFIX: &str = "rodsLog";

/// An expectation about the log that did not hold.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct AssertionFailure(pub String);

/// Byte offset into a log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBookmark {
    path: PathBuf,
    offset: u64,
}

impl LogBookmark {
    /// Bookmark the current end of `path`. A missing file is bookmarked at 0.
    pub fn capture(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let offset = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err),
        };
        Ok(Self { path, offset })
    }

    pub fn at(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Occurrences of `message` appended after this bookmark.
    pub fn count_occurrences(&self, message: &str) -> std::io::Result<usize> {
        count_occurrences_since(&self.path, message, self.offset)
    }

    /// Matches of `pattern` appended after this bookmark.
    pub fn count_matches(&self, pattern: &Regex) -> std::io::Result<usize> {
        count_regex_matches_since(&self.path, pattern, self.offset)
    }

    /// Evaluate `expected` against the occurrences of `message` right now.
    pub fn check(&self, message: &str, expected: &OccurrenceCheck) -> Result<(), AssertionFailure> {
        let count = self.count_occurrences(message).map_err(|err| {
            AssertionFailure(format!("cannot read {}: {err}", self.path.display()))
        })?;
        expected.evaluate(message, count)
    }
}

/// Expected number of occurrences of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OccurrenceCheck {
    Equals(usize),
    GreaterThan(usize),
    FewerThan(usize),
    OneOf(Vec<usize>),
}

impl OccurrenceCheck {
    pub fn evaluate(&self, message: &str, count: usize) -> Result<(), AssertionFailure> {
        let holds = match self {
            Self::Equals(n) => count == *n,
            Self::GreaterThan(n) => count > *n,
            Self::FewerThan(n) => count < *n,
            Self::OneOf(options) => options.contains(&count),
        };
        if holds {
            Ok(())
        } else {
            Err(AssertionFailure(format!(
                "expected {self} occurrences of {message:?}, found {count}"
            )))
        }
    }
}

impl std::fmt::Display for OccurrenceCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equals(n) => write!(f, "exactly {n}"),
            Self::GreaterThan(n) => write!(f, "more than {n}"),
            Self::FewerThan(n) => write!(f, "fewer than {n}"),
            Self::OneOf(options) => write!(f, "one of {options:?}"),
        }
    }
}

pub fn occurrences_equal(bookmark: &LogBookmark, message: &str, n: usize) -> Result<(), AssertionFailure> {
    bookmark.check(message, &OccurrenceCheck::Equals(n))
}

pub fn occurrences_greater_than(
    bookmark: &LogBookmark,
    message: &str,
    n: usize,
) -> Result<(), AssertionFailure> {
    bookmark.check(message, &OccurrenceCheck::GreaterThan(n))
}

pub fn occurrences_fewer_than(
    bookmark: &LogBookmark,
    message: &str,
    n: usize,
) -> Result<(), AssertionFailure> {
    bookmark.check(message, &OccurrenceCheck::FewerThan(n))
}

pub fn occurrences_one_of(
    bookmark: &LogBookmark,
    message: &str,
    options: &[usize],
) -> Result<(), AssertionFailure> {
    bookmark.check(message, &OccurrenceCheck::OneOf(options.to_vec()))
}

fn read_since(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    // A file shorter than the bookmark was rotated or truncated.
    if file.metadata()?.len() < offset {
        return Ok(Vec::new());
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Count occurrences of `needle`, including overlapping ones.
fn count_overlapping(haystack: &[u8], needle: &[u8]) -> usize {
    if needle.is_empty() || needle.len() > haystack.len() {
        return 0;
    }
    haystack
        .windows(needle.len())
        .filter(|window| *window == needle)
        .count()
}

/// Occurrences of `message` in bytes appended to `path` after `offset`.
///
/// Matches may overlap: `"aa"` occurs twice in `"aaa"`.
pub fn count_occurrences_since(path: &Path, message: &str, offset: u64) -> std::io::Result<usize> {
    let content = read_since(path, offset)?;
    Ok(count_overlapping(&content, message.as_bytes()))
}

/// Non-overlapping matches of `pattern` in bytes appended after `offset`.
pub fn count_regex_matches_since(path: &Path, pattern: &Regex, offset: u64) -> std::io::Result<usize> {
    let content = read_since(path, offset)?;
    Ok(pattern.find_iter(&content).count())
}

/// Append `message` to the log at `path`, creating the file if needed.
pub fn write_to_log(path: &Path, message: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(message.as_bytes())
}

/// Most recently modified file in `dir` whose name starts with `prefix`.
pub fn latest_log_in_dir(dir: &Path, prefix: &str) -> std::io::Result<Option<PathBuf>> {
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with(prefix) {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified()?;
        if newest.as_ref().is_none_or(|(time, _)| modified > *time) {
            newest = Some((modified, entry.path()));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

/// The log file for `path`: the path itself, or the newest server log when
/// `path` is a directory.
pub fn resolve_log_path(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_dir() {
        latest_log_in_dir(path, SERVER_LOG_PREFIX)?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no {SERVER_LOG_PREFIX}* file in {}", path.display()),
            )
        })
    } else {
        Ok(path.to_path_buf())
    }
}

/// Retry policy for [`delay_assert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

/// Evaluate `predicate` until it holds, sleeping `interval` between attempts.
///
/// The predicate runs at most `max_attempts` times (at least once); the last
/// failure is returned.
pub async fn delay_assert<F, E>(policy: RetryPolicy, mut predicate: F) -> Result<(), E>
where
    F: FnMut() -> Result<(), E>,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match predicate() {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                debug!(attempt, max_attempts = attempts, error = %err, "assertion not yet satisfied");
                tokio::time::sleep(policy.interval).await;
                attempt += 1;
            }
        }
    }
}

/// Server log handle used by tests.
#[derive(Debug, Clone)]
pub struct LogMonitor {
    path: PathBuf,
}

impl LogMonitor {
    /// Monitor `path`, a log file or a directory of rotating server logs.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bookmark the current end of the active log.
    pub fn bookmark(&self) -> std::io::Result<LogBookmark> {
        LogBookmark::capture(resolve_log_path(&self.path)?)
    }

    pub fn write(&self, message: &str) -> std::io::Result<()> {
        write_to_log(&resolve_log_path(&self.path)?, message)
    }

    /// Retry `expected` against the occurrences of `message` since `bookmark`.
    pub async fn assert_eventually(
        &self,
        bookmark: &LogBookmark,
        message: &str,
        expected: OccurrenceCheck,
        policy: RetryPolicy,
    ) -> Result<(), AssertionFailure> {
        delay_assert(policy, || bookmark.check(message, &expected)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;
    use tempfile::TempDir;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(20),
            max_attempts,
        }
    }

    #[test]
    fn bookmark_of_missing_file_is_zero() {
        let dir = TempDir::new().unwrap();
        let bookmark = LogBookmark::capture(dir.path().join("rodsLog")).unwrap();
        assert_eq!(bookmark.offset(), 0);
        assert_eq!(bookmark.count_occurrences("anything").unwrap(), 0);
    }

    #[test]
    fn counts_only_bytes_after_the_bookmark() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("rodsLog");
        write_to_log(&log, "agent started\nagent started\n").unwrap();

        let bookmark = LogBookmark::capture(&log).unwrap();
        assert_eq!(bookmark.count_occurrences("agent started").unwrap(), 0);

        write_to_log(&log, "agent started\n").unwrap();
        assert_eq!(bookmark.count_occurrences("agent started").unwrap(), 1);

        write_to_log(&log, "noise\nagent started\n").unwrap();
        assert_eq!(bookmark.count_occurrences("agent started").unwrap(), 2);

        assert!(occurrences_equal(&bookmark, "agent started", 2).is_ok());
        assert!(occurrences_greater_than(&bookmark, "agent started", 1).is_ok());
        assert!(occurrences_fewer_than(&bookmark, "agent started", 2).is_err());
        assert!(occurrences_one_of(&bookmark, "agent started", &[0, 2]).is_ok());
    }

    #[test]
    fn occurrences_may_overlap() {
        assert_eq!(count_overlapping(b"aaa", b"aa"), 2);
        assert_eq!(count_overlapping(b"abab", b"ab"), 2);
        assert_eq!(count_overlapping(b"a", b"aa"), 0);
        assert_eq!(count_overlapping(b"abc", b""), 0);
    }

    #[test]
    fn truncated_log_counts_nothing() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("rodsLog");
        write_to_log(&log, "0123456789").unwrap();
        let bookmark = LogBookmark::capture(&log).unwrap();

        std::fs::write(&log, "x").unwrap();
        assert_eq!(bookmark.count_occurrences("x").unwrap(), 0);
    }

    #[test]
    fn regex_matches_after_bookmark() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("rodsLog");
        write_to_log(&log, "rc = -808000\n").unwrap();
        let bookmark = LogBookmark::capture(&log).unwrap();
        write_to_log(&log, "rc = -808000\nrc = -310000\nrc = 0\n").unwrap();

        let pattern = Regex::new(r"rc = -\d+").unwrap();
        assert_eq!(bookmark.count_matches(&pattern).unwrap(), 2);
    }

    #[test]
    fn occurrence_checks() {
        assert!(OccurrenceCheck::Equals(2).evaluate("m", 2).is_ok());
        assert!(OccurrenceCheck::Equals(2).evaluate("m", 3).is_err());
        assert!(OccurrenceCheck::GreaterThan(0).evaluate("m", 1).is_ok());
        assert!(OccurrenceCheck::GreaterThan(1).evaluate("m", 1).is_err());
        assert!(OccurrenceCheck::FewerThan(3).evaluate("m", 2).is_ok());
        assert!(OccurrenceCheck::FewerThan(3).evaluate("m", 3).is_err());
        assert!(OccurrenceCheck::OneOf(vec![0, 4]).evaluate("m", 4).is_ok());

        let err = OccurrenceCheck::OneOf(vec![0, 4])
            .evaluate("m", 1)
            .unwrap_err();
        assert!(err.to_string().contains("one of [0, 4]"));
    }

    #[tokio::test]
    async fn delay_assert_stops_at_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<(), AssertionFailure> = delay_assert(fast(5), || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(AssertionFailure("not yet".into()))
            } else {
                Ok(())
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn delay_assert_is_bounded() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result = delay_assert(fast(3), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(AssertionFailure(format!("attempt {n}")))
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err().to_string(), "attempt 3");
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn zero_attempts_still_evaluates_once() {
        let calls = AtomicU32::new(0);
        let _ = delay_assert(fast(0), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AssertionFailure("no".into()))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn monitor_waits_for_late_log_lines() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("rodsLog.2016.01.01");
        write_to_log(&log, "boot\n").unwrap();

        let monitor = LogMonitor::new(dir.path());
        let bookmark = monitor.bookmark().unwrap();
        assert_eq!(bookmark.path(), log.as_path());

        let late = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            write_to_log(&late, "delay rule fired\n").unwrap();
        });

        monitor
            .assert_eventually(&bookmark, "delay rule fired", OccurrenceCheck::Equals(1), fast(50))
            .await
            .unwrap();
    }

    #[test]
    fn latest_log_prefers_newest_matching_file() {
        let dir = TempDir::new().unwrap();
        assert!(latest_log_in_dir(dir.path(), SERVER_LOG_PREFIX).unwrap().is_none());

        write_to_log(&dir.path().join("rodsLog.2016.01.01"), "old\n").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        write_to_log(&dir.path().join("rodsLog.2016.01.02"), "new\n").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        write_to_log(&dir.path().join("reLog.2016.01.03"), "other\n").unwrap();

        let latest = latest_log_in_dir(dir.path(), SERVER_LOG_PREFIX).unwrap().unwrap();
        assert_eq!(latest.file_name().unwrap(), "rodsLog.2016.01.02");
    }
}
