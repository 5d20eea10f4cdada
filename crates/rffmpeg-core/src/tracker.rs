//! Load tracking through per-process state records.
//!
//! Every running dispatcher owns one record and is its only writer. Readers
//! aggregate all records without locking, so a snapshot may see a record
//! appear or vanish mid-scan; both are skipped rather than treated as errors.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use regex::Regex;
use rffmpeg_proto::{LoadView, StateLine};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{PID_PLACEHOLDER, RffmpegConfig};

/// Errors from reading or writing state records.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("failed to read state record {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write state record {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove state record {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid state filename pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },
}

/// Identifies a state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordId {
    /// Owned by a running dispatcher process.
    Process(u32),
    /// Maintained by operators through the admin commands; never reaped.
    Operator,
}

impl RecordId {
    const OPERATOR_TAG: &'static str = "admin";

    pub fn parse(s: &str) -> Option<Self> {
        if s == Self::OPERATOR_TAG {
            return Some(RecordId::Operator);
        }
        s.parse().ok().map(RecordId::Process)
    }

    pub fn pid(self) -> Option<u32> {
        match self {
            RecordId::Process(pid) => Some(pid),
            RecordId::Operator => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Process(pid) => write!(f, "{pid}"),
            RecordId::Operator => f.write_str(Self::OPERATOR_TAG),
        }
    }
}

/// Storage for state records plus the aggregation built on top of it.
///
/// Backends only move raw record text around; parsing, aggregation and
/// tolerance of broken records live in the provided methods so every
/// backend behaves the same.
pub trait LoadTracker {
    /// Records currently present, in a stable order.
    fn record_ids(&self) -> Vec<RecordId>;

    /// Raw record contents, or `None` if the record no longer exists.
    fn read_record(&self, id: RecordId) -> Result<Option<String>, TrackerError>;

    /// Appends one line to a record, creating it if needed.
    fn append(&self, id: RecordId, line: &StateLine) -> Result<(), TrackerError>;

    /// Replaces a record's contents; an empty slice removes the record.
    fn write_record(&self, id: RecordId, lines: &[StateLine]) -> Result<(), TrackerError>;

    /// Deletes a record. Returns `false` if it was already gone.
    fn remove(&self, id: RecordId) -> Result<bool, TrackerError>;

    /// Aggregates every readable record into a [`LoadView`].
    fn snapshot(&self) -> LoadView {
        let mut view = LoadView::new();
        for id in self.record_ids() {
            let contents = match self.read_record(id) {
                Ok(Some(contents)) => contents,
                Ok(None) => {
                    debug!(record = %id, "State record vanished during snapshot");
                    continue;
                }
                Err(e) => {
                    warn!(record = %id, "Skipping unreadable state record: {}", e);
                    continue;
                }
            };

            let (lines, errors) = StateLine::parse_record(&contents);
            for e in errors {
                warn!(record = %id, "Skipping malformed state line: {}", e);
            }
            for line in &lines {
                match line {
                    StateLine::BadHost(host) => {
                        debug!(record = %id, host = %host, "Found bad host mark");
                    }
                    StateLine::Claim(host) => {
                        debug!(record = %id, host = %host, "Found running process");
                    }
                }
            }
            view.apply_record(&lines);
        }
        view
    }

    /// Records that `pid` is using `host`.
    fn claim(&self, host: &str, pid: u32) -> Result<(), TrackerError> {
        self.append(RecordId::Process(pid), &StateLine::Claim(host.to_string()))
    }

    /// Marks `host` bad in the given record.
    fn mark_bad(&self, host: &str, id: RecordId) -> Result<(), TrackerError> {
        self.append(id, &StateLine::BadHost(host.to_string()))
    }

    /// Deletes `pid`'s record; absent records are not an error.
    fn release(&self, pid: u32) -> Result<(), TrackerError> {
        self.remove(RecordId::Process(pid)).map(|_| ())
    }
}

/// Splits a state filename pattern around its `{pid}` placeholder.
#[derive(Debug, Clone)]
pub struct RecordPattern {
    prefix: String,
    suffix: String,
    matcher: Regex,
}

impl RecordPattern {
    pub fn new(pattern: &str) -> Result<Self, TrackerError> {
        let invalid = |reason: &str| TrackerError::Pattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };
        let (prefix, suffix) = pattern
            .split_once(PID_PLACEHOLDER)
            .ok_or_else(|| invalid("missing {pid} placeholder"))?;
        if suffix.contains(PID_PLACEHOLDER) {
            return Err(invalid("{pid} placeholder appears more than once"));
        }
        let matcher = Regex::new(&format!(
            r"^{}(\d+|{}){}$",
            regex::escape(prefix),
            RecordId::OPERATOR_TAG,
            regex::escape(suffix)
        ))
        .map_err(|e| invalid(&e.to_string()))?;

        Ok(Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            matcher,
        })
    }

    pub fn file_name(&self, id: RecordId) -> String {
        format!("{}{}{}", self.prefix, id, self.suffix)
    }

    /// Returns the record id if `name` is a state record file name.
    pub fn parse(&self, name: &str) -> Option<RecordId> {
        let captures = self.matcher.captures(name)?;
        RecordId::parse(captures.get(1)?.as_str())
    }
}

/// State records stored as files in one directory.
///
/// Only names matching the filename pattern are considered; the directory
/// may hold other files such as the log or ssh control sockets.
#[derive(Debug, Clone)]
pub struct DirectoryTracker {
    dir: PathBuf,
    pattern: RecordPattern,
}

impl DirectoryTracker {
    /// Mode of a state directory this tracker creates.
    pub const DIR_MODE: u32 = 0o777;

    pub fn new(dir: impl Into<PathBuf>, pattern: &str) -> Result<Self, TrackerError> {
        Ok(Self {
            dir: dir.into(),
            pattern: RecordPattern::new(pattern)?,
        })
    }

    pub fn from_config(config: &RffmpegConfig) -> Result<Self, TrackerError> {
        Self::new(config.state_dir(), &config.global.state_filename)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, id: RecordId) -> PathBuf {
        self.dir.join(self.pattern.file_name(id))
    }

    /// Creates the state directory if needed.
    ///
    /// Dispatchers may run as different users, so a directory created here
    /// is made world-writable regardless of the umask.
    fn ensure_dir(&self, path: &Path) -> Result<(), TrackerError> {
        if self.dir.is_dir() {
            return Ok(());
        }
        let write_error = |source| TrackerError::Write {
            path: path.to_path_buf(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(write_error)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(Self::DIR_MODE))
                .map_err(write_error)?;
        }
        Ok(())
    }
}

impl LoadTracker for DirectoryTracker {
    fn record_ids(&self) -> Vec<RecordId> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(dir = %self.dir.display(), "Failed to list state directory: {}", e);
                return Vec::new();
            }
        };

        let mut ids: Vec<RecordId> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                self.pattern.parse(name.to_str()?)
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    fn read_record(&self, id: RecordId) -> Result<Option<String>, TrackerError> {
        let path = self.record_path(id);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(TrackerError::Read { path, source }),
        }
    }

    fn append(&self, id: RecordId, line: &StateLine) -> Result<(), TrackerError> {
        let path = self.record_path(id);
        self.ensure_dir(&path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| TrackerError::Write {
                path: path.clone(),
                source,
            })?;
        // One write per line keeps concurrent readers from seeing half a line
        file.write_all(format!("{line}\n").as_bytes())
            .map_err(|source| TrackerError::Write { path, source })
    }

    fn write_record(&self, id: RecordId, lines: &[StateLine]) -> Result<(), TrackerError> {
        if lines.is_empty() {
            return self.remove(id).map(|_| ());
        }
        let path = self.record_path(id);
        self.ensure_dir(&path)?;
        let contents: String = lines.iter().map(|l| format!("{l}\n")).collect();
        fs::write(&path, contents).map_err(|source| TrackerError::Write { path, source })
    }

    fn remove(&self, id: RecordId) -> Result<bool, TrackerError> {
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(TrackerError::Remove { path, source }),
        }
    }
}

/// In-memory records, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    records: Mutex<BTreeMap<RecordId, String>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores raw contents verbatim, malformed or not.
    pub fn insert_raw(&self, id: RecordId, contents: impl Into<String>) {
        self.lock().insert(id, contents.into());
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.lock().contains_key(&id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<RecordId, String>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LoadTracker for MemoryTracker {
    fn record_ids(&self) -> Vec<RecordId> {
        self.lock().keys().copied().collect()
    }

    fn read_record(&self, id: RecordId) -> Result<Option<String>, TrackerError> {
        Ok(self.lock().get(&id).cloned())
    }

    fn append(&self, id: RecordId, line: &StateLine) -> Result<(), TrackerError> {
        let mut records = self.lock();
        let contents = records.entry(id).or_default();
        contents.push_str(&line.to_string());
        contents.push('\n');
        Ok(())
    }

    fn write_record(&self, id: RecordId, lines: &[StateLine]) -> Result<(), TrackerError> {
        let mut records = self.lock();
        if lines.is_empty() {
            records.remove(&id);
        } else {
            records.insert(id, lines.iter().map(|l| format!("{l}\n")).collect());
        }
        Ok(())
    }

    fn remove(&self, id: RecordId) -> Result<bool, TrackerError> {
        Ok(self.lock().remove(&id).is_some())
    }
}
