//! State record lines and the load view aggregated from them.
//!
//! A state record is a small text file owned by one dispatcher process. Each
//! line is either a claim (`<host>`) or a bad-host mark (`badhost <host>`).

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::ProtoError;

/// One line of a state record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateLine {
    Claim(String),
    BadHost(String),
}

impl StateLine {
    pub const BAD_HOST_KEYWORD: &'static str = "badhost";

    /// Parses a single line, ignoring surrounding whitespace.
    pub fn parse(line: &str) -> Result<Self, ProtoError> {
        let mut tokens = line.split_whitespace();
        let first = tokens.next().ok_or(ProtoError::EmptyStateLine)?;

        let parsed = if first == Self::BAD_HOST_KEYWORD {
            let host = tokens
                .next()
                .ok_or_else(|| ProtoError::MalformedStateLine(line.to_string()))?;
            StateLine::BadHost(host.to_string())
        } else {
            StateLine::Claim(first.to_string())
        };

        if tokens.next().is_some() {
            return Err(ProtoError::MalformedStateLine(line.to_string()));
        }
        Ok(parsed)
    }

    /// Parses every non-blank line of a record.
    ///
    /// Bad lines are returned alongside the good ones so the caller can log
    /// them; one broken line never hides the rest of the record.
    pub fn parse_record(contents: &str) -> (Vec<StateLine>, Vec<ProtoError>) {
        let mut lines = Vec::new();
        let mut errors = Vec::new();
        for raw in contents.lines().filter(|l| !l.trim().is_empty()) {
            match Self::parse(raw) {
                Ok(line) => lines.push(line),
                Err(e) => errors.push(e),
            }
        }
        (lines, errors)
    }

    pub fn host(&self) -> &str {
        match self {
            StateLine::Claim(host) | StateLine::BadHost(host) => host,
        }
    }
}

impl fmt::Display for StateLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateLine::Claim(host) => write!(f, "{host}"),
            StateLine::BadHost(host) => write!(f, "{} {host}", Self::BAD_HOST_KEYWORD),
        }
    }
}

/// Aggregated state for one host name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostLoad {
    pub active: usize,
    pub bad: bool,
}

/// Per-host claim counts and bad marks, recomputed on every selection.
///
/// Keyed by name only; names that match nothing in the catalog are kept but
/// never influence selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadView {
    hosts: BTreeMap<String, HostLoad>,
    records: usize,
}

impl LoadView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one state line into the view.
    pub fn apply(&mut self, line: &StateLine) {
        let entry = self.hosts.entry(line.host().to_string()).or_default();
        match line {
            StateLine::Claim(_) => entry.active += 1,
            StateLine::BadHost(_) => entry.bad = true,
        }
    }

    /// Folds a whole record into the view.
    pub fn apply_record<'a>(&mut self, lines: impl IntoIterator<Item = &'a StateLine>) {
        self.records += 1;
        for line in lines {
            self.apply(line);
        }
    }

    pub fn active(&self, host: &str) -> usize {
        self.hosts.get(host).map_or(0, |load| load.active)
    }

    pub fn is_bad(&self, host: &str) -> bool {
        self.hosts.get(host).is_some_and(|load| load.bad)
    }

    /// Number of records folded in.
    pub fn record_count(&self) -> usize {
        self.records
    }

    pub fn hosts(&self) -> impl Iterator<Item = (&str, &HostLoad)> {
        self.hosts.iter().map(|(name, load)| (name.as_str(), load))
    }
}

impl<'a> FromIterator<&'a StateLine> for LoadView {
    fn from_iter<I: IntoIterator<Item = &'a StateLine>>(iter: I) -> Self {
        let mut view = LoadView::new();
        for line in iter {
            view.apply(line);
        }
        view
    }
}
