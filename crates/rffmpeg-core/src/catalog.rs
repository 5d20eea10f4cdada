//! Host catalog: the ordered list of usable remote workers.

use std::num::NonZeroU32;
use std::path::Path;

use rffmpeg_proto::{HostRecord, LOCAL_CLAIM, StateLine};
use thiserror::Error;
use tracing::warn;

use crate::config::{HostSection, RffmpegConfig};

/// Why a host section was left out of the catalog.
#[derive(Debug, Error, PartialEq, Eq)]
enum SectionError {
    #[error("expected a mapping of host fields")]
    NotAMapping,

    #[error("missing required field '{0}'")]
    Missing(&'static str),

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("invalid weight {0:?} (must be an integer >= 1)")]
    InvalidWeight(String),

    #[error("invalid name {0:?} (no whitespace, not 'badhost' or 'localhost')")]
    InvalidName(String),
}

/// Candidate workers in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostCatalog {
    hosts: Vec<HostRecord>,
}

impl HostCatalog {
    /// Builds the catalog from the config's host sections.
    ///
    /// Incomplete or malformed sections are skipped; they never fail the load.
    pub fn load(config: &RffmpegConfig) -> Self {
        let mut hosts = Vec::with_capacity(config.hosts.len());
        for (index, section) in config.hosts.iter().enumerate() {
            match parse_section(section, &config.base_dir) {
                Ok(host) => hosts.push(host),
                Err(e @ SectionError::Missing(_)) => {
                    warn!(section = index, "Skipping incomplete host section: {}", e);
                }
                Err(e) => {
                    warn!(section = index, "Skipping malformed host section: {}", e);
                }
            }
        }
        Self { hosts }
    }

    pub fn from_records(hosts: Vec<HostRecord>) -> Self {
        Self { hosts }
    }

    pub fn hosts(&self) -> &[HostRecord] {
        &self.hosts
    }

    pub fn get(&self, name: &str) -> Option<&HostRecord> {
        self.hosts.iter().find(|h| h.name == name)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

fn parse_section(section: &HostSection, base_dir: &Path) -> Result<HostRecord, SectionError> {
    if !section.is_mapping() {
        return Err(SectionError::NotAMapping);
    }
    let address = section.field("host").ok_or(SectionError::Missing("host"))?;
    let user = section.field("user").ok_or(SectionError::Missing("user"))?;
    let identity_file = section
        .field("identity_file")
        .ok_or(SectionError::Missing("identity_file"))?;

    let port = match section.field("port") {
        Some(raw) => raw.parse::<u16>().map_err(|_| SectionError::InvalidPort(raw))?,
        None => HostRecord::DEFAULT_PORT,
    };
    let weight = match section.field("weight") {
        Some(raw) => raw
            .parse::<NonZeroU32>()
            .map_err(|_| SectionError::InvalidWeight(raw))?,
        None => HostRecord::DEFAULT_WEIGHT,
    };
    let name = section.field("name").unwrap_or_else(|| address.clone());
    if !is_claimable_name(&name) {
        return Err(SectionError::InvalidName(name));
    }

    Ok(HostRecord::new(name, address, user, base_dir.join(identity_file))
        .with_port(port)
        .with_weight(weight))
}

/// Whether `name` reads back from a state record as a claim on this host
/// and nothing else.
fn is_claimable_name(name: &str) -> bool {
    !name.chars().any(char::is_whitespace)
        && name != StateLine::BAD_HOST_KEYWORD
        && name != LOCAL_CLAIM
}
