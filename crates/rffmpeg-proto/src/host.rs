//! Worker host records and the selector's target type.

use std::fmt;
use std::num::NonZeroU32;
use std::path::PathBuf;

use serde::Serialize;

/// Name written to a state record when a process falls back to local execution.
///
/// It never matches a catalog entry, so local runs stay visible in the state
/// directory without adding load to any remote host.
pub const LOCAL_CLAIM: &str = "localhost";

/// A configured remote worker.
///
/// Immutable once loaded; the catalog hands out one per qualifying host section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostRecord {
    /// Name used for claims and bad-host marks.
    pub name: String,
    /// Address passed to the transport.
    pub address: String,
    pub port: u16,
    pub user: String,
    /// Identity key handed to the transport with `-i`.
    pub identity_file: PathBuf,
    /// Relative capacity; a weight of 2 absorbs twice the claims of a weight of 1.
    pub weight: NonZeroU32,
}

impl HostRecord {
    pub const DEFAULT_PORT: u16 = 22;
    pub const DEFAULT_WEIGHT: NonZeroU32 = NonZeroU32::MIN;

    /// Creates a record with the default port and weight.
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        user: impl Into<String>,
        identity_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port: Self::DEFAULT_PORT,
            user: user.into(),
            identity_file: identity_file.into(),
            weight: Self::DEFAULT_WEIGHT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_weight(mut self, weight: NonZeroU32) -> Self {
        self.weight = weight;
        self
    }

    /// `user@address` as the transport expects it.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }

    /// Active claim count floor-divided by the weight.
    pub fn weighted_load(&self, active: usize) -> usize {
        active / self.weight.get() as usize
    }
}

/// Where a dispatch will run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectedTarget {
    Remote(HostRecord),
    Local,
}

impl SelectedTarget {
    /// The name this target is claimed under in a state record.
    pub fn claim_name(&self) -> &str {
        match self {
            SelectedTarget::Remote(host) => &host.name,
            SelectedTarget::Local => LOCAL_CLAIM,
        }
    }
}

impl fmt::Display for SelectedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectedTarget::Remote(host) if host.name == host.address => {
                write!(f, "{}", host.name)
            }
            SelectedTarget::Remote(host) => write!(f, "{} ({})", host.name, host.address),
            SelectedTarget::Local => write!(f, "{LOCAL_CLAIM}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weight(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    #[test]
    fn test_new_uses_defaults() {
        let host = HostRecord::new("gpu1", "10.0.0.5", "jellyfin", "keys/id_rsa");
        assert_eq!(host.port, 22);
        assert_eq!(host.weight.get(), 1);
        assert_eq!(host.destination(), "jellyfin@10.0.0.5");
    }

    #[test]
    fn test_weighted_load_floors() {
        let host = HostRecord::new("a", "a", "u", "k").with_weight(weight(3));
        assert_eq!(host.weighted_load(0), 0);
        assert_eq!(host.weighted_load(2), 0);
        assert_eq!(host.weighted_load(3), 1);
        assert_eq!(host.weighted_load(8), 2);
    }

    #[test]
    fn test_weighted_load_is_monotonic() {
        for w in 1..=6 {
            let host = HostRecord::new("a", "a", "u", "k").with_weight(weight(w));
            let mut previous = 0;
            for active in 0..50 {
                let load = host.weighted_load(active);
                assert!(load >= previous, "weight {w}, active {active}");
                previous = load;
            }
        }
    }

    #[test]
    fn test_target_claim_name_and_display() {
        let named = HostRecord::new("gpu1", "10.0.0.5", "u", "k");
        let bare = HostRecord::new("10.0.0.6", "10.0.0.6", "u", "k");

        assert_eq!(SelectedTarget::Remote(named.clone()).claim_name(), "gpu1");
        assert_eq!(SelectedTarget::Local.claim_name(), LOCAL_CLAIM);
        assert_eq!(SelectedTarget::Remote(named).to_string(), "gpu1 (10.0.0.5)");
        assert_eq!(SelectedTarget::Remote(bare).to_string(), "10.0.0.6");
        assert_eq!(SelectedTarget::Local.to_string(), LOCAL_CLAIM);
    }
}
