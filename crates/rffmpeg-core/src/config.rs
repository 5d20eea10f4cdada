//! Configuration loading.
//!
//! The dispatcher is invoked under the tool's own name, so its argv belongs
//! to the tool and cannot carry a config flag. The file is located through
//! `RFFMPEG_CONFIG`, falling back to [`DEFAULT_CONFIG_PATH`].

use std::path::{Path, PathBuf};

use rffmpeg_proto::Personality;
use serde::{Deserialize, Deserializer};
use serde_yaml::{Mapping, Value};
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "RFFMPEG_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/rffmpeg/rffmpeg.yml";

/// Placeholder substituted with the process id in `state_filename`.
pub const PID_PLACEHOLDER: &str = "{pid}";

/// Errors that make the configuration unusable as a whole.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// `EX_CONFIG` from sysexits.
    pub const EXIT_CODE: i32 = 78;

    pub fn exit_code(&self) -> i32 {
        Self::EXIT_CODE
    }
}

/// Returns the config path from the environment, or the default location.
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .filter(|v| !v.is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RffmpegConfig {
    pub global: GlobalConfig,

    /// Host sections in declaration order, left raw so the catalog can skip
    /// a broken one without failing the whole file.
    #[serde(deserialize_with = "null_as_empty")]
    pub hosts: Vec<HostSection>,

    /// Directory relative paths resolve against (the config file's directory).
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// The `global` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Local ffmpeg binary.
    pub ffmpeg: PathBuf,
    /// Local ffprobe binary.
    pub ffprobe: PathBuf,
    /// ffmpeg path on the workers, when it differs from the local one.
    pub remote_ffmpeg: Option<String>,
    /// ffprobe path on the workers, when it differs from the local one.
    pub remote_ffprobe: Option<String>,
    /// Directory holding state records. Defaults to `<config dir>/data`.
    pub state_dir: Option<PathBuf>,
    /// State record filename; must contain `{pid}`.
    pub state_filename: String,
    /// ssh connection persistence in seconds; 0 disables multiplexing.
    pub persist: u64,
    /// Transport binary.
    pub ssh: PathBuf,
    /// Log file. Defaults to `<state dir>/rffmpeg.log`.
    pub log_file: Option<PathBuf>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("/usr/bin/ffmpeg"),
            ffprobe: PathBuf::from("/usr/bin/ffprobe"),
            remote_ffmpeg: None,
            remote_ffprobe: None,
            state_dir: None,
            state_filename: format!("rffmpeg_{PID_PLACEHOLDER}.state"),
            persist: 0,
            ssh: PathBuf::from("ssh"),
            log_file: None,
        }
    }
}

/// An empty `hosts:` key reads as no hosts.
fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<HostSection>, D::Error> {
    Ok(Option::<Vec<HostSection>>::deserialize(deserializer)?.unwrap_or_default())
}

/// One raw host section.
///
/// Any YAML value is accepted here; the catalog rejects non-mappings.
/// Scalars of any YAML type are read back as strings, the way an INI-style
/// section would present them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct HostSection(Value);

impl HostSection {
    pub fn is_mapping(&self) -> bool {
        self.0.is_mapping()
    }

    /// Returns a non-empty scalar field as a string.
    pub fn field(&self, key: &str) -> Option<String> {
        let value = match self.0.get(key)? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return None,
        };
        (!value.is_empty()).then_some(value)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HostSection {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mapping: Mapping = iter
            .into_iter()
            .map(|(k, v)| (Value::String(k.into()), Value::String(v.into())))
            .collect();
        HostSection(Value::Mapping(mapping))
    }
}

impl RffmpegConfig {
    /// Loads and validates the config at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&contents, base_dir).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parses YAML text; relative paths resolve against `base_dir`.
    pub fn parse(yaml: &str, base_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let mut config: RffmpegConfig = if yaml.trim().is_empty() {
            RffmpegConfig::default()
        } else {
            serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
                path: PathBuf::new(),
                source,
            })?
        };
        config.base_dir = base_dir.into();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let pattern = &self.global.state_filename;
        if pattern.matches(PID_PLACEHOLDER).count() != 1 {
            return Err(ConfigError::Invalid(format!(
                "global.state_filename must contain {PID_PLACEHOLDER} exactly once, got {pattern:?}"
            )));
        }
        if pattern.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "global.state_filename must be a bare file name, got {pattern:?}"
            )));
        }
        Ok(())
    }

    /// Resolves `path` against the config directory.
    pub fn resolve_path(&self, path: impl AsRef<Path>) -> PathBuf {
        self.base_dir.join(path)
    }

    pub fn state_dir(&self) -> PathBuf {
        match &self.global.state_dir {
            Some(dir) => self.resolve_path(dir),
            None => self.resolve_path("data"),
        }
    }

    pub fn log_file(&self) -> PathBuf {
        match &self.global.log_file {
            Some(file) => self.resolve_path(file),
            None => self.state_dir().join("rffmpeg.log"),
        }
    }

    /// ssh `ControlPath` used when persistence is enabled.
    pub fn control_path(&self) -> PathBuf {
        self.state_dir().join("ssh-%r@%h:%p")
    }

    pub fn local_binary(&self, personality: Personality) -> &Path {
        match personality {
            Personality::Ffmpeg => &self.global.ffmpeg,
            Personality::Ffprobe => &self.global.ffprobe,
        }
    }

    pub fn remote_binary(&self, personality: Personality) -> String {
        let configured = match personality {
            Personality::Ffmpeg => self.global.remote_ffmpeg.as_deref(),
            Personality::Ffprobe => self.global.remote_ffprobe.as_deref(),
        };
        configured.map_or_else(
            || self.local_binary(personality).to_string_lossy().into_owned(),
            str::to_string,
        )
    }
}
