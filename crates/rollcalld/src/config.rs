use rollcall_core::{DistanceMetric, DEFAULT_MATCH_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Config file read when `ROLLCALL_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rollcall/rollcall.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("match threshold must be a positive finite number, got {0}")]
    InvalidThreshold(f64),
    #[error("default dimension must be at least 1")]
    ZeroDimension,
}

/// Daemon configuration: defaults, then the TOML file, then `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// CSV file holding enrolled embeddings.
    pub gallery_path: PathBuf,
    /// Directory of per-day attendance CSV files.
    pub ledger_dir: PathBuf,
    /// Maximum distance (exclusive) accepted as a match.
    pub match_threshold: f64,
    pub metric: DistanceMetric,
    /// Dimensionality enforced on an empty gallery; `None` = learn from the first enrollment.
    pub default_dimension: Option<usize>,
    /// External extractor program and leading arguments; the image path is appended.
    /// `ROLLCALL_EXTRACTOR_COMMAND` is split on whitespace; use the TOML array
    /// for paths or arguments that contain spaces.
    pub extractor_command: Option<Vec<String>>,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
    /// Unix uids allowed to enroll and to run the delete operations.
    pub operator_uids: Vec<u32>,
}

/// Shape of the optional TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    data_dir: Option<PathBuf>,
    gallery_path: Option<PathBuf>,
    ledger_dir: Option<PathBuf>,
    match_threshold: Option<f64>,
    metric: Option<DistanceMetric>,
    default_dimension: Option<usize>,
    extractor_command: Option<Vec<String>>,
    session_bus: Option<bool>,
    operator_uids: Option<Vec<u32>>,
}

impl FileConfig {
    /// Missing file = all defaults.
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Config {
    /// Load from `$ROLLCALL_CONFIG` (or [`DEFAULT_CONFIG_PATH`]) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("ROLLCALL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let file = FileConfig::read(&path)?;
        let config = Self::resolve(file, |key| std::env::var(key).ok())?;
        tracing::debug!(path = %path.display(), "configuration resolved");
        Ok(config)
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = env("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(|| default_data_dir(&env));

        let gallery_path = env("ROLLCALL_GALLERY_PATH")
            .map(PathBuf::from)
            .or(file.gallery_path)
            .unwrap_or_else(|| data_dir.join("faces.csv"));

        let ledger_dir = env("ROLLCALL_LEDGER_DIR")
            .map(PathBuf::from)
            .or(file.ledger_dir)
            .unwrap_or_else(|| data_dir.join("attendance"));

        let match_threshold = match env("ROLLCALL_MATCH_THRESHOLD") {
            Some(raw) => parse_value("ROLLCALL_MATCH_THRESHOLD", &raw)?,
            None => file.match_threshold.unwrap_or(DEFAULT_MATCH_THRESHOLD),
        };

        let metric = match env("ROLLCALL_METRIC") {
            Some(raw) => parse_value("ROLLCALL_METRIC", &raw)?,
            None => file.metric.unwrap_or_default(),
        };

        let default_dimension = match env("ROLLCALL_DEFAULT_DIMENSION") {
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => Some(parse_value("ROLLCALL_DEFAULT_DIMENSION", &raw)?),
            None => file.default_dimension,
        };

        // Split on whitespace with no quoting, so a program path or argument
        // containing spaces must use the `extractor_command` array in the file.
        let extractor_command = match env("ROLLCALL_EXTRACTOR_COMMAND") {
            Some(raw) => {
                let parts: Vec<String> = raw.split_whitespace().map(String::from).collect();
                (!parts.is_empty()).then_some(parts)
            }
            None => file.extractor_command.filter(|parts| !parts.is_empty()),
        };

        let session_bus = match env("ROLLCALL_SESSION_BUS") {
            Some(raw) => raw != "0",
            None => file.session_bus.unwrap_or(false),
        };

        let operator_uids = match env("ROLLCALL_OPERATOR_UIDS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_value("ROLLCALL_OPERATOR_UIDS", s))
                .collect::<Result<Vec<u32>, _>>()?,
            None => file.operator_uids.unwrap_or_else(default_operator_uids),
        };

        let config = Self {
            gallery_path,
            ledger_dir,
            match_threshold,
            metric,
            default_dimension,
            extractor_command,
            session_bus,
            operator_uids,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.match_threshold.is_finite() || self.match_threshold <= 0.0 {
            return Err(ConfigError::InvalidThreshold(self.match_threshold));
        }
        if self.default_dimension == Some(0) {
            return Err(ConfigError::ZeroDimension);
        }
        Ok(())
    }
}

/// `$XDG_DATA_HOME/rollcall`, falling back to `~/.local/share/rollcall`.
fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

/// root plus whoever runs the daemon.
fn default_operator_uids() -> Vec<u32> {
    let own = nix::unistd::getuid().as_raw();
    if own == 0 {
        vec![0]
    } else {
        vec![0, own]
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}
