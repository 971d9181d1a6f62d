use crate::error::ConfigError;
use oxmon_collector::CheckSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    /// Batch tick for the built-in checks
    #[serde(default = "default_collection_interval")]
    pub collection_interval_secs: u64,
    #[serde(default)]
    pub checks: CheckSettings,
    #[serde(default)]
    pub webserver: WebserverConfig,
    /// Push every snapshot to a monitoring server in addition to serving it
    #[serde(default)]
    pub push: Option<PushConfig>,
    /// File holding the `[[checks]]` list of custom command checks
    #[serde(default)]
    pub custom_checks_path: Option<String>,
    #[serde(default)]
    pub exporters: Vec<ExporterConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebserverConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for WebserverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushConfig {
    pub url: String,
    #[serde(default = "default_push_timeout")]
    pub timeout_secs: u64,
    /// Optional bearer token sent with every push
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Append logs to this file instead of stderr
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// A Prometheus endpoint scraped on its own schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExporterConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_item_interval")]
    pub interval_secs: u64,
    /// Defaults to the interval
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// A user-defined command run on its own schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomCheckConfig {
    pub name: String,
    pub command: String,
    #[serde(default = "default_item_interval")]
    pub interval_secs: u64,
    /// Defaults to the interval
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_collection_interval() -> u64 {
    10
}

fn default_item_interval() -> u64 {
    60
}

fn default_push_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8690))
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = read(path)?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the constraints serde cannot express. Per-item timing is not
    /// checked here: a bad item fails at start without failing the reload.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_id.trim().is_empty() {
            return Err(ConfigError::Invalid("agent_id must not be empty".into()));
        }
        if self.collection_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "collection_interval_secs must be greater than zero".into(),
            ));
        }
        if let Some(push) = &self.push {
            if push.url.trim().is_empty() {
                return Err(ConfigError::Invalid("push.url must not be empty".into()));
            }
        }
        let mut names = HashSet::new();
        for exporter in &self.exporters {
            if !names.insert(exporter.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate exporter name '{}'",
                    exporter.name
                )));
            }
        }
        Ok(())
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_secs)
    }
}

impl ExporterConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(self.interval_secs))
    }
}

impl CustomCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(self.interval_secs))
    }
}

#[derive(Debug, Deserialize)]
struct CustomChecksFile {
    #[serde(default)]
    checks: Vec<toml::Value>,
}

/// Parses a custom-check file.
///
/// Each `[[checks]]` record is decoded on its own: a malformed or duplicate
/// record is logged and left out, the rest of the list still loads.
pub fn parse_custom_checks(content: &str, origin: &str) -> Result<Vec<CustomCheckConfig>, ConfigError> {
    let file: CustomChecksFile = toml::from_str(content).map_err(|source| ConfigError::Parse {
        path: origin.to_string(),
        source,
    })?;

    let mut names = HashSet::new();
    let mut checks = Vec::with_capacity(file.checks.len());
    for (index, raw) in file.checks.into_iter().enumerate() {
        let check = match raw.try_into::<CustomCheckConfig>() {
            Ok(check) => check,
            Err(e) => {
                tracing::warn!(file = origin, index, error = %e, "Skipping malformed custom check");
                continue;
            }
        };
        if !names.insert(check.name.clone()) {
            tracing::warn!(file = origin, name = %check.name, "Skipping duplicate custom check");
            continue;
        }
        checks.push(check);
    }
    Ok(checks)
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Where the agent instance gets its configuration from.
///
/// Loading is synchronous; the instance runs it on the blocking pool.
pub trait ConfigSource: Send + Sync + 'static {
    fn load_config(&self) -> Result<AgentConfig, ConfigError>;

    fn load_custom_checks(&self, path: &str) -> Result<Vec<CustomCheckConfig>, ConfigError>;
}

/// Reads both files from disk.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn load_config(&self) -> Result<AgentConfig, ConfigError> {
        AgentConfig::load(&self.path)
    }

    fn load_custom_checks(&self, path: &str) -> Result<Vec<CustomCheckConfig>, ConfigError> {
        let path = Path::new(path);
        // relative paths are resolved next to the main config file
        let resolved = match self.path.parent() {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        };
        let content = read(&resolved)?;
        parse_custom_checks(&content, &resolved.display().to_string())
    }
}
