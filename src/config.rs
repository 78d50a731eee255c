use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap, fs::File, io::BufReader, path::Path, path::PathBuf, sync::Arc,
    time::Duration,
};

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use crate::InternalResult;
use crate::memory::MemoryConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to open config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Run-scoped engine configuration. Passed explicitly to every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default = "default_await_timeout", with = "duration_ms")]
    pub await_timeout: Duration,

    #[serde(default)]
    pub project_root: Option<PathBuf>,

    #[serde(default)]
    pub app_path: Option<PathBuf>,

    /// Directory, relative to the project root, run artifacts are written to.
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: String,

    #[serde(default)]
    pub audit_required: bool,

    #[serde(default = "default_allowed_themes")]
    pub allowed_themes: Vec<String>,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(skip)]
    pub secrets: Secrets,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: LimitsConfig::default(),
            await_timeout: default_await_timeout(),
            project_root: None,
            app_path: None,
            artifacts_dir: default_artifacts_dir(),
            audit_required: false,
            allowed_themes: default_allowed_themes(),
            memory: MemoryConfig::default(),
            secrets: Secrets::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_secrets(mut self, secrets: SecretConfig) -> Self {
        self.secrets = Secrets::from(secrets);
        self
    }

    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = Some(root.into());
        self
    }

    /// Load an engine config file, and optionally a secrets file beside it.
    pub fn load<P: AsRef<Path>>(path: P, secrets: Option<P>) -> InternalResult<Self> {
        let mut config: EngineConfig = from_file(path)?;
        if let Some(secrets) = secrets {
            config = config.with_secrets(from_file(secrets)?);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let limits = &self.limits;
        let caps = [
            ("max_agent_calls", limits.max_agent_calls),
            ("max_parallel_agents", limits.max_parallel_agents),
            ("max_parallel_branches", limits.max_parallel_branches),
            ("max_loop_iterations", limits.max_loop_iterations),
        ];
        if let Some((name, _)) = caps.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{} must be positive", name)));
        }
        if self.artifacts_dir.trim().is_empty() {
            return Err(ConfigError::Invalid("artifacts_dir is empty".to_string()));
        }
        Ok(())
    }

    pub fn artifacts_path(&self) -> Option<PathBuf> {
        self.project_root
            .as_ref()
            .map(|root| root.join(&self.artifacts_dir))
    }
}

/// Hard caps bounding worst-case work of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_agent_calls")]
    pub max_agent_calls: usize,

    #[serde(default = "default_max_parallel_agents")]
    pub max_parallel_agents: usize,

    #[serde(default = "default_max_parallel_branches")]
    pub max_parallel_branches: usize,

    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: usize,

    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_agent_calls: default_max_agent_calls(),
            max_parallel_agents: default_max_parallel_agents(),
            max_parallel_branches: default_max_parallel_branches(),
            max_tool_calls: default_max_tool_calls(),
            max_loop_iterations: default_max_loop_iterations(),
        }
    }
}

/// Secret values as they appear in a secrets file.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SecretConfig {
    #[serde(default = "HashMap::new")]
    pub values: HashMap<String, String>,
}

/// Secret values held for one engine.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    values: Arc<HashMap<String, SecretString>>,
}

impl From<SecretConfig> for Secrets {
    fn from(config: SecretConfig) -> Self {
        let values = config
            .values
            .into_iter()
            .map(|(k, v)| (k, SecretString::from(v)))
            .collect();
        Self {
            values: Arc::new(values),
        }
    }
}

impl Secrets {
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.values.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|s| s.expose_secret())
    }

    /// Raw values, used only for scrubbing outgoing text.
    pub fn values(&self) -> Vec<String> {
        self.values
            .values()
            .map(|s| s.expose_secret().to_string())
            .collect()
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> ConfigResult<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> ConfigResult<T> {
    let config = serde_json::from_str(s)?;
    Ok(config)
}

fn default_await_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_artifacts_dir() -> String {
    ".flowrun".to_string()
}

fn default_allowed_themes() -> Vec<String> {
    vec!["light".to_string(), "dark".to_string(), "system".to_string()]
}

fn default_max_agent_calls() -> usize {
    5
}

fn default_max_parallel_agents() -> usize {
    3
}

fn default_max_parallel_branches() -> usize {
    8
}

fn default_max_tool_calls() -> usize {
    3
}

fn default_max_loop_iterations() -> usize {
    10_000
}

pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: EngineConfig = from_str("{}").unwrap();
        assert_eq!(config.limits.max_agent_calls, 5);
        assert_eq!(config.limits.max_parallel_agents, 3);
        assert_eq!(config.await_timeout, Duration::from_secs(30));
        assert_eq!(config.artifacts_dir, ".flowrun");
        assert!(config.artifacts_path().is_none());
    }

    #[test]
    fn test_partial_limits_and_durations() {
        let config: EngineConfig = from_str(
            r#"{"limits": {"max_agent_calls": 2}, "await_timeout": 1500, "project_root": "/srv/app"}"#,
        )
        .unwrap();
        assert_eq!(config.limits.max_agent_calls, 2);
        assert_eq!(config.limits.max_tool_calls, 3);
        assert_eq!(config.await_timeout, Duration::from_millis(1500));
        assert_eq!(
            config.artifacts_path(),
            Some(PathBuf::from("/srv/app/.flowrun"))
        );
    }

    #[test]
    fn test_secrets_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"values": {{"API_TOKEN": "abc123"}}}}"#).unwrap();
        let secrets: SecretConfig = from_file(file.path()).unwrap();
        let config = EngineConfig::default().with_secrets(secrets);
        assert_eq!(config.secrets.get("API_TOKEN"), Some("abc123"));
        assert_eq!(config.secrets.names(), vec!["API_TOKEN".to_string()]);
        assert!(!format!("{:?}", config.secrets).contains("abc123"));
    }

    #[test]
    fn test_load_merges_secrets_and_validates() {
        let mut config_file = tempfile::NamedTempFile::new().unwrap();
        write!(config_file, r#"{{"audit_required": true}}"#).unwrap();
        let mut secrets_file = tempfile::NamedTempFile::new().unwrap();
        write!(secrets_file, r#"{{"values": {{"DB": "s3cret"}}}}"#).unwrap();
        let config =
            EngineConfig::load(config_file.path(), Some(secrets_file.path())).unwrap();
        assert!(config.audit_required);
        assert_eq!(config.secrets.get("DB"), Some("s3cret"));

        let mut zero_cap = tempfile::NamedTempFile::new().unwrap();
        write!(zero_cap, r#"{{"limits": {{"max_agent_calls": 0}}}}"#).unwrap();
        let err = EngineConfig::load(zero_cap.path(), None).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Config(ConfigError::Invalid(ref message)) if message.contains("max_agent_calls")
        ));
    }

    #[test]
    fn test_invalid_json_is_a_parse_error() {
        let result: ConfigResult<EngineConfig> = from_str("{not json");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
