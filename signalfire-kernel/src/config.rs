use crate::collator::{ClassificationRule, RuleError};
use crate::models::TargetId;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;

pub const CONFIG_PATH_ENVVAR: &str = "CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "sf_conf.yml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file `{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unknown log level `{0}'")]
    LogLevel(String),
    #[error("target `{target}': {reason}")]
    Target { target: String, reason: String },
    #[error("rule #{index}: {source}")]
    Rule {
        index: usize,
        #[source]
        source: RuleError,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KernelConfig {
    #[serde(default)]
    pub log: LogConf,
    #[serde(default)]
    pub server: ServerConf,
    pub targets: Vec<TargetConfig>,
    #[serde(default = "default_rules")]
    pub rules: Vec<RuleConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogConf {
    pub level: String, // debug, info, warn, error, fatal
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConf {
    pub listen: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TargetConfig {
    pub name: Option<String>,
    pub url: String,
    pub username: String,
    pub password: String,
    pub poll_interval: u64,  // secondes
    pub timeout: Option<u64>, // secondes, < poll_interval
    #[serde(default)]
    pub skip_ssl_validation: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RuleConf {
    pub pattern: String,
    pub capture: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            _ => Err(ConfigError::LogLevel(s.to_string())),
        }
    }
}

impl Default for LogConf {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

impl Default for ServerConf {
    fn default() -> Self {
        Self { listen: "0.0.0.0:8080".into(), api_key: None }
    }
}

/// Règles historiques : suffixe après le dernier tiret, sinon le nom complet
fn default_rules() -> Vec<RuleConf> {
    vec![
        RuleConf { pattern: ".*-(.*)".into(), capture: None },
        RuleConf { pattern: "(.*)".into(), capture: None },
    ]
}

impl TargetConfig {
    pub fn id(&self) -> TargetId {
        self.name.clone().unwrap_or_else(|| self.url.clone())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    /// Timeout d'un fetch : configuré, sinon la moitié de l'intervalle
    pub fn fetch_timeout(&self) -> Duration {
        match self.timeout {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_millis(self.poll_interval.saturating_mul(500)),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fail = |reason: String| ConfigError::Target { target: self.id(), reason };

        let url = Url::parse(&self.url).map_err(|e| fail(format!("bad URL `{}': {e}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(fail(format!("URL `{}' must be an absolute http(s) URL", self.url)));
        }
        if self.poll_interval == 0 {
            return Err(fail("poll_interval must be greater than zero".into()));
        }
        match self.timeout {
            Some(0) => return Err(fail("timeout must be greater than zero".into())),
            Some(t) if t >= self.poll_interval => {
                return Err(fail(format!(
                    "timeout ({t}s) must be shorter than poll_interval ({}s)",
                    self.poll_interval
                )))
            }
            _ => {}
        }
        Ok(())
    }
}

impl KernelConfig {
    pub fn log_level(&self) -> Result<LogLevel, ConfigError> {
        self.log.level.parse()
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .listen
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("server.listen `{}': {e}", self.server.listen)))
    }

    /// Compile les règles dans l'ordre configuré
    pub fn compile_rules(&self) -> Result<Vec<ClassificationRule>, ConfigError> {
        self.rules
            .iter()
            .enumerate()
            .map(|(index, r)| {
                ClassificationRule::new(&r.pattern, r.capture).map_err(|source| ConfigError::Rule { index, source })
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid("at least one target is required".into()));
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            target.validate()?;
            if !seen.insert(target.id()) {
                return Err(ConfigError::Target { target: target.id(), reason: "duplicate target name".into() });
            }
        }

        self.log_level()?;
        self.listen_addr()?;
        self.compile_rules()?;
        Ok(())
    }
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, ConfigError> {
    let cfg: KernelConfig = serde_yaml::from_str(txt)?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn config_path() -> String {
    std::env::var(CONFIG_PATH_ENVVAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into())
}

pub async fn load_config(path: &str) -> Result<KernelConfig, ConfigError> {
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io { path: path.to_string(), source })?;
    parse_config(&txt)
}
