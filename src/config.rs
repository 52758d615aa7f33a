//! Configuration management for the limits service.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{LimitsError, Result};
use crate::limits::{parse_directives, LimitsConfig};
use crate::scoreboard::ScoreboardConfig;

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "LIMITS";

/// Main configuration for the limits service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsServiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker slot bounds
    #[serde(default)]
    pub scoreboard: ScoreboardConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Directives for the default scope
    #[serde(default)]
    pub limits: BTreeMap<String, DirectiveArg>,

    /// Per virtual host scopes
    #[serde(default)]
    pub virtual_hosts: Vec<VirtualHostConfig>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8082))
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Directives for one virtual host.
///
/// A virtual host scope starts from the built-in defaults; it does not
/// inherit the default scope's directives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualHostConfig {
    /// Canonical server name, matched exactly
    pub name: String,

    #[serde(default)]
    pub directives: BTreeMap<String, DirectiveArg>,
}

impl VirtualHostConfig {
    /// Parse this scope's directives.
    pub fn limits(&self) -> Result<LimitsConfig> {
        parse_directive_map(&self.directives)
    }
}

/// A directive argument as written in the configuration file.
///
/// Directives take a single string argument; YAML numbers are accepted and
/// handed to the directive parser in their textual form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DirectiveArg {
    Text(String),
    Integer(i64),
    Float(f64),
}

impl fmt::Display for DirectiveArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectiveArg::Text(s) => f.write_str(s),
            DirectiveArg::Integer(i) => write!(f, "{}", i),
            DirectiveArg::Float(x) => write!(f, "{}", x),
        }
    }
}

impl From<&str> for DirectiveArg {
    fn from(s: &str) -> Self {
        DirectiveArg::Text(s.to_string())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

fn parse_directive_map(directives: &BTreeMap<String, DirectiveArg>) -> Result<LimitsConfig> {
    let args: Vec<(&str, String)> = directives
        .iter()
        .map(|(name, arg)| (name.as_str(), arg.to_string()))
        .collect();
    parse_directives(args.iter().map(|(name, arg)| (*name, arg.as_str())))
}

impl LimitsServiceConfig {
    /// Load configuration from a YAML file, with `LIMITS__*` environment
    /// variables layered on top (e.g. `LIMITS__SERVER__GRPC_ADDR`).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::layered(Some(path.as_ref()), environment())
    }

    /// Load configuration from `LIMITS__*` environment variables alone.
    pub fn from_env() -> Result<Self> {
        Self::layered(None, environment())
    }

    fn layered(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }

        let settings = builder.add_source(env).build()?;
        let config: LimitsServiceConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimitsServiceConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LimitsError::Config(format!("Failed to parse limits config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the default scope's directives.
    pub fn default_limits(&self) -> Result<LimitsConfig> {
        parse_directive_map(&self.limits)
    }

    /// Check the parts of the configuration that serde cannot.
    pub fn validate(&self) -> Result<()> {
        self.scoreboard.validate()?;

        let mut seen = std::collections::HashSet::new();
        for vhost in &self.virtual_hosts {
            if vhost.name.is_empty() {
                return Err(LimitsError::Config(
                    "virtual host scope with an empty name".to_string(),
                ));
            }
            if !seen.insert(vhost.name.as_str()) {
                return Err(LimitsError::Config(format!(
                    "duplicate virtual host scope: {}",
                    vhost.name
                )));
            }
        }
        Ok(())
    }
}
