//! Configuration for the rate limiter.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use config::{Config as ConfigLoader, Environment, File};
use reqwest::Url;
use serde::Deserialize;

/// Command-line flags. Every flag is optional and overrides the file and
/// environment layers when present.
#[derive(Parser, Debug, Default, Clone)]
#[command(name = "llm-rate-limiter", version, about = "Concurrency-capping proxy for a llama.cpp server")]
pub struct Cli {
    /// Path to a TOML config file (default: ./config.toml if present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to listen on
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Backend base URL, e.g. http://localhost:8081
    #[arg(short, long)]
    pub backend: Option<String>,

    /// Max requests forwarded to the backend at once
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Max requests waiting for a slot (0 = unbounded)
    #[arg(long)]
    pub queue_size: Option<usize>,

    /// Seconds a request may wait for a slot before a 503
    #[arg(long)]
    pub queue_timeout_secs: Option<u64>,

    /// Seconds a forwarded call may take before a 504
    #[arg(long)]
    pub backend_timeout_secs: Option<u64>,

    /// Spawn the backend process described in the [launch] section
    #[arg(long)]
    pub launch_backend: bool,
}

/// Main configuration structure for the rate limiter.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Optional backend process supervision.
    #[serde(default)]
    pub launch: LaunchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long in-flight requests may drain after SIGINT/SIGTERM.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub url: String,
    /// Deadline for a whole forwarded call, response body included.
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
    /// Deadline for the `/health` probe.
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            timeout_secs: default_backend_timeout(),
            health_timeout_secs: default_health_timeout(),
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Gate capacity. Tuned per backend/model, the GPU scheduler falls over above it.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Max requests waiting for a slot. 0 disables the bound.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Exact paths forwarded without taking a slot.
    #[serde(default)]
    pub passthrough_paths: Vec<String>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queue: default_max_queue(),
            queue_timeout_secs: default_queue_timeout(),
            max_body_bytes: default_max_body_bytes(),
            passthrough_paths: vec![],
        }
    }
}

impl LimitsConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Backend process supervision.
///
/// When enabled the proxy spawns the backend itself, waits for its `/health`
/// to report ready before serving, and stops it on shutdown.
#[derive(Debug, Clone, Deserialize)]
pub struct LaunchConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Binary or wrapper command (e.g. "llama-server" or "toolbox").
    #[serde(default = "default_launch_command")]
    pub command: String,
    /// Arguments passed verbatim. Must make the backend listen on `backend.url`.
    /// Example: `["-m", "/models/qwen.gguf", "--port", "8081", "-np", "5"]`
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_launch_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Inherit the backend's stdout/stderr.
    #[serde(default)]
    pub log_output: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_launch_command(),
            args: vec![],
            startup_timeout_secs: default_startup_timeout(),
            shutdown_timeout_secs: default_launch_shutdown_timeout(),
            log_output: false,
        }
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid backend URL '{url}': {reason}")]
    InvalidBackendUrl { url: String, reason: String },

    #[error("max_concurrent must be at least 1 (got {0})")]
    InvalidMaxConcurrent(usize),

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_shutdown_grace() -> u64 {
    10
}
fn default_backend_url() -> String {
    "http://localhost:8081".to_string()
}
fn default_backend_timeout() -> u64 {
    300
}
fn default_health_timeout() -> u64 {
    2
}
fn default_max_concurrent() -> usize {
    5
}
fn default_max_queue() -> usize {
    100
}
fn default_queue_timeout() -> u64 {
    300
}
fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_launch_command() -> String {
    "llama-server".to_string()
}
fn default_startup_timeout() -> u64 {
    120
}
fn default_launch_shutdown_timeout() -> u64 {
    10
}

impl Config {
    /// Load configuration from file, environment variables and CLI flags.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Command-line flags
    /// 2. Environment variables (RATE_LIMITER__SECTION__KEY format)
    /// 3. config.toml file, or the file given with `--config`
    /// 4. Built-in defaults
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => File::from(path.as_path()).required(true),
            None => File::with_name("config").required(false),
        };

        let loader = ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .set_default("backend.url", default_backend_url())?
            .set_default("limits.max_concurrent", default_max_concurrent() as i64)?
            .add_source(file)
            .add_source(
                Environment::with_prefix("RATE_LIMITER")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("server.host", cli.host.clone())?
            .set_override_option("server.port", cli.port.map(i64::from))?
            .set_override_option("backend.url", cli.backend.clone())?
            .set_override_option("limits.max_concurrent", cli.max_concurrent.map(|n| n as i64))?
            .set_override_option("limits.max_queue", cli.queue_size.map(|n| n as i64))?
            .set_override_option("limits.queue_timeout_secs", cli.queue_timeout_secs.map(|n| n as i64))?
            .set_override_option("backend.timeout_secs", cli.backend_timeout_secs.map(|n| n as i64))?
            .set_override_option("launch.enabled", cli.launch_backend.then_some(true))?
            .build()?;

        let config: Config = loader.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the proxy cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_concurrent < 1 {
            return Err(ConfigError::InvalidMaxConcurrent(self.limits.max_concurrent));
        }
        self.backend_url()?;
        if self.limits.queue_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("limits.queue_timeout_secs"));
        }
        if self.backend.timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("backend.timeout_secs"));
        }
        if self.backend.health_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("backend.health_timeout_secs"));
        }
        if self.limits.max_body_bytes == 0 {
            return Err(ConfigError::ZeroValue("limits.max_body_bytes"));
        }
        Ok(())
    }

    /// Parse the backend URL, requiring an absolute http(s) URL with a host.
    pub fn backend_url(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidBackendUrl {
            url: self.backend.url.clone(),
            reason: reason.to_string(),
        };

        let url = Url::parse(&self.backend.url).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host"));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("must not carry a query or fragment"));
        }
        Ok(url)
    }
}
