//! Configuration for keel-control.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use keel_scheduler::HealthConfig;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};
use crate::retry::RetryPolicy;

/// Default configuration file, read from the working directory if present.
pub const DEFAULT_CONFIG_FILE: &str = "keel.toml";

/// Environment variable prefix. Nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "KEEL_";

/// Top-level configuration for the control worker.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Node health configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Retry and backoff configuration.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Dispatcher configuration.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Runtime executor configuration.
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl ControlConfig {
    /// Load configuration.
    ///
    /// Sources, later overriding earlier:
    /// 1. Default values
    /// 2. `path`, or `keel.toml` in the current directory (if present)
    /// 3. Environment variables with the `KEEL_` prefix
    ///
    /// The merged result is validated before it is returned.
    pub fn load(path: Option<&Path>) -> ControlResult<Self> {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let config: Self = Self::figment(file)
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the worker cannot run with.
    pub fn validate(&self) -> ControlResult<()> {
        self.health
            .validate()
            .map_err(|e| ControlError::Config(e.to_string()))?;

        if self.dispatcher.poll_interval_ms == 0 {
            return Err(ControlError::Config(
                "dispatcher poll interval must be greater than zero".to_owned(),
            ));
        }
        if self.dispatcher.build_timeout_secs == 0 {
            return Err(ControlError::Config(
                "build timeout must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }

    fn figment(file: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_database_url() -> String {
    "postgres://localhost/keel".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl DatabaseConfig {
    /// Connection timeout as a duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Retry and backoff configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry, in seconds.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    /// Retries allowed before a job is exhausted.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Upper bound on a single delay, in seconds.
    #[serde(default = "default_cap_secs")]
    pub cap_secs: u64,
}

const fn default_base_delay_secs() -> u64 {
    5
}

const fn default_max_retries() -> u32 {
    5
}

const fn default_cap_secs() -> u64 {
    60
}

impl RetryConfig {
    /// Build the retry policy.
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.base_delay_secs),
            self.max_retries,
            Duration::from_secs(self.cap_secs),
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            max_retries: default_max_retries(),
            cap_secs: default_cap_secs(),
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Delay between polls of an empty queue, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Build deadline in seconds, unless the job overrides it.
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,

    /// Dispatcher loops to run in this process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Node this worker runs on. When set, the node is registered and
    /// heartbeated, and dispatchers check its health before polling.
    pub node_id: Option<String>,

    /// Address to register the node with.
    #[serde(default = "default_node_address")]
    pub node_address: String,

    /// Place each deployment on the least loaded healthy node. When off,
    /// deployments are recorded against this worker's own node.
    #[serde(default)]
    pub placement: bool,
}

const fn default_poll_interval_ms() -> u64 {
    1000
}

const fn default_build_timeout_secs() -> u64 {
    30 * 60
}

const fn default_concurrency() -> usize {
    1
}

fn default_node_address() -> String {
    "127.0.0.1:7000".to_owned()
}

impl DispatcherConfig {
    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Build timeout as a duration.
    #[must_use]
    pub const fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            build_timeout_secs: default_build_timeout_secs(),
            concurrency: default_concurrency(),
            node_id: None,
            node_address: default_node_address(),
            placement: false,
        }
    }
}

/// Runtime executor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Program run once per build.
    #[serde(default = "default_executor_program")]
    pub program: String,

    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_executor_program() -> String {
    "keel-builder".to_owned()
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: default_executor_program(),
            args: Vec::new(),
        }
    }
}
