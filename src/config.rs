use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Environment variable overriding `server.port`
pub const ENV_PORT: &str = "TOOLGATE_PORT";
/// Environment variable overriding `server.bind`
pub const ENV_BIND: &str = "TOOLGATE_BIND";
/// Environment variable overriding `worker.command` and `worker.args` (shell syntax)
pub const ENV_WORKER_COMMAND: &str = "TOOLGATE_WORKER_COMMAND";

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker process and supervision settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Request queue limits
    #[serde(default)]
    pub queue: QueueConfig,

    /// Health reporting settings
    #[serde(default)]
    pub health: HealthConfig,

    /// Resource tracking for per-client cleanup
    #[serde(default)]
    pub resources: ResourceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port serving WebSocket clients and the status endpoint (default: 8030)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Server name reported in the handshake (default: package name)
    #[serde(default = "default_server_name")]
    pub name: String,

    /// Upper bound on the whole shutdown sequence in seconds (default: 5)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            name: default_server_name(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Configuration for the supervised worker
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the gateway's permissions.
/// Configuration files must be protected accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Command to execute
    #[serde(default = "default_worker_command")]
    pub command: String,

    /// Arguments to pass to the command
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,

    /// Extra environment variables for the worker
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the worker
    pub working_dir: Option<String>,

    /// Consecutive restarts allowed before giving up (default: 3)
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Base delay for exponential restart backoff in milliseconds (default: 1000)
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_ms: u64,

    /// Runtime after which the restart counter resets in milliseconds (default: 10000)
    #[serde(default = "default_stable_runtime")]
    pub stable_runtime_ms: u64,

    /// Delay between spawn and capability discovery in milliseconds (default: 1000)
    #[serde(default = "default_discovery_delay")]
    pub discovery_delay_ms: u64,

    /// Give up on an unanswered capability discovery after this long in milliseconds (default: 10000)
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL in milliseconds (default: 2000)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_ms: u64,

    /// Kill the worker if one request stays in flight longer than this (default: disabled)
    pub request_timeout_ms: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: default_worker_args(),
            env: HashMap::new(),
            working_dir: None,
            max_restarts: default_max_restarts(),
            restart_backoff_ms: default_restart_backoff(),
            stable_runtime_ms: default_stable_runtime(),
            discovery_delay_ms: default_discovery_delay(),
            discovery_timeout_ms: default_discovery_timeout(),
            shutdown_grace_period_ms: default_shutdown_grace_period(),
            request_timeout_ms: None,
        }
    }
}

impl WorkerConfig {
    pub fn local(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn stable_runtime(&self) -> Duration {
        Duration::from_millis(self.stable_runtime_ms)
    }

    pub fn discovery_delay(&self) -> Duration {
        Duration::from_millis(self.discovery_delay_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.command.trim().is_empty() {
            errors.push("worker: 'command' must not be empty".to_string());
        }
        if self.restart_backoff_ms == 0 {
            errors.push("worker: 'restart_backoff_ms' must be greater than 0".to_string());
        }
        if self.request_timeout_ms == Some(0) {
            errors.push("worker: 'request_timeout_ms' must be greater than 0 when set".to_string());
        }
        if self.discovery_timeout_ms == 0 {
            errors.push("worker: 'discovery_timeout_ms' must be greater than 0".to_string());
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct QueueConfig {
    /// Maximum number of queued invocations (default: unbounded)
    pub max_depth: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Worker counts as unresponsive after this long without output (default: 5000)
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: default_inactivity_timeout(),
        }
    }
}

impl HealthConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }
}

/// Which worker methods create per-client resources and how to dispose of them
#[derive(Debug, Deserialize, Clone)]
pub struct ResourceConfig {
    /// Methods whose result carries a new resource handle
    #[serde(default = "default_create_methods")]
    pub create_methods: Vec<String>,

    /// Field of the creation result holding the handle, also used as the disposal param name
    #[serde(default = "default_handle_field")]
    pub handle_field: String,

    /// Method sent to the worker to dispose of a handle
    #[serde(default = "default_dispose_method")]
    pub dispose_method: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            create_methods: default_create_methods(),
            handle_field: default_handle_field(),
            dispose_method: default_dispose_method(),
        }
    }
}

impl ResourceConfig {
    pub fn creates_resource(&self, method: &str) -> bool {
        self.create_methods.iter().any(|m| m == method)
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8030
}

fn default_server_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_worker_command() -> String {
    "npx".to_string()
}

fn default_worker_args() -> Vec<String> {
    vec!["@playwright/mcp@0.0.41".to_string()]
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_backoff() -> u64 {
    1000 // 1s, 2s, 4s
}

fn default_stable_runtime() -> u64 {
    10_000
}

fn default_discovery_delay() -> u64 {
    1000
}

fn default_discovery_timeout() -> u64 {
    10_000
}

fn default_shutdown_grace_period() -> u64 {
    2000
}

fn default_inactivity_timeout() -> u64 {
    5000
}

fn default_create_methods() -> Vec<String> {
    vec!["browser.newContext".to_string()]
}

fn default_handle_field() -> String {
    "guid".to_string()
}

fn default_dispose_method() -> String {
    "context.dispose".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TOOLGATE_*` environment overrides on top of the file settings
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid {}='{}': {}", ENV_PORT, port, e))?;
        }

        if let Some(bind) = lookup(ENV_BIND) {
            self.server.bind = bind;
        }

        if let Some(command_line) = lookup(ENV_WORKER_COMMAND) {
            let mut words = shell_words::split(&command_line).map_err(|e| {
                anyhow::anyhow!("Invalid {}='{}': {}", ENV_WORKER_COMMAND, command_line, e)
            })?;
            if words.is_empty() {
                anyhow::bail!("{} must not be empty", ENV_WORKER_COMMAND);
            }
            self.worker.command = words.remove(0);
            self.worker.args = words;
        }

        self.validate()
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        self.worker.validate(&mut errors);

        if self.queue.max_depth == Some(0) {
            errors.push("queue: 'max_depth' must be greater than 0 when set".to_string());
        }

        if self.resources.handle_field.is_empty() {
            errors.push("resources: 'handle_field' must not be empty".to_string());
        }

        if self.resources.dispose_method.is_empty() {
            errors.push("resources: 'dispose_method' must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
