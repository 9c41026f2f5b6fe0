use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Global default settings for executions
    #[serde(default)]
    pub defaults: ExecDefaults,

    /// Route configurations, keyed by request path
    #[serde(default)]
    pub routes: HashMap<String, RouteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 3000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecDefaults {
    /// Default wall-clock timeout in seconds for a single invocation
    #[serde(default = "default_exec_timeout")]
    pub timeout_secs: u64,

    /// Default grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,

    /// Maximum bytes captured per output stream (stdout and stderr each)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Maximum number of concurrently running subprocesses
    #[serde(default = "default_max_concurrent_execs")]
    pub max_concurrent_execs: usize,

    /// How long a request may wait for an execution slot in seconds
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_secs: u64,

    /// Return the subprocess stderr verbatim in failure responses.
    /// Off by default: stderr may carry internal paths or secrets, so
    /// clients get a generic body plus a correlation id instead.
    #[serde(default)]
    pub expose_stderr: bool,
}

impl Default for ExecDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: default_exec_timeout(),
            kill_grace_secs: default_kill_grace(),
            max_output_bytes: default_max_output_bytes(),
            max_concurrent_execs: default_max_concurrent_execs(),
            queue_timeout_secs: default_queue_timeout(),
            expose_stderr: false,
        }
    }
}

impl ExecDefaults {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }
}

/// Configuration for a single route
///
/// # Security Warning
///
/// The `executable` field allows arbitrary command execution. Configuration
/// files must be protected with appropriate file permissions (e.g., readable
/// only by the service user). Malicious configuration files could execute
/// arbitrary code with the permissions of the gateway process.
#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    /// Executable to invoke for this route
    ///
    /// **Security:** This program is executed directly. Ensure config files
    /// are protected and executables come from trusted sources only.
    pub executable: String,

    /// Forward the request headers to the executable as a single
    /// encoded argument (default: false)
    #[serde(default)]
    pub forward_headers: bool,

    /// HTTP method for this route (default: GET)
    pub method: Option<String>,

    /// Wall-clock timeout in seconds (overrides default)
    pub timeout_secs: Option<u64>,
}

impl RouteConfig {
    /// Create a new route config for an executable with defaults
    pub fn new(executable: &str) -> Self {
        Self {
            executable: executable.to_string(),
            forward_headers: false,
            method: None,
            timeout_secs: None,
        }
    }

    /// Enable header forwarding (builder pattern)
    pub fn with_forwarded_headers(mut self) -> Self {
        self.forward_headers = true;
        self
    }

    pub fn timeout(&self, defaults: &ExecDefaults) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(defaults.timeout_secs))
    }

    /// Validate the route configuration
    pub fn validate(&self, path: &str) -> Result<(), String> {
        if !path.starts_with('/') {
            return Err(format!("Route '{}': path must start with '/'", path));
        }

        if self.executable.is_empty() {
            return Err(format!("Route '{}': 'executable' must not be empty", path));
        }

        if let Some(ref method) = self.method {
            if method.parse::<hyper::Method>().is_err() {
                return Err(format!("Route '{}': invalid method '{}'", path, method));
            }
        }

        if self.timeout_secs == Some(0) {
            return Err(format!("Route '{}': 'timeout_secs' must be greater than 0", path));
        }

        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    3000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_exec_timeout() -> u64 {
    30 // 30 seconds per invocation
}

fn default_kill_grace() -> u64 {
    5 // 5 seconds between SIGTERM and SIGKILL
}

fn default_max_output_bytes() -> usize {
    1024 * 1024 // 1 MiB per stream
}

fn default_max_concurrent_execs() -> usize {
    32 // At most 32 subprocesses at once
}

fn default_queue_timeout() -> u64 {
    5 // 5 seconds waiting for an execution slot
}

impl Default for Config {
    /// The built-in route set served when no configuration file is present
    fn default() -> Self {
        let mut routes = HashMap::new();
        routes.insert("/".to_string(), RouteConfig::new("bin/001"));
        routes.insert("/aws".to_string(), RouteConfig::new("bin/002"));
        routes.insert("/docker".to_string(), RouteConfig::new("bin/003"));
        routes.insert(
            "/loadbalanced".to_string(),
            RouteConfig::new("bin/004").with_forwarded_headers(),
        );
        routes.insert(
            "/tls".to_string(),
            RouteConfig::new("bin/005").with_forwarded_headers(),
        );
        routes.insert(
            "/secret_word".to_string(),
            RouteConfig::new("bin/006").with_forwarded_headers(),
        );

        Self {
            server: ServerConfig::default(),
            defaults: ExecDefaults::default(),
            routes,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, or fall back to the built-in route set when the
    /// file does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.routes.is_empty() {
            errors.push("No routes configured".to_string());
        }

        for (path, route) in &self.routes {
            if let Err(e) = route.validate(path) {
                errors.push(e);
            }
        }

        if self.defaults.max_output_bytes == 0 {
            errors.push("'max_output_bytes' must be greater than 0".to_string());
        }

        if self.defaults.max_concurrent_execs == 0 {
            errors.push("'max_concurrent_execs' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
