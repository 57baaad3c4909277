use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name appended to the runtime root when no work dir is configured
pub const WORK_DIR_NAME: &str = "portcullis";

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// API server and storage configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// How lifecycle actions reach the process supervisor
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// API port (default: 5000)
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Bearer token required on /api routes.
    /// If not set the API is open, so keep it bound to loopback.
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Working directory for service artifacts.
    /// Defaults to `$XDG_RUNTIME_DIR/portcullis`.
    pub work_dir: Option<String>,

    /// Directory holding the built operator UI (`index.html`, `build.js`,
    /// `build.js.map`). Not served when unset.
    pub ui_dir: Option<String>,
}

impl ServerConfig {
    /// Resolve the working directory, falling back to the user runtime dir.
    ///
    /// Returns `None` when nothing is configured and the platform has no
    /// runtime directory, which is fatal at startup.
    pub fn resolve_work_dir(&self) -> Option<PathBuf> {
        match self.work_dir {
            Some(ref dir) => Some(PathBuf::from(dir)),
            None => dirs_next::runtime_dir().map(|root| root.join(WORK_DIR_NAME)),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_api_port(),
            admin_token: None,
            pid_file: None,
            work_dir: None,
            ui_dir: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Supervisor control program (default: systemctl)
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments placed before the action (default: --user --quiet)
    #[serde(default = "default_program_args")]
    pub args: Vec<String>,

    /// Template unit prefix; units are addressed as `<prefix>@<name>.service`
    #[serde(default = "default_unit_prefix")]
    pub unit_prefix: String,

    /// Upper bound for a single control action in seconds
    #[serde(default = "default_action_timeout")]
    pub timeout_secs: u64,

    /// Extra attempts for actions that definitely failed
    #[serde(default)]
    pub action_retries: u32,

    /// Delay between retries in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl SupervisorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Validate the supervisor section
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.program.trim().is_empty() {
            errors.push("supervisor: 'program' must not be empty".to_string());
        }
        if self.unit_prefix.is_empty() {
            errors.push("supervisor: 'unit_prefix' must not be empty".to_string());
        } else if self.unit_prefix.contains('@') || self.unit_prefix.contains('/') {
            errors.push(format!(
                "supervisor: 'unit_prefix' '{}' must not contain '@' or '/'",
                self.unit_prefix
            ));
        }
        if self.timeout_secs == 0 {
            errors.push("supervisor: 'timeout_secs' must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_program_args(),
            unit_prefix: default_unit_prefix(),
            timeout_secs: default_action_timeout(),
            action_retries: 0,
            retry_delay_ms: default_retry_delay(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    5000
}

fn default_program() -> String {
    "systemctl".to_string()
}

fn default_program_args() -> Vec<String> {
    vec!["--user".to_string(), "--quiet".to_string()]
}

fn default_unit_prefix() -> String {
    "portcullis".to_string()
}

fn default_action_timeout() -> u64 {
    30
}

fn default_retry_delay() -> u64 {
    500
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to built-in defaults
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

        if self.server.port == 0 {
            errors.push("server: 'port' must be greater than 0".to_string());
        }
        if let Some(ref dir) = self.server.work_dir {
            if dir.trim().is_empty() {
                errors.push("server: 'work_dir' must not be empty when set".to_string());
            }
        }
        if let Some(ref dir) = self.server.ui_dir {
            if dir.trim().is_empty() {
                errors.push("server: 'ui_dir' must not be empty when set".to_string());
            }
        }
        if let Err(mut supervisor_errors) = self.supervisor.validate() {
            errors.append(&mut supervisor_errors);
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
