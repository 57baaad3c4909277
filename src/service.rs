use serde::Serialize;

/// Longest accepted service name
pub const MAX_NAME_LEN: usize = 64;

/// Lifecycle state of a service as cached by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Supervised unit is not active
    Stopped,
    /// Supervised unit is active
    Running,
}

impl ServiceState {
    pub fn from_running(running: bool) -> Self {
        if running {
            ServiceState::Running
        } else {
            ServiceState::Stopped
        }
    }
}

/// One named proxy worker: its artifacts and cached running state.
///
/// `running` is a cache of the supervisor's view. It is only derived when the
/// record is built (create or reconciliation) and after an explicit lifecycle
/// action, never polled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRecord {
    pub name: String,
    /// Worker configuration with the work dir placeholder already substituted
    pub config: String,
    /// Handler source with the work dir placeholder already substituted
    pub handler: String,
    pub running: bool,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>, config: String, handler: String, running: bool) -> Self {
        Self {
            name: name.into(),
            config,
            handler,
            running,
        }
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_running(self.running)
    }

    /// JSON view used by the API, including the derived state
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "config": self.config,
            "handler": self.handler,
            "running": self.running,
            "state": self.state(),
        })
    }
}

/// Check that `name` is usable as both a file name component and a
/// systemd template instance.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("service name must not be empty".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!(
            "service name must be at most {} characters",
            MAX_NAME_LEN
        ));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(format!(
            "service name '{}' contains invalid character {:?}",
            name, c
        ));
    }
    Ok(())
}
