use crate::config::SupervisorConfig;
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// systemctl exit status for a unit that is not loaded
const EXIT_UNIT_NOT_FOUND: i32 = 5;

/// Control action issued against a supervised unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorAction {
    Start,
    Stop,
    Reload,
    Status,
}

impl SupervisorAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorAction::Start => "start",
            SupervisorAction::Stop => "stop",
            SupervisorAction::Reload => "reload",
            SupervisorAction::Status => "status",
        }
    }
}

impl fmt::Display for SupervisorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The action ran and reported failure
    #[error("{action} of {unit} failed with exit code {code:?}")]
    Failed {
        action: SupervisorAction,
        unit: String,
        code: Option<i32>,
    },

    /// The supervisor does not know the unit
    #[error("unit {unit} not found")]
    UnitNotFound { unit: String },

    /// The action did not finish in time; its effect is unknown
    #[error("{action} of {unit} timed out after {}s", .timeout.as_secs())]
    Timeout {
        action: SupervisorAction,
        unit: String,
        timeout: Duration,
    },

    /// The control program itself could not be run; its effect is unknown
    #[error("failed to run supervisor for {unit}: {source}")]
    Spawn {
        unit: String,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    /// True when the action may or may not have taken effect
    pub fn is_indeterminate(&self) -> bool {
        matches!(
            self,
            SupervisorError::Timeout { .. } | SupervisorError::Spawn { .. }
        )
    }

    /// Only definite failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, SupervisorError::Failed { .. })
    }
}

/// Per-unit control over an external process supervisor.
///
/// Implementations issue exactly one control action per call and never
/// retry. Output of the underlying action is not surfaced.
#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn start(&self, name: &str) -> Result<(), SupervisorError>;

    async fn stop(&self, name: &str) -> Result<(), SupervisorError>;

    async fn reload(&self, name: &str) -> Result<(), SupervisorError>;

    /// Whether the unit is currently active
    async fn status(&self, name: &str) -> Result<bool, SupervisorError>;

    /// Dispatch a state-changing action by value
    async fn apply(&self, action: SupervisorAction, name: &str) -> Result<(), SupervisorError> {
        match action {
            SupervisorAction::Start => self.start(name).await,
            SupervisorAction::Stop => self.stop(name).await,
            SupervisorAction::Reload => self.reload(name).await,
            SupervisorAction::Status => self.status(name).await.map(|_| ()),
        }
    }
}

/// Drives `systemctl` (or a compatible program) against template units
/// named `<prefix>@<name>.service`.
#[derive(Debug, Clone)]
pub struct SystemctlSupervisor {
    program: String,
    args: Vec<String>,
    unit_prefix: String,
    timeout: Duration,
}

impl SystemctlSupervisor {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            unit_prefix: config.unit_prefix.clone(),
            timeout: config.timeout(),
        }
    }

    pub fn unit_name(&self, name: &str) -> String {
        format!("{}@{}.service", self.unit_prefix, name)
    }

    /// Run one action and return its exit code (`None` if killed by a signal)
    async fn run(
        &self,
        action: SupervisorAction,
        name: &str,
    ) -> Result<Option<i32>, SupervisorError> {
        let unit = self.unit_name(name);

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.arg(action.as_str());
        cmd.arg(&unit);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            unit: unit.clone(),
            source,
        })?;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => return Err(SupervisorError::Spawn { unit, source }),
            Err(_) => {
                let _ = child.kill().await;
                return Err(SupervisorError::Timeout {
                    action,
                    unit,
                    timeout: self.timeout,
                });
            }
        };

        debug!(%unit, %action, code = ?status.code(), "Supervisor action finished");
        Ok(status.code())
    }

    async fn control(&self, action: SupervisorAction, name: &str) -> Result<(), SupervisorError> {
        match self.run(action, name).await? {
            Some(0) => Ok(()),
            Some(EXIT_UNIT_NOT_FOUND) => Err(SupervisorError::UnitNotFound {
                unit: self.unit_name(name),
            }),
            code => Err(SupervisorError::Failed {
                action,
                unit: self.unit_name(name),
                code,
            }),
        }
    }
}

#[async_trait]
impl Supervisor for SystemctlSupervisor {
    async fn start(&self, name: &str) -> Result<(), SupervisorError> {
        self.control(SupervisorAction::Start, name).await
    }

    async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        self.control(SupervisorAction::Stop, name).await
    }

    async fn reload(&self, name: &str) -> Result<(), SupervisorError> {
        self.control(SupervisorAction::Reload, name).await
    }

    async fn status(&self, name: &str) -> Result<bool, SupervisorError> {
        Ok(self.run(SupervisorAction::Status, name).await? == Some(0))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// A supervisor whose control program is `sh -c <script>`; the action and
    /// unit arrive as `$1` and `$2`.
    fn shell_supervisor(script: &str, timeout_secs: u64) -> SystemctlSupervisor {
        SystemctlSupervisor::new(&SupervisorConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
            timeout_secs,
            ..SupervisorConfig::default()
        })
    }

    #[test]
    fn test_unit_name() {
        let supervisor = SystemctlSupervisor::new(&SupervisorConfig::default());
        assert_eq!(supervisor.unit_name("svc1"), "portcullis@svc1.service");
    }

    #[tokio::test]
    async fn test_status_from_exit_code() {
        assert!(shell_supervisor("exit 0", 5).status("svc").await.unwrap());
        assert!(!shell_supervisor("exit 3", 5).status("svc").await.unwrap());
    }

    #[tokio::test]
    async fn test_control_success_and_failure() {
        let ok = shell_supervisor("exit 0", 5);
        assert!(ok.start("svc").await.is_ok());
        assert!(ok.stop("svc").await.is_ok());
        assert!(ok.reload("svc").await.is_ok());

        let failing = shell_supervisor("exit 1", 5);
        match failing.reload("svc").await {
            Err(SupervisorError::Failed { action, unit, code }) => {
                assert_eq!(action, SupervisorAction::Reload);
                assert_eq!(unit, "portcullis@svc.service");
                assert_eq!(code, Some(1));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_action_and_unit_are_passed() {
        let supervisor =
            shell_supervisor(r#"[ "$1" = start ] && [ "$2" = portcullis@web.service ]"#, 5);
        assert!(supervisor.start("web").await.is_ok());
        assert!(supervisor.stop("web").await.is_err());
    }

    #[tokio::test]
    async fn test_unit_not_found_is_distinct() {
        let err = shell_supervisor("exit 5", 5).start("svc").await.unwrap_err();
        assert!(matches!(err, SupervisorError::UnitNotFound { .. }));
        assert!(!err.is_retryable());
        assert!(!err.is_indeterminate());
    }

    #[tokio::test]
    async fn test_timeout_is_indeterminate() {
        let err = shell_supervisor("sleep 5", 1).start("svc").await.unwrap_err();
        assert!(matches!(err, SupervisorError::Timeout { .. }));
        assert!(err.is_indeterminate());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_program_is_indeterminate() {
        let supervisor = SystemctlSupervisor::new(&SupervisorConfig {
            program: "/nonexistent/portcullis-systemctl".to_string(),
            ..SupervisorConfig::default()
        });
        let err = supervisor.status("svc").await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(err.is_indeterminate());
    }
}
