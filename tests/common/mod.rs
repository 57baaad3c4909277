//! Shared test doubles

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use portcullis_admin::registry::{RegistryOptions, ServiceRegistry};
use portcullis_admin::storage::WorkDir;
use portcullis_admin::supervisor::{Supervisor, SupervisorAction, SupervisorError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// How a scripted action should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Exit,
    Timeout,
}

/// In-memory supervisor that records every call and tracks which units are
/// alive. Start and stop flip the alive set only when they succeed.
#[derive(Default)]
pub struct FakeSupervisor {
    calls: Mutex<Vec<(SupervisorAction, String)>>,
    alive: Mutex<HashSet<String>>,
    failures: Mutex<HashMap<SupervisorAction, Failure>>,
    broken_status: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_alive(&self, name: &str) {
        self.alive.lock().insert(name.to_string());
    }

    pub fn is_alive(&self, name: &str) -> bool {
        self.alive.lock().contains(name)
    }

    /// Make every call of `action` fail until cleared
    pub fn fail(&self, action: SupervisorAction, failure: Failure) {
        self.failures.lock().insert(action, failure);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    pub fn break_status(&self, name: &str) {
        self.broken_status.lock().insert(name.to_string());
    }

    pub fn delay(&self, name: &str, delay: Duration) {
        self.delays.lock().insert(name.to_string(), delay);
    }

    pub fn count(&self, action: SupervisorAction, name: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(a, n)| *a == action && n == name)
            .count()
    }

    pub fn calls(&self) -> Vec<(SupervisorAction, String)> {
        self.calls.lock().clone()
    }

    /// Highest number of calls that were ever running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn call(&self, action: SupervisorAction, name: &str) -> Result<(), SupervisorError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().push((action, name.to_string()));

        let delay = self.delays.lock().get(name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failures.lock().get(&action).copied();
        let unit = format!("portcullis@{}.service", name);
        let result = match failure {
            Some(Failure::Exit) => Err(SupervisorError::Failed {
                action,
                unit,
                code: Some(1),
            }),
            Some(Failure::Timeout) => Err(SupervisorError::Timeout {
                action,
                unit,
                timeout: Duration::from_secs(30),
            }),
            None => {
                match action {
                    SupervisorAction::Start => {
                        self.alive.lock().insert(name.to_string());
                    }
                    SupervisorAction::Stop => {
                        self.alive.lock().remove(name);
                    }
                    SupervisorAction::Reload | SupervisorAction::Status => {}
                }
                Ok(())
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl Supervisor for FakeSupervisor {
    async fn start(&self, name: &str) -> Result<(), SupervisorError> {
        self.call(SupervisorAction::Start, name).await
    }

    async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        self.call(SupervisorAction::Stop, name).await
    }

    async fn reload(&self, name: &str) -> Result<(), SupervisorError> {
        self.call(SupervisorAction::Reload, name).await
    }

    async fn status(&self, name: &str) -> Result<bool, SupervisorError> {
        self.calls
            .lock()
            .push((SupervisorAction::Status, name.to_string()));
        if self.broken_status.lock().contains(name) {
            return Err(SupervisorError::Spawn {
                unit: format!("portcullis@{}.service", name),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "systemctl missing"),
            });
        }
        Ok(self.is_alive(name))
    }
}

/// Registry over a fresh temporary working directory
pub fn test_registry(supervisor: &Arc<FakeSupervisor>) -> (Arc<ServiceRegistry>, TempDir) {
    let tmp = TempDir::new().unwrap();
    let registry = ServiceRegistry::new(
        WorkDir::new(tmp.path().join("portcullis")),
        Arc::clone(supervisor) as Arc<dyn Supervisor>,
        RegistryOptions::default(),
    );
    (registry, tmp)
}
