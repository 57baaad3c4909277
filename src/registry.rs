use crate::config::SupervisorConfig;
use crate::error::ServiceError;
use crate::service::{validate_name, ServiceRecord};
use crate::storage::{StorageError, WorkDir};
use crate::supervisor::{Supervisor, SupervisorAction};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// Shared handle to the supervisor implementation
pub type SharedSupervisor = Arc<dyn Supervisor>;

/// Retry policy for supervisor actions
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Extra attempts after a definite failure. Timeouts are never retried.
    pub action_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            action_retries: 0,
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl From<&SupervisorConfig> for RegistryOptions {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            action_retries: config.action_retries,
            retry_delay: config.retry_delay(),
        }
    }
}

/// What `create_or_update` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// New service persisted and started
    Created,
    /// Existing service persisted; `reloaded` is false when it was stopped
    Updated { reloaded: bool },
}

/// A persisted entry that reconciliation could not load
#[derive(Debug, Clone)]
pub struct ReconcileSkip {
    pub entry: String,
    pub reason: String,
}

/// Result of the startup scan
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub loaded: Vec<String>,
    pub skipped: Vec<ReconcileSkip>,
}

impl ReconcileReport {
    fn skip(&mut self, entry: impl Into<String>, reason: impl Into<String>) {
        let skip = ReconcileSkip {
            entry: entry.into(),
            reason: reason.into(),
        };
        warn!(entry = %skip.entry, reason = %skip.reason, "Skipping persisted service");
        self.skipped.push(skip);
    }
}

/// Owns every service record and drives their lifecycle.
///
/// # Concurrency
///
/// Mutating operations hold a per-name async mutex from validation until the
/// supervisor answers, so requests for the same name never interleave while
/// different names proceed independently. The record map itself is only
/// locked for short, non-blocking reads and whole-record writes; disk I/O and
/// supervisor calls happen outside it.
///
/// Within one operation the order is always persist, then update the record,
/// then call the supervisor.
pub struct ServiceRegistry {
    records: RwLock<HashMap<String, ServiceRecord>>,
    /// Per-name operation locks, created on first use and never removed, so
    /// the table is bounded by the set of names ever operated on. Unknown
    /// names are rejected before a lock is created.
    locks: DashMap<String, Arc<Mutex<()>>>,
    work_dir: WorkDir,
    supervisor: SharedSupervisor,
    options: RegistryOptions,
}

impl ServiceRegistry {
    /// Create an empty registry without scanning the working directory
    pub fn new(
        work_dir: WorkDir,
        supervisor: SharedSupervisor,
        options: RegistryOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            records: RwLock::new(HashMap::new()),
            locks: DashMap::new(),
            work_dir,
            supervisor,
            options,
        })
    }

    /// Create the registry and rebuild it from persisted artifacts.
    ///
    /// Staging files left by an interrupted write are removed first; nothing
    /// else can be writing before the registry exists.
    pub async fn open(
        work_dir: WorkDir,
        supervisor: SharedSupervisor,
        options: RegistryOptions,
    ) -> (Arc<Self>, ReconcileReport) {
        let cleanup = work_dir.clone();
        match tokio::task::spawn_blocking(move || cleanup.remove_stale_staging()).await {
            Ok(Ok(0)) => {}
            Ok(Ok(removed)) => info!(removed, "Removed stale staging files"),
            Ok(Err(e)) => warn!(error = %e, "Failed to clean up staging files"),
            Err(e) => warn!(error = %e, "Staging cleanup task failed"),
        }

        let registry = Self::new(work_dir, supervisor, options);
        let report = registry.reconcile_on_startup().await;
        (registry, report)
    }

    pub fn work_dir(&self) -> &WorkDir {
        &self.work_dir
    }

    /// Names of every registered service
    pub fn list(&self) -> BTreeSet<String> {
        self.records.read().keys().cloned().collect()
    }

    /// Every record, ordered by name
    pub fn snapshot(&self) -> BTreeMap<String, ServiceRecord> {
        self.records
            .read()
            .iter()
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect()
    }

    pub fn get(&self, name: &str) -> Result<ServiceRecord, ServiceError> {
        self.records
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.read().contains_key(name)
    }

    async fn lock_name(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    fn cached_running(&self, name: &str) -> Result<bool, ServiceError> {
        self.records
            .read()
            .get(name)
            .map(|record| record.running)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    fn set_cached_running(&self, name: &str, running: bool) {
        if let Some(record) = self.records.write().get_mut(name) {
            record.running = running;
        }
    }

    /// Run a storage operation on the blocking pool
    async fn storage<T, F>(&self, name: &str, op: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&WorkDir) -> Result<T, StorageError> + Send + 'static,
    {
        let work_dir = self.work_dir.clone();
        match tokio::task::spawn_blocking(move || op(&work_dir)).await {
            Ok(result) => result.map_err(|e| ServiceError::from_storage(name, e)),
            Err(e) => Err(ServiceError::from_storage(
                name,
                StorageError::Io {
                    action: "run storage task for",
                    path: self.work_dir.root().to_path_buf(),
                    source: io::Error::other(e),
                },
            )),
        }
    }

    /// Issue a supervisor action, retrying definite failures per the options
    async fn invoke(&self, name: &str, action: SupervisorAction) -> Result<(), ServiceError> {
        let mut attempt = 0;
        loop {
            match self.supervisor.apply(action, name).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.options.action_retries => {
                    attempt += 1;
                    warn!(service = name, %action, attempt, error = %e, "Supervisor action failed, retrying");
                    tokio::time::sleep(self.options.retry_delay).await;
                }
                Err(e) => {
                    error!(service = name, %action, error = %e, "Supervisor action failed");
                    return Err(ServiceError::from_supervisor(name, action, e));
                }
            }
        }
    }

    /// Persist a service and bring the supervisor in line with it.
    ///
    /// A new service is started. A known service that is running is reloaded;
    /// a stopped one only has its artifacts replaced. If persistence fails the
    /// registry is left exactly as it was.
    pub async fn create_or_update(
        &self,
        name: &str,
        config: &str,
        handler: &str,
    ) -> Result<UpdateOutcome, ServiceError> {
        validate_name(name).map_err(ServiceError::InvalidName)?;
        let _guard = self.lock_name(name).await;

        let existing = self.records.read().get(name).cloned();

        let pair = {
            let owned = name.to_string();
            let config = config.to_string();
            let handler = handler.to_string();
            self.storage(name, move |work_dir| {
                work_dir.write_pair(&owned, &config, &handler)
            })
            .await?
        };

        match existing {
            None => {
                info!(service = name, "Creating service");
                let record = ServiceRecord::new(name, pair.config, pair.handler, false);
                self.records.write().insert(name.to_string(), record);

                self.invoke(name, SupervisorAction::Start).await?;
                self.set_cached_running(name, true);
                info!(service = name, "Service started");
                Ok(UpdateOutcome::Created)
            }
            Some(previous) => {
                let running = previous.running;
                info!(service = name, running, "Updating service");
                let record = ServiceRecord {
                    config: pair.config,
                    handler: pair.handler,
                    ..previous
                };
                self.records.write().insert(name.to_string(), record);

                if running {
                    self.invoke(name, SupervisorAction::Reload).await?;
                    info!(service = name, "Service reloaded");
                } else {
                    debug!(service = name, "Service stopped, update staged without reload");
                }
                Ok(UpdateOutcome::Updated { reloaded: running })
            }
        }
    }

    /// Start or stop a service. Returns whether a supervisor action was issued;
    /// asking for the state the service is already in does nothing.
    pub async fn set_running(&self, name: &str, desired: bool) -> Result<bool, ServiceError> {
        if !self.contains(name) {
            return Err(ServiceError::NotFound(name.to_string()));
        }
        let _guard = self.lock_name(name).await;

        let running = self.cached_running(name)?;
        if running == desired {
            debug!(service = name, running, "Service already in requested state");
            return Ok(false);
        }

        let action = if desired {
            SupervisorAction::Start
        } else {
            SupervisorAction::Stop
        };
        info!(service = name, %action, "Changing service state");
        self.invoke(name, action).await?;
        self.set_cached_running(name, desired);
        Ok(true)
    }

    /// Stop a service (best effort), remove its artifacts, then forget it.
    pub async fn delete(&self, name: &str) -> Result<(), ServiceError> {
        if !self.contains(name) {
            return Err(ServiceError::NotFound(name.to_string()));
        }
        let _guard = self.lock_name(name).await;

        if self.cached_running(name)? {
            match self.invoke(name, SupervisorAction::Stop).await {
                Ok(()) => self.set_cached_running(name, false),
                Err(e) => {
                    warn!(service = name, error = %e, "Failed to stop service before deletion, continuing");
                }
            }
        }

        let owned = name.to_string();
        match self
            .storage(name, move |work_dir| work_dir.delete_pair(&owned))
            .await
        {
            Ok(()) => {}
            Err(ServiceError::PersistenceFailure {
                source: StorageError::NotFound(_),
                ..
            }) => {
                warn!(service = name, "Service artifacts already missing");
            }
            Err(e) => return Err(e),
        }

        self.records.write().remove(name);
        info!(service = name, "Service deleted");
        Ok(())
    }

    /// Rebuild records from the working directory.
    ///
    /// Each discovered pair not already registered gets its `running` state
    /// from a live status query. Bad entries are logged and skipped; this
    /// never fails as a whole.
    pub async fn reconcile_on_startup(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let work_dir = self.work_dir.clone();
        let scanned = tokio::task::spawn_blocking(move || {
            work_dir.scan().map(|scan| scan.collect::<Vec<_>>())
        })
        .await;
        let entries = match scanned {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                error!(error = %e, "Failed to scan working directory");
                report.skip(self.work_dir.root().display().to_string(), e.to_string());
                return report;
            }
            Err(e) => {
                error!(error = %e, "Working directory scan task failed");
                report.skip(self.work_dir.root().display().to_string(), e.to_string());
                return report;
            }
        };

        for entry in entries {
            let (name, pair) = match entry {
                Ok(found) => found,
                Err(skip) => {
                    report.skip(skip.file.display().to_string(), skip.reason);
                    continue;
                }
            };

            let _guard = self.lock_name(&name).await;
            if self.contains(&name) {
                debug!(service = %name, "Service already registered, keeping in-memory record");
                continue;
            }

            let running = match self.supervisor.status(&name).await {
                Ok(running) => running,
                Err(e) => {
                    report.skip(name, format!("status query failed: {}", e));
                    continue;
                }
            };

            info!(service = %name, running, "Loaded persisted service");
            let record = ServiceRecord::new(name.clone(), pair.config, pair.handler, running);
            self.records.write().insert(name.clone(), record);
            report.loaded.push(name);
        }

        info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            "Reconciliation complete"
        );
        report
    }
}
