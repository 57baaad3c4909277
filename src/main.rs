use anyhow::Context;
use portcullis_admin::api::{ApiServer, PKG_NAME, VERSION};
use portcullis_admin::config::Config;
use portcullis_admin::registry::{RegistryOptions, ServiceRegistry};
use portcullis_admin::storage::WorkDir;
use portcullis_admin::supervisor::SystemctlSupervisor;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[cfg(not(unix))]
compile_error!("portcullis-admin drives systemd units and only builds on Unix");

const DEFAULT_CONFIG_PATH: &str = "portcullis.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("portcullis_admin=debug".parse().expect("valid log directive")),
        )
        .init();

    // An explicit path must exist; the default one is optional
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => Config::load(&path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to load configuration");
            e
        })?,
        None => Config::load_or_default(DEFAULT_CONFIG_PATH).map_err(|e| {
            error!(path = DEFAULT_CONFIG_PATH, error = %e, "Failed to load configuration");
            e
        })?,
    };

    let work_dir = config.server.resolve_work_dir().ok_or_else(|| {
        error!("No work_dir configured and no runtime directory available (is XDG_RUNTIME_DIR set?)");
        anyhow::anyhow!("Cannot resolve working directory")
    })?;
    let work_dir = WorkDir::new(work_dir);

    print_startup_banner(&config, &work_dir);

    let _pid_file = match config.server.pid_file {
        Some(ref path) => Some(PidFile::acquire(PathBuf::from(path))?),
        None => None,
    };

    let supervisor = Arc::new(SystemctlSupervisor::new(&config.supervisor));
    let (registry, report) = ServiceRegistry::open(
        work_dir,
        supervisor,
        RegistryOptions::from(&config.supervisor),
    )
    .await;
    if !report.skipped.is_empty() {
        warn!(
            skipped = report.skipped.len(),
            entries = ?report.skipped.iter().map(|s| s.entry.as_str()).collect::<Vec<_>>(),
            "Some persisted services could not be loaded"
        );
    }
    info!(services = ?report.loaded, "Registry ready");

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid API bind address");
            anyhow::anyhow!("Invalid API bind address: {}", e)
        })?;

    if config.server.admin_token.is_none() {
        warn!("No admin_token configured, API is unauthenticated");
    }

    let mut api_server = ApiServer::bind(
        api_addr,
        Arc::clone(&registry),
        shutdown_rx.clone(),
        config.server.admin_token.clone(),
    )
    .await?;
    if let Some(ref dir) = config.server.ui_dir {
        api_server = api_server.with_ui_dir(dir);
    }

    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            error!(error = %e, "API server error");
        }
    });

    let received = wait_for_signal().await?;
    info!(signal = received, "Shutting down");

    // Supervised units keep running and all state is already on disk
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), api_handle).await;

    info!(services = registry.list().len(), "Shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> anyhow::Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Locked PID file, removed again when dropped.
///
/// A second control plane pointed at the same file fails to start instead
/// of fighting over the working directory.
struct PidFile {
    path: PathBuf,
    _file: File,
}

impl PidFile {
    fn acquire(path: PathBuf) -> anyhow::Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("cannot open PID file {}", path.display()))?;

        // SAFETY: the descriptor is owned by `file` and stays open for the call
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                anyhow::bail!("PID file {} is held by another control plane", path.display());
            }
            return Err(err).with_context(|| format!("cannot lock PID file {}", path.display()));
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        info!(path = %path.display(), "PID file locked");
        Ok(Self { path, _file: file })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
        }
    }
}

fn print_startup_banner(config: &Config, work_dir: &WorkDir) {
    info!(name = PKG_NAME, version = VERSION, "Starting control plane");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        auth = config.server.admin_token.is_some(),
        work_dir = %work_dir.root().display(),
        ui_dir = ?config.server.ui_dir,
        "Server configuration"
    );
    info!(
        program = %config.supervisor.program,
        args = ?config.supervisor.args,
        unit_prefix = %config.supervisor.unit_prefix,
        timeout_secs = config.supervisor.timeout_secs,
        action_retries = config.supervisor.action_retries,
        "Supervisor settings"
    );
}
