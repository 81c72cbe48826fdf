mod client;
mod consts;
mod core;
mod diagnostics;
mod error;
mod login_flow;
mod model;
mod monitor;
mod notifications;
mod runner;
mod settings;
#[cfg(test)]
mod test_support;
mod vault;

use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) use consts::*;

use crate::{
    client::HttpRemote,
    diagnostics::RunnerPhase,
    model::Credentials,
    notifications::{DesktopSink, GatedSink, NotificationSink},
    runner::{InstanceHandle, InstanceRunner, RunnerDeps},
    settings::{CredentialCache, SettingsHandle, StoredSettings},
    vault::KeyringVault,
};

fn main() -> ExitCode {
    init_tracing();
    info!(pid = std::process::id(), "talk-notifier starting");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            error!(%error, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };
    let code = runtime.block_on(run());
    // The stdin reader may still be parked on a blocking read.
    runtime.shutdown_timeout(Duration::from_millis(200));
    code
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("talk_notifier=info,warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run() -> ExitCode {
    let settings_path = match crate::core::settings_file() {
        Ok(path) => path,
        Err(error) => {
            error!(%error, "failed to resolve settings path");
            return ExitCode::FAILURE;
        }
    };
    let cache_path = match crate::core::credentials_file() {
        Ok(path) => path,
        Err(error) => {
            error!(%error, "failed to resolve credential cache path");
            return ExitCode::FAILURE;
        }
    };
    info!(settings = ?settings_path, credentials = ?cache_path, "loading configuration");

    if !settings_path.exists() {
        match settings::save_settings(&settings_path, &StoredSettings::default()) {
            Ok(()) => info!(path = ?settings_path, "wrote default settings, add instances there"),
            Err(error) => warn!(path = ?settings_path, %error, "failed to write default settings"),
        }
    }
    let settings = SettingsHandle::new(settings::load_or_default(&settings_path));
    let cache = Arc::new(CredentialCache::load(cache_path));
    let sink: Arc<dyn NotificationSink> = Arc::new(GatedSink::new(DesktopSink, settings.clone()));
    let shutdown = install_signal_handler(settings.clone(), settings_path.clone());

    let mut workers = Vec::new();
    let mut handles = Vec::new();
    for config in settings.snapshot().instance_configs() {
        let remote = match HttpRemote::new(&config.base_url, Credentials::default()) {
            Ok(remote) => Arc::new(remote),
            Err(error) => {
                warn!(instance = %config.name, %error, "skipping instance");
                continue;
            }
        };
        let deps = RunnerDeps {
            vault: Arc::new(KeyringVault::new(KEYRING_SERVICE, &config.name)),
            cache: cache.clone(),
            sink: sink.clone(),
            settings: settings.clone(),
        };
        let (runner, handle) = InstanceRunner::new(config, remote, deps, shutdown.clone());
        workers.push(tokio::spawn(runner.run()));
        workers.push(tokio::spawn(log_status(handle.clone())));
        handles.push(handle);
    }

    if handles.is_empty() {
        warn!(path = ?settings_path, "no instances configured, nothing to monitor");
        return ExitCode::SUCCESS;
    }
    info!(instances = handles.len(), "instance runners started");
    tokio::spawn(read_login_requests(handles, shutdown.clone()));

    for result in join_all(workers).await {
        if let Err(error) = result {
            error!(%error, "worker task failed");
        }
    }
    info!("talk-notifier stopped");
    ExitCode::SUCCESS
}

/// Cancels the returned token on SIGINT or SIGTERM. SIGHUP reloads the
/// settings file and publishes it to every worker.
fn install_signal_handler(settings: SettingsHandle, settings_path: PathBuf) -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        wait_for_shutdown_signal(&settings, &settings_path).await;
        trigger.cancel();
        debug!("shutdown signal handler completed");
    });

    token
}

#[cfg(unix)]
async fn wait_for_shutdown_signal(settings: &SettingsHandle, settings_path: &std::path::Path) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut terminate, mut hangup) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(terminate), Ok(hangup)) => (terminate, hangup),
        (Err(error), _) | (_, Err(error)) => {
            warn!(%error, "failed to install signal handlers, only Ctrl+C stops the process");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT (Ctrl+C), shutting down");
                return;
            }
            _ = terminate.recv() => {
                info!("received SIGTERM, shutting down");
                return;
            }
            _ = hangup.recv() => {
                info!(path = ?settings_path, "received SIGHUP, reloading settings");
                settings.publish(settings::load_or_default(settings_path));
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal(_settings: &SettingsHandle, _settings_path: &std::path::Path) {
    let _ = tokio::signal::ctrl_c().await;
    info!("received Ctrl+C, shutting down");
}

/// Logs status changes until the runner drops its side of the channel.
async fn log_status(handle: InstanceHandle) {
    let mut status = handle.status();
    let mut last_phase = None;

    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        if last_phase != Some(current.phase) {
            info!(
                instance = %current.instance,
                phase = ?current.phase,
                login = ?current.login,
                "instance status changed"
            );
            if current.phase == RunnerPhase::AwaitingLoginTrigger {
                info!(instance = %current.instance, "type the instance name and press enter to log in");
            }
            last_phase = Some(current.phase);
        } else {
            debug!(
                instance = %current.instance,
                unread = current.unread_total,
                notifiable = current.unread_filtered,
                backoff_secs = current.backoff_seconds,
                last_poll_at = ?current.last_poll_at,
                error = current.last_error.as_deref().unwrap_or(""),
                "instance status"
            );
        }
    }
}

/// Stand-in for the tray's "Log In" item: a line naming an instance fires its
/// login trigger.
async fn read_login_requests(handles: Vec<InstanceHandle>, shutdown: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                let name = line.trim();
                if name.is_empty() {
                    continue;
                }
                match handles.iter().find(|handle| handle.name() == name) {
                    Some(handle) if handle.request_login() => {
                        info!(instance = name, "login requested");
                    }
                    Some(_) => info!(instance = name, "no login on offer right now"),
                    None => warn!(instance = name, "unknown instance"),
                }
            }
            Ok(None) => {
                debug!("stdin closed, login requests disabled");
                return;
            }
            Err(error) => {
                warn!(%error, "failed to read stdin");
                return;
            }
        }
    }
}
