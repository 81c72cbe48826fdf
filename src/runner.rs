//! Per-instance worker: check stored credentials, log in when needed, then
//! poll conversations until shutdown. Every wait races the shutdown token.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    client::RemoteApi,
    core::{open_in_browser, unix_now_secs},
    diagnostics::{InstanceStatus, LoginAvailability, RunnerPhase, StatusPublisher},
    error::{ClientError, NotifyError},
    login_flow::{LoginFlow, LoginHandle, LoginOutcome},
    model::{CredentialCheck, Credentials, InstanceConfig, LoginPolicy, TransportOutcome},
    monitor::ConversationMonitor,
    notifications::{Notification, NotificationSink},
    settings::{CachedCredential, CredentialCache, SettingsHandle},
    vault::CredentialVault,
    LOGIN_EXPIRED_PAUSE_SECS, LOGIN_FLOW_CEILING_SECS, LOGIN_POLL_INTERVAL_SECS,
    LOGIN_START_RETRY_SECS, MAINTENANCE_PAUSE_SECS, UNREACHABLE_PAUSE_SECS,
    VALIDATION_RETRY_SECS,
};

/// Collaborators shared by every runner.
#[derive(Clone)]
pub(crate) struct RunnerDeps {
    pub(crate) vault: Arc<dyn CredentialVault>,
    pub(crate) cache: Arc<CredentialCache>,
    pub(crate) sink: Arc<dyn NotificationSink>,
    pub(crate) settings: SettingsHandle,
}

/// Outside view of a running instance.
#[derive(Clone)]
pub(crate) struct InstanceHandle {
    name: String,
    status: watch::Receiver<InstanceStatus>,
    login_tx: mpsc::Sender<()>,
}

impl InstanceHandle {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn status(&self) -> watch::Receiver<InstanceStatus> {
        self.status.clone()
    }

    /// Fires the deferred login. Returns `false` when no login is on offer.
    pub(crate) fn request_login(&self) -> bool {
        if self.status.borrow().login != Some(LoginAvailability::LoginAvailable) {
            return false;
        }
        self.login_tx.try_send(()).is_ok()
    }
}

enum LoginStep {
    LoggedIn,
    Retry(Duration),
}

pub(crate) struct InstanceRunner {
    config: InstanceConfig,
    remote: Arc<dyn RemoteApi>,
    deps: RunnerDeps,
    monitor: ConversationMonitor,
    status: StatusPublisher,
    login_rx: mpsc::Receiver<()>,
    shutdown: CancellationToken,
    open_url: fn(&str) -> Result<(), String>,
}

impl InstanceRunner {
    pub(crate) fn new(
        config: InstanceConfig,
        remote: Arc<dyn RemoteApi>,
        deps: RunnerDeps,
        shutdown: CancellationToken,
    ) -> (Self, InstanceHandle) {
        let (status, status_rx) = StatusPublisher::new(&config.name);
        let (login_tx, login_rx) = mpsc::channel(1);
        let handle = InstanceHandle {
            name: config.name.clone(),
            status: status_rx,
            login_tx,
        };
        let runner = Self {
            monitor: ConversationMonitor::new(remote.base_url()),
            config,
            remote,
            deps,
            status,
            login_rx,
            shutdown,
            open_url: open_in_browser,
        };
        (runner, handle)
    }

    #[cfg(test)]
    fn with_url_opener(mut self, open_url: fn(&str) -> Result<(), String>) -> Self {
        self.open_url = open_url;
        self
    }

    #[instrument(name = "instance", skip_all, fields(instance = %self.config.name))]
    pub(crate) async fn run(mut self) {
        info!(
            base_url = %self.config.base_url,
            policy = ?self.config.login_policy,
            "instance runner started"
        );
        self.restore_credentials();

        let mut needs_login = match self.check_credentials().await {
            Some(needs_login) => needs_login,
            None => {
                self.stop();
                return;
            }
        };

        while !self.shutdown.is_cancelled() {
            let delay = if needs_login {
                match self.login().await {
                    LoginStep::LoggedIn => {
                        needs_login = false;
                        Duration::ZERO
                    }
                    LoginStep::Retry(delay) => delay,
                }
            } else {
                let transport = self.poll_once().await;
                needs_login = transport == TransportOutcome::LoginExpired;
                poll_delay(transport, self.config.poll_interval)
            };

            if !delay.is_zero() && !self.wait(delay).await {
                break;
            }
        }

        self.stop();
    }

    fn stop(&self) {
        self.status.phase(RunnerPhase::Stopped);
        info!("instance runner stopped");
    }

    /// `false` when shutdown interrupted the wait.
    async fn wait(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn restore_credentials(&self) {
        let Some(cached) = self.deps.cache.get(&self.config.name) else {
            debug!("no stored credentials");
            return;
        };

        let secret = if cached.sealed_secret.is_empty() {
            Ok(String::new())
        } else {
            self.deps.vault.unseal(&cached.sealed_secret)
        };
        match secret {
            Ok(app_password) => {
                self.remote
                    .set_credentials(Credentials::new(cached.login_name, app_password));
            }
            Err(error) => {
                warn!(%error, "failed to unseal stored credentials, starting without");
                self.remote.set_credentials(Credentials::default());
            }
        }
    }

    /// `Some(true)` when a login is needed, `None` on shutdown.
    async fn check_credentials(&self) -> Option<bool> {
        self.status.phase(RunnerPhase::CheckingCredentials);
        loop {
            let credentials = self.remote.credentials();
            let reply = self.remote.validate_credentials(&credentials).await;
            match reply.transport {
                TransportOutcome::Success => {
                    info!(result = ?reply.value, "credentials checked");
                    return Some(reply.value != CredentialCheck::Valid);
                }
                TransportOutcome::LoginExpired => return Some(true),
                transport @ (TransportOutcome::Maintenance | TransportOutcome::Unreachable) => {
                    self.backoff(VALIDATION_RETRY_SECS, transport, reply.error.as_ref());
                    if !self.wait(Duration::from_secs(VALIDATION_RETRY_SECS)).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn login(&mut self) -> LoginStep {
        let deferred = self.config.login_policy == LoginPolicy::Menu;
        if deferred && !self.await_login_trigger().await {
            return LoginStep::Retry(Duration::ZERO);
        }

        self.status.phase(RunnerPhase::LoginInProgress);
        let reply = LoginFlow::new(self.remote.clone()).start().await;
        let handle = match (reply.transport, reply.value) {
            (TransportOutcome::Success, Some(handle)) => handle,
            (transport, _) => {
                // A user-initiated login goes straight back to the menu.
                if deferred {
                    warn!(?transport, error = ?reply.error.map(|e| e.to_string()), "failed to start login flow");
                    return LoginStep::Retry(Duration::ZERO);
                }
                self.backoff(LOGIN_START_RETRY_SECS, transport, reply.error.as_ref());
                return LoginStep::Retry(Duration::from_secs(LOGIN_START_RETRY_SECS));
            }
        };

        if let Err(error) = self.announce_login(handle.login_url()) {
            warn!(%error, "failed to prompt for login");
            handle.cancel();
            self.status
                .backoff(LOGIN_START_RETRY_SECS, Some(error.to_string()));
            return LoginStep::Retry(Duration::from_secs(LOGIN_START_RETRY_SECS));
        }

        let bound = Duration::from_secs(LOGIN_FLOW_CEILING_SECS + 2 * LOGIN_POLL_INTERVAL_SECS);
        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return self.abandon_flow(&handle),
            outcome = handle.wait_timeout(bound) => outcome.unwrap_or_else(|| {
                warn!("login flow did not report in time, cancelling");
                handle.cancel();
                LoginOutcome::TimedOut
            }),
        };

        match outcome {
            LoginOutcome::Succeeded(credentials) => {
                info!(login_name = %credentials.login_name, "logged in");
                self.install_credentials(credentials);
                self.status.backoff(0, None);
                LoginStep::LoggedIn
            }
            other => {
                let transport = other.transport();
                info!(outcome = ?other, ?transport, "login flow ended without credentials");
                if transport != TransportOutcome::Success {
                    self.status.backoff(0, Some(format!("login flow failed: {transport:?}")));
                }
                LoginStep::Retry(Duration::ZERO)
            }
        }
    }

    /// Shutdown arrived while a flow was running. Credentials the server has
    /// already issued are still kept.
    fn abandon_flow(&self, handle: &LoginHandle) -> LoginStep {
        match handle.check() {
            None => {
                info!("cancelling login flow for shutdown");
                handle.cancel();
                LoginStep::Retry(Duration::ZERO)
            }
            Some(LoginOutcome::Succeeded(credentials)) => {
                info!(login_name = %credentials.login_name, "logged in just before shutdown");
                self.install_credentials(credentials);
                LoginStep::LoggedIn
            }
            Some(outcome) => {
                debug!(?outcome, "login flow finished before shutdown");
                LoginStep::Retry(Duration::ZERO)
            }
        }
    }

    /// `false` on shutdown.
    async fn await_login_trigger(&mut self) -> bool {
        while self.login_rx.try_recv().is_ok() {}
        self.status.phase(RunnerPhase::AwaitingLoginTrigger);
        info!("waiting for login request");

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            trigger = self.login_rx.recv() => match trigger {
                Some(()) => true,
                // Every handle is gone; nothing can trigger a login anymore.
                None => {
                    self.shutdown.cancelled().await;
                    false
                }
            },
        }
    }

    fn announce_login(&self, login_url: &str) -> Result<(), NotifyError> {
        if self.config.login_policy != LoginPolicy::Notification {
            match (self.open_url)(login_url) {
                Ok(()) => {
                    info!("opened login page in browser");
                    return Ok(());
                }
                Err(error) => warn!(%error, "failed to open browser, sending notification"),
            }
        }

        self.deps.sink.notify(&Notification {
            instance: self.config.name.clone(),
            title: self.config.name.clone(),
            body: format!("Log in to {}", self.config.name),
            url: login_url.to_string(),
            play_sound: true,
        })
    }

    fn install_credentials(&self, credentials: Credentials) {
        self.remote.set_credentials(credentials.clone());

        let sealed_secret = if credentials.app_password.is_empty() {
            String::new()
        } else {
            match self.deps.vault.seal(&credentials.app_password) {
                Ok(sealed) => sealed,
                Err(error) => {
                    warn!(%error, "failed to seal credentials, not persisting");
                    return;
                }
            }
        };

        let entry = CachedCredential {
            login_name: credentials.login_name,
            sealed_secret,
        };
        if let Err(error) = self.deps.cache.store(&self.config.name, entry) {
            warn!(%error, "failed to persist credentials");
        }
    }

    async fn poll_once(&mut self) -> TransportOutcome {
        self.status.phase(RunnerPhase::LoggedIn);
        let reply = self.remote.fetch_conversations().await;

        match reply.transport {
            TransportOutcome::Success => {
                let settings = self
                    .deps
                    .settings
                    .snapshot()
                    .monitor_settings(&self.config.name);
                let viewer = self.remote.credentials().login_name;
                let report = self.monitor.scan(&reply.value, &viewer, &settings, Utc::now());
                debug!(
                    conversations = reply.value.len(),
                    unread = report.unread_total,
                    pending = report.pending.len(),
                    "poll complete"
                );
                self.status
                    .polled(unix_now_secs(), report.unread_total, report.unread_notifiable);
                self.status.backoff(0, None);

                for pending in report.pending {
                    let notification = Notification {
                        instance: self.config.name.clone(),
                        title: pending.title,
                        body: pending.body,
                        url: pending.url,
                        play_sound: pending.play_sound,
                    };
                    if let Err(error) = self.deps.sink.notify(&notification) {
                        warn!(conversation = pending.conversation_id, %error, "failed to deliver notification");
                    }
                }
            }
            TransportOutcome::LoginExpired => {
                info!("login expired");
                self.status
                    .backoff(LOGIN_EXPIRED_PAUSE_SECS, Some("login expired".to_string()));
            }
            transport => {
                let delay = poll_delay(transport, self.config.poll_interval);
                self.backoff(delay.as_secs(), transport, reply.error.as_ref());
            }
        }

        reply.transport
    }

    fn backoff(&self, seconds: u64, transport: TransportOutcome, error: Option<&ClientError>) {
        let message = match error {
            Some(error) => error.to_string(),
            None => format!("{transport:?}"),
        };
        warn!(?transport, error = %message, retry_in_secs = seconds, "remote call failed");
        self.status.backoff(seconds, Some(message));
    }
}

fn poll_delay(transport: TransportOutcome, poll_interval: Duration) -> Duration {
    match transport {
        TransportOutcome::Success => poll_interval,
        TransportOutcome::LoginExpired => Duration::from_secs(LOGIN_EXPIRED_PAUSE_SECS),
        TransportOutcome::Maintenance => Duration::from_secs(MAINTENANCE_PAUSE_SECS),
        TransportOutcome::Unreachable => Duration::from_secs(UNREACHABLE_PAUSE_SECS),
    }
}
