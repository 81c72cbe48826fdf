//! Browser handshake: start it, then poll the server in the background until
//! the user finishes, the server gives up, or the twenty minute ceiling hits.
//!
//! The background poller is the only writer of the completion channel, so a
//! cancel racing a successful poll still produces exactly one outcome.

use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    client::RemoteApi,
    model::{Credentials, LoginPoll, LoginTicket, Reply, TransportOutcome},
    LOGIN_FLOW_CEILING_SECS, LOGIN_POLL_INTERVAL_SECS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoginFailure {
    Maintenance,
    Error(String),
}

/// Terminal state of a login flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoginOutcome {
    Succeeded(Credentials),
    Failed(LoginFailure),
    Cancelled,
    TimedOut,
}

impl LoginOutcome {
    pub(crate) fn transport(&self) -> TransportOutcome {
        match self {
            Self::Failed(LoginFailure::Maintenance) => TransportOutcome::Maintenance,
            Self::Failed(LoginFailure::Error(_)) => TransportOutcome::Unreachable,
            Self::Succeeded(_) | Self::Cancelled | Self::TimedOut => TransportOutcome::Success,
        }
    }
}

pub(crate) struct LoginFlow {
    remote: Arc<dyn RemoteApi>,
    poll_interval: Duration,
    ceiling: Duration,
}

impl LoginFlow {
    pub(crate) fn new(remote: Arc<dyn RemoteApi>) -> Self {
        Self {
            remote,
            poll_interval: Duration::from_secs(LOGIN_POLL_INTERVAL_SECS),
            ceiling: Duration::from_secs(LOGIN_FLOW_CEILING_SECS),
        }
    }

    /// Initiates the handshake. The background poller is only spawned when
    /// the server handed out a ticket.
    pub(crate) async fn start(self) -> Reply<Option<LoginHandle>> {
        let reply = self.remote.start_login().await;
        let ticket = match (reply.transport, reply.value) {
            (TransportOutcome::Success, Some(ticket)) => ticket,
            (transport, _) => {
                return Reply {
                    value: None,
                    transport,
                    error: reply.error,
                }
            }
        };

        let started_at = Instant::now();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let login_url = ticket.login_url.clone();

        tokio::spawn(run_poller(
            self.remote,
            ticket,
            started_at,
            self.poll_interval,
            self.ceiling,
            cancel.clone(),
            outcome_tx,
        ));

        Reply::success(Some(LoginHandle {
            login_url,
            outcome: outcome_rx,
            cancel,
        }))
    }
}

/// Caller side of a running flow.
#[derive(Debug)]
pub(crate) struct LoginHandle {
    login_url: String,
    outcome: watch::Receiver<Option<LoginOutcome>>,
    cancel: CancellationToken,
}

impl LoginHandle {
    pub(crate) fn login_url(&self) -> &str {
        &self.login_url
    }

    /// Non-blocking look at the outcome.
    pub(crate) fn check(&self) -> Option<LoginOutcome> {
        self.outcome.borrow().clone()
    }

    pub(crate) async fn wait(&self) -> LoginOutcome {
        let mut outcome = self.outcome.clone();
        let result = match outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or(LoginOutcome::Cancelled),
            // Poller went away without reporting, e.g. runtime shutdown.
            Err(_) => LoginOutcome::Cancelled,
        };
        result
    }

    /// `None` if the flow is still pending after `timeout`.
    pub(crate) async fn wait_timeout(&self, timeout: Duration) -> Option<LoginOutcome> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// Safe to call any number of times, before or after completion.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

async fn run_poller(
    remote: Arc<dyn RemoteApi>,
    ticket: LoginTicket,
    started_at: Instant,
    poll_interval: Duration,
    ceiling: Duration,
    cancel: CancellationToken,
    outcome_tx: watch::Sender<Option<LoginOutcome>>,
) {
    let mut ticker = tokio::time::interval_at(started_at + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break LoginOutcome::Cancelled,
            _ = ticker.tick() => {}
        }

        if started_at.elapsed() >= ceiling {
            break LoginOutcome::TimedOut;
        }

        let poll = tokio::select! {
            biased;
            _ = cancel.cancelled() => break LoginOutcome::Cancelled,
            poll = remote.poll_login(&ticket) => poll,
        };

        match poll {
            LoginPoll::Pending => {
                debug!("login handshake still pending");
            }
            LoginPoll::Maintenance => break LoginOutcome::Failed(LoginFailure::Maintenance),
            LoginPoll::Error(error) => {
                warn!(%error, "login handshake poll failed");
                break LoginOutcome::Failed(LoginFailure::Error(error.to_string()));
            }
            LoginPoll::Completed(credentials) => break LoginOutcome::Succeeded(credentials),
        }
    };

    info!(
        outcome = outcome_label(&outcome),
        elapsed_secs = started_at.elapsed().as_secs(),
        "login flow finished"
    );
    outcome_tx.send_replace(Some(outcome));
}

fn outcome_label(outcome: &LoginOutcome) -> &'static str {
    match outcome {
        LoginOutcome::Succeeded(_) => "succeeded",
        LoginOutcome::Failed(LoginFailure::Maintenance) => "maintenance",
        LoginOutcome::Failed(LoginFailure::Error(_)) => "error",
        LoginOutcome::Cancelled => "cancelled",
        LoginOutcome::TimedOut => "timed_out",
    }
}
