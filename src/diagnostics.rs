use tokio::sync::watch;

/// What the runner is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunnerPhase {
    CheckingCredentials,
    AwaitingLoginTrigger,
    LoginInProgress,
    LoggedIn,
    Stopped,
}

/// Whether a "Log In" action should be offered for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoginAvailability {
    LoginAvailable,
    LoginInProgress,
    LoggedIn,
}

impl RunnerPhase {
    pub(crate) fn login_availability(self) -> Option<LoginAvailability> {
        match self {
            Self::AwaitingLoginTrigger => Some(LoginAvailability::LoginAvailable),
            Self::LoginInProgress => Some(LoginAvailability::LoginInProgress),
            Self::LoggedIn => Some(LoginAvailability::LoggedIn),
            Self::CheckingCredentials | Self::Stopped => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InstanceStatus {
    pub(crate) instance: String,
    pub(crate) phase: RunnerPhase,
    pub(crate) login: Option<LoginAvailability>,
    pub(crate) last_error: Option<String>,
    pub(crate) backoff_seconds: u64,
    pub(crate) last_poll_at: Option<u64>,
    pub(crate) unread_total: i64,
    pub(crate) unread_filtered: i64,
}

impl InstanceStatus {
    pub(crate) fn new(instance: &str) -> Self {
        Self {
            instance: instance.to_string(),
            phase: RunnerPhase::CheckingCredentials,
            login: None,
            last_error: None,
            backoff_seconds: 0,
            last_poll_at: None,
            unread_total: 0,
            unread_filtered: 0,
        }
    }
}

/// Writer side of an instance's status channel. Owned by the runner.
pub(crate) struct StatusPublisher {
    tx: watch::Sender<InstanceStatus>,
}

impl StatusPublisher {
    pub(crate) fn new(instance: &str) -> (Self, watch::Receiver<InstanceStatus>) {
        let (tx, rx) = watch::channel(InstanceStatus::new(instance));
        (Self { tx }, rx)
    }

    pub(crate) fn phase(&self, phase: RunnerPhase) {
        self.tx.send_if_modified(|status| {
            if status.phase == phase {
                return false;
            }
            status.phase = phase;
            status.login = phase.login_availability();
            true
        });
    }

    pub(crate) fn backoff(&self, seconds: u64, error: Option<String>) {
        self.tx.send_modify(|status| {
            status.backoff_seconds = seconds;
            status.last_error = error;
        });
    }

    pub(crate) fn polled(&self, at: u64, unread_total: i64, unread_filtered: i64) {
        self.tx.send_modify(|status| {
            status.last_poll_at = Some(at);
            status.unread_total = unread_total;
            status.unread_filtered = unread_filtered;
            status.last_error = None;
        });
    }
}
