//! In-memory stand-ins for the remote API, the vault and the notification
//! sink. Compiled for tests only.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    client::RemoteApi,
    error::{ClientError, NotifyError, VaultError},
    model::{
        Conversation, ConversationKind, CredentialCheck, Credentials, LastMessage, LoginPoll,
        LoginTicket, Reply, TransportOutcome,
    },
    notifications::{Notification, NotificationSink},
    vault::CredentialVault,
};

pub(crate) const FAKE_BASE_URL: &str = "https://cloud.example.com";

#[derive(Debug, Clone)]
pub(crate) enum PollScript {
    Pending,
    Maintenance,
    Status(u16),
    Complete(Credentials),
}

/// Scripted [`RemoteApi`]. Each call pops the next scripted answer and falls
/// back to a benign default once the script runs dry.
pub(crate) struct FakeRemote {
    credentials: Mutex<Credentials>,
    validations: Mutex<VecDeque<(CredentialCheck, TransportOutcome)>>,
    starts: Mutex<VecDeque<TransportOutcome>>,
    polls: Mutex<VecDeque<PollScript>>,
    fetches: Mutex<VecDeque<(TransportOutcome, Vec<Conversation>)>>,
    poll_delay: Mutex<Duration>,
    validate_calls: AtomicUsize,
    start_calls: AtomicUsize,
    poll_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    validated_with: Mutex<Vec<Credentials>>,
}

impl FakeRemote {
    pub(crate) fn new() -> Self {
        Self {
            credentials: Mutex::new(Credentials::default()),
            validations: Mutex::new(VecDeque::new()),
            starts: Mutex::new(VecDeque::new()),
            polls: Mutex::new(VecDeque::new()),
            fetches: Mutex::new(VecDeque::new()),
            poll_delay: Mutex::new(Duration::ZERO),
            validate_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            validated_with: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn login_url(&self) -> &'static str {
        "https://cloud.example.com/login/v2/flow/abc"
    }

    pub(crate) fn script_validation(&self, check: CredentialCheck, transport: TransportOutcome) {
        self.validations.lock().unwrap().push_back((check, transport));
    }

    pub(crate) fn script_start(&self, transport: TransportOutcome) {
        self.starts.lock().unwrap().push_back(transport);
    }

    pub(crate) fn script_polls(&self, polls: impl IntoIterator<Item = PollScript>) {
        self.polls.lock().unwrap().extend(polls);
    }

    pub(crate) fn script_fetch(&self, transport: TransportOutcome, conversations: Vec<Conversation>) {
        self.fetches.lock().unwrap().push_back((transport, conversations));
    }

    pub(crate) fn set_poll_delay(&self, delay: Duration) {
        *self.poll_delay.lock().unwrap() = delay;
    }

    pub(crate) fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn validated_with(&self) -> Vec<Credentials> {
        self.validated_with.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    fn base_url(&self) -> &str {
        FAKE_BASE_URL
    }

    fn credentials(&self) -> Credentials {
        self.credentials.lock().unwrap().clone()
    }

    fn set_credentials(&self, credentials: Credentials) {
        *self.credentials.lock().unwrap() = credentials;
    }

    async fn validate_credentials(&self, credentials: &Credentials) -> Reply<CredentialCheck> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        self.validated_with.lock().unwrap().push(credentials.clone());
        if credentials.is_empty() {
            return Reply::success(CredentialCheck::Invalid);
        }
        let next = self.validations.lock().unwrap().pop_front();
        match next.unwrap_or((CredentialCheck::Valid, TransportOutcome::Success)) {
            (check, TransportOutcome::Unreachable) => {
                Reply::unreachable(check, ClientError::UnexpectedStatus(502))
            }
            (check, transport) => Reply {
                value: check,
                transport,
                error: None,
            },
        }
    }

    async fn start_login(&self) -> Reply<Option<LoginTicket>> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.starts.lock().unwrap().pop_front();
        match next.unwrap_or(TransportOutcome::Success) {
            TransportOutcome::Success => Reply::success(Some(LoginTicket {
                poll_endpoint: format!("{FAKE_BASE_URL}/login/v2/poll"),
                poll_token: "poll-token".to_string(),
                login_url: self.login_url().to_string(),
            })),
            TransportOutcome::Maintenance => Reply::maintenance(None),
            _ => Reply::unreachable(None, ClientError::UnexpectedStatus(502)),
        }
    }

    async fn poll_login(&self, _ticket: &LoginTicket) -> LoginPoll {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.poll_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let next = self.polls.lock().unwrap().pop_front();
        match next.unwrap_or(PollScript::Pending) {
            PollScript::Pending => LoginPoll::Pending,
            PollScript::Maintenance => LoginPoll::Maintenance,
            PollScript::Status(status) => LoginPoll::Error(ClientError::UnexpectedStatus(status)),
            PollScript::Complete(credentials) => LoginPoll::Completed(credentials),
        }
    }

    async fn fetch_conversations(&self) -> Reply<Vec<Conversation>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.fetches.lock().unwrap().pop_front();
        match next.unwrap_or((TransportOutcome::Success, Vec::new())) {
            (TransportOutcome::Success, conversations) => Reply::success(conversations),
            (TransportOutcome::LoginExpired, _) => Reply::login_expired(Vec::new()),
            (TransportOutcome::Maintenance, _) => Reply::maintenance(Vec::new()),
            (TransportOutcome::Unreachable, _) => {
                Reply::unreachable(Vec::new(), ClientError::UnexpectedStatus(502))
            }
        }
    }
}

/// Reversible, obviously-not-secret vault.
#[derive(Default)]
pub(crate) struct MemoryVault {
    pub(crate) fail_seal: bool,
}

impl CredentialVault for MemoryVault {
    fn seal(&self, plaintext: &str) -> Result<String, VaultError> {
        if self.fail_seal {
            return Err(VaultError::MalformedHandle);
        }
        Ok(format!("sealed:{plaintext}"))
    }

    fn unseal(&self, sealed: &str) -> Result<String, VaultError> {
        sealed
            .strip_prefix("sealed:")
            .map(str::to_string)
            .ok_or(VaultError::MalformedHandle)
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    sent: Mutex<Vec<Notification>>,
    fail: bool,
}

impl RecordingSink {
    pub(crate) fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub(crate) fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError::Delivery("sink offline".to_string()));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub(crate) fn conversation(id: i64, unread: i64, last_message_id: i64) -> Conversation {
    Conversation {
        id,
        display_name: format!("Conversation {id}"),
        kind: ConversationKind::OneToOne,
        actor_type: "users".to_string(),
        unread_messages: unread,
        notification_level: 0,
        last_message: LastMessage {
            id: last_message_id,
            token: format!("token{id}"),
            actor_type: "users".to_string(),
            actor_id: "bob".to_string(),
            text: format!("message {last_message_id}"),
            parameters: HashMap::new(),
        },
    }
}
