use std::{collections::HashMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{MIN_POLL_INTERVAL_SECS, NOTIFICATION_LEVEL_NEVER};

/// Login name plus app password. Kept in cleartext only in memory.
#[derive(Clone, Default, PartialEq, Eq)]
pub(crate) struct Credentials {
    pub(crate) login_name: String,
    pub(crate) app_password: String,
}

impl Credentials {
    pub(crate) fn new(login_name: impl Into<String>, app_password: impl Into<String>) -> Self {
        Self {
            login_name: login_name.into(),
            app_password: app_password.into(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.login_name.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login_name", &self.login_name)
            .field("app_password", &"***")
            .finish()
    }
}

/// Coarse classification of a remote call, independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportOutcome {
    Success,
    Unreachable,
    Maintenance,
    /// Only produced for a 401 on an authenticated call.
    LoginExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CredentialCheck {
    /// Empty login name; no request was made.
    Invalid,
    Expired,
    Valid,
    /// Could not be determined. Transient, not a reason to log in again.
    ValidationFailed,
}

/// A domain value paired with its transport classification and the
/// underlying error, if any.
#[derive(Debug)]
pub(crate) struct Reply<T> {
    pub(crate) value: T,
    pub(crate) transport: TransportOutcome,
    pub(crate) error: Option<crate::error::ClientError>,
}

impl<T> Reply<T> {
    pub(crate) fn success(value: T) -> Self {
        Self {
            value,
            transport: TransportOutcome::Success,
            error: None,
        }
    }

    pub(crate) fn maintenance(value: T) -> Self {
        Self {
            value,
            transport: TransportOutcome::Maintenance,
            error: None,
        }
    }

    pub(crate) fn unreachable(value: T, error: crate::error::ClientError) -> Self {
        Self {
            value,
            transport: TransportOutcome::Unreachable,
            error: Some(error),
        }
    }

    pub(crate) fn login_expired(value: T) -> Self {
        Self {
            value,
            transport: TransportOutcome::LoginExpired,
            error: None,
        }
    }
}

/// What the server hands back when a browser handshake is initiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LoginTicket {
    pub(crate) poll_endpoint: String,
    pub(crate) poll_token: String,
    pub(crate) login_url: String,
}

/// Result of a single handshake poll.
#[derive(Debug)]
pub(crate) enum LoginPoll {
    Pending,
    Maintenance,
    Completed(Credentials),
    Error(crate::error::ClientError),
}

/// When a login flow gets started for an instance that needs one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum LoginPolicy {
    /// Send one notification carrying the login URL.
    #[default]
    Notification,
    /// Open the browser right away, falling back to a notification.
    Immediately,
    /// Wait until the user asks for it from the menu.
    Menu,
}

/// Which kind of participant a conversation is with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConversationKind {
    OneToOne,
    Group,
    Other,
}

impl ConversationKind {
    pub(crate) fn from_wire(kind: i64) -> Self {
        match kind {
            1 | 5 => Self::OneToOne,
            2 | 3 => Self::Group,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LastMessage {
    pub(crate) id: i64,
    pub(crate) token: String,
    pub(crate) actor_type: String,
    pub(crate) actor_id: String,
    pub(crate) text: String,
    pub(crate) parameters: HashMap<String, serde_json::Value>,
}

/// One conversation as seen in a single poll. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Conversation {
    pub(crate) id: i64,
    pub(crate) display_name: String,
    pub(crate) kind: ConversationKind,
    pub(crate) actor_type: String,
    pub(crate) unread_messages: i64,
    pub(crate) notification_level: i64,
    pub(crate) last_message: LastMessage,
}

impl Conversation {
    pub(crate) fn is_muted(&self) -> bool {
        self.notification_level == NOTIFICATION_LEVEL_NEVER
    }

    pub(crate) fn involves_actor(&self, actor_type: &str) -> bool {
        self.actor_type == actor_type || self.last_message.actor_type == actor_type
    }

    pub(crate) fn call_url(&self, base_url: &str) -> String {
        format!("{base_url}/call/{}", self.last_message.token)
    }
}

impl From<ConversationWire> for Conversation {
    fn from(wire: ConversationWire) -> Self {
        let parameters = match wire.last_message.message_parameters {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => HashMap::new(),
        };
        Self {
            id: wire.id,
            display_name: wire.display_name,
            kind: ConversationKind::from_wire(wire.kind),
            actor_type: wire.actor_type,
            unread_messages: wire.unread_messages,
            notification_level: wire.notification_level,
            last_message: LastMessage {
                id: wire.last_message.id,
                token: wire.last_message.token,
                actor_type: wire.last_message.actor_type,
                actor_id: wire.last_message.actor_id,
                text: wire.last_message.message,
                parameters,
            },
        }
    }
}

/// Per-conversation bookkeeping that keeps the same unread message from
/// being announced over and over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NotificationState {
    pub(crate) last_notified_at: chrono::DateTime<chrono::Utc>,
    pub(crate) last_message_id: i64,
}

impl Default for NotificationState {
    fn default() -> Self {
        Self {
            last_notified_at: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
            last_message_id: 0,
        }
    }
}

/// Fully resolved configuration of one monitored instance.
#[derive(Debug, Clone)]
pub(crate) struct InstanceConfig {
    pub(crate) name: String,
    pub(crate) base_url: String,
    pub(crate) login_policy: LoginPolicy,
    pub(crate) poll_interval: Duration,
}

impl InstanceConfig {
    pub(crate) fn new(
        name: impl Into<String>,
        base_url: &str,
        login_policy: LoginPolicy,
        poll_interval_secs: u64,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            login_policy,
            poll_interval: Duration::from_secs(poll_interval_secs.max(MIN_POLL_INTERVAL_SECS)),
        }
    }
}

/// A notification the monitor decided to emit. Dispatched after the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingNotification {
    pub(crate) conversation_id: i64,
    pub(crate) title: String,
    pub(crate) body: String,
    pub(crate) url: String,
    pub(crate) play_sound: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OcsEnvelope<T> {
    pub(crate) ocs: OcsBody<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OcsBody<T> {
    pub(crate) meta: OcsMeta,
    pub(crate) data: T,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OcsMeta {
    pub(crate) status: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub(crate) statuscode: i64,
    #[serde(default)]
    #[allow(dead_code)]
    pub(crate) message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LoginFlowWire {
    pub(crate) poll: LoginPollWire,
    pub(crate) login: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LoginPollWire {
    pub(crate) token: String,
    pub(crate) endpoint: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthResultWire {
    #[serde(default)]
    #[allow(dead_code)]
    pub(crate) server: String,
    pub(crate) login_name: String,
    pub(crate) app_password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConversationWire {
    pub(crate) id: i64,
    #[serde(rename = "type", default)]
    pub(crate) kind: i64,
    #[serde(default)]
    pub(crate) display_name: String,
    #[serde(default)]
    pub(crate) actor_type: String,
    #[serde(default)]
    pub(crate) notification_level: i64,
    #[serde(default)]
    pub(crate) unread_messages: i64,
    #[serde(default)]
    pub(crate) last_message: MessageWire,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MessageWire {
    #[serde(default)]
    pub(crate) id: i64,
    #[serde(default)]
    pub(crate) token: String,
    #[serde(default)]
    pub(crate) actor_type: String,
    #[serde(default)]
    pub(crate) actor_id: String,
    #[serde(default)]
    pub(crate) message: String,
    #[serde(default)]
    pub(crate) message_parameters: serde_json::Value,
}
