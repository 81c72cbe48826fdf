//! Turns a freshly fetched conversation list into the notifications worth
//! showing. The scan never performs I/O; it returns an emission queue the
//! runner dispatches afterwards.

use std::{collections::HashMap, sync::OnceLock, time::Duration};

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use tracing::debug;

use crate::{
    core::truncate_message,
    model::{Conversation, ConversationKind, NotificationState, PendingNotification},
    settings::CategorySettings,
    MIN_REPEAT_INTERVAL_SECS, NOTIFICATION_BODY_MAX_CHARS,
};

const BOT_ACTOR: &str = "bots";
const BRIDGED_ACTOR: &str = "bridged";
const GUEST_ACTOR: &str = "guests";
const USER_ACTOR: &str = "users";

/// The slice of settings one scan needs, resolved per poll.
#[derive(Debug, Clone)]
pub(crate) struct MonitorSettings {
    pub(crate) categories: CategorySettings,
    pub(crate) repeat_interval: Duration,
    pub(crate) exclude_own_messages: bool,
}

impl MonitorSettings {
    pub(crate) fn new(
        categories: CategorySettings,
        repeat_interval_secs: u64,
        exclude_own_messages: bool,
    ) -> Self {
        Self {
            categories,
            repeat_interval: Duration::from_secs(repeat_interval_secs.max(MIN_REPEAT_INTERVAL_SECS)),
            exclude_own_messages,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ScanReport {
    pub(crate) pending: Vec<PendingNotification>,
    pub(crate) unread_total: i64,
    pub(crate) unread_notifiable: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Suppression {
    Muted,
    Bot,
    Bridged,
    Guest,
    OneToOne,
    Group,
}

pub(crate) struct ConversationMonitor {
    base_url: String,
    states: HashMap<i64, NotificationState>,
}

impl ConversationMonitor {
    pub(crate) fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            states: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self, conversation_id: i64) -> Option<NotificationState> {
        self.states.get(&conversation_id).copied()
    }

    /// `viewer` is the login name the instance is authenticated as.
    pub(crate) fn scan(
        &mut self,
        conversations: &[Conversation],
        viewer: &str,
        settings: &MonitorSettings,
        now: DateTime<Utc>,
    ) -> ScanReport {
        let mut report = ScanReport::default();

        for conversation in conversations {
            report.unread_total += conversation.unread_messages.max(0);
            if conversation.unread_messages <= 0 {
                continue;
            }
            if settings.exclude_own_messages && is_own_message(conversation, viewer) {
                continue;
            }
            if let Some(reason) = suppression(conversation, &settings.categories) {
                debug!(conversation = conversation.id, ?reason, "conversation suppressed");
                continue;
            }
            report.unread_notifiable += conversation.unread_messages;

            let state = self.states.entry(conversation.id).or_default();
            let message_id = conversation.last_message.id;
            let elapsed = now
                .signed_duration_since(state.last_notified_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed <= settings.repeat_interval && message_id == state.last_message_id {
                continue;
            }

            state.last_notified_at = now;
            state.last_message_id = message_id;

            report.pending.push(PendingNotification {
                conversation_id: conversation.id,
                title: conversation.display_name.clone(),
                body: truncate_message(&render_message(conversation), NOTIFICATION_BODY_MAX_CHARS),
                url: conversation.call_url(&self.base_url),
                play_sound: settings.categories.play_sound,
            });
        }

        report
    }
}

fn is_own_message(conversation: &Conversation, viewer: &str) -> bool {
    !viewer.is_empty()
        && conversation.last_message.actor_type == USER_ACTOR
        && conversation.last_message.actor_id == viewer
}

/// First suppressed category that matches, checked in a fixed order.
fn suppression(conversation: &Conversation, categories: &CategorySettings) -> Option<Suppression> {
    let checks = [
        (Suppression::Muted, conversation.is_muted(), categories.muted),
        (Suppression::Bot, conversation.involves_actor(BOT_ACTOR), categories.bots),
        (Suppression::Bridged, conversation.involves_actor(BRIDGED_ACTOR), categories.bridged),
        (Suppression::Guest, conversation.involves_actor(GUEST_ACTOR), categories.guests),
        (
            Suppression::OneToOne,
            conversation.kind == ConversationKind::OneToOne,
            categories.users,
        ),
        (
            Suppression::Group,
            conversation.kind == ConversationKind::Group,
            categories.groups,
        ),
    ];

    checks
        .into_iter()
        .find(|(_, matches, enabled)| *matches && !*enabled)
        .map(|(reason, _, _)| reason)
}

fn placeholder_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\{[^{}]*\}").ok())
        .as_ref()
}

/// Substitutes `{key}` placeholders with the parameter's display name. Unknown
/// placeholders stay verbatim.
pub(crate) fn render_message(conversation: &Conversation) -> String {
    let message = &conversation.last_message;
    let pattern = match placeholder_pattern() {
        Some(pattern) if !message.parameters.is_empty() => pattern,
        _ => return message.text.clone(),
    };

    pattern
        .replace_all(&message.text, |caps: &Captures<'_>| {
            let placeholder = &caps[0];
            let key = &placeholder[1..placeholder.len() - 1];
            message
                .parameters
                .get(key)
                .and_then(|parameter| parameter.get("name"))
                .and_then(|name| name.as_str())
                .map_or_else(|| placeholder.to_string(), str::to_string)
        })
        .into_owned()
}
