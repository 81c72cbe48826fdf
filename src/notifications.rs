use chrono::Timelike;
#[cfg(target_os = "macos")]
use mac_notification_sys::{MainButton, Notification as MacNotification, NotificationResponse};
use tracing::{debug, info};

use crate::{
    core::{truncate_message, unix_now_secs},
    error::NotifyError,
    settings::SettingsHandle,
    NOTIFICATION_BODY_MAX_CHARS, PAUSE_FOREVER_SENTINEL,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Notification {
    pub(crate) instance: String,
    pub(crate) title: String,
    pub(crate) body: String,
    pub(crate) url: String,
    pub(crate) play_sound: bool,
}

/// OS notification surface. Called from every instance worker.
pub(crate) trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Applies the global switches (mute, pause, quiet hours, sound) before
/// handing a notification to the real sink.
pub(crate) struct GatedSink<S> {
    inner: S,
    settings: SettingsHandle,
}

impl<S: NotificationSink> GatedSink<S> {
    pub(crate) fn new(inner: S, settings: SettingsHandle) -> Self {
        Self { inner, settings }
    }
}

impl<S: NotificationSink> NotificationSink for GatedSink<S> {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let settings = self.settings.snapshot();
        if !settings.show_notifications {
            debug!(instance = %notification.instance, "notifications disabled, dropping");
            return Ok(());
        }
        if is_paused(settings.pause_until, unix_now_secs()) {
            debug!(instance = %notification.instance, "notifications paused, dropping");
            return Ok(());
        }
        let hour = chrono::Local::now().hour() as u8;
        if is_quiet_hours(settings.quiet_hours_start, settings.quiet_hours_end, hour) {
            debug!(instance = %notification.instance, "quiet hours, dropping");
            return Ok(());
        }

        let mut gated = notification.clone();
        gated.play_sound = notification.play_sound && settings.play_sounds;
        self.inner.notify(&gated)
    }
}

pub(crate) fn is_paused(pause_until: Option<u64>, now: u64) -> bool {
    match pause_until {
        Some(PAUSE_FOREVER_SENTINEL) => true,
        Some(until) => now < until,
        None => false,
    }
}

pub(crate) fn is_quiet_hours(start: Option<u8>, end: Option<u8>, hour: u8) -> bool {
    let (start, end) = match (start, end) {
        (Some(start), Some(end)) => (start % 24, end % 24),
        _ => return false,
    };

    if start == end {
        return true;
    }
    if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// Native notifications on macOS; elsewhere the notification is only logged.
pub(crate) struct DesktopSink;

impl NotificationSink for DesktopSink {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let body = truncate_message(&notification.body, NOTIFICATION_BODY_MAX_CHARS);
        info!(
            instance = %notification.instance,
            title = %notification.title,
            sound = notification.play_sound,
            "notification"
        );
        #[cfg(target_os = "macos")]
        return send_macos_notification(notification.clone(), body);
        #[cfg(not(target_os = "macos"))]
        {
            debug!(body = %body, url = %notification.url, "notification body");
            Ok(())
        }
    }
}

#[cfg(target_os = "macos")]
fn send_macos_notification(notification: Notification, body: String) -> Result<(), NotifyError> {
    let spawned = std::thread::Builder::new()
        .name("talk-notification".to_string())
        .spawn(move || {
            ensure_macos_notification_application();

            let mut native = MacNotification::new();
            native
                .title(&notification.title)
                .subtitle(&notification.instance)
                .message(&body)
                .main_button(MainButton::SingleAction("Open"))
                .close_button("Dismiss")
                .wait_for_click(true)
                .asynchronous(false);
            if notification.play_sound {
                native.default_sound();
            }

            match native.send() {
                Ok(NotificationResponse::Click) | Ok(NotificationResponse::ActionButton(_)) => {
                    if let Err(error) = crate::core::open_in_browser(&notification.url) {
                        tracing::warn!(%error, "failed to open notification target");
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(%error, "failed to show macOS notification");
                }
            }
        });
    spawned
        .map(|_| ())
        .map_err(|error| NotifyError::Delivery(format!("notification thread: {error}")))
}

#[cfg(target_os = "macos")]
fn ensure_macos_notification_application() {
    static INIT_NOTIFICATION_APP: std::sync::Once = std::sync::Once::new();
    INIT_NOTIFICATION_APP.call_once(|| {
        for bundle_id in ["com.nextcloud.talk.desktop", "com.apple.Terminal"] {
            match mac_notification_sys::set_application(bundle_id) {
                Ok(_) => return,
                Err(error) => {
                    debug!(bundle_id, %error, "failed to set macOS notification bundle id");
                }
            }
        }
    });
}
