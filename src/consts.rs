pub(crate) const APP_DIR_NAME: &str = "talk-notifier";
pub(crate) const SETTINGS_FILE_NAME: &str = "settings.json";
pub(crate) const CREDENTIALS_FILE_NAME: &str = "credentials.json";
pub(crate) const CONFIG_PATH_ENV: &str = "TALK_NOTIFIER_CONFIG";
pub(crate) const KEYRING_SERVICE: &str = "talk-notifier";
pub(crate) const USER_AGENT: &str = "Nextcloud Talk Client (talk-notifier)";

pub(crate) const VALIDATION_RETRY_SECS: u64 = 300;
pub(crate) const LOGIN_START_RETRY_SECS: u64 = 300;
pub(crate) const LOGIN_EXPIRED_PAUSE_SECS: u64 = 5;
pub(crate) const MAINTENANCE_PAUSE_SECS: u64 = 300;
pub(crate) const UNREACHABLE_PAUSE_SECS: u64 = 20;
pub(crate) const MIN_POLL_INTERVAL_SECS: u64 = 5;

pub(crate) const LOGIN_POLL_INTERVAL_SECS: u64 = 5;
pub(crate) const LOGIN_FLOW_CEILING_SECS: u64 = 20 * 60;

pub(crate) const MIN_REPEAT_INTERVAL_SECS: u64 = 30;
pub(crate) const DEFAULT_REPEAT_INTERVAL_SECS: u64 = 300;

pub(crate) const NOTIFICATION_BODY_MAX_CHARS: usize = 220;
pub(crate) const PAUSE_FOREVER_SENTINEL: u64 = 0;

pub(crate) const NOTIFICATION_LEVEL_NEVER: i64 = 3;
