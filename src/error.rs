use thiserror::Error;

/// Failures talking to a remote instance. These never reach the run loop
/// directly; callers map them onto a [`TransportOutcome`](crate::model::TransportOutcome).
#[derive(Debug, Error)]
pub(crate) enum ClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected server response (HTTP {0})")]
    UnexpectedStatus(u16),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Error)]
pub(crate) enum VaultError {
    #[error("keychain access failed: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("sealed secret is not a keychain handle")]
    MalformedHandle,
}

#[derive(Debug, Error)]
pub(crate) enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Error)]
pub(crate) enum SettingsError {
    #[error("settings io failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no config directory available on this platform")]
    NoConfigDir,

    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
}
