use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::debug;

use crate::{error::SettingsError, APP_DIR_NAME, CONFIG_PATH_ENV, CREDENTIALS_FILE_NAME, SETTINGS_FILE_NAME};

pub(crate) fn config_dir() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir()
        .ok_or(SettingsError::NoConfigDir)?
        .join(APP_DIR_NAME);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub(crate) fn settings_file() -> Result<PathBuf, SettingsError> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(config_dir()?.join(SETTINGS_FILE_NAME))
}

pub(crate) fn credentials_file() -> Result<PathBuf, SettingsError> {
    let dir = match dirs::cache_dir() {
        Some(cache_dir) => {
            let dir = cache_dir.join(APP_DIR_NAME);
            fs::create_dir_all(&dir)?;
            dir
        }
        None => config_dir()?,
    };
    Ok(dir.join(CREDENTIALS_FILE_NAME))
}

pub(crate) fn restrict_file_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        if path.exists() {
            if let Err(error) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
                debug!(?path, %error, "failed to restrict file permissions");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Strips query strings so poll tokens never end up in logs.
pub(crate) fn redact_url(url: &str) -> String {
    let mut parsed = match reqwest::Url::parse(url) {
        Ok(url) => url,
        Err(_) => return "<invalid-url>".to_string(),
    };
    if parsed.query().is_some() {
        parsed.set_query(Some("***"));
    }
    let _ = parsed.set_password(None);
    parsed.to_string()
}

pub(crate) fn truncate_message(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }

    let truncated: String = input.chars().take(max_chars).collect();
    format!("{truncated}...")
}

pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn open_in_browser(url: &str) -> Result<(), String> {
    let candidate = url.trim();
    if candidate.is_empty() {
        return Err("Missing URL".to_string());
    }
    let parsed = reqwest::Url::parse(candidate).map_err(|error| format!("Invalid URL: {error}"))?;
    let scheme = parsed.scheme().to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return Err(format!("Unsupported URL scheme: {scheme}"));
    }

    #[cfg(target_os = "macos")]
    let status = Command::new("open").arg(candidate).status();
    #[cfg(target_os = "windows")]
    let status = Command::new("cmd")
        .arg("/C")
        .arg("start")
        .arg("")
        .arg(candidate)
        .status();
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let status = Command::new("xdg-open").arg(candidate).status();

    let status = status.map_err(|error| format!("Failed to open URL: {error}"))?;
    if !status.success() {
        return Err(format!(
            "Failed to open URL (exit code {})",
            status.code().unwrap_or(-1)
        ));
    }

    Ok(())
}
