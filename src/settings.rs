use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    core::restrict_file_permissions,
    error::SettingsError,
    model::{InstanceConfig, LoginPolicy},
    monitor::MonitorSettings,
    DEFAULT_REPEAT_INTERVAL_SECS, MIN_POLL_INTERVAL_SECS, MIN_REPEAT_INTERVAL_SECS,
};

/// Per-instance notification categories. `true` means "notify".
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub(crate) struct CategorySettings {
    pub(crate) users: bool,
    pub(crate) groups: bool,
    pub(crate) bots: bool,
    pub(crate) guests: bool,
    pub(crate) bridged: bool,
    pub(crate) muted: bool,
    pub(crate) play_sound: bool,
}

impl Default for CategorySettings {
    fn default() -> Self {
        Self {
            users: true,
            groups: true,
            bots: true,
            guests: true,
            bridged: true,
            muted: false,
            play_sound: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub(crate) struct InstanceSettings {
    pub(crate) url: String,
    pub(crate) login: LoginPolicy,
    pub(crate) notifications: CategorySettings,
    pub(crate) poll_interval_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub(crate) struct StoredSettings {
    pub(crate) instances: BTreeMap<String, InstanceSettings>,
    pub(crate) poll_interval_secs: u64,
    pub(crate) repeat_interval_secs: u64,
    pub(crate) show_notifications: bool,
    pub(crate) play_sounds: bool,
    pub(crate) pause_until: Option<u64>,
    pub(crate) quiet_hours_start: Option<u8>,
    pub(crate) quiet_hours_end: Option<u8>,
    pub(crate) exclude_own_messages: bool,
}

impl Default for StoredSettings {
    fn default() -> Self {
        Self {
            instances: BTreeMap::new(),
            poll_interval_secs: MIN_POLL_INTERVAL_SECS,
            repeat_interval_secs: DEFAULT_REPEAT_INTERVAL_SECS,
            show_notifications: true,
            play_sounds: true,
            pause_until: None,
            quiet_hours_start: None,
            quiet_hours_end: None,
            exclude_own_messages: true,
        }
    }
}

impl StoredSettings {
    /// Resolved configuration of every instance with a usable URL. Invalid
    /// entries are logged and left out.
    pub(crate) fn instance_configs(&self) -> Vec<InstanceConfig> {
        self.instances
            .iter()
            .filter_map(|(name, instance)| match normalize_base_url(&instance.url) {
                Ok(url) => Some(InstanceConfig::new(
                    name.clone(),
                    &url,
                    instance.login,
                    instance.poll_interval_secs.unwrap_or(self.poll_interval_secs),
                )),
                Err(error) => {
                    warn!(instance = %name, %error, "skipping instance");
                    None
                }
            })
            .collect()
    }

    pub(crate) fn monitor_settings(&self, instance: &str) -> MonitorSettings {
        let categories = self
            .instances
            .get(instance)
            .map(|settings| settings.notifications.clone())
            .unwrap_or_default();
        MonitorSettings::new(
            categories,
            self.repeat_interval_secs.max(MIN_REPEAT_INTERVAL_SECS),
            self.exclude_own_messages,
        )
    }
}

pub(crate) fn read_settings(path: &Path) -> Result<StoredSettings, SettingsError> {
    if !path.exists() {
        return Ok(StoredSettings::default());
    }

    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str::<StoredSettings>(&content)?)
}

/// Like [`read_settings`], but a broken file degrades to defaults.
pub(crate) fn load_or_default(path: &Path) -> StoredSettings {
    match read_settings(path) {
        Ok(settings) => settings,
        Err(error) => {
            warn!(?path, %error, "failed to load settings, using defaults");
            StoredSettings::default()
        }
    }
}

pub(crate) fn save_settings(path: &Path, settings: &StoredSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(settings)?;
    fs::write(path, content)?;
    restrict_file_permissions(path);
    Ok(())
}

pub(crate) fn normalize_base_url(input: &str) -> Result<String, SettingsError> {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(SettingsError::InvalidUrl("server URL is required".to_string()));
    }

    let url = reqwest::Url::parse(trimmed)
        .map_err(|error| SettingsError::InvalidUrl(format!("{trimmed}: {error}")))?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(SettingsError::InvalidUrl(format!(
            "{trimmed}: must start with http:// or https://"
        )));
    }

    Ok(trimmed.to_string())
}

/// Shared view of the current settings. Readers take a snapshot per use;
/// writers replace the whole value.
#[derive(Clone)]
pub(crate) struct SettingsHandle {
    current: Arc<ArcSwap<StoredSettings>>,
}

impl SettingsHandle {
    pub(crate) fn new(settings: StoredSettings) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<StoredSettings> {
        self.current.load_full()
    }

    pub(crate) fn publish(&self, settings: StoredSettings) {
        self.current.store(Arc::new(settings));
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub(crate) struct CachedCredential {
    pub(crate) login_name: String,
    pub(crate) sealed_secret: String,
}

/// Per-instance login names and sealed secrets, shared by every worker.
pub(crate) struct CredentialCache {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, CachedCredential>>,
}

impl CredentialCache {
    /// A missing or unreadable file starts an empty cache.
    pub(crate) fn load(path: PathBuf) -> Self {
        let entries = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|error| {
                warn!(?path, %error, "credential cache unreadable, starting empty");
                BTreeMap::new()
            }),
            Err(error) => {
                debug!(?path, %error, "no credential cache yet");
                BTreeMap::new()
            }
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub(crate) fn get(&self, instance: &str) -> Option<CachedCredential> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(instance).cloned())
    }

    pub(crate) fn store(&self, instance: &str, credential: CachedCredential) -> Result<(), SettingsError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| SettingsError::Io(std::io::Error::other("credential cache lock poisoned")))?;
        entries.insert(instance.to_string(), credential);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&*entries)?;
        fs::write(&self.path, content)?;
        restrict_file_permissions(&self.path);
        Ok(())
    }
}
