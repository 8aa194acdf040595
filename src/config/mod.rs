use crate::error::{Result, ServmanError};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

/// Name of the per-server settings file kept inside each install root.
pub const SETTINGS_FILE: &str = "server_settings.json";

/// Declared server entry in the fleet configuration file.
///
/// The fleet file is the operator-owned source of truth: which servers
/// exist, which app they install, and optional store credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Application identifier passed to the package-fetch tool
    pub app_id: String,

    /// Executable relative to the install root (fallback for the resolver)
    #[serde(default)]
    pub executable: Option<String>,

    /// Optional login pair; absent means anonymous login
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

/// Runtime settings stored as `server_settings.json` inside the install
/// root, editable live by operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default)]
    pub executable: Option<String>,

    /// Launch parameters; accepts a list, a whitespace-delimited string,
    /// or a single scalar, always normalized to a list of strings.
    #[serde(default, deserialize_with = "deserialize_params")]
    pub parameters: Vec<String>,

    #[serde(default = "default_true")]
    pub auto_update: bool,

    #[serde(default = "default_true")]
    pub auto_restart: bool,

    #[serde(default)]
    pub restart_after_stop: bool,

    /// Daily stop time as "HH:MM" (24h); empty means no scheduled stop
    #[serde(default)]
    pub stop_time: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            executable: None,
            parameters: Vec::new(),
            auto_update: true,
            auto_restart: true,
            restart_after_stop: false,
            stop_time: String::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn deserialize_params<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawParams {
        List(Vec<serde_json::Value>),
        Text(String),
        Scalar(serde_json::Value),
    }

    let raw = Option::<RawParams>::deserialize(deserializer)?;
    Ok(match raw {
        None => Vec::new(),
        Some(RawParams::List(values)) => values.iter().map(value_to_string).collect(),
        Some(RawParams::Text(text)) => text.split_whitespace().map(str::to_string).collect(),
        Some(RawParams::Scalar(serde_json::Value::Null)) => Vec::new(),
        Some(RawParams::Scalar(value)) => vec![value_to_string(&value)],
    })
}

fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Check a daily stop time: "HH:MM", 24h clock, or empty for "none".
pub fn is_valid_stop_time(value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    let Some((hh, mm)) = value.split_once(':') else {
        return false;
    };
    if hh.len() != 2 || mm.len() != 2 {
        return false;
    }
    match (hh.parse::<u8>(), mm.parse::<u8>()) {
        (Ok(h), Ok(m)) => h < 24 && m < 60,
        _ => false,
    }
}

/// Top-level fleet configuration (TOML).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Hard timeout for a single package-fetch invocation
    #[serde(default = "default_update_timeout")]
    pub update_timeout_secs: u64,

    #[serde(default)]
    pub servers: HashMap<String, ServerEntry>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            update_timeout_secs: default_update_timeout(),
            servers: HashMap::new(),
        }
    }
}

fn default_update_timeout() -> u64 {
    7200
}

impl FleetConfig {
    fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| ServmanError::InvalidConfig(format!("Failed to parse fleet config: {}", e)))
    }
}

struct Inner {
    fleet: FleetConfig,
    settings: HashMap<String, ServerSettings>,
    fleet_mtime: Option<SystemTime>,
}

/// Read-mostly configuration store.
///
/// Operators edit the fleet file and the per-server settings files while
/// the daemon runs, so nothing here is cached beyond one `reload` cycle:
/// the fleet TOML is re-read whenever its mtime changes and the settings
/// files are re-read on every reload.
pub struct ConfigStore {
    path: PathBuf,
    base_dir: PathBuf,
    inner: RwLock<Inner>,
}

impl ConfigStore {
    pub fn new<P: AsRef<Path>, B: AsRef<Path>>(path: P, base_dir: B) -> Self {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            base_dir: base_dir.as_ref().to_path_buf(),
            inner: RwLock::new(Inner {
                fleet: FleetConfig::default(),
                settings: HashMap::new(),
                fleet_mtime: None,
            }),
        };
        store.reload();
        store
    }

    /// Re-read configuration from disk. Never fails: a missing or corrupt
    /// fleet file degrades to an empty fleet so the daemon keeps ticking.
    pub fn reload(&self) {
        let mut inner = self.lock_write();

        if self.path.exists() {
            let mtime = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();
            if inner.fleet_mtime.is_none() || mtime != inner.fleet_mtime {
                match std::fs::read_to_string(&self.path).map_err(ServmanError::Io).and_then(|c| {
                    FleetConfig::parse(&c)
                }) {
                    Ok(fleet) => {
                        inner.fleet = fleet;
                        inner.fleet_mtime = mtime;
                    }
                    Err(e) => {
                        tracing::error!("Fleet config unreadable, using empty fleet: {}", e);
                        inner.fleet = FleetConfig::default();
                        inner.fleet_mtime = mtime;
                    }
                }
            }
        } else {
            inner.fleet = FleetConfig::default();
            inner.fleet_mtime = None;
        }

        // Settings live inside each install root and can change under us
        // at any time, so they are re-read unconditionally.
        let mut settings = HashMap::new();
        for (name, entry) in &inner.fleet.servers {
            let path = install_root_for(&self.base_dir, &entry.app_id).join(SETTINGS_FILE);
            settings.insert(name.clone(), load_settings_file(name, &path));
        }
        inner.settings = settings;
    }

    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_read().fleet.servers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn entry(&self, name: &str) -> Option<ServerEntry> {
        self.lock_read().fleet.servers.get(name).cloned()
    }

    /// Runtime settings for a declared server; defaults when the settings
    /// file is absent or unreadable.
    pub fn settings(&self, name: &str) -> ServerSettings {
        self.lock_read().settings.get(name).cloned().unwrap_or_default()
    }

    /// Install root for a declared server (GSM layout:
    /// `<base>/servers/<app_id>/serverfiles`); None if undeclared.
    pub fn install_root(&self, name: &str) -> Option<PathBuf> {
        let inner = self.lock_read();
        inner
            .fleet
            .servers
            .get(name)
            .map(|entry| install_root_for(&self.base_dir, &entry.app_id))
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_read().fleet.update_timeout_secs)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory containing the package-fetch tool and its working files
    pub fn steam_dir(&self) -> PathBuf {
        self.base_dir.join("steam")
    }

    /// Per-server cached login/session artifacts
    pub fn sessions_dir(&self) -> PathBuf {
        self.base_dir.join("steam_sessions")
    }

    pub fn pid_cache_path(&self) -> PathBuf {
        self.base_dir.join("server_pids.json")
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        // A poisoned lock still holds a structurally sound map.
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn install_root_for(base_dir: &Path, app_id: &str) -> PathBuf {
    base_dir.join("servers").join(app_id).join("serverfiles")
}

fn load_settings_file(name: &str, path: &Path) -> ServerSettings {
    if !path.exists() {
        return ServerSettings::default();
    }
    let mut settings = match std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|c| serde_json::from_str::<ServerSettings>(&c).map_err(|e| e.to_string()))
    {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Settings for {} unreadable ({}), using defaults", name, e);
            return ServerSettings::default();
        }
    };
    if !is_valid_stop_time(&settings.stop_time) {
        tracing::warn!(
            "Ignoring invalid stop_time '{}' for {} (expected HH:MM)",
            settings.stop_time,
            name
        );
        settings.stop_time.clear();
    }
    settings
}
