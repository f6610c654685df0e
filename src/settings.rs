use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use crate::autosave::DEFAULT_DEBOUNCE;
use crate::bridge::{EngineCommand, DEFAULT_CALL_TIMEOUT};
use crate::persistence::{validate_directory, validate_labeler_name, validate_version};

pub const CONFIG_FILE_NAME: &str = "config.json";

fn default_labeler_name() -> String {
    "labeler1".into()
}

fn default_labels_directory() -> String {
    "labels".into()
}

fn default_data_folder() -> String {
    ".".into()
}

fn default_version() -> String {
    "1.0".into()
}

/// Who is labeling and where their files live. Missing keys in a stored
/// config take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_labeler_name")]
    pub labeler_name: String,
    #[serde(default = "default_labels_directory")]
    pub labels_directory: String,
    #[serde(default = "default_data_folder")]
    pub data_folder: String,
    #[serde(default = "default_version")]
    pub version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            labeler_name: default_labeler_name(),
            labels_directory: default_labels_directory(),
            data_folder: default_data_folder(),
            version: default_version(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        validate_labeler_name(&self.labeler_name)?;
        validate_directory("labels directory", &self.labels_directory)?;
        validate_directory("data folder", &self.data_folder)?;
        validate_version(&self.version)
    }

    /// Replaces each invalid field with its default.
    fn sanitized(mut self) -> Self {
        let defaults = AppConfig::default();
        if validate_labeler_name(&self.labeler_name).is_err() {
            log::warn!("Invalid labeler name in config, using default");
            self.labeler_name = defaults.labeler_name;
        }
        if validate_directory("labels directory", &self.labels_directory).is_err() {
            self.labels_directory = defaults.labels_directory;
        }
        if validate_directory("data folder", &self.data_folder).is_err() {
            self.data_folder = defaults.data_folder;
        }
        if validate_version(&self.version).is_err() {
            self.version = defaults.version;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Label files are read and written by the engine process.
    Engine,
    /// Label files are read and written directly by this process.
    Fs,
}

/// Process-level knobs, read from the environment rather than `config.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub command: EngineCommand,
    pub call_timeout: Duration,
    pub autosave_delay: Duration,
    pub storage: StorageBackend,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            command: EngineCommand {
                program: "python3".into(),
                args: vec!["backend/labeler_backend.py".into()],
                working_dir: None,
            },
            call_timeout: DEFAULT_CALL_TIMEOUT,
            autosave_delay: DEFAULT_DEBOUNCE,
            storage: StorageBackend::Engine,
        }
    }
}

impl EngineSettings {
    /// Defaults overridden by `LABELER_ENGINE_CMD`, `LABELER_RPC_TIMEOUT_MS`,
    /// `LABELER_AUTOSAVE_MS` and `LABELER_STORAGE`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();

        if let Some(command) = lookup("LABELER_ENGINE_CMD").and_then(|v| EngineCommand::parse(&v)) {
            settings.command = command;
        }
        if let Some(ms) = lookup("LABELER_RPC_TIMEOUT_MS").and_then(|v| parse_millis(&v)) {
            settings.call_timeout = ms;
        }
        if let Some(ms) = lookup("LABELER_AUTOSAVE_MS").and_then(|v| parse_millis(&v)) {
            settings.autosave_delay = ms;
        }
        match lookup("LABELER_STORAGE").as_deref().map(str::trim) {
            Some("fs") => settings.storage = StorageBackend::Fs,
            Some("engine") | None => {}
            Some(other) => log::warn!("Unknown LABELER_STORAGE '{other}', using engine"),
        }
        settings
    }
}

fn parse_millis(value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => {
            log::warn!("Ignoring invalid millisecond value '{value}'");
            None
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<AppConfig>,
}

impl SettingsStore {
    /// Loads `path`, writing defaults if it does not exist yet. A corrupt
    /// file is logged and replaced in memory by defaults; it is not
    /// overwritten until the next update.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            match serde_json::from_str::<AppConfig>(&contents) {
                Ok(config) => config.sanitized(),
                Err(err) => {
                    log::error!("Invalid config at {}, using defaults: {err}", path.display());
                    AppConfig::default()
                }
            }
        } else {
            let defaults = AppConfig::default();
            persist_to(&path, &defaults)?;
            defaults
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> AppConfig {
        self.read().clone()
    }

    pub fn update(&self, config: AppConfig) -> Result<()> {
        config.validate()?;
        let mut guard = self.write();
        persist_to(&self.path, &config)?;
        *guard = config;
        Ok(())
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)?;
        let data: AppConfig = serde_json::from_str(&contents)?;
        *self.write() = data.sanitized();
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, AppConfig> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, AppConfig> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn persist_to(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let serialized = serde_json::to_string_pretty(config)?;
    fs::write(path, serialized)
        .with_context(|| format!("Failed to write config to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let store = SettingsStore::new(path.clone()).unwrap();
        assert_eq!(store.config(), AppConfig::default());

        let written: AppConfig =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written, AppConfig::default());
    }

    #[test]
    fn partial_and_invalid_fields_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, r#"{"labeler_name": "has space", "data_folder": "/data"}"#).unwrap();

        let config = SettingsStore::new(path).unwrap().config();
        assert_eq!(config.labeler_name, "labeler1");
        assert_eq!(config.data_folder, "/data");
        assert_eq!(config.labels_directory, "labels");
    }

    #[test]
    fn corrupt_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "{").unwrap();

        assert_eq!(SettingsStore::new(path).unwrap().config(), AppConfig::default());
    }

    #[test]
    fn invalid_update_is_rejected_and_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let store = SettingsStore::new(path.clone()).unwrap();

        let bad = AppConfig {
            version: "far-too-long-version".into(),
            ..AppConfig::default()
        };
        assert!(store.update(bad).is_err());
        assert_eq!(store.config(), AppConfig::default());

        let good = AppConfig {
            labeler_name: "alice".into(),
            ..AppConfig::default()
        };
        store.update(good.clone()).unwrap();
        store.reload().unwrap();
        assert_eq!(store.config(), good);
    }

    #[test]
    fn engine_settings_read_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("LABELER_ENGINE_CMD", "/opt/engine --stdio"),
            ("LABELER_RPC_TIMEOUT_MS", "1500"),
            ("LABELER_AUTOSAVE_MS", "zero"),
            ("LABELER_STORAGE", "fs"),
        ]);
        let settings = EngineSettings::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(settings.command.program, "/opt/engine");
        assert_eq!(settings.command.args, vec!["--stdio"]);
        assert_eq!(settings.call_timeout, Duration::from_millis(1500));
        assert_eq!(settings.autosave_delay, DEFAULT_DEBOUNCE);
        assert_eq!(settings.storage, StorageBackend::Fs);
    }
}
