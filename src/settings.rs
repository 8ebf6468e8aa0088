use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::EngineError;
use crate::script::parser::LanguageVersion;
use crate::script::vm::{ExecutionLimits, DEFAULT_MAX_CALL_DEPTH};
use crate::script::CompileOptions;

const SETTINGS_VERSION: u32 = 1;
const SETTINGS_FILE: &str = "settings.json";

/// Namespaces and types imported for unqualified use in every submission.
pub const DEFAULT_USINGS: &[&str] = &[
    "System",
    "System.IO",
    "System.Collections.Generic",
    "System.Console",
    "System.Diagnostics",
    "System.Dynamic",
    "System.Linq",
    "System.Linq.Expressions",
    "System.Net.Http",
    "System.Text",
    "System.Threading.Tasks",
    "System.Math",
];

fn default_version() -> u32 {
    SETTINGS_VERSION
}

fn default_usings() -> Vec<String> {
    DEFAULT_USINGS.iter().map(|u| (*u).to_string()).collect()
}

fn default_true() -> bool {
    true
}

fn default_max_call_depth() -> usize {
    DEFAULT_MAX_CALL_DEPTH
}

fn default_initial_state_capacity() -> usize {
    2
}

// ── Engine settings ─────────────────────────────────────────────

/// Session configuration, stored as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, JsonSchema)]
#[ts(export)]
pub struct EngineSettings {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Imports applied to every submission.
    #[serde(default = "default_usings")]
    pub usings: Vec<String>,
    #[serde(default)]
    pub language_version: LanguageVersion,
    /// Report warnings for accepted and rejected submissions.
    #[serde(default = "default_true")]
    pub show_warnings: bool,
    /// Report info diagnostics (such as shadowed declarations).
    #[serde(default)]
    pub show_info: bool,
    /// Maximum VM steps per submission. None = unlimited.
    #[serde(default)]
    pub step_limit: Option<u64>,
    #[serde(default = "default_max_call_depth")]
    #[ts(type = "number")]
    pub max_call_depth: usize,
    /// Initial number of state slots; the store doubles from here.
    #[serde(default = "default_initial_state_capacity")]
    #[ts(type = "number")]
    pub initial_state_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            usings: default_usings(),
            language_version: LanguageVersion::default(),
            show_warnings: true,
            show_info: false,
            step_limit: None,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            initial_state_capacity: default_initial_state_capacity(),
        }
    }
}

impl EngineSettings {
    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            step_limit: self.step_limit,
            max_call_depth: self.max_call_depth.max(1),
        }
    }

    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            language_version: self.language_version,
        }
    }

    /// JSON schema of the settings file.
    pub fn schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(EngineSettings)
    }
}

/// `settings.json` inside `config_dir`.
pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join(SETTINGS_FILE)
}

/// Load settings from a JSON file. Returns None if the file does not exist
/// or cannot be parsed; the caller falls back to defaults.
pub fn load_settings(path: &Path) -> Option<EngineSettings> {
    if !path.exists() {
        log::debug!("no settings at {}, using defaults", path.display());
        return None;
    }
    match read_json::<EngineSettings>(path) {
        Ok(settings) => {
            if settings.version > SETTINGS_VERSION {
                log::warn!(
                    "settings version {} is newer than supported version {SETTINGS_VERSION}",
                    settings.version
                );
            }
            Some(settings)
        }
        Err(e) => {
            log::warn!("ignoring unreadable settings {}: {e}", path.display());
            None
        }
    }
}

/// Save settings as pretty JSON, atomically.
pub fn save_settings(path: &Path, settings: &EngineSettings) -> Result<(), EngineError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    atomic_write(path, json.as_bytes()).map_err(|e| EngineError::SettingsSaveError {
        message: e.to_string(),
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, EngineError> {
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

/// Per-file mutex map to serialize concurrent writes to the same path.
static FILE_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Write to a `.tmp` sibling, fsync, keep the previous file as `.bak`, then
/// rename into place.
fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let lock = FILE_LOCKS
        .lock()
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone();
    let _guard = lock.lock();

    let file_name = path.file_name().unwrap_or_default();
    let mut tmp_name = OsString::from(file_name);
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(&tmp_name);
    let mut bak_name = OsString::from(file_name);
    bak_name.push(".bak");
    let bak_path = path.with_file_name(&bak_name);

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    // Best-effort backup
    if path.exists() {
        let _ = fs::rename(path, &bak_path);
    }
    fs::rename(&tmp_path, path)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("snippet_repl_{name}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_settings_round_trip() {
        let dir = temp_dir("round_trip");
        let path = settings_path(&dir);
        let settings = EngineSettings {
            language_version: LanguageVersion::Stable,
            step_limit: Some(10_000),
            ..EngineSettings::default()
        };
        save_settings(&path, &settings).unwrap();

        let loaded = load_settings(&path).expect("should load");
        assert_eq!(loaded, settings);

        // Second save keeps a backup of the first
        save_settings(&path, &EngineSettings::default()).unwrap();
        assert!(dir.join("settings.json.bak").exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let dir = temp_dir("defaults");
        let path = settings_path(&dir);
        fs::write(&path, r#"{ "show_info": true, "language_version": "stable" }"#).unwrap();

        let loaded = load_settings(&path).expect("should load");
        assert!(loaded.show_info);
        assert!(loaded.show_warnings);
        assert_eq!(loaded.language_version, LanguageVersion::Stable);
        assert_eq!(loaded.usings, default_usings());
        assert_eq!(loaded.initial_state_capacity, 2);
        assert_eq!(loaded.max_call_depth, DEFAULT_MAX_CALL_DEPTH);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_missing_or_corrupt_returns_none() {
        let dir = temp_dir("corrupt");
        let path = settings_path(&dir);
        assert!(load_settings(&path).is_none());
        fs::write(&path, "{ not json").unwrap();
        assert!(load_settings(&path).is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_schema_lists_fields() {
        let schema = serde_json::to_value(EngineSettings::schema()).unwrap();
        let props = &schema["properties"];
        assert!(props["usings"].is_object());
        assert!(props["language_version"].is_object());
        assert!(props["initial_state_capacity"].is_object());
    }

    #[test]
    fn test_limits_follow_settings() {
        let settings = EngineSettings {
            step_limit: Some(5),
            max_call_depth: 0,
            ..EngineSettings::default()
        };
        let limits = settings.limits();
        assert_eq!(limits.step_limit, Some(5));
        assert_eq!(limits.max_call_depth, 1);
    }
}
