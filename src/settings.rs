//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If a settings file exists, deep-merge its values over the defaults
//! 3. Apply `EEL_*` environment variable overrides
//! 4. Command-line flags are applied last by the caller
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use eel_core::SessionConfig;
use eel_server::ServerConfig;
use eel_telemetry::{LogFormat, TelemetryConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Settings file looked up in the working directory when none is given.
pub const DEFAULT_SETTINGS_FILE: &str = "eel.json";

/// Errors that can occur when loading or parsing settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub logging: LoggingSettings,
    /// Page announced at startup, relative to the web root.
    pub start_page: String,
    /// Stop the process once the browser goes away.
    pub exit_on_disconnect: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            session: SessionConfig::default(),
            logging: LoggingSettings::default(),
            start_page: "index.html".into(),
            exit_on_disconnect: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
    /// Per-module level overrides, e.g. `{"eel_core::dispatcher": "trace"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Pretty,
            modules: BTreeMap::new(),
        }
    }
}

impl LoggingSettings {
    pub fn telemetry_config(&self) -> Result<TelemetryConfig> {
        let level = |name: &str| {
            eel_telemetry::parse_level(name)
                .ok_or_else(|| SettingsError::InvalidValue(format!("unknown log level '{name}'")))
        };
        let module_levels = self
            .modules
            .iter()
            .map(|(module, name)| Ok((module.clone(), level(name)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(TelemetryConfig {
            log_level: level(&self.level)?,
            module_levels,
            format: self.format,
        })
    }
}

/// Resolve the settings file: the explicit path, else `./eel.json`.
pub fn settings_path(explicit: Option<&Path>) -> PathBuf {
    explicit.map_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE), Path::to_path_buf)
}

/// Load settings from `path` with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    let mut settings = load_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn load_file(path: &Path) -> Result<Settings> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `EEL_*` environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup` (an env var reader in production).
pub fn apply_overrides_from<F>(settings: &mut Settings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = string("EEL_HOST") {
        settings.server.host = v;
    }
    if let Some(raw) = string("EEL_PORT") {
        if let Some(v) = checked("EEL_PORT", raw.parse::<u16>().ok(), &raw) {
            settings.server.port = v;
        }
    }
    if let Some(v) = string("EEL_WEB_ROOT") {
        settings.server.web_root = Some(PathBuf::from(v));
    }

    // ── Session ─────────────────────────────────────────────────────
    if let Some(raw) = string("EEL_POLL_ATTEMPTS") {
        let parsed = raw.parse::<u32>().ok().filter(|n| *n > 0);
        if let Some(v) = checked("EEL_POLL_ATTEMPTS", parsed, &raw) {
            settings.session.poll_attempts = v;
        }
    }
    if let Some(raw) = string("EEL_POLL_INTERVAL_MS") {
        if let Some(v) = checked("EEL_POLL_INTERVAL_MS", parse_u64_range(&raw, 1, 60_000), &raw) {
            settings.session.poll_interval_ms = v;
        }
    }

    // ── Logging / lifecycle ─────────────────────────────────────────
    if let Some(v) = string("EEL_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(raw) = string("EEL_LOG_JSON") {
        if let Some(json) = checked("EEL_LOG_JSON", parse_bool(&raw), &raw) {
            settings.logging.format = if json { LogFormat::Json } else { LogFormat::Pretty };
        }
    }
    if let Some(raw) = string("EEL_EXIT_ON_DISCONNECT") {
        if let Some(v) = checked("EEL_EXIT_ON_DISCONNECT", parse_bool(&raw), &raw) {
            settings.exit_on_disconnect = v;
        }
    }
}

fn checked<T>(name: &str, parsed: Option<T>, raw: &str) -> Option<T> {
    if parsed.is_none() {
        tracing::warn!(key = name, value = %raw, "invalid env var, ignoring");
    }
    parsed
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
