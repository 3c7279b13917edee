//! Settings loading with layered providers.
//!
//! Loading flow:
//! 1. Start with compiled [`GateSettings::default()`]
//! 2. If the settings file exists, merge its values over the defaults
//! 3. Merge `WSGATE_*` environment variables (highest priority)
//! 4. Validate the result
//!
//! Nested keys are addressed with `__` in environment variables:
//! `WSGATE_SERVER__PORT=9000` sets `server.port`.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use tracing::debug;

use crate::errors::Result;
use crate::types::GateSettings;

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "WSGATE_";

/// Resolve the path to the settings file (`~/.wsgate/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".wsgate").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<GateSettings> {
    load_settings_from_path(&settings_path())
}

/// Build the provider stack for a given settings file.
///
/// A missing file contributes nothing; defaults and environment still apply.
pub fn figment_for(path: &Path) -> Figment {
    Figment::from(Serialized::defaults(GateSettings::default()))
        .merge(Json::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults (plus env overrides). If the
/// file contains invalid JSON or a value of the wrong type, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<GateSettings> {
    if path.exists() {
        debug!(?path, "loading settings from file");
    } else {
        debug!(?path, "settings file not found, using defaults");
    }

    let settings: GateSettings = figment_for(path).extract()?;
    settings.validate()?;
    Ok(settings)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
