//! # wsgate-settings
//!
//! Configuration management with layered sources for the wsgate server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** - [`GateSettings::default()`]
//! 2. **User file** - `~/.wsgate/settings.json` or an explicit path
//! 3. **Environment variables** - `WSGATE_*` overrides (highest priority),
//!    with `__` separating nested keys (`WSGATE_IDLE__TIMEOUT_SECS=30`)
//!
//! The merged result is validated before it is handed out.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{ENV_PREFIX, figment_for, load_settings, load_settings_from_path, settings_path};
pub use types::*;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
