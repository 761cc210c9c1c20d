//! # genwire-settings
//!
//! Layered configuration for the genwire client.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`GenwireSettings::default()`]
//! 2. **User file**: `~/.genwire/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `GENWIRE_*` overrides (highest priority)
//!
//! There is no process-wide cache: the composition root loads settings once
//! and hands the value to whatever needs it.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
