//! # wakegate-settings
//!
//! Settings are layered, lowest priority first:
//! 1. compiled defaults ([`WakegateSettings::default()`])
//! 2. a JSON file, deep-merged over the defaults
//! 3. `WAKEGATE_*` environment variables

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, apply_overrides_from, deep_merge, load_settings_from_path};
pub use types::*;
