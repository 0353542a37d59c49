//! # texplorer-settings
//!
//! Layered configuration for the test explorer.
//!
//! Settings resolve from three layers (in priority order):
//! 1. **Compiled defaults**: [`ExplorerSettings::default()`]
//! 2. **Settings file**: `~/.texplorer/settings.json` or an explicit path
//! 3. **Environment variables**: `TEXPLORER_*` overrides (highest priority)
//!
//! The raw document lives in a [`SettingsStore`], which is what the host
//! hands to each project as its `ConfigStore`. A typed [`ExplorerSettings`]
//! snapshot is read from it every time a subsystem generation is built.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod store;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_store_from_path, load_store_with, settings_path};
pub use store::SettingsStore;
pub use types::*;
