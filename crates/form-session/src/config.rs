//! Session configuration.
//!
//! Deserialized from camelCase JSON; every field has a default so a partial
//! (or empty) object is valid.

use form_core::GeneratorOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Debounce window applied after the last edit unless a write overrides it.
pub const DEFAULT_DEBOUNCE_MS: u64 = 400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub debounce_timeout_ms: u64,
    /// Save as soon as the debounced data differs from the last save.
    /// When off, only manual saves (and lock requests) reach the backend.
    pub auto_saving: bool,
    /// Give a repeating group with no bound array one row anyway.
    pub always_show_one_row: bool,
    /// Where `PUT` requests for the form data go.
    pub save_url: String,
    pub language: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce_timeout_ms: DEFAULT_DEBOUNCE_MS,
            auto_saving: true,
            always_show_one_row: false,
            save_url: String::new(),
            language: "nb".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn debounce_timeout(&self) -> Duration {
        Duration::from_millis(self.debounce_timeout_ms)
    }

    pub fn generator_options(&self) -> GeneratorOptions {
        GeneratorOptions {
            always_show_one_row: self.always_show_one_row,
        }
    }
}
