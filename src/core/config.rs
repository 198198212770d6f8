//! Open configuration
//!
//! An [`OpenConfig`] describes how a database is opened. It can be built in
//! code, or loaded from TOML or JSON:
//!
//! ```toml
//! target = "sandboxed"
//! read_only = false
//! busy_timeout_ms = 250
//! ```

use super::engine::Target;
use super::error::{Error, Result};
use super::events::DEFAULT_EVENT_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenConfig {
    /// Execution target the engine runs as
    pub target: Target,
    /// VFS to open through instead of the target's default
    pub vfs: Option<String>,
    pub read_only: bool,
    /// Create the database if it does not exist (ignored when read-only)
    pub create: bool,
    /// Busy handler timeout; 0 fails lock contention immediately
    pub busy_timeout_ms: u32,
    pub extended_result_codes: bool,
    /// Events buffered per subscriber; further events are dropped and counted
    pub event_capacity: usize,
}

impl Default for OpenConfig {
    fn default() -> Self {
        Self {
            target: Target::Native,
            vfs: None,
            read_only: false,
            create: true,
            busy_timeout_ms: 0,
            extended_result_codes: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl OpenConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&text),
            Some("json") => Self::from_json(&text),
            other => Err(Error::Config(format!(
                "unsupported config format: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    /// Engine open flags for this configuration
    pub(crate) fn open_flags(&self) -> std::os::raw::c_int {
        use libsqlite3_sys as ffi;

        let access = if self.read_only {
            ffi::SQLITE_OPEN_READONLY
        } else if self.create {
            ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE
        } else {
            ffi::SQLITE_OPEN_READWRITE
        };
        // shared cache is never used: shared in-memory stores live in the VFS
        access | ffi::SQLITE_OPEN_FULLMUTEX | ffi::SQLITE_OPEN_PRIVATECACHE
    }
}
