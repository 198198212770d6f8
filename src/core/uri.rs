//! Open-target resolution
//!
//! Turns the string passed to `open` into a [`Location`]. In-memory databases
//! (`:memory:`, the empty name, and `file:` URIs with `mode=memory`) are always
//! served by the crate's memory VFS so that shared in-memory databases are
//! routed through the VFS lock protocol rather than the engine's shared cache.

use super::error::{Error, Result};
use std::path::PathBuf;

/// Where a database lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// In-memory database; `shared` databases with the same name are one store
    Memory { name: Option<String>, shared: bool },
    /// Plain file name
    Path(PathBuf),
    /// `file:` URI passed to the engine unchanged
    Uri { uri: String, vfs: Option<String> },
}

impl Location {
    pub fn is_memory(&self) -> bool {
        matches!(self, Location::Memory { .. })
    }
}

/// Parsed `file:` URI
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileUri {
    pub path: String,
    pub params: Vec<(String, String)>,
}

impl FileUri {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn decode(part: &str) -> Result<String> {
    urlencoding::decode(part)
        .map(|s| s.into_owned())
        .map_err(|e| Error::InvalidArgument(format!("invalid percent-encoding in URI: {}", e)))
}

/// Parse a `file:` URI; `None` when `input` is not one
pub fn parse_file_uri(input: &str) -> Result<Option<FileUri>> {
    let Some(rest) = input.strip_prefix("file:") else {
        return Ok(None);
    };
    let rest = rest.split('#').next().unwrap_or_default();
    let (path, query) = rest.split_once('?').unwrap_or((rest, ""));

    // Authority must be empty or "localhost"
    let path = match path.strip_prefix("//") {
        Some(after) => {
            let (authority, tail) = after.split_at(after.find('/').unwrap_or(after.len()));
            if !authority.is_empty() && authority != "localhost" {
                return Err(Error::InvalidArgument(format!(
                    "invalid URI authority: {}",
                    authority
                )));
            }
            tail
        }
        None => path,
    };

    let mut params = Vec::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.push((decode(key)?, decode(value)?));
    }

    Ok(Some(FileUri {
        path: decode(path)?,
        params,
    }))
}

/// Resolve an open target
pub fn resolve(input: &str) -> Result<Location> {
    if input.is_empty() || input == ":memory:" {
        return Ok(Location::Memory {
            name: None,
            shared: false,
        });
    }

    let Some(uri) = parse_file_uri(input)? else {
        return Ok(Location::Path(PathBuf::from(input)));
    };

    let shared = uri.param("cache") == Some("shared");
    if uri.param("mode") == Some("memory") || uri.path == ":memory:" {
        let name = Some(uri.path.clone()).filter(|p| !p.is_empty());
        return Ok(Location::Memory { name, shared });
    }

    Ok(Location::Uri {
        vfs: uri.param("vfs").map(str::to_string),
        uri: input.to_string(),
    })
}
