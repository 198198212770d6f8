//! Asynchronous loading of the sandboxed target
//!
//! Loading the sandboxed engine instantiates its storage emulation and is the
//! only suspension point in the crate; query execution stays synchronous.
//!
//! ```rust,no_run
//! # async fn run() -> sqlbridge_rs::Result<()> {
//! let db = sqlbridge_rs::open_sandboxed("app.db").await?;
//! db.execute("CREATE TABLE IF NOT EXISTS kv(k TEXT PRIMARY KEY, v BLOB)", &[])?;
//! # Ok(())
//! # }
//! ```

use super::config::OpenConfig;
use super::connection::Database;
use super::engine::{Engine, Target};
use super::error::{Error, Result};
use tracing::info;

/// Load the sandboxed engine, off the async executor
///
/// Shares the process-wide instance with [`Engine::load`]; once loaded, this
/// returns without spawning.
pub async fn load_sandboxed() -> Result<&'static Engine> {
    if let Some(engine) = Engine::loaded(Target::Sandboxed) {
        return Ok(engine);
    }
    info!("Loading sandboxed engine");
    tokio::task::spawn_blocking(|| Engine::load(Target::Sandboxed))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

/// Open `target` on the sandboxed engine with default settings
pub async fn open_sandboxed(target: &str) -> Result<Database> {
    open_sandboxed_with_config(target, OpenConfig::default()).await
}

pub async fn open_sandboxed_with_config(target: &str, config: OpenConfig) -> Result<Database> {
    let engine = load_sandboxed().await?;
    Database::open_with_engine(engine, target, &config)
}
