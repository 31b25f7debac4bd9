//! Store backend selection from resolved configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use gleitzeit_core::store::{FileStore, MemoryStore, Store};
use gleitzeit_db::{pool, PgStore};

use crate::config::GleitzeitConfig;

/// Default root for the `file` backend:
/// `$XDG_DATA_HOME/gleitzeit` or `~/.local/share/gleitzeit`.
fn default_file_root() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("gleitzeit");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local")
        .join("share")
        .join("gleitzeit")
}

/// Open the configured persistence backend.
pub async fn open_store(config: &GleitzeitConfig) -> Result<Arc<dyn Store>> {
    match config.store.backend.as_str() {
        "postgres" => {
            let pg_pool = pool::create_pool(&config.db_config).await?;
            Ok(Arc::new(PgStore::new(pg_pool)))
        }
        "file" => {
            let root = config
                .store
                .path
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(default_file_root);
            let store = FileStore::open(&root)
                .await
                .with_context(|| format!("failed to open file store at {}", root.display()))?;
            Ok(Arc::new(store))
        }
        "memory" => Ok(Arc::new(MemoryStore::new())),
        other => bail!(
            "unknown store backend {other:?} (expected postgres, file, or memory)"
        ),
    }
}
