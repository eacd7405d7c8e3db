use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;

use crate::{
    backends::{FileBackingStore, MemoryBackingStore},
    r#trait::BackingStore,
};

/// Where queue entries are kept.
///
/// Each queue gets its own store: a subdirectory of the spool path for file
/// spools, or a separate map for memory spools.
///
/// File spool in RON config:
/// ```ron
/// spool: (
///     type: "File",
///     path: "/var/spool/tern",
///     max_entries: 2000,
/// ),
/// ```
///
/// Memory spool:
/// ```ron
/// spool: (
///     type: "Memory",
///     capacity: 1000,
/// ),
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum SpoolConfig {
    File(FileBackingStore),
    Memory(MemoryConfig),
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryConfig {
    /// Maximum number of entries per queue (omit for unlimited)
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self::File(FileBackingStore::default())
    }
}

impl SpoolConfig {
    pub fn path(&self) -> Option<PathBuf> {
        match self {
            Self::File(store) => Some(store.path().to_path_buf()),
            Self::Memory(_) => None,
        }
    }

    /// Open the store for the named queue, creating and cleaning it as needed.
    pub fn open(&self, queue: &str) -> crate::Result<Arc<dyn BackingStore>> {
        match self {
            Self::File(root) => {
                let store = root.queue(queue);
                store.init()?;
                Ok(Arc::new(store))
            }
            Self::Memory(config) => Ok(config.capacity.map_or_else(
                || Arc::new(MemoryBackingStore::new()) as Arc<dyn BackingStore>,
                |capacity| Arc::new(MemoryBackingStore::with_capacity(capacity)),
            )),
        }
    }
}
