//! Picking a storage engine by name.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::engine::StorageEngine;
use crate::local::LocalEngine;
use crate::memory::MemoryEngine;
use sehatlink_common::{Error, Result};

/// Engine names accepted in configuration.
pub const ENGINE_NAMES: &[&str] = &["local", "memory"];

/// A storage engine selected from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineChoice {
    /// Nothing survives a restart.
    Memory,
    /// One JSON file per table under `root`.
    Local { root: PathBuf },
}

impl EngineChoice {
    /// Resolve an engine name. `root` is only used by `local`.
    ///
    /// # Errors
    /// - `Config` if the name is not one of [`ENGINE_NAMES`]
    pub fn from_name(name: &str, root: &Path) -> Result<Self> {
        match name {
            "memory" => Ok(EngineChoice::Memory),
            "local" => Ok(EngineChoice::Local {
                root: root.to_path_buf(),
            }),
            other => Err(Error::Config(format!(
                "Unknown storage engine '{}', expected one of: {}",
                other,
                ENGINE_NAMES.join(", ")
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EngineChoice::Memory => "memory",
            EngineChoice::Local { .. } => "local",
        }
    }

    pub fn is_persistent(&self) -> bool {
        !matches!(self, EngineChoice::Memory)
    }

    /// Construct the engine. A local root that cannot be created fails here
    /// with `StorageUnavailable`.
    pub fn open(&self) -> Result<Arc<dyn StorageEngine>> {
        match self {
            EngineChoice::Memory => Ok(Arc::new(MemoryEngine::new())),
            EngineChoice::Local { root } => Ok(Arc::new(LocalEngine::new(root)?)),
        }
    }
}
