//! External Libraries
//!
//! Libraries callable through the externalCallLib operation. A library
//! exposes `sum` and `find`; resolution from a path goes through a
//! [`LibraryResolver`].

use dashmap::DashMap;
use log::{debug, info};
use std::sync::Arc;

use super::{NativeError, NativeErrorKind};

/// Functions an external library must export
pub trait ExternalLibrary: Send + Sync {
    fn sum(&self, a: u64, b: u64) -> u64;

    /// First line containing `target`
    fn find(&self, lines: &[String], target: &str) -> Option<String>;
}

/// Maps a library path to a loaded library
pub trait LibraryResolver: Send + Sync {
    fn resolve(&self, path: &str) -> Result<Arc<dyn ExternalLibrary>, NativeError>;
}

/// Library shipped with the engine; behaves like the reference plugin
#[derive(Debug, Default, Clone, Copy)]
pub struct BundledPlugin;

impl ExternalLibrary for BundledPlugin {
    fn sum(&self, a: u64, b: u64) -> u64 {
        a.saturating_add(b)
    }

    fn find(&self, lines: &[String], target: &str) -> Option<String> {
        lines.iter().find(|line| line.contains(target)).cloned()
    }
}

/// In-memory registry of libraries (path -> library)
pub struct LibraryRegistry {
    libraries: Arc<DashMap<String, Arc<dyn ExternalLibrary>>>,
}

impl LibraryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            libraries: Arc::new(DashMap::new()),
        }
    }

    /// Registry with [`BundledPlugin`] available under `path`
    pub fn with_bundled(path: impl Into<String>) -> Self {
        let registry = Self::new();
        registry.register(path, Arc::new(BundledPlugin));
        registry
    }

    /// Register a library under a path, replacing any previous one
    pub fn register(&self, path: impl Into<String>, library: Arc<dyn ExternalLibrary>) {
        let path = path.into();
        info!("Registered external library: {}", path);
        self.libraries.insert(path, library);
    }

    /// Remove a library
    pub fn unregister(&self, path: &str) -> bool {
        self.libraries.remove(path).is_some()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.libraries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.libraries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LibraryResolver for LibraryRegistry {
    fn resolve(&self, path: &str) -> Result<Arc<dyn ExternalLibrary>, NativeError> {
        debug!("Resolving external library: {}", path);
        self.libraries
            .get(path)
            .map(|lib| lib.value().clone())
            .ok_or_else(|| {
                NativeError::error(
                    NativeErrorKind::FileNotFound,
                    format!("Fail to load lib: {} isn't registered", path),
                )
            })
    }
}
