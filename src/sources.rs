//! Registered folder sources for [`Engine::scan_all`](crate::Engine::scan_all).
//!
//! A source is a folder with its own `enabled` and `recursive` flags. After
//! a scan has processed every file of a source, the registry records when
//! that happened and how many files it holds (indexed plus unchanged).

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use knowledge_engine_core::{EngineError, Result};
use serde::Serialize;
use tracing::info;

use crate::scan::ScanRoot;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FolderSource {
    /// Canonical path of the folder.
    pub path: PathBuf,
    pub enabled: bool,
    pub recursive: bool,
    pub last_scan: Option<DateTime<Utc>>,
    pub file_count: usize,
}

#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: RwLock<Vec<FolderSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing folder, enabled.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidInput`] when the path is missing, not a
    /// directory, or already registered.
    pub fn add(&self, path: impl AsRef<Path>, recursive: bool) -> Result<FolderSource> {
        let path = path.as_ref();
        let canonical = std::fs::canonicalize(path).map_err(|e| {
            EngineError::InvalidInput(format!("cannot add {}: {e}", path.display()))
        })?;
        if !canonical.is_dir() {
            return Err(EngineError::InvalidInput(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        if sources.iter().any(|s| s.path == canonical) {
            return Err(EngineError::InvalidInput(format!(
                "folder already added: {}",
                canonical.display()
            )));
        }
        let source = FolderSource {
            path: canonical,
            enabled: true,
            recursive,
            last_scan: None,
            file_count: 0,
        };
        sources.push(source.clone());
        info!(path = %source.path.display(), recursive, "folder source added");
        Ok(source)
    }

    /// Change the flags of a registered folder. `None` leaves a flag as is.
    pub fn update(
        &self,
        path: impl AsRef<Path>,
        enabled: Option<bool>,
        recursive: Option<bool>,
    ) -> Result<FolderSource> {
        let key = lookup_key(path.as_ref());
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        let source = sources
            .iter_mut()
            .find(|s| s.path == key)
            .ok_or_else(|| EngineError::NotFound(format!("folder source {}", key.display())))?;
        if let Some(enabled) = enabled {
            source.enabled = enabled;
        }
        if let Some(recursive) = recursive {
            source.recursive = recursive;
        }
        Ok(source.clone())
    }

    /// Unregister a folder. Its documents stay indexed.
    pub fn remove(&self, path: impl AsRef<Path>) -> bool {
        let key = lookup_key(path.as_ref());
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        let before = sources.len();
        sources.retain(|s| s.path != key);
        sources.len() != before
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<FolderSource> {
        let key = lookup_key(path.as_ref());
        self.list().into_iter().find(|s| s.path == key)
    }

    pub fn list(&self) -> Vec<FolderSource> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn enabled_roots(&self) -> Vec<ScanRoot> {
        self.list()
            .into_iter()
            .filter(|s| s.enabled)
            .map(|s| ScanRoot {
                path: s.path,
                recursive: s.recursive,
            })
            .collect()
    }

    /// Record a finished pass over `path`. Unregistered paths are ignored.
    pub(crate) fn record_scan(&self, path: &Path, file_count: usize) {
        let key = lookup_key(path);
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(source) = sources.iter_mut().find(|s| s.path == key) {
            source.last_scan = Some(Utc::now());
            source.file_count = file_count;
        }
    }
}

/// Registered paths are canonical; a folder deleted since then no longer
/// canonicalizes, so fall back to the path as given.
fn lookup_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_rejects_missing_duplicate_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SourceRegistry::new();

        let added = registry.add(dir.path(), true).unwrap();
        assert!(added.enabled);
        assert_eq!(added.file_count, 0);
        assert!(added.last_scan.is_none());

        assert!(matches!(
            registry.add(dir.path(), false),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(registry.add(dir.path().join("missing"), true).is_err());

        let file = dir.path().join("note.md");
        std::fs::write(&file, "x").unwrap();
        assert!(registry.add(&file, true).is_err());
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_update_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SourceRegistry::new();
        registry.add(dir.path(), true).unwrap();

        let updated = registry.update(dir.path(), Some(false), None).unwrap();
        assert!(!updated.enabled);
        assert!(updated.recursive);
        assert!(registry.enabled_roots().is_empty());

        assert!(matches!(
            registry.update(dir.path().join("other"), Some(true), None),
            Err(EngineError::NotFound(_))
        ));

        assert!(registry.remove(dir.path()));
        assert!(!registry.remove(dir.path()));
        assert!(registry.get(dir.path()).is_none());
    }

    #[test]
    fn test_record_scan_sets_count_and_time() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SourceRegistry::new();
        let source = registry.add(dir.path(), true).unwrap();

        registry.record_scan(&source.path, 7);
        let after = registry.get(dir.path()).unwrap();
        assert_eq!(after.file_count, 7);
        assert!(after.last_scan.is_some());
    }
}
