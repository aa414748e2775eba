//! Path-aware access to catalog records.
//!
//! Both wrappers sit on the same [`CatalogStore`]; they differ only in how a
//! local absolute path becomes the string the catalog stores.
//! [`LocalCatalog`] keeps absolute paths; [`SharedCatalog`] stores canonical
//! keys so every machine can resolve them through its own mappings.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};

use crate::db::CatalogStore;
use crate::error::{Error, Result};
use crate::models::{CatalogEntry, MediaKind};
use crate::paths::{normalize_path, PathTranslator};

/// A catalog record together with where it lives on this machine.
#[derive(Debug, Clone)]
pub struct ResolvedEntry {
    pub entry: CatalogEntry,
    pub local_path: Option<PathBuf>,
}

/// A file about to be added to the catalog.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub content_hash: Option<String>,
    pub media_kind: MediaKind,
    pub upload_date: Option<NaiveDate>,
    pub download_date: Option<DateTime<Utc>>,
}

pub trait CatalogAccess {
    fn store(&self) -> &dyn CatalogStore;

    /// Local absolute path to stored form.
    fn encode_path(&self, path: &Path) -> Result<String>;

    /// Stored form to local absolute path, if this machine can express it.
    fn resolve_path(&self, stored: &str) -> Option<PathBuf>;

    fn resolved_entries(&self) -> Result<Vec<ResolvedEntry>> {
        Ok(self
            .store()
            .all_entries()?
            .into_iter()
            .map(|entry| {
                let local_path = self.resolve_path(&entry.path);
                ResolvedEntry { entry, local_path }
            })
            .collect())
    }

    fn insert_file(&self, file: &NewFile) -> Result<CatalogEntry> {
        let entry = CatalogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            filename: file_name_of(&file.path)?,
            content_hash: file.content_hash.clone(),
            path: self.encode_path(&file.path)?,
            size_bytes: file.size_bytes,
            linked: true,
            media_kind: file.media_kind,
            upload_date: file.upload_date,
            download_date: file.download_date,
            last_verified_at: Some(Utc::now()),
        };
        self.store().insert_entry(&entry)?;
        Ok(entry)
    }

    /// Points an existing record at a new local file and marks it linked.
    fn relocate(&self, id: &str, path: &Path) -> Result<String> {
        let stored = self.encode_path(path)?;
        let filename = file_name_of(path)?;
        if !self.store().update_entry_path(id, &stored, &filename)? {
            return Err(Error::ConflictDeleted { id: id.to_string() });
        }
        self.store().mark_linked(id, Utc::now())?;
        Ok(stored)
    }
}

pub struct LocalCatalog<'a> {
    store: &'a dyn CatalogStore,
}

impl<'a> LocalCatalog<'a> {
    pub fn new(store: &'a dyn CatalogStore) -> Self {
        Self { store }
    }
}

impl CatalogAccess for LocalCatalog<'_> {
    fn store(&self) -> &dyn CatalogStore {
        self.store
    }

    fn encode_path(&self, path: &Path) -> Result<String> {
        if !path.is_absolute() {
            return Err(Error::InvalidArgument(format!(
                "expected an absolute path: {}",
                path.display()
            )));
        }
        Ok(normalize_path(&path.to_string_lossy()))
    }

    fn resolve_path(&self, stored: &str) -> Option<PathBuf> {
        if PathTranslator::is_canonical(stored) {
            None
        } else {
            Some(PathBuf::from(stored))
        }
    }
}

pub struct SharedCatalog<'a> {
    store: &'a dyn CatalogStore,
    translator: &'a PathTranslator,
}

impl<'a> SharedCatalog<'a> {
    pub fn new(store: &'a dyn CatalogStore, translator: &'a PathTranslator) -> Self {
        Self { store, translator }
    }
}

impl CatalogAccess for SharedCatalog<'_> {
    fn store(&self) -> &dyn CatalogStore {
        self.store
    }

    fn encode_path(&self, path: &Path) -> Result<String> {
        self.translator.to_canonical(path)
    }

    fn resolve_path(&self, stored: &str) -> Option<PathBuf> {
        if PathTranslator::is_canonical(stored) {
            Some(self.translator.to_absolute(stored))
        } else {
            // Not migrated yet; usable only if this machine wrote it.
            Some(PathBuf::from(stored))
        }
    }
}

/// How a library stores paths, decided once when the library is opened.
#[derive(Debug, Clone)]
pub enum LibraryMode {
    Local,
    Shared(PathTranslator),
}

impl LibraryMode {
    pub fn access<'a>(&'a self, store: &'a dyn CatalogStore) -> Box<dyn CatalogAccess + 'a> {
        match self {
            LibraryMode::Local => Box::new(LocalCatalog::new(store)),
            LibraryMode::Shared(translator) => Box::new(SharedCatalog::new(store, translator)),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, LibraryMode::Shared(_))
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::InvalidArgument(format!("no file name in {}", path.display())))
}
