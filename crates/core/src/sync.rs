//! Pull-execute-push around the shared catalog file.

use std::path::{Path, PathBuf};

use crate::conflict::{BatchValidation, ConflictGuard, DeleteOutcome};
use crate::db::{CatalogStore, SqliteCatalog};
use crate::error::Result;
use crate::lock::{FileLock, LockOptions, LockStatus};
use crate::models::{BatchDeleteReport, CatalogEntry, Phase};

enum Backend {
    /// Single machine: the catalog file is opened directly and every call
    /// runs against it with no locking or copying.
    Local(SqliteCatalog),
    Shared(FileLock),
}

pub struct LockCoordinator {
    catalog_path: PathBuf,
    backend: Backend,
}

impl LockCoordinator {
    pub fn local(catalog_path: impl Into<PathBuf>) -> Result<Self> {
        let catalog_path = catalog_path.into();
        let catalog = SqliteCatalog::open(&catalog_path)?;
        Ok(Self {
            catalog_path,
            backend: Backend::Local(catalog),
        })
    }

    pub fn shared(
        catalog_path: impl Into<PathBuf>,
        computer_id: impl Into<String>,
        options: LockOptions,
    ) -> Self {
        let catalog_path = catalog_path.into();
        let lock = FileLock::for_catalog(&catalog_path, computer_id, options);
        Self {
            catalog_path,
            backend: Backend::Shared(lock),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backend, Backend::Shared(_))
    }

    pub fn catalog_path(&self) -> &Path {
        &self.catalog_path
    }

    /// Runs `op` with exclusive access to the latest committed catalog.
    ///
    /// Shared mode: lock, pull a fresh copy, run `op`, push the copy back with
    /// an atomic rename, unlock. A failing `op` skips the push, so the shared
    /// file is left exactly as it was. The lock is released on every path.
    pub fn with_lock<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&dyn CatalogStore) -> Result<T>,
    {
        let lock = match &self.backend {
            Backend::Local(catalog) => return op(catalog),
            Backend::Shared(lock) => lock,
        };

        let handle = lock.acquire()?;
        let outcome = (|| -> Result<T> {
            let catalog = SqliteCatalog::load_snapshot(&self.catalog_path)?;
            let value = op(&catalog)?;
            if catalog.has_changes()? {
                // Fails when the lock was reclaimed under us; nothing is pushed.
                handle.refresh()?;
                catalog.save_snapshot(&self.catalog_path)?;
                tracing::debug!(catalog = %self.catalog_path.display(), "pushed catalog");
            } else {
                tracing::debug!(catalog = %self.catalog_path.display(), "nothing to push");
            }
            Ok(value)
        })();

        if let Err(err) = handle.release() {
            tracing::warn!(catalog = %self.catalog_path.display(), %err, "lock release failed");
        }
        outcome
    }

    /// Read-only view of the latest committed catalog, without taking the lock.
    /// Changes made by `op` are discarded in shared mode.
    pub fn read_snapshot<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&dyn CatalogStore) -> Result<T>,
    {
        match &self.backend {
            Backend::Local(catalog) => op(catalog),
            Backend::Shared(_) => {
                let catalog = SqliteCatalog::load_snapshot(&self.catalog_path)?;
                op(&catalog)
            }
        }
    }

    /// Like [`with_lock`](Self::with_lock) for a single record; fails with
    /// `ConflictDeleted` when the record is gone after the pull.
    pub fn with_entry<T, F>(&self, id: &str, op: F) -> Result<T>
    where
        F: FnOnce(&dyn CatalogStore, CatalogEntry) -> Result<T>,
    {
        self.with_lock(|store| {
            let entry = ConflictGuard::new(store).ensure_exists(id)?;
            op(store, entry)
        })
    }

    /// `op` gets the records that still exist and the ids that do not.
    pub fn with_batch<T, F, S>(&self, ids: &[S], op: F) -> Result<T>
    where
        F: FnOnce(&dyn CatalogStore, &BatchValidation) -> Result<T>,
        S: AsRef<str>,
    {
        self.with_lock(|store| {
            let validation = ConflictGuard::new(store).validate_batch(ids)?;
            op(store, &validation)
        })
    }

    pub fn delete_entries<S: AsRef<str>>(&self, ids: &[S]) -> Result<BatchDeleteReport> {
        self.with_lock(|store| {
            let guard = ConflictGuard::new(store);
            let mut report = BatchDeleteReport::default();
            for id in ids {
                let id = id.as_ref();
                match guard.safe_delete(id) {
                    Ok(DeleteOutcome::Deleted) => report.deleted += 1,
                    Ok(DeleteOutcome::AlreadyAbsent) => report.already_absent += 1,
                    Err(err) => report.errors.push(Phase::Delete, id, err),
                }
            }
            tracing::info!(
                deleted = report.deleted,
                already_absent = report.already_absent,
                failed = report.errors.total(),
                "batch delete finished"
            );
            Ok(report)
        })
    }

    /// Creates an empty catalog when none exists yet, under the lock so two
    /// machines bootstrapping at once cannot overwrite each other. Returns
    /// whether a file was created.
    pub fn ensure_catalog(&self) -> Result<bool> {
        let lock = match &self.backend {
            Backend::Local(_) => return Ok(false),
            Backend::Shared(lock) => lock,
        };
        if self.catalog_path.is_file() {
            return Ok(false);
        }

        let handle = lock.acquire()?;
        let outcome = (|| -> Result<bool> {
            if self.catalog_path.is_file() {
                return Ok(false);
            }
            if let Some(parent) = self.catalog_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            handle.refresh()?;
            SqliteCatalog::open_in_memory()?.save_snapshot(&self.catalog_path)?;
            tracing::info!(catalog = %self.catalog_path.display(), "created empty shared catalog");
            Ok(true)
        })();
        if let Err(err) = handle.release() {
            tracing::warn!(catalog = %self.catalog_path.display(), %err, "lock release failed");
        }
        outcome
    }

    /// Current holder of the shared lock, if any. Always `None` locally.
    pub fn lock_status(&self) -> Result<Option<LockStatus>> {
        match &self.backend {
            Backend::Local(_) => Ok(None),
            Backend::Shared(lock) => lock.status(),
        }
    }
}
