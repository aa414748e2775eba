use crate::db::CatalogStore;
use crate::error::{Error, Result};
use crate::models::CatalogEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Someone else removed it first.
    AlreadyAbsent,
}

#[derive(Debug, Clone, Default)]
pub struct BatchValidation {
    pub valid: Vec<CatalogEntry>,
    pub conflicts: Vec<String>,
}

impl BatchValidation {
    pub fn valid_ids(&self) -> impl Iterator<Item = &str> {
        self.valid.iter().map(|e| e.id.as_str())
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Checks that records a caller read earlier still exist in the freshly
/// pulled catalog. An absent record means another machine deleted it.
pub struct ConflictGuard<'a> {
    store: &'a dyn CatalogStore,
}

impl<'a> ConflictGuard<'a> {
    pub fn new(store: &'a dyn CatalogStore) -> Self {
        Self { store }
    }

    pub fn ensure_exists(&self, id: &str) -> Result<CatalogEntry> {
        self.store.get_entry(id)?.ok_or_else(|| {
            tracing::info!(id, "entry vanished since last read");
            Error::ConflictDeleted { id: id.to_string() }
        })
    }

    pub fn safe_delete(&self, id: &str) -> Result<DeleteOutcome> {
        if self.store.delete_entry(id)? {
            Ok(DeleteOutcome::Deleted)
        } else {
            tracing::debug!(id, "delete of absent entry ignored");
            Ok(DeleteOutcome::AlreadyAbsent)
        }
    }

    pub fn validate_batch<S: AsRef<str>>(&self, ids: &[S]) -> Result<BatchValidation> {
        let mut out = BatchValidation::default();
        for id in ids {
            let id = id.as_ref();
            match self.store.get_entry(id)? {
                Some(entry) => out.valid.push(entry),
                None => out.conflicts.push(id.to_string()),
            }
        }
        if out.has_conflicts() {
            tracing::info!(
                valid = out.valid.len(),
                conflicts = out.conflicts.len(),
                "batch targets deleted elsewhere"
            );
        }
        Ok(out)
    }
}
