use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// One media item in the catalog.
///
/// `path` is whatever the catalog stores: a canonical key such as
/// `clips/2025-01-15/video.mp4` once the library is shared, or an absolute
/// path on catalogs that were never migrated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: String,
    pub filename: String,
    pub content_hash: Option<String>,
    pub path: String,
    pub size_bytes: u64,
    pub linked: bool,
    pub media_kind: MediaKind,
    /// Content creation date, usually derived from the folder or file name.
    pub upload_date: Option<NaiveDate>,
    /// When the file was acquired on disk.
    pub download_date: Option<DateTime<Utc>>,
    pub last_verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
    Image,
    Document,
    Other,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Image => "image",
            MediaKind::Document => "document",
            MediaKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            "image" => MediaKind::Image,
            "document" => MediaKind::Document,
            _ => MediaKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Enumerate,
    Fingerprint,
    Reconcile,
    Index,
    Match,
    Copy,
    Backup,
    Configure,
    Convert,
    Move,
    Validate,
    Finalize,
    Delete,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Enumerate => "enumerate",
            Phase::Fingerprint => "fingerprint",
            Phase::Reconcile => "reconcile",
            Phase::Index => "index",
            Phase::Match => "match",
            Phase::Copy => "copy",
            Phase::Backup => "backup",
            Phase::Configure => "configure",
            Phase::Convert => "convert",
            Phase::Move => "move",
            Phase::Validate => "validate",
            Phase::Finalize => "finalize",
            Phase::Delete => "delete",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload handed to progress callbacks of scan, relink and migrate.
#[derive(Debug, Clone)]
pub struct Progress {
    pub phase: Phase,
    pub current: u64,
    pub total: u64,
    pub message: String,
}

impl Progress {
    pub fn new(phase: Phase, current: u64, total: u64, message: impl Into<String>) -> Self {
        Self {
            phase,
            current,
            total,
            message: message.into(),
        }
    }
}

/// Callbacks fire at most once per this many items, plus once at each phase end.
pub const PROGRESS_INTERVAL: u64 = 50;

pub const MAX_REPORTED_ERRORS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
    pub phase: Phase,
    /// Entry id or file path the failure belongs to.
    pub target: String,
    pub message: String,
}

/// Per-item failures of a batch operation. Keeps the first
/// [`MAX_REPORTED_ERRORS`] and counts the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorLog {
    items: Vec<ItemError>,
    dropped: u64,
}

impl ErrorLog {
    pub fn push(&mut self, phase: Phase, target: impl Into<String>, message: impl fmt::Display) {
        if self.items.len() < MAX_REPORTED_ERRORS {
            self.items.push(ItemError {
                phase,
                target: target.into(),
                message: message.to_string(),
            });
        } else {
            self.dropped += 1;
        }
    }

    pub fn items(&self) -> &[ItemError] {
        &self.items
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn total(&self) -> u64 {
        self.items.len() as u64 + self.dropped
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.dropped == 0
    }
}

/// Uniform succeeded / skipped / failed view over every batch report.
pub trait BatchOutcome {
    fn succeeded(&self) -> u64;
    fn skipped(&self) -> u64;
    fn failed(&self) -> u64;
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub files_seen: u64,
    pub new: u64,
    pub moved: u64,
    pub missing: u64,
    pub verified: u64,
    pub duplicates: u64,
    pub ignored: u64,
    pub dry_run: bool,
    pub errors: ErrorLog,
}

impl BatchOutcome for ScanReport {
    fn succeeded(&self) -> u64 {
        self.new + self.moved + self.verified
    }

    fn skipped(&self) -> u64 {
        self.duplicates + self.ignored + self.missing
    }

    fn failed(&self) -> u64 {
        self.errors.total()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmatchedEntry {
    pub id: String,
    pub filename: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelinkReport {
    pub total: u64,
    pub matched_by_hash: u64,
    /// Filename-only matches; content may differ.
    pub matched_by_filename: u64,
    pub copied: u64,
    pub already_linked: u64,
    pub unmatched: Vec<UnmatchedEntry>,
    pub dry_run: bool,
    pub errors: ErrorLog,
}

impl BatchOutcome for RelinkReport {
    fn succeeded(&self) -> u64 {
        self.matched_by_hash + self.matched_by_filename + self.copied
    }

    fn skipped(&self) -> u64 {
        self.already_linked + self.unmatched.len() as u64
    }

    fn failed(&self) -> u64 {
        self.errors.total()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationCounts {
    pub valid: u64,
    /// Stored path could not be translated on this machine.
    pub invalid: u64,
    /// Translated fine but nothing exists there.
    pub missing: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDeleteReport {
    pub deleted: u64,
    pub already_absent: u64,
    pub errors: ErrorLog,
}

impl BatchOutcome for BatchDeleteReport {
    fn succeeded(&self) -> u64 {
        self.deleted
    }

    fn skipped(&self) -> u64 {
        self.already_absent
    }

    fn failed(&self) -> u64 {
        self.errors.total()
    }
}
