use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::SystemTime;

use chrono::{DateTime, NaiveDate, Utc};
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::catalog::{CatalogAccess, LibraryMode, NewFile, ResolvedEntry};
use crate::db::CatalogStore;
use crate::error::{Error, Result};
use crate::hash::Fingerprinter;
use crate::ignore::IgnoreList;
use crate::models::{
    CatalogEntry, ErrorLog, MediaKind, Phase, Progress, ScanReport, PROGRESS_INTERVAL,
};
use crate::paths::{is_within, normalize_path};
use crate::sync::LockCoordinator;

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub root: PathBuf,
    pub ignore: IgnoreList,
    pub fingerprinter: Fingerprinter,
    pub dry_run: bool,
}

impl ScanConfig {
    pub fn for_folder(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ignore: IgnoreList::default(),
            fingerprinter: Fingerprinter::default(),
            dry_run: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A fingerprinted file found under the scanned root.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub filename: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub date_hint: Option<NaiveDate>,
    pub media_kind: MediaKind,
    pub content_hash: String,
}

impl ScannedFile {
    fn to_new_file(&self) -> NewFile {
        NewFile {
            path: self.path.clone(),
            size_bytes: self.size_bytes,
            content_hash: Some(self.content_hash.clone()),
            media_kind: self.media_kind,
            upload_date: self.date_hint,
            download_date: self.modified_at,
        }
    }
}

/// Filesystem side of a scan, gathered without holding the catalog lock.
/// `files` is sorted by path, which decides every first-match tie-break.
#[derive(Debug, Clone, Default)]
pub struct Survey {
    pub root: PathBuf,
    pub files: Vec<ScannedFile>,
    pub files_seen: u64,
    pub ignored: u64,
    pub errors: ErrorLog,
}

struct Candidate {
    path: PathBuf,
    size: u64,
    modified: Option<SystemTime>,
}

/// Enumerates and fingerprints everything under `config.root`. Unreadable
/// files are recorded in `errors` and left out of `files`.
pub fn survey<F>(config: &ScanConfig, cancel: Option<&CancelToken>, mut on_progress: F) -> Result<Survey>
where
    F: FnMut(&Progress),
{
    if !config.root.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "root is not a directory: {}",
            config.root.to_string_lossy()
        )));
    }

    let mut survey = Survey {
        root: config.root.clone(),
        ..Survey::default()
    };
    let mut candidates = Vec::new();

    for entry in WalkDir::new(&config.root).follow_links(false).into_iter() {
        check_cancel(cancel)?;

        let entry = match entry {
            Ok(v) => v,
            Err(err) => {
                let target = err
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                survey.errors.push(Phase::Enumerate, target, &err);
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }
        if config.ignore.is_ignored(&config.root, entry.path()) {
            survey.ignored += 1;
            continue;
        }

        survey.files_seen += 1;
        match entry.metadata() {
            Ok(md) => candidates.push(Candidate {
                path: entry.path().to_path_buf(),
                size: md.len(),
                modified: md.modified().ok(),
            }),
            Err(err) => survey
                .errors
                .push(Phase::Enumerate, entry.path().display().to_string(), &err),
        }

        if survey.files_seen % PROGRESS_INTERVAL == 0 {
            on_progress(&Progress::new(
                Phase::Enumerate,
                survey.files_seen,
                0,
                entry.path().display().to_string(),
            ));
        }
    }

    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    on_progress(&Progress::new(
        Phase::Enumerate,
        survey.files_seen,
        survey.files_seen,
        format!("found {} files", survey.files_seen),
    ));

    let total = candidates.len() as u64;
    let mut done = 0u64;
    for chunk in candidates.chunks(PROGRESS_INTERVAL as usize) {
        check_cancel(cancel)?;

        let hashed: Vec<_> = chunk
            .par_iter()
            .map(|c| {
                (
                    config.fingerprinter.fingerprint(&c.path, Some(c.size)),
                    detect_media_kind(&c.path),
                )
            })
            .collect();

        for (c, (hash, media_kind)) in chunk.iter().zip(hashed) {
            match hash {
                Ok(content_hash) => survey.files.push(ScannedFile {
                    filename: c
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default(),
                    size_bytes: c.size,
                    modified_at: c.modified.map(DateTime::<Utc>::from),
                    date_hint: parse_date_hint(&c.path),
                    media_kind,
                    content_hash,
                    path: c.path.clone(),
                }),
                Err(err) => {
                    tracing::warn!(path = %c.path.display(), %err, "skipping unreadable file");
                    survey
                        .errors
                        .push(Phase::Fingerprint, c.path.display().to_string(), &err);
                }
            }
        }

        done += chunk.len() as u64;
        on_progress(&Progress::new(
            Phase::Fingerprint,
            done,
            total,
            format!("fingerprinted {done} of {total}"),
        ));
    }

    tracing::debug!(
        root = %config.root.display(),
        files = survey.files.len(),
        ignored = survey.ignored,
        errors = survey.errors.total(),
        "survey finished"
    );
    Ok(survey)
}

/// Applies a survey to the catalog:
/// entries still at their path are refreshed, entries whose fingerprint shows
/// up elsewhere are moved, the rest are flagged unlinked, and files matching
/// no entry are inserted. With `dry_run` nothing is written but the counts are
/// the same.
pub fn reconcile<F>(
    survey: &Survey,
    catalog: &dyn CatalogAccess,
    dry_run: bool,
    mut on_progress: F,
) -> Result<ScanReport>
where
    F: FnMut(&Progress),
{
    let mut report = ScanReport {
        files_seen: survey.files_seen,
        ignored: survey.ignored,
        dry_run,
        errors: survey.errors.clone(),
        ..ScanReport::default()
    };

    let files = &survey.files;
    let entries = catalog.resolved_entries()?;
    let total = entries.len() as u64;
    let root = normalize_path(&survey.root.to_string_lossy());
    let now = Utc::now();

    let by_path: HashMap<String, usize> = files
        .iter()
        .enumerate()
        .map(|(i, f)| (normalize_path(&f.path.to_string_lossy()), i))
        .collect();
    let mut by_hash: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, f) in files.iter().enumerate() {
        by_hash.entry(f.content_hash.as_str()).or_default().push(i);
    }
    let mut claimed = vec![false; files.len()];

    // Path matches go first so a move can never take a file that is some
    // other entry's current location.
    let mut pending: Vec<&ResolvedEntry> = Vec::new();
    for (n, resolved) in entries.iter().enumerate() {
        let hit = resolved
            .local_path
            .as_ref()
            .and_then(|p| by_path.get(&normalize_path(&p.to_string_lossy())))
            .copied();
        match hit {
            Some(idx) => {
                claimed[idx] = true;
                let applied = unless_dry(dry_run, || {
                    refresh_verified(catalog.store(), &resolved.entry, &files[idx], now)
                });
                match applied {
                    Ok(()) => report.verified += 1,
                    Err(err) => report.errors.push(Phase::Reconcile, &resolved.entry.id, err),
                }
            }
            None => pending.push(resolved),
        }
        report_every(&mut on_progress, n as u64 + 1, total);
    }

    for resolved in pending {
        let entry = &resolved.entry;
        if !in_scope(resolved, &root) {
            continue;
        }
        // Still there but not enumerated: ignored, a symlink, or unreadable.
        if resolved.local_path.as_deref().is_some_and(Path::exists) {
            tracing::debug!(id = %entry.id, path = %entry.path, "entry present but not surveyed");
            let applied = unless_dry(dry_run || entry.linked, || {
                catalog.store().mark_linked(&entry.id, now).map(|_| ())
            });
            match applied {
                Ok(()) => report.verified += 1,
                Err(err) => report.errors.push(Phase::Reconcile, &entry.id, err),
            }
            continue;
        }

        let moved_to = entry
            .content_hash
            .as_deref()
            .and_then(|h| by_hash.get(h))
            .and_then(|candidates| candidates.iter().copied().find(|&i| !claimed[i]));

        match moved_to {
            Some(idx) => {
                claimed[idx] = true;
                let to = &files[idx].path;
                tracing::info!(id = %entry.id, from = %entry.path, to = %to.display(), "entry moved");
                match unless_dry(dry_run, || catalog.relocate(&entry.id, to).map(|_| ())) {
                    Ok(()) => report.moved += 1,
                    Err(err) => report.errors.push(Phase::Reconcile, &entry.id, err),
                }
            }
            None => {
                tracing::debug!(id = %entry.id, path = %entry.path, "entry missing");
                let applied = unless_dry(dry_run || !entry.linked, || {
                    catalog.store().mark_unlinked(&entry.id).map(|_| ())
                });
                match applied {
                    Ok(()) => report.missing += 1,
                    Err(err) => report.errors.push(Phase::Reconcile, &entry.id, err),
                }
            }
        }
    }

    let mut known: HashSet<String> = entries
        .iter()
        .filter_map(|r| r.entry.content_hash.clone())
        .collect();
    for (idx, file) in files.iter().enumerate() {
        if claimed[idx] {
            continue;
        }
        if known.contains(&file.content_hash) {
            tracing::debug!(path = %file.path.display(), "duplicate content, not inserted");
            report.duplicates += 1;
            continue;
        }

        let inserted = if dry_run {
            catalog.encode_path(&file.path).map(|_| ())
        } else {
            catalog.insert_file(&file.to_new_file()).map(|_| ())
        };
        match inserted {
            Ok(()) => {
                known.insert(file.content_hash.clone());
                report.new += 1;
            }
            Err(err) => report
                .errors
                .push(Phase::Reconcile, file.path.display().to_string(), err),
        }
    }

    on_progress(&Progress::new(
        Phase::Reconcile,
        total,
        total,
        format!(
            "{} new, {} moved, {} missing",
            report.new, report.moved, report.missing
        ),
    ));
    Ok(report)
}

/// Full scan: survey without the lock, then reconcile under it. Dry runs only
/// read a snapshot and never take the lock.
pub fn scan_library<F>(
    config: &ScanConfig,
    coordinator: &LockCoordinator,
    mode: &LibraryMode,
    cancel: Option<&CancelToken>,
    mut on_progress: F,
) -> Result<ScanReport>
where
    F: FnMut(&Progress),
{
    let survey = survey(config, cancel, &mut on_progress)?;

    let apply = |store: &dyn CatalogStore| {
        let access = mode.access(store);
        reconcile(&survey, access.as_ref(), config.dry_run, &mut on_progress)
    };
    let report = if config.dry_run {
        coordinator.read_snapshot(apply)?
    } else {
        coordinator.with_lock(apply)?
    };

    tracing::info!(
        root = %config.root.display(),
        new = report.new,
        moved = report.moved,
        missing = report.missing,
        verified = report.verified,
        duplicates = report.duplicates,
        errors = report.errors.total(),
        dry_run = report.dry_run,
        "scan finished"
    );
    Ok(report)
}

pub fn scan(
    config: &ScanConfig,
    coordinator: &LockCoordinator,
    mode: &LibraryMode,
) -> Result<ScanReport> {
    scan_library(config, coordinator, mode, None, |_| {})
}

/// `YYYY-MM-DD` prefix of the file name, else of the parent directory name.
pub fn parse_date_hint(path: &Path) -> Option<NaiveDate> {
    let from_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(date_prefix);
    from_name.or_else(|| {
        path.parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .and_then(date_prefix)
    })
}

fn date_prefix(s: &str) -> Option<NaiveDate> {
    let head = s.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

pub fn detect_media_kind(path: &Path) -> MediaKind {
    if let Ok(Some(kind)) = infer::get_from_path(path) {
        match kind.matcher_type() {
            infer::MatcherType::Video => return MediaKind::Video,
            infer::MatcherType::Audio => return MediaKind::Audio,
            infer::MatcherType::Image => return MediaKind::Image,
            infer::MatcherType::Doc | infer::MatcherType::Book | infer::MatcherType::Text => {
                return MediaKind::Document
            }
            _ => {}
        }
    }
    kind_from_extension(path)
}

fn kind_from_extension(path: &Path) -> MediaKind {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "mov" | "m4v" | "mkv" | "webm" | "avi" | "mts" | "m2ts" | "wmv" | "flv" => {
            MediaKind::Video
        }
        "mp3" | "wav" | "aac" | "m4a" | "flac" | "ogg" | "opus" | "aiff" => MediaKind::Audio,
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "heic" | "tif" | "tiff" => MediaKind::Image,
        "pdf" | "txt" | "md" | "doc" | "docx" | "srt" | "vtt" | "rtf" | "epub" => {
            MediaKind::Document
        }
        _ => MediaKind::Other,
    }
}

fn refresh_verified(
    store: &dyn CatalogStore,
    entry: &CatalogEntry,
    file: &ScannedFile,
    now: DateTime<Utc>,
) -> Result<()> {
    if entry.content_hash.as_deref() != Some(file.content_hash.as_str())
        || entry.size_bytes != file.size_bytes
    {
        tracing::debug!(id = %entry.id, "content changed in place, updating fingerprint");
        store.update_fingerprint(&entry.id, &file.content_hash, file.size_bytes)?;
    }
    store.mark_linked(&entry.id, now)?;
    Ok(())
}

/// Entries that resolve outside the scanned root and still exist belong to
/// another root and are left alone.
fn in_scope(resolved: &ResolvedEntry, root: &str) -> bool {
    match &resolved.local_path {
        None => true,
        Some(p) => is_within(&normalize_path(&p.to_string_lossy()), root) || !p.exists(),
    }
}

fn unless_dry<F>(dry_run: bool, apply: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    if dry_run {
        Ok(())
    } else {
        apply()
    }
}

fn report_every<F: FnMut(&Progress)>(on_progress: &mut F, current: u64, total: u64) {
    if current % PROGRESS_INTERVAL == 0 {
        on_progress(&Progress::new(
            Phase::Reconcile,
            current,
            total,
            format!("checked {current} of {total} entries"),
        ));
    }
}

fn check_cancel(cancel: Option<&CancelToken>) -> Result<()> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(Error::Cancelled),
        _ => Ok(()),
    }
}
