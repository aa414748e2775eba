//! Repairs catalog-to-file links after files were moved in bulk.
//!
//! Matching order per entry: fingerprint, then file name (degraded: different
//! content can share a name), then optionally copying the entry's current
//! file into the target root. Entries nothing matches are reported, never
//! deleted.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::atomic::copy_atomic;
use crate::catalog::{LibraryMode, ResolvedEntry};
use crate::error::{Error, Result};
use crate::hash::Fingerprinter;
use crate::ignore::IgnoreList;
use crate::models::{
    CatalogEntry, ErrorLog, Phase, Progress, RelinkReport, UnmatchedEntry, PROGRESS_INTERVAL,
};
use crate::paths::{normalize_path, PathTranslator};
use crate::scan::{survey, CancelToken, ScanConfig, Survey};
use crate::sync::LockCoordinator;

#[derive(Debug, Clone)]
pub struct RelinkOptions {
    pub dry_run: bool,
    pub copy_missing_files: bool,
    pub ignore: IgnoreList,
    pub fingerprinter: Fingerprinter,
}

impl Default for RelinkOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            copy_missing_files: false,
            ignore: IgnoreList::default(),
            fingerprinter: Fingerprinter::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Fingerprint,
    Filename,
    Copied,
}

#[derive(Debug, Clone)]
pub struct RelinkAction {
    pub id: String,
    pub target: PathBuf,
    pub kind: MatchKind,
    pub copy_from: Option<PathBuf>,
}

enum Decision {
    AlreadyLinked,
    Act(RelinkAction),
    Unmatched,
}

/// Fingerprint and file name lookups over a target root. When several files
/// qualify, the one first in path order wins.
#[derive(Debug, Clone, Default)]
pub struct TargetIndex {
    root: PathBuf,
    by_hash: HashMap<String, PathBuf>,
    by_name: HashMap<String, PathBuf>,
    files: usize,
    errors: ErrorLog,
}

impl TargetIndex {
    pub fn build<F>(
        root: &Path,
        options: &RelinkOptions,
        cancel: Option<&CancelToken>,
        on_progress: F,
    ) -> Result<Self>
    where
        F: FnMut(&Progress),
    {
        let config = ScanConfig {
            root: root.to_path_buf(),
            ignore: options.ignore.clone(),
            fingerprinter: options.fingerprinter,
            dry_run: true,
        };
        Ok(Self::from_survey(survey(&config, cancel, on_progress)?))
    }

    pub fn from_survey(survey: Survey) -> Self {
        let mut index = TargetIndex {
            root: survey.root,
            files: survey.files.len(),
            errors: survey.errors,
            ..TargetIndex::default()
        };
        for file in survey.files {
            index
                .by_name
                .entry(file.filename.clone())
                .or_insert_with(|| file.path.clone());
            index.by_hash.entry(file.content_hash).or_insert(file.path);
        }
        index
    }

    pub fn by_fingerprint(&self, hash: &str) -> Option<&Path> {
        self.by_hash.get(hash).map(PathBuf::as_path)
    }

    pub fn by_filename(&self, name: &str) -> Option<&Path> {
        self.by_name.get(name).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files == 0
    }
}

pub fn relink<F>(
    target_root: &Path,
    coordinator: &LockCoordinator,
    mode: &LibraryMode,
    options: &RelinkOptions,
    cancel: Option<&CancelToken>,
    mut on_progress: F,
) -> Result<RelinkReport>
where
    F: FnMut(&Progress),
{
    let index = TargetIndex::build(target_root, options, cancel, &mut on_progress)?;
    let entries = coordinator.read_snapshot(|store| mode.access(store).resolved_entries())?;

    let mut report = RelinkReport {
        total: entries.len() as u64,
        dry_run: options.dry_run,
        errors: index.errors.clone(),
        ..RelinkReport::default()
    };

    let total = entries.len() as u64;
    let mut actions = Vec::new();
    for (n, resolved) in entries.iter().enumerate() {
        match decide(resolved, &index, options) {
            Decision::AlreadyLinked => report.already_linked += 1,
            Decision::Act(action) => actions.push(action),
            Decision::Unmatched => report.unmatched.push(unmatched(&resolved.entry)),
        }
        let current = n as u64 + 1;
        if current % PROGRESS_INTERVAL == 0 || current == total {
            on_progress(&Progress::new(
                Phase::Match,
                current,
                total,
                format!("matched {current} of {total}"),
            ));
        }
    }

    if options.dry_run {
        for action in &actions {
            tally(&mut report, action.kind);
        }
        log_summary(&report, target_root);
        return Ok(report);
    }

    let by_id: HashMap<&str, &CatalogEntry> =
        entries.iter().map(|r| (r.entry.id.as_str(), &r.entry)).collect();
    let actions = perform_copies(actions, &by_id, &mut report, &mut on_progress);
    if actions.is_empty() {
        log_summary(&report, target_root);
        return Ok(report);
    }

    let ids: Vec<&str> = actions.iter().map(|a| a.id.as_str()).collect();
    coordinator.with_batch(&ids, |store, validation| {
        let access = mode.access(store);
        let valid: HashSet<&str> = validation.valid_ids().collect();
        for id in &validation.conflicts {
            report.errors.push(
                Phase::Match,
                id.as_str(),
                Error::ConflictDeleted { id: id.clone() },
            );
        }
        for action in actions.iter().filter(|a| valid.contains(a.id.as_str())) {
            match access.relocate(&action.id, &action.target) {
                Ok(_) => tally(&mut report, action.kind),
                Err(err) => report.errors.push(Phase::Match, action.id.as_str(), err),
            }
        }
        Ok(())
    })?;

    log_summary(&report, target_root);
    Ok(report)
}

fn decide(resolved: &ResolvedEntry, index: &TargetIndex, options: &RelinkOptions) -> Decision {
    let entry = &resolved.entry;
    let current = resolved.local_path.as_deref();

    if let Some(found) = entry
        .content_hash
        .as_deref()
        .and_then(|h| index.by_fingerprint(h))
    {
        if entry.linked && same_path(current, found) {
            return Decision::AlreadyLinked;
        }
        return Decision::Act(RelinkAction {
            id: entry.id.clone(),
            target: found.to_path_buf(),
            kind: MatchKind::Fingerprint,
            copy_from: None,
        });
    }

    if let Some(found) = index.by_filename(&entry.filename) {
        if entry.linked && same_path(current, found) {
            return Decision::AlreadyLinked;
        }
        tracing::warn!(
            id = %entry.id,
            filename = %entry.filename,
            target = %found.display(),
            "degraded match by file name only"
        );
        return Decision::Act(RelinkAction {
            id: entry.id.clone(),
            target: found.to_path_buf(),
            kind: MatchKind::Filename,
            copy_from: None,
        });
    }

    if options.copy_missing_files {
        if let Some(src) = current.filter(|p| p.is_file()) {
            let target = index
                .root
                .join(prior_subfolder(entry))
                .join(&entry.filename);
            return Decision::Act(RelinkAction {
                id: entry.id.clone(),
                target,
                kind: MatchKind::Copied,
                copy_from: Some(src.to_path_buf()),
            });
        }
    }

    Decision::Unmatched
}

/// Copies files for `Copied` actions; failed copies turn into unmatched entries.
fn perform_copies<F>(
    actions: Vec<RelinkAction>,
    by_id: &HashMap<&str, &CatalogEntry>,
    report: &mut RelinkReport,
    on_progress: &mut F,
) -> Vec<RelinkAction>
where
    F: FnMut(&Progress),
{
    let total = actions.iter().filter(|a| a.copy_from.is_some()).count() as u64;
    let mut done = 0u64;
    let mut kept = Vec::with_capacity(actions.len());

    for action in actions {
        let src = match action.copy_from.clone() {
            Some(src) => src,
            None => {
                kept.push(action);
                continue;
            }
        };
        match copy_into_place(&src, &action.target) {
            Ok(bytes) => {
                tracing::info!(from = %src.display(), to = %action.target.display(), bytes, "copied missing file");
                kept.push(action);
            }
            Err(err) => {
                report
                    .errors
                    .push(Phase::Copy, action.target.display().to_string(), err);
                if let Some(entry) = by_id.get(action.id.as_str()) {
                    report.unmatched.push(unmatched(entry));
                }
            }
        }
        done += 1;
        on_progress(&Progress::new(
            Phase::Copy,
            done,
            total,
            format!("copied {done} of {total}"),
        ));
    }

    kept
}

fn copy_into_place(src: &Path, target: &Path) -> Result<u64> {
    if target.exists() {
        return Err(Error::InvalidArgument(format!(
            "refusing to overwrite {}",
            target.display()
        )));
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    copy_atomic(src, target)
}

/// Folders between the root name and the file name of the entry's previous
/// location, e.g. `2025-01-15` for `clips/2025-01-15/a.mp4`. Absolute paths
/// contribute their immediate parent folder only.
fn prior_subfolder(entry: &CatalogEntry) -> PathBuf {
    let stored = normalize_path(&entry.path);
    let segments: Vec<&str> = stored.split('/').filter(|s| !s.is_empty()).collect();
    let mut out = PathBuf::new();
    if PathTranslator::is_canonical(&entry.path) {
        if segments.len() > 2 {
            for seg in &segments[1..segments.len() - 1] {
                out.push(seg);
            }
        }
    } else if segments.len() >= 2 {
        out.push(segments[segments.len() - 2]);
    }
    out
}

fn same_path(current: Option<&Path>, found: &Path) -> bool {
    current
        .map(|p| normalize_path(&p.to_string_lossy()) == normalize_path(&found.to_string_lossy()))
        .unwrap_or(false)
}

fn tally(report: &mut RelinkReport, kind: MatchKind) {
    match kind {
        MatchKind::Fingerprint => report.matched_by_hash += 1,
        MatchKind::Filename => report.matched_by_filename += 1,
        MatchKind::Copied => report.copied += 1,
    }
}

fn unmatched(entry: &CatalogEntry) -> UnmatchedEntry {
    UnmatchedEntry {
        id: entry.id.clone(),
        filename: entry.filename.clone(),
        path: entry.path.clone(),
    }
}

fn log_summary(report: &RelinkReport, target_root: &Path) {
    tracing::info!(
        target = %target_root.display(),
        by_hash = report.matched_by_hash,
        by_filename = report.matched_by_filename,
        copied = report.copied,
        already_linked = report.already_linked,
        unmatched = report.unmatched.len(),
        errors = report.errors.total(),
        dry_run = report.dry_run,
        "relink finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::entry;
    use crate::hash::fingerprint;

    fn write(path: &Path, body: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    fn abs(p: &Path) -> String {
        normalize_path(&p.to_string_lossy())
    }

    fn run(target: &Path, coord: &LockCoordinator, options: &RelinkOptions) -> RelinkReport {
        relink(target, coord, &LibraryMode::Local, options, None, |_| {}).unwrap()
    }

    fn listing(root: &Path) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = walkdir::WalkDir::new(root)
            .into_iter()
            .map(|e| e.unwrap().path().to_path_buf())
            .collect();
        out.sort();
        out
    }

    #[test]
    fn fingerprint_beats_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("new-home");
        let by_hash = target.join("renamed").join("interview-final.mp4");
        let by_name = target.join("a.mp4");
        write(&by_hash, b"the real content");
        write(&by_name, b"an unrelated clip");
        let h = fingerprint(&by_hash, None).unwrap();

        let coord = LockCoordinator::local(dir.path().join("catalog.db")).unwrap();
        coord
            .with_lock(|s| s.insert_entry(&entry("e1", "/old/place/a.mp4", &h)))
            .unwrap();

        let report = run(&target, &coord, &RelinkOptions::default());

        assert_eq!(report.matched_by_hash, 1);
        assert_eq!(report.matched_by_filename, 0);
        let e = coord.read_snapshot(|s| s.get_entry("e1")).unwrap().unwrap();
        assert_eq!(e.path, abs(&by_hash));
        assert_eq!(e.filename, "interview-final.mp4");
    }

    #[test]
    fn falls_back_to_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("new-home");
        let by_name = target.join("2025-01-01").join("a.mp4");
        write(&by_name, b"re-encoded");

        let coord = LockCoordinator::local(dir.path().join("catalog.db")).unwrap();
        coord
            .with_lock(|s| s.insert_entry(&entry("e1", "/old/place/a.mp4", "old-hash")))
            .unwrap();

        let report = run(&target, &coord, &RelinkOptions::default());

        assert_eq!((report.matched_by_hash, report.matched_by_filename), (0, 1));
        let e = coord.read_snapshot(|s| s.get_entry("e1")).unwrap().unwrap();
        assert_eq!(e.path, abs(&by_name));
    }

    #[test]
    fn copies_missing_files_into_prior_subfolder() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("new-home");
        fs::create_dir_all(&target).unwrap();
        let old = dir.path().join("old").join("2025-01-15").join("a.mp4");
        write(&old, b"only copy");

        let coord = LockCoordinator::local(dir.path().join("catalog.db")).unwrap();
        coord
            .with_lock(|s| s.insert_entry(&entry("e1", &abs(&old), "no-such-hash")))
            .unwrap();

        let options = RelinkOptions {
            copy_missing_files: true,
            ..RelinkOptions::default()
        };
        let report = run(&target, &coord, &options);

        let copied = target.join("2025-01-15").join("a.mp4");
        assert_eq!(report.copied, 1);
        assert_eq!(fs::read(&copied).unwrap(), b"only copy");
        assert!(old.exists());
        let e = coord.read_snapshot(|s| s.get_entry("e1")).unwrap().unwrap();
        assert_eq!(e.path, abs(&copied));
    }

    #[test]
    fn unmatched_entries_are_reported_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("new-home");
        write(&target.join("b.mp4"), b"b");

        let coord = LockCoordinator::local(dir.path().join("catalog.db")).unwrap();
        coord
            .with_lock(|s| s.insert_entry(&entry("e1", "/old/a.mp4", "h")))
            .unwrap();

        let report = run(&target, &coord, &RelinkOptions::default());

        assert_eq!(report.unmatched.len(), 1);
        assert_eq!(report.unmatched[0].id, "e1");
        assert_eq!(coord.read_snapshot(|s| s.count_entries()).unwrap(), 1);
    }

    #[test]
    fn already_linked_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("home");
        let file = target.join("a.mp4");
        write(&file, b"here");
        let h = fingerprint(&file, None).unwrap();

        let coord = LockCoordinator::local(dir.path().join("catalog.db")).unwrap();
        coord
            .with_lock(|s| s.insert_entry(&entry("e1", &abs(&file), &h)))
            .unwrap();

        let report = run(&target, &coord, &RelinkOptions::default());
        assert_eq!(report.already_linked, 1);
        assert_eq!(report.matched_by_hash, 0);
    }

    #[test]
    fn dry_run_changes_nothing_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("new-home");
        let moved = target.join("x.mp4");
        write(&moved, b"moved content");
        let h = fingerprint(&moved, None).unwrap();
        let old = dir.path().join("old").join("2025-02-02").join("c.mp4");
        write(&old, b"needs copy");

        let catalog = dir.path().join("catalog.db");
        {
            let coord = LockCoordinator::local(&catalog).unwrap();
            coord
                .with_lock(|s| {
                    s.insert_entry(&entry("e1", "/gone/x.mp4", &h))?;
                    s.insert_entry(&entry("e2", &abs(&old), "other"))
                })
                .unwrap();
        }
        let before_bytes = fs::read(&catalog).unwrap();
        let before_tree = listing(dir.path());

        let coord = LockCoordinator::shared(&catalog, "m", Default::default());
        let options = RelinkOptions {
            dry_run: true,
            copy_missing_files: true,
            ..RelinkOptions::default()
        };
        let report = relink(&target, &coord, &LibraryMode::Local, &options, None, |_| {}).unwrap();

        assert_eq!((report.matched_by_hash, report.copied), (1, 1));
        assert!(report.dry_run);
        assert_eq!(fs::read(&catalog).unwrap(), before_bytes);
        assert_eq!(listing(dir.path()), before_tree);
    }

    #[test]
    fn subfolder_from_prior_location() {
        let mut e = entry("e", "clips/2025/01/a.mp4", "h");
        assert_eq!(prior_subfolder(&e), PathBuf::from("2025/01"));
        e.path = "clips/a.mp4".to_string();
        assert_eq!(prior_subfolder(&e), PathBuf::new());
        e.path = "/Volumes/Old/clips/2025-03-03/a.mp4".to_string();
        assert_eq!(prior_subfolder(&e), PathBuf::from("2025-03-03"));
    }
}
