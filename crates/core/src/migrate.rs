//! One-shot conversion of a catalog from absolute paths to canonical keys.
//!
//! Phases run in a fixed order: backup, configure, convert, move, validate,
//! finalize. Conversion works on an in-memory copy, so a dry run computes
//! exactly what a live run would and then simply never writes it back.
//! Per-record failures are collected; only setup problems (missing catalog,
//! failed backup, busy lock) abort the run.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use walkdir::WalkDir;

use crate::atomic::copy_atomic;
use crate::config::{ConfigStore, PathMappingConfig, DEFAULT_ROOTS};
use crate::db::{CatalogStore, SqliteCatalog};
use crate::drive;
use crate::error::{Error, Result};
use crate::lock::{FileLock, LockOptions};
use crate::models::{BatchOutcome, ErrorLog, Phase, Progress, ValidationCounts, PROGRESS_INTERVAL};
use crate::paths::{normalize_path, PathTranslator};

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub catalog_path: PathBuf,
    pub computer_name: String,
    pub nas_root: PathBuf,
    /// Named roots that differ from `<nas_root>/<name>`.
    pub mappings: BTreeMap<String, PathBuf>,
    /// Relocate the clips directory here and repoint the `clips` mapping.
    pub move_clips_to: Option<PathBuf>,
    /// Defaults to the catalog's own directory.
    pub backup_dir: Option<PathBuf>,
    pub dry_run: bool,
    pub lock: LockOptions,
}

impl MigrationOptions {
    pub fn new(
        catalog_path: impl Into<PathBuf>,
        computer_name: impl Into<String>,
        nas_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            catalog_path: catalog_path.into(),
            computer_name: computer_name.into(),
            nas_root: nas_root.into(),
            mappings: BTreeMap::new(),
            move_clips_to: None,
            backup_dir: None,
            dry_run: false,
            lock: LockOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    pub dry_run: bool,
    /// Where the backup went, or would have gone on a dry run.
    pub backup_path: PathBuf,
    pub config: PathMappingConfig,
    pub total: u64,
    pub converted: u64,
    pub skipped: u64,
    pub failed: u64,
    pub clips_moved: bool,
    pub validation: ValidationCounts,
    pub errors: ErrorLog,
}

impl BatchOutcome for MigrationResult {
    fn succeeded(&self) -> u64 {
        self.converted
    }

    fn skipped(&self) -> u64 {
        self.skipped
    }

    fn failed(&self) -> u64 {
        self.failed
    }
}

pub struct MigrationEngine<'a> {
    configs: &'a mut ConfigStore,
}

impl<'a> MigrationEngine<'a> {
    pub fn new(configs: &'a mut ConfigStore) -> Self {
        Self { configs }
    }

    pub fn migrate<F>(&mut self, options: &MigrationOptions, mut on_progress: F) -> Result<MigrationResult>
    where
        F: FnMut(&Progress),
    {
        let catalog_path = &options.catalog_path;
        if !catalog_path.is_file() {
            return Err(Error::CatalogUnreadable {
                path: catalog_path.clone(),
                reason: "file does not exist".to_string(),
            });
        }

        let mut config = self.derive_config(options);
        let lock = if options.dry_run {
            None
        } else {
            let lock = FileLock::for_catalog(catalog_path, &config.computer_id, options.lock.clone());
            Some(lock.acquire()?)
        };

        let mut errors = ErrorLog::default();

        // backup
        let backup_path = backup_path_for(options, Utc::now());
        on_progress(&Progress::new(Phase::Backup, 0, 1, backup_path.display().to_string()));
        if !options.dry_run {
            backup_catalog(catalog_path, &backup_path)?;
            tracing::info!(backup = %backup_path.display(), "catalog backed up");
        }
        on_progress(&Progress::new(Phase::Backup, 1, 1, "backup done"));

        let catalog = SqliteCatalog::load_snapshot(catalog_path)?;

        // configure
        on_progress(&Progress::new(Phase::Configure, 0, 1, "deriving path mappings"));
        match drive::probe_volume(&config.nas_root) {
            Ok(volume) => {
                if !volume.is_network() {
                    tracing::warn!(
                        nas_root = %config.nas_root.display(),
                        fs_type = volume.fs_type.as_deref().unwrap_or("unknown"),
                        "NAS root does not look like a network filesystem"
                    );
                }
                config.nas_fs_type = volume.fs_type;
            }
            Err(err) => tracing::debug!(%err, "volume probe failed"),
        }
        if !options.dry_run {
            self.configs.save(config.clone())?;
        }
        on_progress(&Progress::new(Phase::Configure, 1, 1, config.computer_id.clone()));

        // convert
        let translator = PathTranslator::new(&config);
        let entries = catalog.all_entries()?;
        let total = entries.len() as u64;
        let (mut converted, mut skipped, mut failed) = (0u64, 0u64, 0u64);
        for (n, entry) in entries.iter().enumerate() {
            if PathTranslator::is_canonical(&entry.path) {
                skipped += 1;
            } else {
                let rewritten = translator
                    .to_canonical(Path::new(&entry.path))
                    .and_then(|key| catalog.update_entry_path(&entry.id, &key, &entry.filename));
                match rewritten {
                    Ok(_) => converted += 1,
                    Err(err) => {
                        failed += 1;
                        errors.push(Phase::Convert, entry.id.as_str(), err);
                    }
                }
            }
            let current = n as u64 + 1;
            if current % PROGRESS_INTERVAL == 0 || current == total {
                on_progress(&Progress::new(
                    Phase::Convert,
                    current,
                    total,
                    format!("{converted} converted, {skipped} skipped, {failed} failed"),
                ));
            }
        }

        // move
        let mut clips_moved = false;
        let mut validate_with = config.clone();
        if let Some(dest) = &options.move_clips_to {
            if let Some(handle) = &lock {
                handle.refresh()?;
            }
            on_progress(&Progress::new(Phase::Move, 0, 1, dest.display().to_string()));
            match move_clips(&mut config, dest, options.dry_run) {
                Ok(moved) => {
                    clips_moved = moved;
                    if moved {
                        validate_with = config.clone();
                        if let Err(err) = self.configs.save(config.clone()) {
                            errors.push(Phase::Move, self.configs.path().display().to_string(), err);
                        }
                    }
                }
                Err(err) => errors.push(Phase::Move, dest.display().to_string(), err),
            }
            on_progress(&Progress::new(Phase::Move, 1, 1, "move done"));
        }

        // validate
        let validation = validate_catalog(&catalog, &PathTranslator::new(&validate_with), &mut on_progress)?;

        // finalize
        on_progress(&Progress::new(Phase::Finalize, 0, 1, catalog_path.display().to_string()));
        if let Some(handle) = &lock {
            handle.refresh()?;
            catalog.save_snapshot(catalog_path)?;
        }
        on_progress(&Progress::new(Phase::Finalize, 1, 1, "migration finished"));

        tracing::info!(
            catalog = %catalog_path.display(),
            converted,
            skipped,
            failed,
            valid = validation.valid,
            missing = validation.missing,
            invalid = validation.invalid,
            dry_run = options.dry_run,
            "migration finished"
        );

        Ok(MigrationResult {
            dry_run: options.dry_run,
            backup_path,
            config,
            total,
            converted,
            skipped,
            failed,
            clips_moved,
            validation,
            errors,
        })
    }

    /// Puts a backup taken by [`migrate`](Self::migrate) back in place,
    /// holding the catalog lock like any other writer.
    pub fn rollback(
        backup: &Path,
        catalog_path: &Path,
        computer_id: &str,
        options: LockOptions,
    ) -> Result<()> {
        SqliteCatalog::load_snapshot(backup)?;

        let handle = FileLock::for_catalog(catalog_path, computer_id, options).acquire()?;
        let restored = handle
            .refresh()
            .and_then(|()| copy_atomic(backup, catalog_path));
        let released = handle.release();
        restored?;
        released?;

        tracing::info!(backup = %backup.display(), catalog = %catalog_path.display(), "catalog restored from backup");
        Ok(())
    }

    /// Reuses this machine's id and custom roots when a config already exists.
    fn derive_config(&mut self, options: &MigrationOptions) -> PathMappingConfig {
        let mut config = match self.configs.load() {
            Ok(existing) => existing.clone(),
            Err(Error::ConfigMissing { .. }) => {
                PathMappingConfig::new(options.computer_name.clone(), options.nas_root.clone())
            }
            Err(err) => {
                tracing::warn!(%err, "ignoring unreadable path mapping config");
                PathMappingConfig::new(options.computer_name.clone(), options.nas_root.clone())
            }
        };

        config.computer_name = options.computer_name.clone();
        config.nas_root = options.nas_root.clone();
        for name in DEFAULT_ROOTS {
            config
                .path_mappings
                .entry(name.to_string())
                .or_insert_with(|| options.nas_root.join(name));
        }
        for (name, path) in &options.mappings {
            config.path_mappings.insert(name.clone(), path.clone());
        }
        config.touch();
        config
    }
}

fn backup_path_for(options: &MigrationOptions, now: DateTime<Utc>) -> PathBuf {
    let catalog = &options.catalog_path;
    let stem = catalog
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "catalog".to_string());
    let name = match catalog.extension() {
        Some(ext) => format!(
            "{stem}.backup-{}.{}",
            now.format("%Y%m%d-%H%M%S-%3f"),
            ext.to_string_lossy()
        ),
        None => format!("{stem}.backup-{}", now.format("%Y%m%d-%H%M%S-%3f")),
    };
    let dir = options
        .backup_dir
        .clone()
        .or_else(|| catalog.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    dir.join(name)
}

fn backup_catalog(catalog: &Path, backup: &Path) -> Result<()> {
    let failed = |source| Error::BackupFailed {
        path: backup.to_path_buf(),
        source,
    };
    if let Some(parent) = backup.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(failed)?;
    }
    fs::copy(catalog, backup).map_err(failed)?;
    Ok(())
}

/// Returns whether files were actually moved; a dry run only checks the
/// preconditions and records the new mapping in `config`.
fn move_clips(config: &mut PathMappingConfig, dest: &Path, dry_run: bool) -> Result<bool> {
    let src = config
        .mapping("clips")
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.nas_root.join("clips"));

    if normalize_path(&src.to_string_lossy()) == normalize_path(&dest.to_string_lossy()) {
        return Ok(false);
    }
    if !src.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "clips directory does not exist: {}",
            src.display()
        )));
    }
    if dest.exists() && fs::read_dir(dest)?.next().is_some() {
        return Err(Error::InvalidArgument(format!(
            "move target is not empty: {}",
            dest.display()
        )));
    }

    if dry_run {
        config.set_mapping("clips", dest);
        return Ok(false);
    }

    move_dir(&src, dest)?;
    config.set_mapping("clips", dest);
    tracing::info!(from = %src.display(), to = %dest.display(), "clips directory moved");
    Ok(true)
}

fn move_dir(src: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        fs::remove_dir(dest)?;
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::debug!(%err, "rename failed, copying across volumes");
            copy_tree(src, dest)?;
            fs::remove_dir_all(src)?;
            Ok(())
        }
    }
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|err| Error::InvalidArgument(err.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|err| Error::InvalidArgument(err.to_string()))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Classifies every record: not canonical is invalid, otherwise valid when
/// the resolved file exists and missing when it does not. Read-only.
pub fn validate_catalog<F>(
    catalog: &dyn CatalogStore,
    translator: &PathTranslator,
    on_progress: &mut F,
) -> Result<ValidationCounts>
where
    F: FnMut(&Progress),
{
    let entries = catalog.all_entries()?;
    let total = entries.len() as u64;
    let mut counts = ValidationCounts::default();
    for (n, entry) in entries.iter().enumerate() {
        if !PathTranslator::is_canonical(&entry.path) {
            counts.invalid += 1;
        } else if translator.exists(&entry.path) {
            counts.valid += 1;
        } else {
            counts.missing += 1;
        }
        let current = n as u64 + 1;
        if current % PROGRESS_INTERVAL == 0 || current == total {
            on_progress(&Progress::new(
                Phase::Validate,
                current,
                total,
                format!("{} valid, {} missing", counts.valid, counts.missing),
            ));
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::entry;

    struct Fixture {
        dir: tempfile::TempDir,
        catalog: PathBuf,
        nas: PathBuf,
        configs: ConfigStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let nas = dir.path().join("nas");
        let catalog = nas.join("catalog.db");
        fs::create_dir_all(nas.join("clips").join("2025-01-15")).unwrap();
        fs::write(nas.join("clips").join("2025-01-15").join("a.mp4"), b"a").unwrap();

        let db = SqliteCatalog::open(&catalog).unwrap();
        let a = nas.join("clips").join("2025-01-15").join("a.mp4");
        let b = nas.join("clips").join("2025-01-16").join("b.mp4");
        db.insert_entry(&entry("a", &normalize_path(&a.to_string_lossy()), "ha"))
            .unwrap();
        db.insert_entry(&entry("b", &normalize_path(&b.to_string_lossy()), "hb"))
            .unwrap();
        db.insert_entry(&entry("c", "/somewhere/else/c.mp4", "hc")).unwrap();
        drop(db);

        let configs = ConfigStore::new(dir.path().join("config").join("path-mapping.json"));
        Fixture {
            dir,
            catalog,
            nas,
            configs,
        }
    }

    fn options(fx: &Fixture) -> MigrationOptions {
        MigrationOptions::new(&fx.catalog, "edit-bay", &fx.nas)
    }

    fn backups(fx: &Fixture) -> usize {
        fs::read_dir(&fx.nas)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .contains(".backup-")
            })
            .count()
    }

    #[test]
    fn converts_absolute_paths_and_tolerates_bad_records() {
        let mut fx = fixture();
        let opts = options(&fx);
        let mut phases = Vec::new();
        let result = MigrationEngine::new(&mut fx.configs)
            .migrate(&opts, |p| {
                if phases.last() != Some(&p.phase) {
                    phases.push(p.phase);
                }
            })
            .unwrap();

        assert_eq!((result.converted, result.skipped, result.failed), (2, 0, 1));
        assert_eq!(result.errors.items()[0].target, "c");
        assert_eq!(
            phases,
            vec![Phase::Backup, Phase::Configure, Phase::Convert, Phase::Validate, Phase::Finalize]
        );
        assert!(result.backup_path.exists());
        assert_eq!(
            result.validation,
            ValidationCounts {
                valid: 1,
                invalid: 1,
                missing: 1
            }
        );

        let db = SqliteCatalog::open(&fx.catalog).unwrap();
        assert_eq!(db.get_entry("a").unwrap().unwrap().path, "clips/2025-01-15/a.mp4");
        assert_eq!(db.get_entry("c").unwrap().unwrap().path, "/somewhere/else/c.mp4");
        assert!(fx.configs.exists());
    }

    #[test]
    fn second_run_skips_everything_converted() {
        let mut fx = fixture();
        {
            let db = SqliteCatalog::open(&fx.catalog).unwrap();
            db.delete_entry("c").unwrap();
        }
        let opts = options(&fx);
        let first = MigrationEngine::new(&mut fx.configs).migrate(&opts, |_| {}).unwrap();
        assert_eq!(first.converted, 2);

        let second = MigrationEngine::new(&mut fx.configs).migrate(&opts, |_| {}).unwrap();
        assert_eq!((second.converted, second.skipped, second.failed), (0, 2, 0));
        assert_eq!(second.config.computer_id, first.config.computer_id);
    }

    #[test]
    fn dry_run_reports_without_touching_disk() {
        let mut fx = fixture();
        let before = fs::read(&fx.catalog).unwrap();
        let mut opts = options(&fx);
        opts.dry_run = true;

        let dry = MigrationEngine::new(&mut fx.configs).migrate(&opts, |_| {}).unwrap();

        assert!(dry.dry_run);
        assert!(!dry.backup_path.exists());
        assert_eq!(fs::read(&fx.catalog).unwrap(), before);
        assert_eq!(backups(&fx), 0);
        assert!(!fx.configs.exists());
        assert!(!crate::lock::lock_path_for(&fx.catalog).exists());

        opts.dry_run = false;
        let live = MigrationEngine::new(&mut fx.configs).migrate(&opts, |_| {}).unwrap();
        assert_eq!(
            (dry.converted, dry.skipped, dry.failed, dry.validation),
            (live.converted, live.skipped, live.failed, live.validation)
        );
    }

    #[test]
    fn missing_catalog_aborts() {
        let mut fx = fixture();
        let mut opts = options(&fx);
        opts.catalog_path = fx.dir.path().join("nope.db");
        let err = MigrationEngine::new(&mut fx.configs)
            .migrate(&opts, |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::CatalogUnreadable { .. }));
        assert!(!fx.configs.exists());
    }

    #[test]
    fn moves_clips_and_repoints_mapping() {
        let mut fx = fixture();
        let dest = fx.dir.path().join("fast-ssd").join("clips");
        let mut opts = options(&fx);
        opts.move_clips_to = Some(dest.clone());

        let result = MigrationEngine::new(&mut fx.configs).migrate(&opts, |_| {}).unwrap();

        assert!(result.clips_moved);
        assert!(dest.join("2025-01-15").join("a.mp4").exists());
        assert!(!fx.nas.join("clips").exists());
        assert_eq!(result.config.mapping("clips"), Some(dest.as_path()));
        assert_eq!(result.validation.valid, 1);
        assert_eq!(
            fx.configs.reload().unwrap().mapping("clips"),
            Some(dest.as_path())
        );
    }

    fn quick() -> LockOptions {
        LockOptions {
            max_attempts: 2,
            initial_backoff: std::time::Duration::from_millis(5),
            max_backoff: std::time::Duration::from_millis(5),
            stale_after: std::time::Duration::from_secs(30),
        }
    }

    #[test]
    fn rollback_restores_the_backup() {
        let mut fx = fixture();
        let opts = options(&fx);
        let result = MigrationEngine::new(&mut fx.configs).migrate(&opts, |_| {}).unwrap();

        MigrationEngine::rollback(&result.backup_path, &fx.catalog, "edit-bay", quick()).unwrap();

        let db = SqliteCatalog::open(&fx.catalog).unwrap();
        assert!(db.get_entry("a").unwrap().unwrap().path.starts_with('/'));
        assert!(!crate::lock::lock_path_for(&fx.catalog).exists());
    }

    #[test]
    fn rollback_waits_for_the_lock() {
        let mut fx = fixture();
        let opts = options(&fx);
        let result = MigrationEngine::new(&mut fx.configs).migrate(&opts, |_| {}).unwrap();
        let migrated = fs::read(&fx.catalog).unwrap();

        let other = FileLock::for_catalog(&fx.catalog, "laptop", quick());
        let _held = other.acquire().unwrap();
        let err = MigrationEngine::rollback(&result.backup_path, &fx.catalog, "edit-bay", quick())
            .unwrap_err();

        assert!(matches!(err, Error::LockAcquisitionTimeout { .. }));
        assert_eq!(fs::read(&fx.catalog).unwrap(), migrated);
    }

    #[test]
    fn lost_lock_stops_migration_before_finalize() {
        let mut fx = fixture();
        let before = fs::read(&fx.catalog).unwrap();
        let lock_path = crate::lock::lock_path_for(&fx.catalog);
        let catalog = fx.catalog.clone();
        let opts = options(&fx);

        let mut taken_over = None;
        let err = MigrationEngine::new(&mut fx.configs)
            .migrate(&opts, |p| {
                if p.phase == Phase::Validate && taken_over.is_none() {
                    fs::OpenOptions::new()
                        .write(true)
                        .open(&lock_path)
                        .unwrap()
                        .set_modified(
                            std::time::SystemTime::now() - std::time::Duration::from_secs(120),
                        )
                        .unwrap();
                    taken_over = Some(FileLock::for_catalog(&catalog, "laptop", quick()).acquire().unwrap());
                }
            })
            .unwrap_err();

        assert!(matches!(err, Error::LockLost { .. }));
        assert_eq!(fs::read(&fx.catalog).unwrap(), before);
        assert!(taken_over.unwrap().verify().is_ok());
    }
}
