use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clipvault_core::catalog::LibraryMode;
use clipvault_core::config::{ConfigStore, PathMappingConfig};
use clipvault_core::ignore::IgnoreList;
use clipvault_core::lock::LockOptions;
use clipvault_core::migrate::{validate_catalog, MigrationEngine, MigrationOptions};
use clipvault_core::models::{BatchOutcome, Progress};
use clipvault_core::paths::PathTranslator;
use clipvault_core::relink::{relink, RelinkOptions};
use clipvault_core::scan::{scan_library, ScanConfig};
use clipvault_core::sync::LockCoordinator;
use clipvault_core::{Error, Result};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(err) = real_main() {
        eprintln!("error: {err}");
        std::process::exit(if err.is_retryable() { 75 } else { 2 });
    }
}

/// Flags accepted by every command.
struct Globals {
    json: bool,
    verbose: bool,
    config: Option<PathBuf>,
}

impl Globals {
    fn config_store(&self) -> Result<ConfigStore> {
        let path = match &self.config {
            Some(path) => path.clone(),
            None => ConfigStore::default_location()?,
        };
        Ok(ConfigStore::new(path))
    }
}

fn real_main() -> Result<()> {
    let (globals, rest) = split_globals(std::env::args().skip(1).collect())?;
    init_tracing(globals.verbose);

    let mut args = rest.into_iter();
    let Some(cmd) = args.next() else {
        print_help();
        return Ok(());
    };

    match cmd.as_str() {
        "--help" | "-h" | "help" => {
            print_help();
            Ok(())
        }
        "init" => cmd_init(&globals, args),
        "config" => cmd_config(&globals),
        "scan" => cmd_scan(&globals, args),
        "relink" => cmd_relink(&globals, args),
        "migrate" => cmd_migrate(&globals, args),
        "rollback" => cmd_rollback(&globals, args),
        "validate" => cmd_validate(&globals, args),
        "lock-status" => cmd_lock_status(&globals, args),
        _ => Err(Error::InvalidArgument(format!("unknown command: {cmd}"))),
    }
}

fn split_globals(args: Vec<String>) -> Result<(Globals, Vec<String>)> {
    let mut globals = Globals {
        json: false,
        verbose: false,
        config: None,
    };
    let mut rest = Vec::new();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => globals.json = true,
            "-v" | "--verbose" => globals.verbose = true,
            "--config" => globals.config = Some(PathBuf::from(required(&mut iter, "--config")?)),
            _ => rest.push(arg),
        }
    }
    Ok((globals, rest))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_init(globals: &Globals, mut args: impl Iterator<Item = String>) -> Result<()> {
    let mut name: Option<String> = None;
    let mut nas_root: Option<PathBuf> = None;
    let mut mappings = BTreeMap::new();
    let mut catalog: Option<PathBuf> = None;
    let mut force = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--name" => name = Some(required(&mut args, "--name")?),
            "--nas-root" => nas_root = Some(PathBuf::from(required(&mut args, "--nas-root")?)),
            "--map" => {
                let (root, path) = parse_mapping(&required(&mut args, "--map")?)?;
                mappings.insert(root, path);
            }
            "--catalog" => catalog = Some(PathBuf::from(required(&mut args, "--catalog")?)),
            "--force" => force = true,
            _ => return Err(unknown_arg(&arg)),
        }
    }

    let nas_root = nas_root.ok_or_else(|| missing("--nas-root <path>"))?;
    let name = name.unwrap_or_else(default_computer_name);

    let mut store = globals.config_store()?;
    if store.exists() && !force {
        return Err(Error::InvalidArgument(format!(
            "config already exists at {} (use --force to replace it)",
            store.path().display()
        )));
    }

    let mut config = PathMappingConfig::new(name, nas_root);
    for (root, path) in mappings {
        config.set_mapping(root, path);
    }
    if let Ok(volume) = clipvault_core::drive::probe_volume(&config.nas_root) {
        if !volume.is_network() {
            tracing::warn!(nas_root = %config.nas_root.display(), "NAS root does not look like a network filesystem");
        }
        config.nas_fs_type = volume.fs_type;
    }
    store.save(config.clone())?;
    tracing::info!(path = %store.path().display(), "wrote path mapping config");
    if let Some(catalog) = catalog {
        LockCoordinator::shared(catalog, config.computer_id.clone(), LockOptions::default())
            .ensure_catalog()?;
    }
    print_config(globals, &config)
}

fn cmd_config(globals: &Globals) -> Result<()> {
    let mut store = globals.config_store()?;
    let config = store.load()?.clone();
    print_config(globals, &config)
}

fn cmd_scan(globals: &Globals, mut args: impl Iterator<Item = String>) -> Result<()> {
    let mut root: Option<PathBuf> = None;
    let mut catalog: Option<PathBuf> = None;
    let mut ignore_file: Option<PathBuf> = None;
    let mut dry_run = false;
    let mut local = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--root" => root = Some(PathBuf::from(required(&mut args, "--root")?)),
            "--catalog" => catalog = Some(PathBuf::from(required(&mut args, "--catalog")?)),
            "--ignore-file" => {
                ignore_file = Some(PathBuf::from(required(&mut args, "--ignore-file")?))
            }
            "--dry-run" => dry_run = true,
            "--local" => local = true,
            _ => return Err(unknown_arg(&arg)),
        }
    }

    let root = root.ok_or_else(|| missing("--root <path>"))?;
    let catalog = catalog.ok_or_else(|| missing("--catalog <path>"))?;
    let (coordinator, mode) = open_library(globals, &catalog, local)?;

    let mut config = ScanConfig::for_folder(root);
    config.dry_run = dry_run;
    if let Some(path) = ignore_file {
        config.ignore = IgnoreList::load(&path)?;
    }

    let report = scan_library(&config, &coordinator, &mode, None, log_progress)?;
    if globals.json {
        return print_json(&report);
    }
    println!(
        "{}files: {}, new: {}, moved: {}, missing: {}, verified: {}, duplicates: {}, ignored: {}",
        dry_run_prefix(report.dry_run),
        report.files_seen,
        report.new,
        report.moved,
        report.missing,
        report.verified,
        report.duplicates,
        report.ignored
    );
    print_errors(&report);
    Ok(())
}

fn cmd_relink(globals: &Globals, mut args: impl Iterator<Item = String>) -> Result<()> {
    let mut target: Option<PathBuf> = None;
    let mut catalog: Option<PathBuf> = None;
    let mut options = RelinkOptions::default();
    let mut local = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--target" => target = Some(PathBuf::from(required(&mut args, "--target")?)),
            "--catalog" => catalog = Some(PathBuf::from(required(&mut args, "--catalog")?)),
            "--ignore-file" => {
                options.ignore = IgnoreList::load(Path::new(&required(&mut args, "--ignore-file")?))?
            }
            "--copy-missing" => options.copy_missing_files = true,
            "--dry-run" => options.dry_run = true,
            "--local" => local = true,
            _ => return Err(unknown_arg(&arg)),
        }
    }

    let target = target.ok_or_else(|| missing("--target <path>"))?;
    let catalog = catalog.ok_or_else(|| missing("--catalog <path>"))?;
    let (coordinator, mode) = open_library(globals, &catalog, local)?;

    let report = relink(&target, &coordinator, &mode, &options, None, log_progress)?;
    if globals.json {
        return print_json(&report);
    }
    println!(
        "{}entries: {}, by fingerprint: {}, by filename: {}, copied: {}, already linked: {}, unmatched: {}",
        dry_run_prefix(report.dry_run),
        report.total,
        report.matched_by_hash,
        report.matched_by_filename,
        report.copied,
        report.already_linked,
        report.unmatched.len()
    );
    for entry in &report.unmatched {
        println!("  unmatched: {} ({})", entry.filename, entry.path);
    }
    print_errors(&report);
    Ok(())
}

fn cmd_migrate(globals: &Globals, mut args: impl Iterator<Item = String>) -> Result<()> {
    let mut catalog: Option<PathBuf> = None;
    let mut name: Option<String> = None;
    let mut nas_root: Option<PathBuf> = None;
    let mut mappings = BTreeMap::new();
    let mut move_clips_to: Option<PathBuf> = None;
    let mut backup_dir: Option<PathBuf> = None;
    let mut dry_run = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--catalog" => catalog = Some(PathBuf::from(required(&mut args, "--catalog")?)),
            "--name" => name = Some(required(&mut args, "--name")?),
            "--nas-root" => nas_root = Some(PathBuf::from(required(&mut args, "--nas-root")?)),
            "--map" => {
                let (root, path) = parse_mapping(&required(&mut args, "--map")?)?;
                mappings.insert(root, path);
            }
            "--move-clips" => {
                move_clips_to = Some(PathBuf::from(required(&mut args, "--move-clips")?))
            }
            "--backup-dir" => backup_dir = Some(PathBuf::from(required(&mut args, "--backup-dir")?)),
            "--dry-run" => dry_run = true,
            _ => return Err(unknown_arg(&arg)),
        }
    }

    let catalog = catalog.ok_or_else(|| missing("--catalog <path>"))?;
    let nas_root = nas_root.ok_or_else(|| missing("--nas-root <path>"))?;
    let mut options = MigrationOptions::new(catalog, name.unwrap_or_else(default_computer_name), nas_root);
    options.mappings = mappings;
    options.move_clips_to = move_clips_to;
    options.backup_dir = backup_dir;
    options.dry_run = dry_run;

    let mut store = globals.config_store()?;
    let result = MigrationEngine::new(&mut store).migrate(&options, log_progress)?;
    if globals.json {
        return print_json(&result);
    }
    println!(
        "{}backup: {}",
        dry_run_prefix(result.dry_run),
        result.backup_path.display()
    );
    println!(
        "records: {}, converted: {}, skipped: {}, failed: {}, clips moved: {}",
        result.total, result.converted, result.skipped, result.failed, result.clips_moved
    );
    println!(
        "validation: {} valid, {} invalid, {} missing",
        result.validation.valid, result.validation.invalid, result.validation.missing
    );
    print_errors(&result);
    Ok(())
}

fn cmd_rollback(globals: &Globals, mut args: impl Iterator<Item = String>) -> Result<()> {
    let mut backup: Option<PathBuf> = None;
    let mut catalog: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--backup" => backup = Some(PathBuf::from(required(&mut args, "--backup")?)),
            "--catalog" => catalog = Some(PathBuf::from(required(&mut args, "--catalog")?)),
            _ => return Err(unknown_arg(&arg)),
        }
    }

    let backup = backup.ok_or_else(|| missing("--backup <path>"))?;
    let catalog = catalog.ok_or_else(|| missing("--catalog <path>"))?;

    let computer_id = globals
        .config_store()?
        .load()
        .map(|c| c.computer_id.clone())
        .unwrap_or_else(|_| "rollback".to_string());
    MigrationEngine::rollback(&backup, &catalog, &computer_id, LockOptions::default())?;

    if globals.json {
        return print_json(&serde_json::json!({
            "backup": backup,
            "catalog": catalog,
        }));
    }
    println!("restored {} from {}", catalog.display(), backup.display());
    Ok(())
}

fn cmd_validate(globals: &Globals, mut args: impl Iterator<Item = String>) -> Result<()> {
    let mut catalog: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--catalog" => catalog = Some(PathBuf::from(required(&mut args, "--catalog")?)),
            _ => return Err(unknown_arg(&arg)),
        }
    }
    let catalog = catalog.ok_or_else(|| missing("--catalog <path>"))?;

    let mut store = globals.config_store()?;
    let translator = PathTranslator::new(store.load()?);
    let coordinator = LockCoordinator::shared(&catalog, "validate", LockOptions::default());
    let mut progress = log_progress;
    let counts = coordinator.read_snapshot(|store| validate_catalog(store, &translator, &mut progress))?;

    if globals.json {
        return print_json(&counts);
    }
    println!(
        "valid: {}, invalid: {}, missing: {}",
        counts.valid, counts.invalid, counts.missing
    );
    Ok(())
}

fn cmd_lock_status(globals: &Globals, mut args: impl Iterator<Item = String>) -> Result<()> {
    let mut catalog: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--catalog" => catalog = Some(PathBuf::from(required(&mut args, "--catalog")?)),
            _ => return Err(unknown_arg(&arg)),
        }
    }
    let catalog = catalog.ok_or_else(|| missing("--catalog <path>"))?;
    let coordinator = LockCoordinator::shared(&catalog, "status", LockOptions::default());

    let status = coordinator.lock_status()?;
    if globals.json {
        let value = match &status {
            None => serde_json::json!({ "held": false }),
            Some(status) => serde_json::json!({
                "held": true,
                "owner": status.owner,
                "ageSecs": status.age.as_secs(),
                "stale": status.stale,
            }),
        };
        return print_json(&value);
    }

    match status {
        None => println!("unlocked"),
        Some(status) => {
            let holder = status
                .owner
                .map(|o| format!("{} (pid {}, since {})", o.computer_id, o.pid, o.acquired_at))
                .unwrap_or_else(|| "unknown owner".to_string());
            println!(
                "locked by {holder}, age {}s{}",
                status.age.as_secs(),
                if status.stale { ", stale" } else { "" }
            );
        }
    }
    Ok(())
}

/// Shared when this machine has a path mapping config, unless `--local`.
fn open_library(globals: &Globals, catalog: &Path, local: bool) -> Result<(LockCoordinator, LibraryMode)> {
    let mut store = globals.config_store()?;
    if local || !store.exists() {
        tracing::debug!(catalog = %catalog.display(), "opening library in local mode");
        return Ok((LockCoordinator::local(catalog)?, LibraryMode::Local));
    }
    let config = store.load()?;
    let coordinator = LockCoordinator::shared(catalog, config.computer_id.clone(), LockOptions::default());
    coordinator.ensure_catalog()?;
    Ok((coordinator, LibraryMode::Shared(PathTranslator::new(config))))
}

fn log_progress(progress: &Progress) {
    tracing::debug!(
        phase = %progress.phase,
        current = progress.current,
        total = progress.total,
        "{}",
        progress.message
    );
}

fn print_config(globals: &Globals, config: &PathMappingConfig) -> Result<()> {
    if globals.json {
        return print_json(config);
    }
    println!("computer: {} ({})", config.computer_name, config.computer_id);
    println!("os: {}", config.os);
    println!("nas root: {}", config.nas_root.display());
    if let Some(fs_type) = &config.nas_fs_type {
        println!("nas filesystem: {fs_type}");
    }
    for (name, path) in &config.path_mappings {
        println!("  {name} -> {}", path.display());
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_errors<R>(report: &R)
where
    R: BatchOutcome + HasErrors,
{
    let errors = report.error_log();
    if errors.is_empty() {
        return;
    }
    eprintln!("{} item(s) failed:", report.failed());
    for item in errors.items() {
        eprintln!("  [{}] {}: {}", item.phase, item.target, item.message);
    }
    if errors.dropped() > 0 {
        eprintln!("  ... and {} more", errors.dropped());
    }
}

trait HasErrors {
    fn error_log(&self) -> &clipvault_core::ErrorLog;
}

impl HasErrors for clipvault_core::ScanReport {
    fn error_log(&self) -> &clipvault_core::ErrorLog {
        &self.errors
    }
}

impl HasErrors for clipvault_core::RelinkReport {
    fn error_log(&self) -> &clipvault_core::ErrorLog {
        &self.errors
    }
}

impl HasErrors for clipvault_core::migrate::MigrationResult {
    fn error_log(&self) -> &clipvault_core::ErrorLog {
        &self.errors
    }
}

fn dry_run_prefix(dry_run: bool) -> &'static str {
    if dry_run {
        "[dry run] "
    } else {
        ""
    }
}

fn parse_mapping(raw: &str) -> Result<(String, PathBuf)> {
    match raw.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), PathBuf::from(path)))
        }
        _ => Err(Error::InvalidArgument(format!(
            "expected --map <name>=<path>, got {raw}"
        ))),
    }
}

fn default_computer_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|n| !n.is_empty())
        .or_else(|| {
            dirs::home_dir()
                .and_then(|h| h.file_name().map(|n| n.to_string_lossy().to_string()))
        })
        .unwrap_or_else(|| "unnamed".to_string())
}

fn required(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    args.next()
        .ok_or_else(|| Error::InvalidArgument(format!("{flag} needs a value")))
}

fn missing(what: &str) -> Error {
    Error::InvalidArgument(format!("missing {what}"))
}

fn unknown_arg(arg: &str) -> Error {
    Error::InvalidArgument(format!("unknown arg: {arg}"))
}

fn print_help() {
    println!(
        r#"clipvault

USAGE:
  clipvault [--json] [-v] [--config <path>] <command> [options]

COMMANDS:
  init        --nas-root <path> [--name <computer>] [--map <root>=<path>]... [--catalog <db>] [--force]
  config
  scan        --root <path> --catalog <db> [--ignore-file <path>] [--dry-run] [--local]
  relink      --target <path> --catalog <db> [--copy-missing] [--ignore-file <path>] [--dry-run] [--local]
  migrate     --catalog <db> --nas-root <path> [--name <computer>] [--map <root>=<path>]...
              [--move-clips <path>] [--backup-dir <path>] [--dry-run]
  rollback    --backup <path> --catalog <db>
  validate    --catalog <db>
  lock-status --catalog <db>

NOTES:
  - With a path mapping config present, scan and relink run in shared mode:
    paths are stored as canonical keys and every write holds the catalog lock.
    A missing shared catalog is created empty on first use.
  - Logging goes to stderr; set RUST_LOG to override the level.
"#
    );
}
