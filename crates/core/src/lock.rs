//! Cross-machine mutual exclusion through a lock file on the shared volume.
//!
//! The lock is a sibling file created with `create_new`, which network
//! filesystems honour as an exclusive create. A lock whose file has not been
//! touched for [`LockOptions::stale_after`] is treated as abandoned and may be
//! reclaimed. A holder that is merely slow can lose its lock this way; it
//! finds out through [`LockHandle::verify`] before writing anything back.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub stale_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            stale_after: Duration::from_secs(30),
        }
    }
}

/// Written into the lock file so operators can see who holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockOwner {
    pub computer_id: String,
    pub pid: u32,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LockStatus {
    pub owner: Option<LockOwner>,
    pub age: Duration,
    pub stale: bool,
}

pub fn lock_path_for(catalog: &Path) -> PathBuf {
    let mut name = catalog
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "catalog".into());
    name.push(".lock");
    catalog.with_file_name(name)
}

#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    computer_id: String,
    options: LockOptions,
}

impl FileLock {
    pub fn for_catalog(catalog: &Path, computer_id: impl Into<String>, options: LockOptions) -> Self {
        Self {
            path: lock_path_for(catalog),
            computer_id: computer_id.into(),
            options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Blocks with exponential backoff until the lock is ours or the attempts
    /// run out.
    pub fn acquire(&self) -> Result<LockHandle> {
        let attempts = self.options.max_attempts.max(1);
        let mut backoff = self.options.initial_backoff;

        for attempt in 1..=attempts {
            if let Some(handle) = self.try_acquire()? {
                tracing::debug!(lock = %self.path.display(), attempt, "lock acquired");
                return Ok(handle);
            }
            if attempt < attempts {
                tracing::debug!(lock = %self.path.display(), attempt, ?backoff, "lock busy, backing off");
                thread::sleep(backoff);
                backoff = (backoff * 2).min(self.options.max_backoff);
            }
        }

        Err(Error::LockAcquisitionTimeout {
            lock_path: self.path.clone(),
            attempts,
        })
    }

    pub fn try_acquire(&self) -> Result<Option<LockHandle>> {
        if let Some(handle) = self.create()? {
            return Ok(Some(handle));
        }
        if self.reclaim_if_stale()? {
            return self.create();
        }
        Ok(None)
    }

    pub fn status(&self) -> Result<Option<LockStatus>> {
        let age = match lock_age(&self.path) {
            Ok(age) => age,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(LockStatus {
            owner: read_owner(&self.path),
            age,
            stale: age > self.options.stale_after,
        }))
    }

    fn create(&self) -> Result<Option<LockHandle>> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let owner = LockOwner {
            computer_id: self.computer_id.clone(),
            pid: std::process::id(),
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at: Utc::now(),
        };
        let written = serde_json::to_vec(&owner)
            .map_err(Error::from)
            .and_then(|json| {
                file.write_all(&json)?;
                file.sync_all()?;
                Ok(())
            });
        if let Err(err) = written {
            drop(file);
            let _ = fs::remove_file(&self.path);
            return Err(err);
        }

        Ok(Some(LockHandle {
            path: self.path.clone(),
            token: owner.token,
            released: false,
        }))
    }

    fn reclaim_if_stale(&self) -> Result<bool> {
        let age = match lock_age(&self.path) {
            Ok(age) => age,
            // Released between our create attempt and now.
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(err.into()),
        };
        if age <= self.options.stale_after {
            return Ok(false);
        }
        let owner = read_owner(&self.path);
        self.reclaim(owner.as_ref().map(|o| o.token.as_str()))
    }

    /// Moves the lock observed as stale aside and deletes it. Staleness check
    /// and rename are separate steps, so another machine may have reclaimed
    /// and re-created the lock in between; what was moved is checked again
    /// and put back unless it is still the stale lock with `observed_token`.
    fn reclaim(&self, observed_token: Option<&str>) -> Result<bool> {
        let aside = self
            .path
            .with_extension(format!("stale-{}", uuid::Uuid::new_v4().simple()));
        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(err.into()),
        }

        let moved = read_owner(&aside);
        let moved_age = lock_age(&aside).unwrap_or(Duration::ZERO);
        if moved.as_ref().map(|o| o.token.as_str()) != observed_token
            || moved_age <= self.options.stale_after
        {
            tracing::debug!(lock = %self.path.display(), "lock changed hands while reclaiming, restoring it");
            restore_lock(&aside, &self.path);
            return Ok(false);
        }
        let _ = fs::remove_file(&aside);

        tracing::warn!(
            lock = %self.path.display(),
            age_secs = moved_age.as_secs(),
            holder = moved.as_ref().map(|o| o.computer_id.as_str()).unwrap_or("unknown"),
            "reclaimed stale lock"
        );
        Ok(true)
    }
}

/// Puts a lock moved aside back in place. `hard_link` refuses to clobber a
/// lock created in the meantime; its displaced holder then fails `verify`.
fn restore_lock(aside: &Path, path: &Path) {
    match fs::hard_link(aside, path) {
        Ok(()) => {
            let _ = fs::remove_file(aside);
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(aside);
        }
        Err(_) => {
            let _ = fs::rename(aside, path);
        }
    }
}

/// Exclusive ownership of the shared catalog. Released on drop.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    token: String,
    released: bool,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fails with `LockLost` unless the lock file still carries this
    /// handle's token.
    pub fn verify(&self) -> Result<()> {
        match read_owner(&self.path) {
            Some(owner) if owner.token == self.token => Ok(()),
            other => {
                let holder = other.map(|o| o.computer_id);
                tracing::warn!(
                    lock = %self.path.display(),
                    holder = holder.as_deref().unwrap_or("none"),
                    "lock no longer ours"
                );
                Err(Error::LockLost {
                    lock_path: self.path.clone(),
                    holder,
                })
            }
        }
    }

    /// Checks ownership, then resets the staleness clock. Call before every
    /// write to the shared catalog.
    pub fn refresh(&self) -> Result<()> {
        self.verify()?;
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_modified(SystemTime::now())?;
        Ok(())
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.remove_if_ours()
    }

    fn remove_if_ours(&self) -> Result<()> {
        match read_owner(&self.path) {
            Some(owner) if owner.token == self.token => match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            },
            Some(owner) => {
                tracing::warn!(
                    lock = %self.path.display(),
                    holder = %owner.computer_id,
                    "lock was reclaimed by another holder before release"
                );
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.remove_if_ours() {
                tracing::warn!(lock = %self.path.display(), %err, "failed to release lock");
            }
        }
    }
}

fn lock_age(path: &Path) -> io::Result<Duration> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO))
}

fn read_owner(path: &Path) -> Option<LockOwner> {
    let file = File::open(path).ok()?;
    serde_json::from_reader(file).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> LockOptions {
        LockOptions {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
            stale_after: Duration::from_secs(30),
        }
    }

    fn age_lock(path: &Path, by: Duration) {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn lock_file_sits_next_to_catalog() {
        assert_eq!(
            lock_path_for(Path::new("/nas/library/catalog.db")),
            PathBuf::from("/nas/library/catalog.db.lock")
        );
    }

    #[test]
    fn second_holder_waits_then_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("catalog.db");
        let a = FileLock::for_catalog(&catalog, "machine-a", quick());
        let b = FileLock::for_catalog(&catalog, "machine-b", quick());

        let held = a.acquire().unwrap();
        assert!(b.try_acquire().unwrap().is_none());
        let err = b.acquire().unwrap_err();
        assert!(matches!(err, Error::LockAcquisitionTimeout { attempts: 3, .. }));
        assert!(err.is_retryable());

        held.release().unwrap();
        assert!(!a.path().exists());
        assert!(b.acquire().is_ok());
    }

    #[test]
    fn drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::for_catalog(&dir.path().join("c.db"), "m", quick());
        {
            let _held = lock.acquire().unwrap();
            assert!(lock.path().exists());
        }
        assert!(!lock.path().exists());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("catalog.db");
        let crashed = FileLock::for_catalog(&catalog, "crashed", quick());
        let held = crashed.acquire().unwrap();
        std::mem::forget(held);
        age_lock(crashed.path(), Duration::from_secs(120));

        let status = crashed.status().unwrap().unwrap();
        assert!(status.stale);
        assert_eq!(status.owner.unwrap().computer_id, "crashed");

        let next = FileLock::for_catalog(&catalog, "next", quick());
        let handle = next.try_acquire().unwrap().expect("stale lock reclaimed");
        assert_eq!(next.status().unwrap().unwrap().owner.unwrap().computer_id, "next");
        handle.release().unwrap();

        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn release_leaves_a_foreign_lock_alone() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("catalog.db");
        let slow = FileLock::for_catalog(&catalog, "slow", quick());
        let slow_handle = slow.acquire().unwrap();
        age_lock(slow.path(), Duration::from_secs(120));

        let fast = FileLock::for_catalog(&catalog, "fast", quick());
        let fast_handle = fast.acquire().unwrap();

        slow_handle.release().unwrap();
        assert!(fast.path().exists());
        fast_handle.release().unwrap();
        assert!(!fast.path().exists());
    }

    #[test]
    fn taken_over_handle_fails_verify_and_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("catalog.db");
        let slow = FileLock::for_catalog(&catalog, "slow", quick());
        let slow_handle = slow.acquire().unwrap();
        assert!(slow_handle.verify().is_ok());
        age_lock(slow.path(), Duration::from_secs(120));

        let fast = FileLock::for_catalog(&catalog, "fast", quick());
        let fast_handle = fast.acquire().unwrap();
        age_lock(fast.path(), Duration::from_secs(60));

        let err = slow_handle.refresh().unwrap_err();
        assert!(matches!(err, Error::LockLost { holder: Some(ref h), .. } if h == "fast"));
        // The new owner's lock keeps its own clock.
        assert!(fast.status().unwrap().unwrap().age >= Duration::from_secs(59));
        assert!(fast_handle.verify().is_ok());
    }

    #[test]
    fn reclaim_restores_a_lock_that_replaced_the_stale_one() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("catalog.db");
        let crashed = FileLock::for_catalog(&catalog, "crashed", quick());
        let held = crashed.acquire().unwrap();
        let observed = read_owner(crashed.path()).unwrap().token;
        std::mem::forget(held);

        // Someone else reclaimed it first and holds a fresh lock now.
        fs::remove_file(crashed.path()).unwrap();
        let fresh = FileLock::for_catalog(&catalog, "fresh", quick());
        let fresh_handle = fresh.acquire().unwrap();

        let late = FileLock::for_catalog(&catalog, "late", quick());
        assert!(!late.reclaim(Some(&observed)).unwrap());

        assert_eq!(late.status().unwrap().unwrap().owner.unwrap().computer_id, "fresh");
        assert!(fresh_handle.verify().is_ok());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn refresh_resets_staleness() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::for_catalog(&dir.path().join("c.db"), "m", quick());
        let held = lock.acquire().unwrap();
        age_lock(lock.path(), Duration::from_secs(120));
        assert!(lock.status().unwrap().unwrap().stale);

        held.refresh().unwrap();
        assert!(!lock.status().unwrap().unwrap().stale);
    }
}
