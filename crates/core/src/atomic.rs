//! Write-to-temp-then-rename helpers. The temp file always lives next to the
//! target so the final rename never crosses a filesystem boundary.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// A hidden, uniquely named sibling of `target`.
pub fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp_name = format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple());
    match target.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}

/// Runs `fill` against a temp path and renames the result over `target`.
/// The temp file is removed if either step fails.
pub fn replace_with<F>(target: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let tmp = temp_path_for(target);
    let outcome = fill(&tmp).and_then(|()| fs::rename(&tmp, target).map_err(Into::into));
    if outcome.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    outcome
}

pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    replace_with(target, |tmp| {
        let mut file = fs::File::create(tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    })
}

pub fn copy_atomic(src: &Path, target: &Path) -> Result<u64> {
    let mut copied = 0;
    replace_with(target, |tmp| {
        copied = fs::copy(src, tmp)?;
        Ok(())
    })?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_existing_file_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("catalog.db");
        fs::write(&target, b"old").unwrap();

        write_atomic(&target, b"new").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"new");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn failed_fill_keeps_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("catalog.db");
        fs::write(&target, b"old").unwrap();

        let res = replace_with(&target, |tmp| {
            fs::write(tmp, b"partial")?;
            Err(crate::Error::InvalidArgument("boom".into()))
        });

        assert!(res.is_err());
        assert_eq!(fs::read(&target).unwrap(), b"old");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
