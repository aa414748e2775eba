use std::fs;
use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{Error, Result};

/// OS droppings and our own temp/lock files.
pub const DEFAULT_IGNORES: &[&str] = &[
    ".DS_Store",
    "._*",
    "Thumbs.db",
    "desktop.ini",
    "*.partial",
    ".clipvault*",
    ".*.tmp",
    "*.lock",
];

/// Glob-based exclude list consulted by scan and relink.
/// Patterns match either the file name or the root-relative path.
#[derive(Debug, Clone)]
pub struct IgnoreList {
    patterns: Vec<String>,
    set: GlobSet,
}

impl Default for IgnoreList {
    fn default() -> Self {
        // The built-in patterns are static and known to compile.
        Self::from_patterns(DEFAULT_IGNORES.iter().copied()).unwrap_or_else(|_| Self::empty())
    }
}

impl IgnoreList {
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }

    pub fn from_patterns<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| p.as_ref().trim().to_string())
            .filter(|p| !p.is_empty() && !p.starts_with('#'))
            .collect();

        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            let glob = Glob::new(pattern).map_err(|err| {
                Error::InvalidArgument(format!("bad ignore pattern {pattern:?}: {err}"))
            })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|err| Error::InvalidArgument(format!("bad ignore patterns: {err}")))?;

        Ok(Self { patterns, set })
    }

    /// Defaults plus one pattern per line of `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_patterns(
            DEFAULT_IGNORES
                .iter()
                .copied()
                .chain(contents.lines()),
        )
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_ignored(&self, root: &Path, path: &Path) -> bool {
        if let Some(name) = path.file_name() {
            if self.set.is_match(Path::new(name)) {
                return true;
            }
        }
        match path.strip_prefix(root) {
            Ok(rel) => self.set.is_match(rel),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_skip_os_metadata() {
        let list = IgnoreList::default();
        let root = Path::new("/mnt/clips");
        assert!(list.is_ignored(root, Path::new("/mnt/clips/2025-01-01/.DS_Store")));
        assert!(list.is_ignored(root, Path::new("/mnt/clips/._a.mp4")));
        assert!(!list.is_ignored(root, Path::new("/mnt/clips/2025-01-01/a.mp4")));
    }

    #[test]
    fn loads_patterns_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(".clipignore");
        fs::write(&file, "# comment\n\n*.xmp\nrenders/**\n").unwrap();

        let list = IgnoreList::load(&file).unwrap();
        let root = Path::new("/mnt/clips");
        assert!(list.is_ignored(root, Path::new("/mnt/clips/a.xmp")));
        assert!(list.is_ignored(root, Path::new("/mnt/clips/renders/out/final.mp4")));
        assert!(!list.is_ignored(root, Path::new("/mnt/clips/raw/final.mp4")));
        assert!(list.patterns().iter().any(|p| p == "*.xmp"));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        assert!(IgnoreList::from_patterns(["a[b"]).is_err());
    }
}
