//! Translation between machine-local absolute paths and canonical keys.
//!
//! A canonical key is `<root name>/<remainder>` (for example
//! `clips/2025-01-15/video.mp4`) and means the same file on every machine that
//! has a mapping for `<root name>`. Keys under no named root are relative to
//! the machine's NAS root.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::PathMappingConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct PathTranslator {
    nas_root: String,
    /// `(name, normalized root)`, longest root first.
    mappings: Vec<(String, String)>,
}

impl PathTranslator {
    pub fn new(config: &PathMappingConfig) -> Self {
        let mut mappings: Vec<(String, String)> = config
            .path_mappings
            .iter()
            .map(|(name, root)| (name.clone(), normalize_path(&root.to_string_lossy())))
            .filter(|(name, root)| !name.is_empty() && !root.is_empty())
            .collect();
        mappings.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));
        Self {
            nas_root: normalize_path(&config.nas_root.to_string_lossy()),
            mappings,
        }
    }

    pub fn to_canonical(&self, path: &Path) -> Result<String> {
        let normalized = normalize_path(&path.to_string_lossy());

        for (name, root) in &self.mappings {
            if let Some(rest) = strip_root(&normalized, root) {
                return Ok(if rest.is_empty() {
                    name.clone()
                } else {
                    format!("{name}/{rest}")
                });
            }
        }

        // A NAS-relative key whose first segment names a mapping would
        // resolve through that mapping instead, so it must round-trip.
        match strip_root(&normalized, &self.nas_root) {
            Some(rest)
                if !rest.is_empty()
                    && same_path(
                        &normalize_path(&self.to_absolute(rest).to_string_lossy()),
                        &normalized,
                    ) =>
            {
                Ok(rest.to_string())
            }
            _ => Err(Error::PathNotUnderRoot {
                path: path.to_path_buf(),
            }),
        }
    }

    pub fn to_absolute(&self, key: &str) -> PathBuf {
        let key = normalize_path(key);
        let key = key.trim_start_matches('/');
        let (first, rest) = key.split_once('/').unwrap_or((key, ""));

        match self.mappings.iter().find(|(name, _)| name == first) {
            Some((_, root)) => join_segments(PathBuf::from(root), rest),
            None => join_segments(PathBuf::from(&self.nas_root), key),
        }
    }

    /// Whether a stored path is already a canonical key rather than an
    /// absolute path left over from before migration.
    pub fn is_canonical(stored: &str) -> bool {
        !looks_absolute(stored)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.stat(key).is_some()
    }

    pub fn stat(&self, key: &str) -> Option<fs::Metadata> {
        if !Self::is_canonical(key) {
            return None;
        }
        fs::metadata(self.to_absolute(key)).ok()
    }

    pub fn nas_root(&self) -> &str {
        &self.nas_root
    }

    pub fn root_names(&self) -> impl Iterator<Item = &str> {
        self.mappings.iter().map(|(name, _)| name.as_str())
    }
}

/// Forward slashes, no empty or `.` segments, no trailing slash.
/// A leading `//` (UNC share) is preserved.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let unc = unified.starts_with("//");
    let absolute = unified.starts_with('/');

    let body = unified
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/");

    match (unc, absolute) {
        (true, _) => format!("//{body}"),
        (false, true) => format!("/{body}"),
        _ => body,
    }
}

/// Whether normalized `path` is `root` itself or lies below it.
pub fn is_within(path: &str, root: &str) -> bool {
    strip_root(path, root).is_some()
}

fn looks_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with('/')
        || path.starts_with('\\')
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

/// Remainder of `path` below `root` without leading slashes, if `root` is a
/// whole-segment prefix.
fn strip_root<'a>(path: &'a str, root: &str) -> Option<&'a str> {
    if root.is_empty() || path.len() < root.len() {
        return None;
    }
    let (head, tail) = path.split_at(root.len());
    let same = if cfg!(windows) {
        head.eq_ignore_ascii_case(root)
    } else {
        head == root
    };
    if !same {
        return None;
    }
    if tail.is_empty() || tail.starts_with('/') || root.ends_with('/') {
        Some(tail.trim_start_matches('/'))
    } else {
        None
    }
}

fn same_path(a: &str, b: &str) -> bool {
    if cfg!(windows) {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

fn join_segments(mut base: PathBuf, rest: &str) -> PathBuf {
    for seg in rest.split('/').filter(|s| !s.is_empty()) {
        base.push(seg);
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> PathTranslator {
        let mut config = PathMappingConfig::new("test", "/Volumes/Media");
        config.set_mapping("clips", "/Volumes/Media/clips");
        config.set_mapping("downloads", "/Users/ed/Downloads/clipvault");
        config.set_mapping("archive", "/Volumes/Media/clips/archive");
        PathTranslator::new(&config)
    }

    #[test]
    fn canonical_uses_longest_matching_root() {
        let t = translator();
        assert_eq!(
            t.to_canonical(Path::new("/Volumes/Media/clips/2025-01-15/a.mp4"))
                .unwrap(),
            "clips/2025-01-15/a.mp4"
        );
        assert_eq!(
            t.to_canonical(Path::new("/Volumes/Media/clips/archive/old.mov"))
                .unwrap(),
            "archive/old.mov"
        );
        assert_eq!(
            t.to_canonical(Path::new("/Users/ed/Downloads/clipvault/x.webm"))
                .unwrap(),
            "downloads/x.webm"
        );
    }

    #[test]
    fn falls_back_to_nas_root() {
        let t = translator();
        assert_eq!(
            t.to_canonical(Path::new("/Volumes/Media/projects/cut.prproj"))
                .unwrap(),
            "projects/cut.prproj"
        );
        assert_eq!(
            t.to_absolute("projects/cut.prproj"),
            PathBuf::from("/Volumes/Media/projects/cut.prproj")
        );
    }

    #[test]
    fn rejects_paths_outside_every_root() {
        let t = translator();
        for p in ["/tmp/a.mp4", "/Volumes/MediaBackup/clips/a.mp4", "/Volumes/Media"] {
            let err = t.to_canonical(Path::new(p)).unwrap_err();
            assert!(matches!(err, Error::PathNotUnderRoot { .. }), "{p}");
        }
    }

    #[test]
    fn nas_fallback_never_shadows_a_mapping() {
        let mut config = PathMappingConfig::new("laptop", "/Volumes/Media");
        config.set_mapping("downloads", "/Users/ed/Downloads");
        let t = PathTranslator::new(&config);

        let err = t
            .to_canonical(Path::new("/Volumes/Media/downloads/x.mp4"))
            .unwrap_err();
        assert!(matches!(err, Error::PathNotUnderRoot { .. }));
        assert_eq!(
            t.to_canonical(Path::new("/Users/ed/Downloads/x.mp4")).unwrap(),
            "downloads/x.mp4"
        );
        assert_eq!(
            t.to_canonical(Path::new("/Volumes/Media/downloads-old/x.mp4"))
                .unwrap(),
            "downloads-old/x.mp4"
        );
    }

    #[test]
    fn round_trips_paths_under_configured_roots() {
        let t = translator();
        for p in [
            "/Volumes/Media/clips/2025-01-01/a.mp4",
            "/Volumes/Media/clips//nested/./b.mov",
            "/Volumes/Media/clips/archive/2019/c.wav",
            "/Users/ed/Downloads/clipvault/d.pdf",
            "/Volumes/Media/libraries/e.mp3",
            "/Volumes/Media/clips",
        ] {
            let key = t.to_canonical(Path::new(p)).unwrap();
            let back = t.to_absolute(&key);
            assert_eq!(normalize_path(&back.to_string_lossy()), normalize_path(p));
        }
    }

    #[test]
    fn normalizes_windows_separators() {
        assert_eq!(normalize_path(r"C:\Media\clips\a.mp4"), "C:/Media/clips/a.mp4");
        assert_eq!(normalize_path(r"\\nas\share\clips\"), "//nas/share/clips");
        assert_eq!(normalize_path("/a//b/./c/"), "/a/b/c");

        let mut config = PathMappingConfig::new("win", r"\\nas\share");
        config.set_mapping("clips", r"\\nas\share\clips");
        let t = PathTranslator::new(&config);
        assert_eq!(
            t.to_canonical(Path::new(r"\\nas\share\clips\2025-02-02\a.mp4"))
                .unwrap(),
            "clips/2025-02-02/a.mp4"
        );
    }

    #[test]
    fn canonical_detection() {
        assert!(PathTranslator::is_canonical("clips/a.mp4"));
        assert!(!PathTranslator::is_canonical("/Volumes/Media/clips/a.mp4"));
        assert!(!PathTranslator::is_canonical(r"D:\clips\a.mp4"));
    }

    #[test]
    fn exists_and_stat_swallow_failures() {
        let dir = tempfile::tempdir().unwrap();
        let clips = dir.path().join("clips");
        fs::create_dir_all(&clips).unwrap();
        fs::write(clips.join("a.mp4"), b"abc").unwrap();

        let t = PathTranslator::new(&PathMappingConfig::new("t", dir.path()));
        assert!(t.exists("clips/a.mp4"));
        assert_eq!(t.stat("clips/a.mp4").map(|m| m.len()), Some(3));
        assert!(!t.exists("clips/b.mp4"));
        assert!(t.stat("/absolute/key").is_none());
    }
}
