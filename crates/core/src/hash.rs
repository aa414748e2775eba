//! Sampled content fingerprints.
//!
//! Small files are hashed whole. Larger files hash their decimal size followed
//! by three samples taken at the start, the middle and the end. Scanner,
//! relink and importers must all go through [`Fingerprinter`] so that the
//! digests they produce stay comparable.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Error, Result};

pub const SAMPLE_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprinter {
    sample_size: u64,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self {
            sample_size: SAMPLE_SIZE,
        }
    }
}

impl Fingerprinter {
    /// Catalogs fingerprinted with one sample size cannot be matched against
    /// another; only tests should use anything but the default.
    pub fn with_sample_size(sample_size: u64) -> Self {
        assert!(sample_size > 0, "sample size must be positive");
        Self { sample_size }
    }

    pub fn sample_size(&self) -> u64 {
        self.sample_size
    }

    /// Hex digest of `path`. `known_size` saves a stat when the caller has one.
    pub fn fingerprint(&self, path: &Path, known_size: Option<u64>) -> Result<String> {
        self.try_fingerprint(path, known_size)
            .map_err(|source| Error::FingerprintUnreadable {
                path: path.to_path_buf(),
                source,
            })
    }

    fn try_fingerprint(&self, path: &Path, known_size: Option<u64>) -> std::io::Result<String> {
        let mut file = File::open(path)?;
        let size = match known_size {
            Some(size) => size,
            None => file.metadata()?.len(),
        };

        let mut hasher = blake3::Hasher::new();
        if size <= self.sample_size * 3 {
            hash_whole(&mut file, &mut hasher)?;
        } else {
            hasher.update(size.to_string().as_bytes());
            let mut buf = vec![0u8; self.sample_size as usize];
            for offset in sample_offsets(size, self.sample_size) {
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut buf)?;
                hasher.update(&buf);
            }
        }

        Ok(hasher.finalize().to_hex().to_string())
    }
}

/// Start, middle and tail sample positions for a file larger than three samples.
fn sample_offsets(size: u64, sample_size: u64) -> [u64; 3] {
    [0, size / 2 - sample_size / 2, size - sample_size]
}

fn hash_whole(file: &mut File, hasher: &mut blake3::Hasher) -> std::io::Result<()> {
    let mut reader = BufReader::new(file);
    let mut buf = [0u8; 1024 * 128];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(())
}

/// Fingerprint with the default sample size.
pub fn fingerprint(path: &Path, known_size: Option<u64>) -> Result<String> {
    Fingerprinter::default().fingerprint(path, known_size)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;

    use super::*;

    #[test]
    fn stable_until_the_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        fs::write(&path, vec![7u8; 4096]).unwrap();

        let fp = Fingerprinter::with_sample_size(256);
        let first = fp.fingerprint(&path, None).unwrap();
        let second = fp.fingerprint(&path, None).unwrap();
        assert_eq!(first, second);

        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1]).unwrap();
        drop(file);

        let third = fp.fingerprint(&path, None).unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn size_is_hashed_before_samples() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        // Every sample of both files is zeros; only the length differs.
        fs::write(&a, vec![0u8; 1000]).unwrap();
        fs::write(&b, vec![0u8; 1001]).unwrap();

        let fp = Fingerprinter::with_sample_size(16);
        assert_ne!(
            fp.fingerprint(&a, None).unwrap(),
            fp.fingerprint(&b, None).unwrap()
        );
    }

    #[test]
    fn small_files_are_hashed_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.txt");
        let body = b"exactly three samples".repeat(3);
        fs::write(&path, &body).unwrap();

        let fp = Fingerprinter::with_sample_size(body.len() as u64);
        let expected = blake3::hash(&body).to_hex().to_string();
        assert_eq!(fp.fingerprint(&path, None).unwrap(), expected);
    }

    #[test]
    fn large_files_hash_size_then_three_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("large.bin");
        let body: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &body).unwrap();

        let fp = Fingerprinter::with_sample_size(100);
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"1000");
        hasher.update(&body[0..100]);
        hasher.update(&body[450..550]);
        hasher.update(&body[900..1000]);
        assert_eq!(
            fp.fingerprint(&path, Some(1000)).unwrap(),
            hasher.finalize().to_hex().to_string()
        );
    }

    #[test]
    fn edits_in_the_middle_sample_are_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edit.bin");
        let mut body = vec![3u8; 1000];
        fs::write(&path, &body).unwrap();

        let fp = Fingerprinter::with_sample_size(100);
        let before = fp.fingerprint(&path, None).unwrap();
        body[500] = 9;
        fs::write(&path, &body).unwrap();
        assert_ne!(before, fp.fingerprint(&path, None).unwrap());
    }

    #[test]
    fn unreadable_file_is_a_fingerprint_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = fingerprint(&dir.path().join("gone.mov"), None).unwrap_err();
        assert!(matches!(err, Error::FingerprintUnreadable { .. }));
    }
}
