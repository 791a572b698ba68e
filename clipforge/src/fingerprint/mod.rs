//! Two-tier content fingerprinting.
//!
//! The quick tier hashes the file size plus five sampled 1 MiB windows
//! (start, 25%, 50%, 75%, end) and is cheap enough to run on every
//! resolve pass. The strong tier hashes the full content and is the
//! authority whenever the quick tier disagrees with the manifest: large
//! media containers routinely get header-only rewrites that shift the
//! sampled windows without changing the picture.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Sampled window size for the quick tier, and the streaming chunk size
/// for the strong tier.
const WINDOW_BYTES: u64 = 1024 * 1024;

/// Relative offsets of the first four sampled windows; the fifth is
/// anchored to the end of the file.
const WINDOW_POSITIONS: [f64; 4] = [0.0, 0.25, 0.50, 0.75];

/// Both fingerprint tiers of one input artifact, plus its size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFingerprint {
    pub quick: String,
    pub strong: String,
    pub size: u64,
}

/// What the fingerprint stored in the manifest says about the file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintChange {
    /// Size and quick hash both match.
    Unchanged,
    /// Quick hash moved but the full content is identical; treated as a
    /// cache hit.
    MetadataOnlyChanged,
    /// The content itself changed.
    ContentChanged,
}

/// Compute both tiers in one pass over the file's lifetime on disk.
pub fn fingerprint_artifact(path: &Path) -> Result<ArtifactFingerprint> {
    let (quick, size) = quick_fingerprint(path)?;
    let strong = strong_fingerprint(path)?;
    Ok(ArtifactFingerprint {
        quick,
        strong,
        size,
    })
}

/// Quick tier: SHA-256 over the file size and five sampled windows.
pub fn quick_fingerprint(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path)
        .map_err(|e| Error::permanent(format!("cannot open {}: {}", path.display(), e)))?;
    let size = file.metadata()?.len();
    if size == 0 {
        return Err(Error::permanent(format!(
            "refusing to fingerprint empty file {}",
            path.display()
        )));
    }

    let mut hasher = Sha256::new();
    hasher.update(size.to_string().as_bytes());

    let mut offsets: Vec<u64> = WINDOW_POSITIONS
        .iter()
        .map(|pos| (size as f64 * pos) as u64)
        .collect();
    offsets.push(size.saturating_sub(WINDOW_BYTES));

    let mut buf = vec![0u8; WINDOW_BYTES as usize];
    for offset in offsets {
        file.seek(SeekFrom::Start(offset))?;
        let want = WINDOW_BYTES.min(size - offset) as usize;
        let mut read_total = 0;
        while read_total < want {
            let n = file.read(&mut buf[read_total..want])?;
            if n == 0 {
                break;
            }
            read_total += n;
        }
        hasher.update(&buf[..read_total]);
    }

    Ok((hex::encode(hasher.finalize()), size))
}

/// Strong tier: SHA-256 over the full content, streamed.
pub fn strong_fingerprint(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| Error::permanent(format!("cannot open {}: {}", path.display(), e)))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; WINDOW_BYTES as usize];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Fingerprint of a serializable configuration's canonical JSON.
pub fn config_fingerprint<T: Serialize>(config: &T) -> Result<String> {
    // serde_json Value objects keep keys BTree-ordered, so this is
    // canonical regardless of struct field order.
    let canonical = serde_json::to_value(config)?.to_string();
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

/// Fingerprint of an arbitrary canonical string (already-serialized payloads).
pub fn payload_fingerprint(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

/// Compare stored fingerprints against the file currently on disk.
///
/// The tiers escalate: a size mismatch is conclusive, a quick match is
/// conclusive, but a quick mismatch forces a strong-tier check before
/// `ContentChanged` is declared.
pub fn compare(stored: &ArtifactFingerprint, path: &Path) -> Result<FingerprintChange> {
    let size = std::fs::metadata(path)?.len();
    if size != stored.size {
        return Ok(FingerprintChange::ContentChanged);
    }

    let (quick, _) = quick_fingerprint(path)?;
    if quick == stored.quick {
        return Ok(FingerprintChange::Unchanged);
    }

    let strong = strong_fingerprint(path)?;
    if strong == stored.strong {
        Ok(FingerprintChange::MetadataOnlyChanged)
    } else {
        Ok(FingerprintChange::ContentChanged)
    }
}

/// Classify a freshly computed fingerprint against a stored one without
/// touching the filesystem again.
pub fn classify(stored: &ArtifactFingerprint, current: &ArtifactFingerprint) -> FingerprintChange {
    if current.size != stored.size {
        return FingerprintChange::ContentChanged;
    }
    if current.quick == stored.quick {
        return FingerprintChange::Unchanged;
    }
    if current.strong == stored.strong {
        FingerprintChange::MetadataOnlyChanged
    } else {
        FingerprintChange::ContentChanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn quick_fingerprint_is_deterministic() {
        let f = write_temp(b"some artifact bytes");
        let (a, size_a) = quick_fingerprint(f.path()).unwrap();
        let (b, size_b) = quick_fingerprint(f.path()).unwrap();
        assert_eq!(a, b);
        assert_eq!(size_a, size_b);
    }

    #[test]
    fn quick_fingerprint_rejects_empty_file() {
        let f = write_temp(b"");
        let err = quick_fingerprint(f.path()).unwrap_err();
        assert!(matches!(err, Error::PermanentInput(_)));
    }

    #[test]
    fn size_seeds_the_quick_hash() {
        // Same leading content, different length: windows overlap but the
        // seeded size must separate them even for sub-window files.
        let a = write_temp(b"abcdef");
        let b = write_temp(b"abcdefabcdef");
        let (ha, _) = quick_fingerprint(a.path()).unwrap();
        let (hb, _) = quick_fingerprint(b.path()).unwrap();
        assert_ne!(ha, hb);
    }

    #[test]
    fn strong_fingerprint_matches_known_digest() {
        let f = write_temp(b"abc");
        let digest = strong_fingerprint(f.path()).unwrap();
        // SHA-256("abc")
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn compare_reports_unchanged_for_untouched_file() {
        let f = write_temp(b"stable content");
        let stored = fingerprint_artifact(f.path()).unwrap();
        assert_eq!(
            compare(&stored, f.path()).unwrap(),
            FingerprintChange::Unchanged
        );
    }

    #[test]
    fn quick_match_settles_compare_without_the_strong_tier() {
        let f = write_temp(b"stable recording bytes");
        let (quick, size) = quick_fingerprint(f.path()).unwrap();
        // A stored strong hash that matches nothing: if the quick match
        // truly short-circuits, it is never consulted.
        let stored = ArtifactFingerprint {
            quick,
            strong: "never-computed".to_string(),
            size,
        };
        assert_eq!(
            compare(&stored, f.path()).unwrap(),
            FingerprintChange::Unchanged
        );
    }

    #[test]
    fn compare_reports_content_change_on_rewrite() {
        let f = write_temp(b"original content");
        let stored = fingerprint_artifact(f.path()).unwrap();
        std::fs::write(f.path(), b"modified content").unwrap();
        assert_eq!(
            compare(&stored, f.path()).unwrap(),
            FingerprintChange::ContentChanged
        );
    }

    #[test]
    fn classify_confirms_quick_mismatch_against_strong_tier() {
        let base = fingerprint_artifact(write_temp(b"payload").path()).unwrap();
        // Same strong hash, divergent quick hash: a sampled-window shift.
        let mut shifted = base.clone();
        shifted.quick = "deadbeef".to_string();
        assert_eq!(
            classify(&base, &shifted),
            FingerprintChange::MetadataOnlyChanged
        );

        let mut rewritten = shifted.clone();
        rewritten.strong = "cafebabe".to_string();
        assert_eq!(classify(&base, &rewritten), FingerprintChange::ContentChanged);
    }

    #[test]
    fn config_fingerprint_is_field_order_independent() {
        #[derive(Serialize)]
        struct A {
            x: u32,
            y: u32,
        }
        #[derive(Serialize)]
        struct B {
            y: u32,
            x: u32,
        }
        let a = config_fingerprint(&A { x: 1, y: 2 }).unwrap();
        let b = config_fingerprint(&B { y: 2, x: 1 }).unwrap();
        assert_eq!(a, b);
    }
}
