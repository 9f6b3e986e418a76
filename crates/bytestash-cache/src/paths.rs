//! Key hashing and on-disk path layout.
//!
//! A user key maps to `<dir>/<hh>/<hash>.<slot>` for committed values
//! and `<dir>/<hh>/<hash>.<slot>.tmp` for in-flight edits, where `hash`
//! is the lowercase SHA-256 hex digest of the key and `hh` its first
//! two characters. Two distinct keys with colliding digests would
//! overwrite each other; no collision detection is attempted.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Length of the hex-encoded SHA-256 digest in a cache filename.
pub(crate) const HASH_LEN: usize = 64;

/// Suffix marking a temporary file written by an in-flight edit.
pub(crate) const DIRTY_SUFFIX: &str = ".tmp";

/// Lowercase SHA-256 hex digest of a user key.
pub(crate) fn key_hash(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Two-hex-char bucket directory for a hash.
pub(crate) fn bucket_dir(dir: &Path, hash: &str) -> PathBuf {
    dir.join(&hash[..2])
}

/// Authoritative file for a committed slot.
pub(crate) fn clean_path(dir: &Path, hash: &str, slot: usize) -> PathBuf {
    bucket_dir(dir, hash).join(format!("{hash}.{slot}"))
}

/// Temporary file for a slot written by an in-flight edit.
pub(crate) fn dirty_path(dir: &Path, hash: &str, slot: usize) -> PathBuf {
    bucket_dir(dir, hash).join(format!("{hash}.{slot}{DIRTY_SUFFIX}"))
}

/// Parsed cache filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParsedName<'a> {
    pub hash: &'a str,
    pub slot: usize,
    pub dirty: bool,
}

/// Parse `<64-hex>.<digits>` or `<64-hex>.<digits>.tmp`.
///
/// Anything else (foreign files, truncated names, uppercase hex) yields
/// `None` and is left alone by the scanner.
pub(crate) fn parse_file_name(name: &str) -> Option<ParsedName<'_>> {
    if !name.is_ascii() {
        return None;
    }
    let (stem, dirty) = match name.strip_suffix(DIRTY_SUFFIX) {
        Some(stem) => (stem, true),
        None => (name, false),
    };
    if stem.len() < HASH_LEN + 2 {
        return None;
    }
    let (hash, rest) = stem.split_at(HASH_LEN);
    if !hash
        .bytes()
        .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    {
        return None;
    }
    let slot = rest.strip_prefix('.')?;
    if slot.is_empty() || !slot.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let slot = slot.parse().ok()?;
    Some(ParsedName { hash, slot, dirty })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Digest pinned against an external sha256sum of the same input.
    const HASH_A: &str = "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb";

    #[test]
    fn key_hash_is_lowercase_sha256_hex() {
        assert_eq!(key_hash("a"), HASH_A);
        assert_eq!(key_hash("a").len(), HASH_LEN);
    }

    #[test]
    fn layout_places_files_under_two_char_bucket() {
        let dir = Path::new("/cache");
        let clean = clean_path(dir, HASH_A, 0);
        let dirty = dirty_path(dir, HASH_A, 1);
        assert_eq!(clean, dir.join("ca").join(format!("{HASH_A}.0")));
        assert_eq!(dirty, dir.join("ca").join(format!("{HASH_A}.1.tmp")));
    }

    #[test]
    fn parses_clean_and_dirty_names() {
        let clean = format!("{HASH_A}.0");
        let parsed = parse_file_name(&clean).expect("clean name");
        assert_eq!(parsed.hash, HASH_A);
        assert_eq!(parsed.slot, 0);
        assert!(!parsed.dirty);

        let dirty = format!("{HASH_A}.12.tmp");
        let parsed = parse_file_name(&dirty).expect("dirty name");
        assert_eq!(parsed.slot, 12);
        assert!(parsed.dirty);
    }

    #[test]
    fn rejects_foreign_names() {
        assert!(parse_file_name("otherFile0").is_none());
        assert!(parse_file_name(&format!("hello{HASH_A}.0")).is_none());
        assert!(parse_file_name(&format!("{HASH_A}0")).is_none());
        assert!(parse_file_name(&format!("{HASH_A}.")).is_none());
        assert!(parse_file_name(&format!("{HASH_A}.x")).is_none());
        assert!(parse_file_name(&format!("{HASH_A}.0.bak")).is_none());
        assert!(parse_file_name(&HASH_A[..HASH_LEN - 1]).is_none());
        // Uppercase hex is not produced by this cache.
        assert!(parse_file_name(&format!("{}.0", HASH_A.to_uppercase())).is_none());
        // Multibyte names must not panic the parser.
        assert!(parse_file_name("каша.0").is_none());
    }
}
