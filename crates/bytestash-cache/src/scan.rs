//! Startup directory scanner.
//!
//! Walks the cache directory once at open time and rebuilds the set of
//! complete entries. Temporaries left by aborted edits are deleted, as
//! are entries missing a required clean slot. Files that do not match
//! the naming schema are left on disk untouched; the cache never
//! garbage-collects foreign data. Per-file failures are logged and
//! skipped so that a single bad bucket cannot fail `open`.

use crate::paths;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A complete on-disk entry discovered at open time.
///
/// The original user key is unrecoverable from disk, so discovered
/// entries are identified by hash until the first lookup promotes them.
#[derive(Debug)]
pub(crate) struct DiscoveredEntry {
    pub hash: String,
    pub lengths: Vec<u64>,
}

#[derive(Debug, Default)]
struct Bucket {
    dirty: Vec<PathBuf>,
    clean: HashMap<usize, (PathBuf, u64)>,
}

/// Scan `dir` and return complete entries in discovery order.
///
/// The top-level directory listing must succeed; everything below it is
/// best-effort.
pub(crate) fn scan_directory(dir: &Path, value_count: usize) -> io::Result<Vec<DiscoveredEntry>> {
    let mut order: Vec<String> = Vec::new();
    let mut buckets: HashMap<String, Bucket> = HashMap::new();

    for subdir in fs::read_dir(dir)? {
        let subdir = match subdir {
            Ok(subdir) => subdir,
            Err(err) => {
                warn!(target: "stash::scan", event = "dirent_unreadable", error = %err);
                continue;
            }
        };
        let subdir_path = subdir.path();
        if !subdir.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let Some(prefix) = subdir.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        collect_bucket_files(&subdir_path, &prefix, &mut order, &mut buckets);
    }

    let mut entries = Vec::new();
    let mut removed_incomplete = 0_usize;
    let mut removed_dirty = 0_usize;
    for hash in order {
        let bucket = buckets.remove(&hash).unwrap_or_default();

        // Any temporary means an edit died mid-flight; its leftovers are
        // unconditionally discarded.
        for tmp in &bucket.dirty {
            removed_dirty += 1;
            remove_file_logged(tmp);
        }

        let complete = (0..value_count).all(|slot| bucket.clean.contains_key(&slot));
        if !complete {
            for (path, _) in bucket.clean.values() {
                remove_file_logged(path);
            }
            removed_incomplete += 1;
            debug!(
                target: "stash::scan",
                event = "incomplete_entry_discarded",
                hash = %hash,
                files = bucket.clean.len()
            );
            continue;
        }

        let mut lengths = Vec::with_capacity(value_count);
        for slot in 0..value_count {
            let (_, len) = bucket.clean[&slot];
            lengths.push(len);
        }
        entries.push(DiscoveredEntry { hash, lengths });
    }

    debug!(
        target: "stash::scan",
        event = "scan_complete",
        entries = entries.len(),
        removed_dirty,
        removed_incomplete
    );
    Ok(entries)
}

fn collect_bucket_files(
    subdir: &Path,
    prefix: &str,
    order: &mut Vec<String>,
    buckets: &mut HashMap<String, Bucket>,
) {
    let listing = match fs::read_dir(subdir) {
        Ok(listing) => listing,
        Err(err) => {
            warn!(target: "stash::scan", event = "bucket_unreadable", bucket = %subdir.display(), error = %err);
            return;
        }
    };
    for file in listing {
        let file = match file {
            Ok(file) => file,
            Err(err) => {
                warn!(target: "stash::scan", event = "dirent_unreadable", error = %err);
                continue;
            }
        };
        if !file.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = file.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(parsed) = paths::parse_file_name(name) else {
            continue;
        };
        // The bucket directory name must be the two-char hash prefix;
        // anything else is foreign data and stays untouched.
        if prefix.len() != 2 || !parsed.hash.starts_with(prefix) {
            continue;
        }

        if !buckets.contains_key(parsed.hash) {
            order.push(parsed.hash.to_owned());
        }
        let hash = parsed.hash.to_owned();
        if parsed.dirty {
            buckets.entry(hash).or_default().dirty.push(file.path());
            continue;
        }
        let len = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(err) => {
                warn!(
                    target: "stash::scan",
                    event = "stat_failed",
                    file = %file.path().display(),
                    error = %err
                );
                continue;
            }
        };
        buckets
            .entry(hash)
            .or_default()
            .clean
            .insert(parsed.slot, (file.path(), len));
    }
}

fn remove_file_logged(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(
                target: "stash::scan",
                event = "remove_failed",
                file = %path.display(),
                error = %err
            );
        }
    }
}
