#![forbid(unsafe_code)]
//! Bounded disk-backed LRU cache for opaque byte payloads.
//!
//! Each entry holds a fixed number of independently addressable byte
//! values under a caller-supplied key. Edits stage their writes in
//! `.tmp` files and publish them with atomic renames, so a reader
//! holding a [`Snapshot`] keeps seeing the bytes that were current
//! when the snapshot was taken. An in-memory index plus recency list
//! enforces the configured on-disk ceiling: least recently used
//! entries are evicted synchronously after commits and on a background
//! worker when [`Stash::set_max_size`] lowers the bound.
//!
//! The cache survives process restarts without a journal. Keys are
//! never stored on disk; at open time the directory scanner rebuilds
//! hash-keyed placeholder entries, and the first `get` or `edit` of a
//! key promotes its placeholder in place.

mod lru;
mod paths;
mod pool;
mod scan;

pub use bytestash_error::{Result, StashError};

use crate::lru::{NodeId, RecencyList};
use crate::pool::EvictionPool;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Upper bound on values per entry; the edit protocol tracks written
/// slots in a 64-bit bitmap.
pub const MAX_VALUE_COUNT: usize = 64;

/// Sequence value for entries that have never committed.
const SEQ_UNCOMMITTED: u64 = u64::MAX;

/// Point-in-time counters, captured with a single lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StashMetrics {
    /// `get` calls that returned a snapshot.
    pub hits: u64,
    /// `get` calls that returned nothing.
    pub misses: u64,
    /// Entries removed to maintain the size bound.
    pub evictions: u64,
    /// Entries currently in the index (placeholders included).
    pub entries: usize,
    /// Total committed bytes on disk.
    pub size: u64,
    /// Configured ceiling in bytes.
    pub max_size: u64,
    /// Deferred eviction jobs queued or executing.
    pub pending_evictions: usize,
}

impl StashMetrics {
    /// Hit ratio in the range [0.0, 1.0]; 0.0 before any access.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry {
    hash: Arc<str>,
    lengths: Vec<u64>,
    readable: bool,
    editor: Option<u64>,
    sequence: u64,
    node: NodeId,
}

struct State {
    entries: HashMap<Arc<str>, Entry>,
    lru: RecencyList,
    size: u64,
    max_size: u64,
    next_sequence: u64,
    next_editor_id: u64,
    closed: bool,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl State {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(StashError::InvalidState("cache is closed"));
        }
        Ok(())
    }

    /// Find the index identity for a user key.
    ///
    /// Entries recovered by the scanner are keyed by hash until the
    /// first lookup arrives with the actual key, at which point the
    /// placeholder is promoted in place.
    fn resolve(&mut self, key: &str, hash: &str) -> Option<Arc<str>> {
        if let Some((ident, _)) = self.entries.get_key_value(key) {
            return Some(Arc::clone(ident));
        }
        let entry = self.entries.remove(hash)?;
        let ident: Arc<str> = Arc::from(key);
        self.lru.rename(entry.node, Arc::clone(&ident));
        self.entries.insert(Arc::clone(&ident), entry);
        trace!(target: "stash::index", event = "placeholder_promoted", hash = %hash);
        Some(ident)
    }

    /// Remove an entry from the index and recency list, releasing its
    /// accounted bytes. Disk state is the caller's concern.
    fn drop_entry(&mut self, ident: &str) {
        if let Some(entry) = self.entries.remove(ident) {
            if entry.readable {
                let total: u64 = entry.lengths.iter().sum();
                self.size = self.size.saturating_sub(total);
            }
            self.lru.unlink(entry.node);
        }
    }

    /// Evict from the least recently used end until the bound holds.
    ///
    /// Entries with an in-flight edit are pinned and skipped; if only
    /// pinned entries remain the size may transiently stay above the
    /// bound.
    fn evict_to_limit(&mut self, dir: &Path, value_count: usize) {
        let mut cursor = self.lru.first();
        while self.size > self.max_size {
            let Some(node) = cursor else { break };
            cursor = self.lru.next_of(node);
            let ident = Arc::clone(self.lru.ident(node));
            let Some(entry) = self.entries.get(ident.as_ref()) else {
                continue;
            };
            if entry.editor.is_some() {
                continue;
            }
            let hash = Arc::clone(&entry.hash);
            if let Err(err) = delete_clean_files(dir, &hash, value_count) {
                warn!(target: "stash::evict", event = "delete_failed", hash = %hash, error = %err);
            }
            self.drop_entry(&ident);
            self.evictions += 1;
            trace!(target: "stash::evict", event = "entry_evicted", hash = %hash, size = self.size);
        }
    }
}

struct Shared {
    dir: PathBuf,
    value_count: usize,
    state: Mutex<State>,
    pool: EvictionPool,
}

/// A bounded disk-backed LRU cache of byte values.
///
/// One instance owns its directory for the process lifetime; opening
/// the same directory from two instances at once is undefined. Keys
/// are addressed by their SHA-256 digest on disk, so two keys with
/// colliding digests would overwrite each other; no collision
/// detection is attempted.
pub struct Stash {
    shared: Arc<Shared>,
}

impl Stash {
    /// Open (creating if necessary) the cache rooted at `dir`, holding
    /// `value_count` values per entry under a `max_size` byte ceiling.
    ///
    /// Scans the directory once: temporaries from aborted edits and
    /// entries missing a clean value file are deleted, anything not
    /// matching the naming schema is left alone, and surviving entries
    /// are indexed by hash awaiting promotion. `value_count` is capped
    /// at [`MAX_VALUE_COUNT`].
    pub fn open(dir: impl AsRef<Path>, value_count: usize, max_size: u64) -> Result<Self> {
        if value_count < 1 || value_count > MAX_VALUE_COUNT {
            return Err(StashError::InvalidArg("value_count must be in 1..=64"));
        }
        if max_size < 1 {
            return Err(StashError::InvalidArg("max_size must be at least 1"));
        }
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut state = State {
            entries: HashMap::new(),
            lru: RecencyList::new(),
            size: 0,
            max_size,
            next_sequence: 0,
            next_editor_id: 0,
            closed: false,
            hits: 0,
            misses: 0,
            evictions: 0,
        };
        for found in scan::scan_directory(&dir, value_count)? {
            let ident: Arc<str> = Arc::from(found.hash.as_str());
            let node = state.lru.push_back(Arc::clone(&ident));
            let total: u64 = found.lengths.iter().sum();
            state.size += total;
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.entries.insert(
                Arc::clone(&ident),
                Entry {
                    hash: ident,
                    lengths: found.lengths,
                    readable: true,
                    editor: None,
                    sequence,
                    node,
                },
            );
        }
        if state.size > state.max_size {
            state.evict_to_limit(&dir, value_count);
        }
        debug!(
            target: "stash::open",
            event = "opened",
            dir = %dir.display(),
            entries = state.entries.len(),
            size = state.size,
            max_size
        );

        let pool = EvictionPool::new()?;
        Ok(Self {
            shared: Arc::new(Shared {
                dir,
                value_count,
                state: Mutex::new(state),
                pool,
            }),
        })
    }

    /// Snapshot of the entry for `key`, or `None` on a miss.
    ///
    /// The snapshot holds open read handles: it sees exactly the bytes
    /// committed at the time of this call, independent of later edits.
    /// A value file deleted behind the cache's back drops the entry
    /// and reads as a miss.
    pub fn get(&self, key: &str) -> Result<Option<Snapshot>> {
        ensure_key(key)?;
        let hash = paths::key_hash(key);
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        state.ensure_open()?;
        let Some(ident) = state.resolve(key, &hash) else {
            state.misses += 1;
            return Ok(None);
        };
        let Some(entry) = state.entries.get(ident.as_ref()) else {
            state.misses += 1;
            return Ok(None);
        };
        if !entry.readable {
            state.misses += 1;
            return Ok(None);
        }
        let entry_hash = Arc::clone(&entry.hash);
        let node = entry.node;
        let sequence = entry.sequence;
        let lengths = entry.lengths.clone();

        // All handles are captured before the lock is released, so a
        // concurrent commit is observed in full or not at all.
        let mut files = Vec::with_capacity(self.shared.value_count);
        for slot in 0..self.shared.value_count {
            match File::open(paths::clean_path(&self.shared.dir, &entry_hash, slot)) {
                Ok(file) => files.push(file),
                Err(err) => {
                    debug!(
                        target: "stash::read",
                        event = "clean_file_missing",
                        hash = %entry_hash,
                        slot,
                        error = %err
                    );
                    state.drop_entry(&ident);
                    state.misses += 1;
                    return Ok(None);
                }
            }
        }
        state.lru.move_to_back(node);
        state.hits += 1;
        trace!(target: "stash::read", event = "snapshot_opened", hash = %entry_hash);
        Ok(Some(Snapshot {
            shared: Arc::clone(&self.shared),
            key: key.to_owned(),
            sequence,
            lengths,
            files,
        }))
    }

    /// Begin an edit of `key`, or `None` while another edit is in
    /// flight for it.
    ///
    /// An absent key gets a not-yet-readable entry; until the first
    /// commit, `get` misses and an abort removes it again.
    pub fn edit(&self, key: &str) -> Result<Option<Editor>> {
        edit_internal(&self.shared, key, None)
    }

    /// Remove the entry for `key`, deleting its value files.
    ///
    /// Returns `Ok(false)` if the key is absent. Fails with
    /// [`StashError::Busy`] while an edit is in flight; the edit's
    /// commit or abort settles the on-disk state instead.
    pub fn remove(&self, key: &str) -> Result<bool> {
        ensure_key(key)?;
        let hash = paths::key_hash(key);
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        state.ensure_open()?;
        let Some(ident) = state.resolve(key, &hash) else {
            return Ok(false);
        };
        let Some(entry) = state.entries.get(ident.as_ref()) else {
            return Ok(false);
        };
        if entry.editor.is_some() {
            return Err(StashError::Busy);
        }
        let entry_hash = Arc::clone(&entry.hash);
        delete_clean_files(&self.shared.dir, &entry_hash, self.shared.value_count)?;
        state.drop_entry(&ident);
        debug!(target: "stash::evict", event = "entry_removed", hash = %entry_hash);
        Ok(true)
    }

    /// Total committed bytes currently accounted.
    pub fn size(&self) -> u64 {
        self.shared.state.lock().size
    }

    /// Configured size ceiling in bytes.
    pub fn max_size(&self) -> u64 {
        self.shared.state.lock().max_size
    }

    /// Number of values per entry, fixed at open.
    pub fn value_count(&self) -> usize {
        self.shared.value_count
    }

    /// Directory this cache owns.
    pub fn directory(&self) -> &Path {
        &self.shared.dir
    }

    /// Whether `close` (or `destroy`) has run.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Change the size ceiling.
    ///
    /// Growing never evicts. Shrinking schedules one deferred eviction
    /// pass on the background worker; `flush` waits for it.
    pub fn set_max_size(&self, max_size: u64) -> Result<()> {
        if max_size < 1 {
            return Err(StashError::InvalidArg("max_size must be at least 1"));
        }
        let shrink = {
            let mut state = self.shared.state.lock();
            state.ensure_open()?;
            let shrink = max_size < state.max_size;
            state.max_size = max_size;
            shrink
        };
        if shrink {
            let weak = Arc::downgrade(&self.shared);
            self.shared.pool.execute(Box::new(move || deferred_trim(&weak)));
            debug!(target: "stash::evict", event = "deferred_trim_scheduled", max_size);
        }
        Ok(())
    }

    /// Wait for any deferred eviction work to finish.
    pub fn flush(&self) -> Result<()> {
        self.shared.state.lock().ensure_open()?;
        self.shared.pool.drain();
        Ok(())
    }

    /// Close the cache: roll back the on-disk side of in-flight edits,
    /// finish deferred eviction, and stop the worker. Idempotent.
    ///
    /// Outstanding [`Editor`] values become stale; their `commit` and
    /// `abort` fail with [`StashError::InvalidState`]. Outstanding
    /// snapshots keep reading from their open handles.
    pub fn close(&self) -> Result<()> {
        {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if state.closed {
                return Ok(());
            }
            let editing: Vec<Arc<str>> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.editor.is_some())
                .map(|(ident, _)| Arc::clone(ident))
                .collect();
            for ident in editing {
                let Some(entry) = state.entries.get_mut(ident.as_ref()) else {
                    continue;
                };
                entry.editor = None;
                let hash = Arc::clone(&entry.hash);
                let readable = entry.readable;
                delete_dirty_files(&self.shared.dir, &hash, self.shared.value_count);
                if !readable {
                    state.drop_entry(&ident);
                }
            }
            state.closed = true;
            debug!(target: "stash::open", event = "closed", size = state.size);
        }
        self.shared.pool.shutdown();
        Ok(())
    }

    /// Close the cache and delete its entire directory.
    ///
    /// This is the one operation that also removes files the cache
    /// does not recognize as its own.
    pub fn destroy(self) -> Result<()> {
        self.close()?;
        match fs::remove_dir_all(&self.shared.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Counters snapshot. Acquires the cache lock once; the pending
    /// job count is an atomic read inside the same critical section.
    pub fn metrics(&self) -> StashMetrics {
        let state = self.shared.state.lock();
        StashMetrics {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            entries: state.entries.len(),
            size: state.size,
            max_size: state.max_size,
            pending_evictions: self.shared.pool.pending(),
        }
    }
}

impl Drop for Stash {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn ensure_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StashError::InvalidArg("key must be non-empty"));
    }
    Ok(())
}

fn deferred_trim(weak: &Weak<Shared>) {
    let Some(shared) = weak.upgrade() else { return };
    let mut state = shared.state.lock();
    if state.closed {
        return;
    }
    state.evict_to_limit(&shared.dir, shared.value_count);
}

fn delete_clean_files(dir: &Path, hash: &str, value_count: usize) -> io::Result<()> {
    for slot in 0..value_count {
        match fs::remove_file(paths::clean_path(dir, hash, slot)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn delete_dirty_files(dir: &Path, hash: &str, value_count: usize) {
    for slot in 0..value_count {
        match fs::remove_file(paths::dirty_path(dir, hash, slot)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(
                    target: "stash::edit",
                    event = "dirty_remove_failed",
                    hash = %hash,
                    slot,
                    error = %err
                );
            }
        }
    }
}

fn edit_internal(
    shared: &Arc<Shared>,
    key: &str,
    expected_sequence: Option<u64>,
) -> Result<Option<Editor>> {
    ensure_key(key)?;
    let hash: Arc<str> = Arc::from(paths::key_hash(key).as_str());
    let mut guard = shared.state.lock();
    let state = &mut *guard;
    state.ensure_open()?;
    let id = state.next_editor_id;
    state.next_editor_id += 1;

    let is_create = match state.resolve(key, &hash) {
        Some(ident) => {
            let Some(entry) = state.entries.get_mut(ident.as_ref()) else {
                return Ok(None);
            };
            if let Some(expected) = expected_sequence {
                if !entry.readable || entry.sequence != expected {
                    return Ok(None);
                }
            }
            if entry.editor.is_some() {
                trace!(target: "stash::edit", event = "edit_rejected_busy", hash = %hash);
                return Ok(None);
            }
            entry.editor = Some(id);
            !entry.readable
        }
        None => {
            // A snapshot-derived edit of an entry that has since been
            // evicted is refused rather than recreated.
            if expected_sequence.is_some() {
                return Ok(None);
            }
            let ident: Arc<str> = Arc::from(key);
            let node = state.lru.push_back(Arc::clone(&ident));
            state.entries.insert(
                Arc::clone(&ident),
                Entry {
                    hash: Arc::clone(&hash),
                    lengths: vec![0; shared.value_count],
                    readable: false,
                    editor: Some(id),
                    sequence: SEQ_UNCOMMITTED,
                    node,
                },
            );
            true
        }
    };
    trace!(target: "stash::edit", event = "edit_started", hash = %hash, is_create);
    Ok(Some(Editor {
        shared: Arc::clone(shared),
        key: key.to_owned(),
        hash,
        id,
        is_create,
        edit: Arc::new(EditState::default()),
        finished: false,
    }))
}

fn complete_edit(shared: &Arc<Shared>, editor: &Editor, success: bool) -> Result<()> {
    let mut guard = shared.state.lock();
    let state = &mut *guard;
    let Some((ident, entry)) = state.entries.get_key_value(editor.key.as_str()) else {
        return Err(StashError::InvalidState("editor's entry no longer exists"));
    };
    let ident = Arc::clone(ident);
    if entry.editor != Some(editor.id) {
        return Err(StashError::InvalidState("editor is no longer current"));
    }
    let was_readable = entry.readable;
    let node = entry.node;
    let old_lengths = entry.lengths.clone();

    if !success {
        rollback_edit(state, shared, &ident, editor);
        return Ok(());
    }

    // First-time creators must fill every slot before publishing.
    if editor.is_create {
        for slot in 0..shared.value_count {
            if !editor.edit.is_written(slot) {
                rollback_edit(state, shared, &ident, editor);
                return Err(StashError::Incomplete { slot });
            }
        }
    }

    let mut new_lengths = old_lengths.clone();
    for slot in 0..shared.value_count {
        if !editor.edit.is_written(slot) {
            continue;
        }
        let dirty = paths::dirty_path(&shared.dir, &editor.hash, slot);
        let clean = paths::clean_path(&shared.dir, &editor.hash, slot);
        let renamed = fs::metadata(&dirty)
            .map(|meta| meta.len())
            .and_then(|len| fs::rename(&dirty, &clean).map(|()| len));
        match renamed {
            Ok(len) => new_lengths[slot] = len,
            Err(err) => {
                warn!(
                    target: "stash::edit",
                    event = "commit_rename_failed",
                    hash = %editor.hash,
                    slot,
                    error = %err
                );
                rollback_edit(state, shared, &ident, editor);
                return Err(StashError::CommitFailed(format!(
                    "publishing slot {slot}: {err}"
                )));
            }
        }
    }

    let old_total: u64 = if was_readable {
        old_lengths.iter().sum()
    } else {
        0
    };
    let new_total: u64 = new_lengths.iter().sum();
    let sequence = state.next_sequence;
    state.next_sequence += 1;
    if let Some(entry) = state.entries.get_mut(ident.as_ref()) {
        entry.lengths = new_lengths;
        entry.readable = true;
        entry.editor = None;
        entry.sequence = sequence;
    }
    state.size = state.size.saturating_sub(old_total).saturating_add(new_total);
    state.lru.move_to_back(node);
    debug!(
        target: "stash::edit",
        event = "committed",
        hash = %editor.hash,
        bytes = new_total,
        size = state.size
    );
    if state.size > state.max_size {
        state.evict_to_limit(&shared.dir, shared.value_count);
    }
    Ok(())
}

fn rollback_edit(state: &mut State, shared: &Shared, ident: &Arc<str>, editor: &Editor) {
    delete_dirty_files(&shared.dir, &editor.hash, shared.value_count);
    let Some(entry) = state.entries.get_mut(ident.as_ref()) else {
        return;
    };
    entry.editor = None;
    let readable = entry.readable;
    if !readable {
        state.drop_entry(ident);
    }
    trace!(target: "stash::edit", event = "edit_rolled_back", hash = %editor.hash);
}

#[derive(Default)]
struct EditState {
    written: AtomicU64,
    has_errors: AtomicBool,
}

impl EditState {
    fn mark_written(&self, slot: usize) {
        self.written.fetch_or(1 << slot, Ordering::SeqCst);
    }

    fn is_written(&self, slot: usize) -> bool {
        self.written.load(Ordering::SeqCst) & (1 << slot) != 0
    }

    fn mark_error(&self) {
        self.has_errors.store(true, Ordering::SeqCst);
    }

    fn has_errors(&self) -> bool {
        self.has_errors.load(Ordering::SeqCst)
    }
}

/// Exclusive in-flight writer for one entry.
///
/// Writes go to per-slot temporary files and become visible only on
/// `commit`. Exactly one editor exists per key at a time; the editor
/// must be finished with [`Editor::commit`] or [`Editor::abort`].
/// Dropping an unfinished editor leaves the key busy until the cache
/// is closed.
pub struct Editor {
    shared: Arc<Shared>,
    key: String,
    hash: Arc<str>,
    id: u64,
    is_create: bool,
    edit: Arc<EditState>,
    finished: bool,
}

impl Editor {
    /// Key this editor writes.
    pub fn key(&self) -> &str {
        &self.key
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.shared.value_count {
            return Err(StashError::InvalidArg("slot index out of range"));
        }
        Ok(())
    }

    fn ensure_current(&self) -> Result<()> {
        let state = self.shared.state.lock();
        state.ensure_open()?;
        let current = state
            .entries
            .get(self.key.as_str())
            .and_then(|entry| entry.editor);
        if current != Some(self.id) {
            return Err(StashError::InvalidState("editor is no longer current"));
        }
        Ok(())
    }

    /// Write `value` as the new contents of `slot`.
    ///
    /// Replaces anything an earlier `set` or `writer` call in this
    /// edit staged for the slot. The bucket directory is re-created if
    /// it went missing. A write failure marks the edit as failed, so a
    /// later `commit` turns into an abort.
    pub fn set(&mut self, slot: usize, value: &[u8]) -> Result<()> {
        self.check_slot(slot)?;
        self.ensure_current()?;
        let path = paths::dirty_path(&self.shared.dir, &self.hash, slot);
        let outcome = fs::create_dir_all(paths::bucket_dir(&self.shared.dir, &self.hash))
            .and_then(|()| fs::write(&path, value));
        match outcome {
            Ok(()) => {
                self.edit.mark_written(slot);
                trace!(
                    target: "stash::edit",
                    event = "slot_written",
                    hash = %self.hash,
                    slot,
                    bytes = value.len()
                );
                Ok(())
            }
            Err(err) => {
                self.edit.mark_error();
                warn!(
                    target: "stash::edit",
                    event = "slot_write_failed",
                    hash = %self.hash,
                    slot,
                    error = %err
                );
                Err(err.into())
            }
        }
    }

    /// Streaming variant of [`Editor::set`]: truncate the slot's
    /// temporary file and return a writer for it.
    ///
    /// The slot counts as written once a write on the handle succeeds.
    pub fn writer(&mut self, slot: usize) -> Result<SlotWriter> {
        self.check_slot(slot)?;
        self.ensure_current()?;
        let open = fs::create_dir_all(paths::bucket_dir(&self.shared.dir, &self.hash)).and_then(
            |()| {
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(paths::dirty_path(&self.shared.dir, &self.hash, slot))
            },
        );
        match open {
            Ok(file) => Ok(SlotWriter {
                file,
                slot,
                edit: Arc::clone(&self.edit),
            }),
            Err(err) => {
                self.edit.mark_error();
                Err(err.into())
            }
        }
    }

    /// Read handle over the previous committed bytes of `slot`, or
    /// `None` if the entry had no committed version when this edit
    /// began. Never sees data staged by this edit.
    pub fn prior_reader(&self, slot: usize) -> Result<Option<File>> {
        self.check_slot(slot)?;
        self.ensure_current()?;
        if self.is_create {
            return Ok(None);
        }
        match File::open(paths::clean_path(&self.shared.dir, &self.hash, slot)) {
            Ok(file) => Ok(Some(file)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Previous committed bytes of `slot` as a string; see
    /// [`Editor::prior_reader`].
    pub fn prior_to_string(&self, slot: usize) -> Result<Option<String>> {
        let Some(mut file) = self.prior_reader(slot)? else {
            return Ok(None);
        };
        let mut out = String::new();
        file.read_to_string(&mut out)?;
        Ok(Some(out))
    }

    /// Publish this edit's writes atomically.
    ///
    /// A first-creation edit must have written every slot or the
    /// commit fails with [`StashError::Incomplete`] and the entry is
    /// rolled back. An edit that recorded write failures aborts and
    /// fails with [`StashError::CommitFailed`].
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        if self.edit.has_errors() {
            complete_edit(&self.shared, &self, false)?;
            return Err(StashError::CommitFailed(
                "edit recorded write failures".to_owned(),
            ));
        }
        complete_edit(&self.shared, &self, true)
    }

    /// Discard this edit's writes and release the entry.
    pub fn abort(mut self) -> Result<()> {
        self.finished = true;
        complete_edit(&self.shared, &self, false)
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if !self.finished {
            // The entry stays pinned until close; this is a caller bug.
            warn!(target: "stash::edit", event = "editor_leaked", hash = %self.hash);
        }
    }
}

/// Writable handle for one slot of an in-flight edit.
pub struct SlotWriter {
    file: File,
    slot: usize,
    edit: Arc<EditState>,
}

impl Write for SlotWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.write(buf) {
            Ok(n) => {
                self.edit.mark_written(self.slot);
                Ok(n)
            }
            Err(err) => {
                self.edit.mark_error();
                Err(err)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.flush() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.edit.mark_error();
                Err(err)
            }
        }
    }
}

/// Point-in-time read-only view of one entry.
///
/// Holds one open handle per slot, captured while the cache lock was
/// held, so later commits or removals of the key do not affect what
/// this snapshot reads. Handles close when the snapshot drops.
pub struct Snapshot {
    shared: Arc<Shared>,
    key: String,
    sequence: u64,
    lengths: Vec<u64>,
    files: Vec<File>,
}

impl Snapshot {
    /// Key this snapshot was taken from.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Committed length of `slot` in bytes.
    ///
    /// # Panics
    /// Panics if `slot` is out of range.
    pub fn length(&self, slot: usize) -> u64 {
        self.lengths[slot]
    }

    /// Shared read handle for `slot`.
    ///
    /// Repeated calls return the same handle, so reads continue where
    /// the previous one stopped.
    ///
    /// # Panics
    /// Panics if `slot` is out of range.
    pub fn reader(&self, slot: usize) -> &File {
        &self.files[slot]
    }

    /// Remaining bytes of `slot` from the shared handle's position.
    pub fn read_to_vec(&self, slot: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut reader = self.reader(slot);
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Remaining bytes of `slot` as a string.
    pub fn read_to_string(&self, slot: usize) -> Result<String> {
        let mut out = String::new();
        let mut reader = self.reader(slot);
        reader.read_to_string(&mut out)?;
        Ok(out)
    }

    /// Begin an edit of the snapshotted entry, or `None` if it has
    /// been replaced by a newer commit, evicted, or is being edited.
    pub fn edit(&self) -> Result<Option<Editor>> {
        edit_internal(&self.shared, &self.key, Some(self.sequence))
    }

    /// Release the snapshot's handles. Equivalent to dropping it.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &Path, value_count: usize, max_size: u64) -> Stash {
        Stash::open(dir, value_count, max_size).expect("open stash")
    }

    fn set(stash: &Stash, key: &str, v0: &str, v1: &str) {
        let mut editor = stash.edit(key).expect("edit").expect("editor");
        editor.set(0, v0.as_bytes()).expect("set 0");
        editor.set(1, v1.as_bytes()).expect("set 1");
        editor.commit().expect("commit");
    }

    #[test]
    fn open_validates_arguments() {
        let tmp = TempDir::new().expect("tempdir");
        assert!(matches!(
            Stash::open(tmp.path(), 0, 10),
            Err(StashError::InvalidArg(_))
        ));
        assert!(matches!(
            Stash::open(tmp.path(), 2, 0),
            Err(StashError::InvalidArg(_))
        ));
        assert!(matches!(
            Stash::open(tmp.path(), MAX_VALUE_COUNT + 1, 10),
            Err(StashError::InvalidArg(_))
        ));
    }

    #[test]
    fn empty_keys_are_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        let stash = open(tmp.path(), 2, 1024);
        assert!(matches!(stash.get(""), Err(StashError::InvalidArg(_))));
        assert!(matches!(stash.edit(""), Err(StashError::InvalidArg(_))));
        assert!(matches!(stash.remove(""), Err(StashError::InvalidArg(_))));
    }

    #[test]
    fn concurrent_edit_of_same_key_is_refused() {
        let tmp = TempDir::new().expect("tempdir");
        let stash = open(tmp.path(), 2, 1024);
        let first = stash.edit("k").expect("edit").expect("editor");
        assert!(stash.edit("k").expect("edit").is_none());
        first.abort().expect("abort");
        assert!(stash.edit("k").expect("edit").is_some_and(|e| {
            e.abort().expect("abort");
            true
        }));
    }

    #[test]
    fn remove_during_edit_is_busy() {
        let tmp = TempDir::new().expect("tempdir");
        let stash = open(tmp.path(), 2, 1024);
        set(&stash, "k", "a", "b");
        let editor = stash.edit("k").expect("edit").expect("editor");
        assert!(matches!(stash.remove("k"), Err(StashError::Busy)));
        editor.abort().expect("abort");
        assert!(stash.remove("k").expect("remove"));
    }

    #[test]
    fn slot_index_out_of_range_is_invalid_arg() {
        let tmp = TempDir::new().expect("tempdir");
        let stash = open(tmp.path(), 2, 1024);
        let mut editor = stash.edit("k").expect("edit").expect("editor");
        assert!(matches!(
            editor.set(2, b"x"),
            Err(StashError::InvalidArg(_))
        ));
        editor.abort().expect("abort");
    }

    #[test]
    fn editors_are_invalidated_by_close() {
        let tmp = TempDir::new().expect("tempdir");
        let stash = open(tmp.path(), 2, 1024);
        let mut editor = stash.edit("k").expect("edit").expect("editor");
        editor.set(0, b"x").expect("set");
        stash.close().expect("close");
        assert!(matches!(
            editor.set(1, b"y"),
            Err(StashError::InvalidState(_))
        ));
        assert!(matches!(
            editor.commit(),
            Err(StashError::InvalidState(_))
        ));
        assert!(matches!(stash.get("k"), Err(StashError::InvalidState(_))));
    }

    #[test]
    fn close_rolls_back_unfinished_first_edit_on_disk() {
        let tmp = TempDir::new().expect("tempdir");
        let stash = open(tmp.path(), 1, 1024);
        let mut editor = stash.edit("k").expect("edit").expect("editor");
        editor.set(0, b"half").expect("set");
        stash.close().expect("close");
        drop(editor);

        let reopened = open(tmp.path(), 1, 1024);
        assert!(reopened.get("k").expect("get").is_none());
    }

    #[test]
    fn streamed_writes_count_as_written() {
        let tmp = TempDir::new().expect("tempdir");
        let stash = open(tmp.path(), 2, 1024);
        let mut editor = stash.edit("k").expect("edit").expect("editor");
        let mut w0 = editor.writer(0).expect("writer 0");
        w0.write_all(b"stream").expect("write");
        drop(w0);
        editor.set(1, b"x").expect("set");
        editor.commit().expect("commit");

        let snapshot = stash.get("k").expect("get").expect("snapshot");
        assert_eq!(snapshot.read_to_string(0).expect("read"), "stream");
        assert_eq!(snapshot.length(0), 6);
    }

    #[test]
    fn creators_see_no_prior_values_and_updaters_do() {
        let tmp = TempDir::new().expect("tempdir");
        let stash = open(tmp.path(), 2, 1024);
        let mut creator = stash.edit("k").expect("edit").expect("editor");
        assert!(creator.prior_to_string(0).expect("prior").is_none());
        assert!(creator.prior_reader(1).expect("prior").is_none());
        creator.set(0, b"A").expect("set");
        creator.set(1, b"B").expect("set");
        creator.commit().expect("commit");

        let updater = stash.edit("k").expect("edit").expect("editor");
        assert_eq!(
            updater.prior_to_string(0).expect("prior").as_deref(),
            Some("A")
        );
        updater.abort().expect("abort");
    }

    #[test]
    fn metrics_track_hits_misses_and_evictions() {
        let tmp = TempDir::new().expect("tempdir");
        let stash = open(tmp.path(), 2, 10);
        assert_eq!(stash.metrics().hit_ratio(), 0.0);

        set(&stash, "a", "aa", "aa"); // 4 bytes
        assert!(stash.get("a").expect("get").is_some());
        assert!(stash.get("missing").expect("get").is_none());
        set(&stash, "b", "bbbb", "bbbb"); // 8 bytes, evicts "a"

        let metrics = stash.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.evictions, 1);
        assert_eq!(metrics.entries, 1);
        assert_eq!(metrics.size, 8);
        assert_eq!(metrics.max_size, 10);
    }

    #[test]
    fn eviction_skips_entries_pinned_by_an_edit() {
        let tmp = TempDir::new().expect("tempdir");
        let stash = open(tmp.path(), 2, 10);
        set(&stash, "pinned", "pppp", "pppp"); // 8 bytes
        let editor = stash.edit("pinned").expect("edit").expect("editor");

        // Committing 8 more bytes overflows the bound, but the only
        // older entry is pinned, so the newcomer itself is evicted.
        set(&stash, "other", "oooo", "oooo");
        assert!(stash.get("other").expect("get").is_none());
        assert!(stash.get("pinned").expect("get").is_some());

        editor.abort().expect("abort");
    }

    #[test]
    fn flush_after_close_is_invalid_state() {
        let tmp = TempDir::new().expect("tempdir");
        let stash = open(tmp.path(), 2, 1024);
        stash.close().expect("close");
        assert!(matches!(stash.flush(), Err(StashError::InvalidState(_))));
        // close is idempotent
        stash.close().expect("close again");
    }

    #[test]
    fn destroy_deletes_the_directory() {
        let tmp = TempDir::new().expect("tempdir");
        let dir = tmp.path().join("stash");
        let stash = open(&dir, 2, 1024);
        set(&stash, "k", "a", "b");
        stash.destroy().expect("destroy");
        assert!(!dir.exists());
    }
}
