#![forbid(unsafe_code)]
//! bytestash public API facade.
//!
//! Re-exports the disk-backed LRU cache from `bytestash-cache` through
//! a stable external interface. This is the crate downstream consumers
//! depend on.

pub use bytestash_cache::*;
