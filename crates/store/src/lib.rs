//! Storage backends for the memoir memoization engine
//!
//! This crate defines the persistence contract the engine programs against
//! and ships the reference implementation on the local filesystem:
//!
//! - [`StoreBackend`] — byte-level persistence of artifacts, metadata, and
//!   recorded function source, plus enumeration and size-bounded eviction
//! - [`FileSystemBackend`] — the `"local"` backend, with optional zlib
//!   compression and memory-mapped loads
//! - a process-wide registry ([`register_store_backend`] /
//!   [`make_store_backend`]) so backends can be reconstructed from a
//!   `(name, location)` pair carried inside serialized result handles
//!
//! Artifacts are addressed by a [`CachePath`]: a path-like function
//! identifier plus the hex digest of the call's filtered arguments. For any
//! stored pair, either both the artifact and its metadata are readable, or
//! the pair is treated as absent by the layers above.

mod backend;
mod error;
mod filesystem;

pub use backend::{
    BackendFactory, CachePath, CallMetadata, FuncId, FuncInfo, ItemData, ItemInfo, LOCAL_BACKEND,
    MmapMode, StoreBackend, StoreConfig, make_store_backend, register_store_backend,
};
pub use error::{Error, Result};
pub use filesystem::FileSystemBackend;
