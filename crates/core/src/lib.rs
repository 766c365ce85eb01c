//! Persistent function-result memoization
//!
//! memoir caches a computation's return value on disk the first time it
//! runs and transparently reloads it on every later call with the same
//! arguments — across process restarts, and shareable between processes
//! through a pluggable store backend.
//!
//! # Overview
//!
//! A [`Memory`] context owns a store backend and the caching policy;
//! [`Memory::cache`] wraps a callable into a [`CachedFunc`] running the
//! lookup/compute/persist pipeline. The [`callable!`] macro captures the
//! callable's module path, name and source text, which is how the engine
//! keys the cache and detects redefinitions:
//!
//! - calls are addressed by a stable function identifier plus a SHA-256
//!   digest of the (filtered) arguments;
//! - when a function's recorded source no longer matches its definition,
//!   its cached results are wiped and recomputed;
//! - corrupted artifacts are detected on load, warned about, and
//!   recomputed;
//! - [`CachedFunc::call_and_shelve`] stores the result but returns only a
//!   small serializable [`Shelved`] reference, resolvable later — even in
//!   another process.
//!
//! Async callables get the same treatment through [`Memory::cache_async`]
//! and [`AsyncCachedFunc`]; the awaited value is what gets cached, and the
//! user computation is the only suspension point.
//!
//! # Example
//!
//! ```no_run
//! # fn main() -> memoir_core::Result<()> {
//! use memoir_core::{Memory, callable};
//!
//! let memory = Memory::builder()
//!     .location("/var/cache/pipeline")
//!     .verbose(0)
//!     .build()?;
//!
//! let resample = memory.cache(callable!(resample = |xs: &Vec<f64>| {
//!     xs.iter().map(|x| x * 0.5).collect::<Vec<f64>>()
//! }))?;
//!
//! let ys = resample.call(&vec![1.0, 2.0, 3.0])?; // computed and stored
//! let zs = resample.call(&vec![1.0, 2.0, 3.0])?; // loaded from the store
//! assert_eq!(ys, zs);
//! # Ok(())
//! # }
//! ```

pub mod digest;
mod error;
mod func;
mod identity;
mod memory;
mod shelf;
mod source;

pub use error::{Error, Result};
pub use func::{AsyncCachedFunc, CachedFunc};
pub use memory::{Memory, MemoryBuilder, STORE_NAMESPACE};
pub use shelf::{InlineResult, Shelved, StoredResult};
pub use source::{ANONYMOUS_NAME, FIRST_LINE_TEXT, FuncSource, extract_first_line};

// The store layer is part of the public surface: custom backends implement
// its trait and register through its registry.
pub use memoir_store as store;
pub use memoir_store::{
    CachePath, CallMetadata, FuncId, MmapMode, StoreBackend, StoreConfig, register_store_backend,
};
