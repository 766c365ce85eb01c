//! The `Memory` context
//!
//! A `Memory` owns a store backend and the default caching policy
//! (compression, memory-mapping, verbosity, byte ceiling) and hands out
//! cached-function handles bound to that store. Built without a location it
//! is completely transparent: handles it produces compute every time and
//! persist nothing.

use crate::error::Result;
use crate::func::{AsyncCachedFunc, CachedFunc, CallCore};
use crate::source::FuncSource;
use memoir_store::{MmapMode, StoreBackend, StoreConfig, make_store_backend};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Namespace directory appended to the configured location, so a store can
/// share a directory with unrelated data.
pub const STORE_NAMESPACE: &str = "memoir";

/// Context wiring cached functions to a store backend.
#[derive(Debug, Clone)]
pub struct Memory {
    store: Option<Arc<dyn StoreBackend>>,
    mmap_mode: Option<MmapMode>,
    verbose: u32,
    bytes_limit: Option<u64>,
}

/// Configuration for a [`Memory`] context.
#[derive(Debug, Clone)]
pub struct MemoryBuilder {
    location: Option<PathBuf>,
    backend: String,
    mmap_mode: Option<MmapMode>,
    compress: Option<u32>,
    verbose: u32,
    bytes_limit: Option<u64>,
    backend_options: BTreeMap<String, serde_json::Value>,
}

impl Default for MemoryBuilder {
    fn default() -> Self {
        Self {
            location: None,
            backend: memoir_store::LOCAL_BACKEND.to_string(),
            mmap_mode: None,
            compress: None,
            verbose: 1,
            bytes_limit: None,
            backend_options: BTreeMap::new(),
        }
    }
}

impl MemoryBuilder {
    /// Base directory of the data store. Without one, caching is disabled
    /// and the context is transparent.
    #[must_use]
    pub fn location(mut self, location: impl Into<PathBuf>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Registry name of the store backend (default `"local"`).
    #[must_use]
    pub fn backend(mut self, name: impl Into<String>) -> Self {
        self.backend = name.into();
        self
    }

    /// Memory-map artifacts on load.
    #[must_use]
    pub fn mmap_mode(mut self, mode: MmapMode) -> Self {
        self.mmap_mode = Some(mode);
        self
    }

    /// Compress stored artifacts (zlib level 1..=9).
    ///
    /// Compressed artifacts cannot be memory-mapped.
    #[must_use]
    pub fn compress(mut self, level: u32) -> Self {
        self.compress = Some(level);
        self
    }

    /// Verbosity of informational messages (0 silences them).
    #[must_use]
    pub fn verbose(mut self, verbose: u32) -> Self {
        self.verbose = verbose;
        self
    }

    /// Ceiling on total stored bytes, enforced by
    /// [`Memory::reduce_size`].
    #[must_use]
    pub fn bytes_limit(mut self, limit: u64) -> Self {
        self.bytes_limit = Some(limit);
        self
    }

    /// Extra named option passed through to the backend factory.
    #[must_use]
    pub fn backend_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.backend_options.insert(key.into(), value);
        self
    }

    /// Construct the context, bringing up the store backend.
    ///
    /// This is the single place the [`STORE_NAMESPACE`] directory is joined
    /// onto the location; every handle downstream receives an
    /// already-rooted backend.
    pub fn build(self) -> Result<Memory> {
        if self.compress.is_some() && self.mmap_mode.is_some() {
            tracing::warn!("compressed results cannot be memory-mapped");
        }

        let store = match self.location {
            None => None,
            Some(location) => {
                let config = StoreConfig {
                    location: location.join(STORE_NAMESPACE),
                    compress: self.compress,
                    mmap_mode: self.mmap_mode,
                    verbose: self.verbose,
                    options: self.backend_options,
                };
                Some(make_store_backend(&self.backend, config)?)
            }
        };

        Ok(Memory {
            store,
            mmap_mode: self.mmap_mode,
            verbose: self.verbose,
            bytes_limit: self.bytes_limit,
        })
    }
}

impl Memory {
    /// Start configuring a context.
    #[must_use]
    pub fn builder() -> MemoryBuilder {
        MemoryBuilder::default()
    }

    /// Whether a store is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Location of the configured store, if any.
    #[must_use]
    pub fn store_location(&self) -> Option<&Path> {
        self.store.as_deref().map(StoreBackend::location)
    }

    fn call_core<A, R>(&self, source: FuncSource) -> Result<CallCore<A, R>> {
        if let Some(store) = &self.store {
            // Create the function's container on demand.
            store.store_cached_func_code(&source.func_id(), None)?;
        }
        Ok(CallCore::new(
            source,
            self.store.clone(),
            self.mmap_mode,
            self.verbose,
        ))
    }

    /// Wrap a callable with the caching pipeline.
    ///
    /// Takes the `(FuncSource, F)` pair produced by
    /// [`callable!`](crate::callable):
    ///
    /// ```no_run
    /// # fn main() -> memoir_core::Result<()> {
    /// use memoir_core::{Memory, callable};
    ///
    /// let memory = Memory::builder().location("/tmp/demo").verbose(0).build()?;
    /// let twice = memory.cache(callable!(twice = |x: &i64| x * 2))?;
    /// assert_eq!(twice.call(&21)?, 42);
    /// assert_eq!(twice.call(&21)?, 42); // served from the store
    /// # Ok(())
    /// # }
    /// ```
    pub fn cache<A, R, F>(&self, func: (FuncSource, F)) -> Result<CachedFunc<A, R, F>>
    where
        A: Serialize,
        R: Serialize + DeserializeOwned,
        F: Fn(&A) -> R,
    {
        let (source, func) = func;
        Ok(CachedFunc::new(self.call_core(source)?, func))
    }

    /// Wrap an async callable with the caching pipeline.
    pub fn cache_async<A, R, F, Fut>(&self, func: (FuncSource, F)) -> Result<AsyncCachedFunc<A, R, F>>
    where
        A: Serialize,
        R: Serialize + DeserializeOwned,
        F: Fn(&A) -> Fut,
        Fut: Future<Output = R>,
    {
        let (source, func) = func;
        Ok(AsyncCachedFunc::new(self.call_core(source)?, func))
    }

    /// Erase the whole store.
    pub fn clear(&self, warn: bool) -> Result<()> {
        if warn && self.verbose > 0 {
            tracing::warn!("flushing the whole cache");
        }
        if let Some(store) = &self.store {
            store.clear()?;
        }
        Ok(())
    }

    /// Evict least-recently-used artifacts down to the configured byte
    /// ceiling. A no-op without a ceiling or a store; returns bytes freed.
    pub fn reduce_size(&self) -> Result<u64> {
        match (&self.store, self.bytes_limit) {
            (Some(store), Some(limit)) => Ok(store.reduce_store_size(limit)?),
            _ => Ok(0),
        }
    }

    /// Cache `func` on demand and invoke it once with `args`.
    pub fn eval<A, R, F>(&self, func: (FuncSource, F), args: &A) -> Result<R>
    where
        A: Serialize,
        R: Serialize + DeserializeOwned,
        F: Fn(&A) -> R,
    {
        if self.store.is_none() {
            return Ok((func.1)(args));
        }
        self.cache(func)?.call(args)
    }

    /// Cache an async `func` on demand and invoke it once with `args`.
    pub async fn eval_async<A, R, F, Fut>(&self, func: (FuncSource, F), args: &A) -> Result<R>
    where
        A: Serialize,
        R: Serialize + DeserializeOwned,
        F: Fn(&A) -> Fut,
        Fut: Future<Output = R>,
    {
        if self.store.is_none() {
            return Ok((func.1)(args).await);
        }
        self.cache_async(func)?.call(args).await
    }
}
