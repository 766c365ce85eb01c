//! Cached function handles
//!
//! A handle wraps a user callable with the lookup/compute/persist pipeline:
//! verify the recorded source, digest the arguments, and either load the
//! stored artifact or run the callable and persist its result. The same
//! pipeline backs [`CachedFunc`] (plain callables) and [`AsyncCachedFunc`]
//! (callables returning futures); only the compute step differs, and it is
//! the only point where an async call can suspend.
//!
//! A handle whose context has no store configured is a pass-through: it
//! always computes, never touches a backend, and shelves values inline.

use crate::digest;
use crate::error::{Error, Result};
use crate::identity;
use crate::shelf::{InlineResult, Shelved, StoredResult};
use crate::source::FuncSource;
use chrono::Utc;
use memoir_store::{CachePath, CallMetadata, FuncId, MmapMode, StoreBackend};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Warn when persisting call metadata takes longer than this.
const PERSIST_INPUT_LIMIT: Duration = Duration::from_millis(500);

type FilteredArgs = BTreeMap<String, serde_json::Value>;

/// Pipeline state shared by the sync and async handles.
pub(crate) struct CallCore<A, R> {
    source: FuncSource,
    func_id: FuncId,
    store: Option<Arc<dyn StoreBackend>>,
    ignore: Vec<String>,
    mmap_mode: Option<MmapMode>,
    verbose: u32,
    _call: PhantomData<fn(&A) -> R>,
}

/// Where a computed value should be persisted; empty for pass-through.
pub(crate) struct Pending {
    target: Option<(Arc<dyn StoreBackend>, CachePath, FilteredArgs)>,
}

enum Probe {
    PassThrough,
    Present {
        store: Arc<dyn StoreBackend>,
        path: CachePath,
        filtered: FilteredArgs,
    },
    Absent {
        store: Arc<dyn StoreBackend>,
        path: CachePath,
        filtered: FilteredArgs,
    },
}

enum Lookup<R> {
    Hit(R),
    Compute(Pending),
}

enum ShelfLookup {
    Ready {
        store: Arc<dyn StoreBackend>,
        path: CachePath,
        metadata: CallMetadata,
    },
    Compute(Pending),
}

impl<A, R> CallCore<A, R> {
    pub(crate) fn new(
        source: FuncSource,
        store: Option<Arc<dyn StoreBackend>>,
        mmap_mode: Option<MmapMode>,
        verbose: u32,
    ) -> Self {
        let func_id = source.func_id();
        Self {
            source,
            func_id,
            store,
            ignore: Vec::new(),
            mmap_mode,
            verbose,
            _call: PhantomData,
        }
    }

    pub(crate) fn set_ignore(&mut self, names: Vec<String>) {
        self.ignore = names;
    }

    pub(crate) fn set_verbose(&mut self, verbose: u32) {
        self.verbose = verbose;
    }

    pub(crate) fn set_mmap_mode(&mut self, mode: Option<MmapMode>) {
        self.mmap_mode = mode;
    }

    pub(crate) fn func_id(&self) -> &FuncId {
        &self.func_id
    }

    fn announce(&self, filtered: &FilteredArgs) {
        if self.verbose > 0 {
            tracing::info!(
                func = %self.func_id,
                "calling {}",
                digest::format_signature(self.func_id.name(), filtered)
            );
        }
    }
}

impl<A: Serialize, R> CallCore<A, R> {
    /// VERIFY_CODE and CHECK_PRESENCE.
    fn probe(&self, args: &A) -> Result<Probe> {
        let Some(store) = &self.store else {
            return Ok(Probe::PassThrough);
        };
        let code_matches = identity::check_previous_func_code(
            store.as_ref(),
            &self.func_id,
            &self.source,
            self.verbose,
        )?;
        let filtered = digest::filtered_args(args, &self.ignore)?;
        let args_id = digest::args_digest(&filtered)?;
        let path = CachePath::new(self.func_id.clone(), args_id);

        if code_matches && store.contains_item(&path) {
            Ok(Probe::Present {
                store: Arc::clone(store),
                path,
                filtered,
            })
        } else {
            if self.verbose > 10 {
                let info = store.get_cached_func_info(&self.func_id);
                tracing::debug!(
                    func = %self.func_id.name(),
                    args_id = %path.args_id,
                    location = %info.location,
                    "computing function"
                );
            }
            Ok(Probe::Absent {
                store: Arc::clone(store),
                path,
                filtered,
            })
        }
    }
}

impl<A: Serialize, R: DeserializeOwned> CallCore<A, R> {
    fn load_value(&self, store: &dyn StoreBackend, path: &CachePath) -> Result<R> {
        let data = store.load_item(path, self.mmap_mode)?;
        serde_json::from_slice(data.as_ref()).map_err(|e| Error::decode(path, e))
    }

    fn lookup(&self, args: &A) -> Result<Lookup<R>> {
        match self.probe(args)? {
            Probe::PassThrough => Ok(Lookup::Compute(Pending { target: None })),
            Probe::Absent {
                store,
                path,
                filtered,
            } => {
                self.announce(&filtered);
                Ok(Lookup::Compute(Pending {
                    target: Some((store, path, filtered)),
                }))
            }
            Probe::Present {
                store,
                path,
                filtered,
            } => {
                let started = Instant::now();
                match self.load_value(store.as_ref(), &path) {
                    Ok(value) => {
                        if self.verbose > 4 {
                            tracing::debug!(
                                func = %self.func_id,
                                elapsed_s = started.elapsed().as_secs_f64(),
                                "cache loaded"
                            );
                        }
                        Ok(Lookup::Hit(value))
                    }
                    Err(e) if e.is_recoverable_load() => {
                        tracing::warn!(
                            func = %self.func_id,
                            "Exception while loading results for {}: {e}",
                            digest::format_signature(self.func_id.name(), &filtered)
                        );
                        self.announce(&filtered);
                        Ok(Lookup::Compute(Pending {
                            target: Some((store, path, filtered)),
                        }))
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn lookup_shelved(&self, args: &A) -> Result<ShelfLookup> {
        match self.probe(args)? {
            Probe::PassThrough => Ok(ShelfLookup::Compute(Pending { target: None })),
            Probe::Present { store, path, .. } => {
                let metadata = store.get_metadata(&path);
                Ok(ShelfLookup::Ready {
                    store,
                    path,
                    metadata,
                })
            }
            Probe::Absent {
                store,
                path,
                filtered,
            } => {
                self.announce(&filtered);
                Ok(ShelfLookup::Compute(Pending {
                    target: Some((store, path, filtered)),
                }))
            }
        }
    }
}

impl<A: Serialize, R: Serialize + DeserializeOwned> CallCore<A, R> {
    /// PERSIST and PERSIST_META, plus the first-call reload under mmap.
    ///
    /// Returns the value to hand back and, when a store is involved, the
    /// backend/path/metadata triple for shelving.
    #[allow(clippy::type_complexity)]
    fn finish(
        &self,
        pending: Pending,
        value: R,
        duration: Duration,
    ) -> Result<(R, Option<(Arc<dyn StoreBackend>, CachePath, CallMetadata)>)> {
        let Some((store, path, filtered)) = pending.target else {
            return Ok((value, None));
        };

        let bytes = serde_json::to_vec(&value).map_err(Error::encode)?;
        store.dump_item(&path, &bytes)?;
        if self.verbose > 0 {
            tracing::info!(
                func = %self.func_id,
                duration_s = duration.as_secs_f64(),
                "computed and stored"
            );
        }

        let metadata = self.persist_input(store.as_ref(), &path, &filtered, duration);

        // Reload through the store so the first call observes the same
        // memory-mapped view as every later cached call.
        let value = if self.mmap_mode.is_some() {
            self.load_value(store.as_ref(), &path)?
        } else {
            value
        };

        Ok((value, Some((store, path, metadata))))
    }

    fn persist_input(
        &self,
        store: &dyn StoreBackend,
        path: &CachePath,
        filtered: &FilteredArgs,
        duration: Duration,
    ) -> CallMetadata {
        let started = Instant::now();
        let metadata = CallMetadata {
            duration: Some(duration.as_secs_f64()),
            input_args: digest::printable_args(filtered),
            created_at: Some(Utc::now()),
        };
        if let Err(e) = store.store_metadata(path, &metadata) {
            tracing::warn!(func = %self.func_id, "failed to persist call metadata: {e}");
        }
        let elapsed = started.elapsed();
        if elapsed > PERSIST_INPUT_LIMIT {
            tracing::warn!(
                func = %self.func_id,
                "Persisting input arguments took {:.2}s; results stay correct, but \
                 large argument representations slow every cache write down",
                elapsed.as_secs_f64()
            );
        }
        metadata
    }
}

impl<A, R> CallCore<A, R> {
    fn shelve_stored(
        &self,
        store: Arc<dyn StoreBackend>,
        path: CachePath,
        metadata: CallMetadata,
    ) -> Shelved<R> {
        Shelved::Stored(StoredResult::new(
            store,
            path.func_id,
            path.args_id,
            self.mmap_mode,
            Some(metadata),
            self.verbose.saturating_sub(1),
        ))
    }

    /// Delete every artifact of this function and re-record its source.
    pub(crate) fn clear(&self, warn: bool) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if warn && self.verbose > 0 {
            tracing::warn!(func = %self.func_id, "clearing function cache");
        }
        store.clear_path(&self.func_id)?;
        identity::write_func_code(store.as_ref(), &self.func_id, &self.source)?;
        Ok(())
    }
}

/// Handle wrapping a plain callable with the caching pipeline.
///
/// Created by [`Memory::cache`](crate::Memory::cache); configured with the
/// builder-style [`ignore`](Self::ignore), [`verbose`](Self::verbose) and
/// [`mmap_mode`](Self::mmap_mode) methods.
pub struct CachedFunc<A, R, F> {
    core: CallCore<A, R>,
    func: F,
}

impl<A, R, F> CachedFunc<A, R, F> {
    pub(crate) fn new(core: CallCore<A, R>, func: F) -> Self {
        Self { core, func }
    }

    /// Parameter names excluded from the argument digest.
    #[must_use]
    pub fn ignore<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.core.set_ignore(names.into_iter().map(Into::into).collect());
        self
    }

    /// Override the verbosity level for this handle.
    #[must_use]
    pub fn verbose(mut self, verbose: u32) -> Self {
        self.core.set_verbose(verbose);
        self
    }

    /// Override the memory-mapping mode for this handle's loads.
    #[must_use]
    pub fn mmap_mode(mut self, mode: Option<MmapMode>) -> Self {
        self.core.set_mmap_mode(mode);
        self
    }

    /// Identifier this handle caches under.
    #[must_use]
    pub fn func_id(&self) -> &FuncId {
        self.core.func_id()
    }

    /// Delete every cached result of this function.
    pub fn clear(&self, warn: bool) -> Result<()> {
        self.core.clear(warn)
    }
}

impl<A, R, F> CachedFunc<A, R, F>
where
    A: Serialize,
    R: Serialize + DeserializeOwned,
    F: Fn(&A) -> R,
{
    /// Return the cached result when available, else compute and store it.
    pub fn call(&self, args: &A) -> Result<R> {
        match self.core.lookup(args)? {
            Lookup::Hit(value) => Ok(value),
            Lookup::Compute(pending) => {
                let started = Instant::now();
                let value = (self.func)(args);
                let (value, _) = self.core.finish(pending, value, started.elapsed())?;
                Ok(value)
            }
        }
    }

    /// Ensure the result is stored and return a reference to it instead of
    /// the value. A result already present is not loaded.
    pub fn call_and_shelve(&self, args: &A) -> Result<Shelved<R>> {
        match self.core.lookup_shelved(args)? {
            ShelfLookup::Ready {
                store,
                path,
                metadata,
            } => Ok(self.core.shelve_stored(store, path, metadata)),
            ShelfLookup::Compute(pending) => {
                let started = Instant::now();
                let value = (self.func)(args);
                let (value, stored) = self.core.finish(pending, value, started.elapsed())?;
                Ok(match stored {
                    Some((store, path, metadata)) => self.core.shelve_stored(store, path, metadata),
                    None => Shelved::Inline(InlineResult::new(value)),
                })
            }
        }
    }
}

/// Handle wrapping an async callable with the caching pipeline.
///
/// The pipeline is the one [`CachedFunc`] runs; the only suspension point
/// is the user future itself, and the awaited value — never the future —
/// is what gets stored. Store interactions stay synchronous.
pub struct AsyncCachedFunc<A, R, F> {
    core: CallCore<A, R>,
    func: F,
}

impl<A, R, F> AsyncCachedFunc<A, R, F> {
    pub(crate) fn new(core: CallCore<A, R>, func: F) -> Self {
        Self { core, func }
    }

    /// Parameter names excluded from the argument digest.
    #[must_use]
    pub fn ignore<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.core.set_ignore(names.into_iter().map(Into::into).collect());
        self
    }

    /// Override the verbosity level for this handle.
    #[must_use]
    pub fn verbose(mut self, verbose: u32) -> Self {
        self.core.set_verbose(verbose);
        self
    }

    /// Override the memory-mapping mode for this handle's loads.
    #[must_use]
    pub fn mmap_mode(mut self, mode: Option<MmapMode>) -> Self {
        self.core.set_mmap_mode(mode);
        self
    }

    /// Identifier this handle caches under.
    #[must_use]
    pub fn func_id(&self) -> &FuncId {
        self.core.func_id()
    }

    /// Delete every cached result of this function.
    pub fn clear(&self, warn: bool) -> Result<()> {
        self.core.clear(warn)
    }
}

impl<A, R, F, Fut> AsyncCachedFunc<A, R, F>
where
    A: Serialize,
    R: Serialize + DeserializeOwned,
    F: Fn(&A) -> Fut,
    Fut: Future<Output = R>,
{
    /// Return the cached result when available, else compute and store it.
    ///
    /// Cancelling the returned future while the user computation runs
    /// persists nothing.
    pub async fn call(&self, args: &A) -> Result<R> {
        match self.core.lookup(args)? {
            Lookup::Hit(value) => Ok(value),
            Lookup::Compute(pending) => {
                let started = Instant::now();
                let value = (self.func)(args).await;
                let (value, _) = self.core.finish(pending, value, started.elapsed())?;
                Ok(value)
            }
        }
    }

    /// Ensure the result is stored and return a reference to it.
    pub async fn call_and_shelve(&self, args: &A) -> Result<Shelved<R>> {
        match self.core.lookup_shelved(args)? {
            ShelfLookup::Ready {
                store,
                path,
                metadata,
            } => Ok(self.core.shelve_stored(store, path, metadata)),
            ShelfLookup::Compute(pending) => {
                let started = Instant::now();
                let value = (self.func)(args).await;
                let (value, stored) = self.core.finish(pending, value, started.elapsed())?;
                Ok(match stored {
                    Some((store, path, metadata)) => self.core.shelve_stored(store, path, metadata),
                    None => Shelved::Inline(InlineResult::new(value)),
                })
            }
        }
    }
}
