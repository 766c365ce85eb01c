//! Shelved results
//!
//! `call_and_shelve` hands back a reference to a cached value instead of
//! the value itself. The reference is small and serializable: it carries
//! the backend name, the store location and the cache path, and rebuilds a
//! live backend through the registry when `get()` is first called — so a
//! reference serialized in one process resolves in another, as long as the
//! store and the artifact still exist.

use crate::error::{Error, Result};
use memoir_store::{
    CachePath, CallMetadata, FuncId, MmapMode, StoreBackend, StoreConfig, make_store_backend,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

/// Serializable reference to a result persisted in a store.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
pub struct StoredResult<R> {
    backend: String,
    location: PathBuf,
    func_id: FuncId,
    args_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    mmap_mode: Option<MmapMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<CallMetadata>,
    verbose: u32,
    #[serde(skip)]
    store: OnceLock<Arc<dyn StoreBackend>>,
    #[serde(skip)]
    _value: PhantomData<fn() -> R>,
}

impl<R> StoredResult<R> {
    pub(crate) fn new(
        store: Arc<dyn StoreBackend>,
        func_id: FuncId,
        args_id: String,
        mmap_mode: Option<MmapMode>,
        metadata: Option<CallMetadata>,
        verbose: u32,
    ) -> Self {
        let handle = OnceLock::new();
        let backend = store.name().to_string();
        let location = store.location().to_path_buf();
        let _ = handle.set(store);
        Self {
            backend,
            location,
            func_id,
            args_id,
            mmap_mode,
            metadata,
            verbose,
            store: handle,
            _value: PhantomData,
        }
    }

    /// Identifier of the function that produced this result.
    #[must_use]
    pub fn func_id(&self) -> &FuncId {
        &self.func_id
    }

    /// Digest of the call's filtered arguments.
    #[must_use]
    pub fn args_id(&self) -> &str {
        &self.args_id
    }

    /// Call metadata captured when the result was produced, if any.
    #[must_use]
    pub fn metadata(&self) -> Option<&CallMetadata> {
        self.metadata.as_ref()
    }

    /// Wall-clock duration of the original computation, in seconds.
    #[must_use]
    pub fn duration(&self) -> Option<f64> {
        self.metadata.as_ref().and_then(|m| m.duration)
    }

    fn path(&self) -> CachePath {
        CachePath::new(self.func_id.clone(), self.args_id.clone())
    }

    fn backend_handle(&self) -> Result<&Arc<dyn StoreBackend>> {
        if let Some(store) = self.store.get() {
            return Ok(store);
        }
        let built = make_store_backend(
            &self.backend,
            StoreConfig {
                verbose: self.verbose,
                ..StoreConfig::at(&self.location)
            },
        )?;
        Ok(self.store.get_or_init(|| built))
    }

    /// Delete the referenced artifact.
    pub fn clear(&self) -> Result<()> {
        let store = self.backend_handle()?;
        store.clear_item(&self.path())?;
        Ok(())
    }
}

impl<R: DeserializeOwned> StoredResult<R> {
    /// Materialize the referenced value from the store.
    pub fn get(&self) -> Result<R> {
        let path = self.path();
        let store = self.backend_handle()?;
        let data = store.load_item(&path, self.mmap_mode)?;
        serde_json::from_slice(data.as_ref()).map_err(|e| Error::decode(&path, e))
    }
}

/// In-memory stand-in used when no store is configured.
///
/// Carries the value itself; `clear` drops it, after which `get` reports
/// the value as missing.
#[derive(Debug)]
pub struct InlineResult<R> {
    value: Mutex<Option<R>>,
}

impl<R> InlineResult<R> {
    pub(crate) fn new(value: R) -> Self {
        Self {
            value: Mutex::new(Some(value)),
        }
    }

    /// Drop the carried value.
    pub fn clear(&self) {
        if let Ok(mut slot) = self.value.lock() {
            *slot = None;
        }
    }
}

impl<R: Clone> InlineResult<R> {
    /// The carried value, unless cleared.
    pub fn get(&self) -> Result<R> {
        self.value
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or_else(|| memoir_store::Error::not_found("shelved value").into())
    }
}

/// Reference returned by `call_and_shelve`.
#[derive(Debug)]
pub enum Shelved<R> {
    /// The result lives in a store
    Stored(StoredResult<R>),
    /// No store is configured; the result is carried inline
    Inline(InlineResult<R>),
}

impl<R: DeserializeOwned + Clone> Shelved<R> {
    /// Materialize the referenced value.
    pub fn get(&self) -> Result<R> {
        match self {
            Self::Stored(stored) => stored.get(),
            Self::Inline(inline) => inline.get(),
        }
    }
}

impl<R> Shelved<R> {
    /// Delete (or drop) the referenced value.
    pub fn clear(&self) -> Result<()> {
        match self {
            Self::Stored(stored) => stored.clear(),
            Self::Inline(inline) => {
                inline.clear();
                Ok(())
            }
        }
    }
}
