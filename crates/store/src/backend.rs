//! Storage backend contract for memoized results
//!
//! A store backend persists three kinds of entries per cached function:
//! artifacts (the serialized return value of one call), sibling metadata,
//! and the function's recorded source text. Backends are byte-level: value
//! serialization stays with the caller so any backend can hold any format.
//!
//! Backends are constructed through a process-wide registry mapping a name
//! (such as `"local"`) to a factory. The registry makes small serialized
//! result handles possible: a handle stores only the backend name and
//! location and rebuilds the live backend on demand.

use crate::error::{Error, Result};
use crate::filesystem::FileSystemBackend;
use chrono::{DateTime, Utc};
use memmap2::{Mmap, MmapMut};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::SystemTime;

/// Stable, path-like identifier of a cached function.
///
/// Built from the function's `::`-separated module qualifier plus its name;
/// each qualifier segment becomes one component, so a function
/// `my_app::pipeline::resample` maps to the components
/// `["my_app", "pipeline", "resample"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FuncId(Vec<String>);

impl FuncId {
    /// Derive an identifier from a module qualifier and a function name.
    #[must_use]
    pub fn from_qualified(module: &str, name: &str) -> Self {
        let mut components: Vec<String> = module
            .split("::")
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        components.push(name.to_string());
        Self(components)
    }

    /// Build an identifier directly from components.
    #[must_use]
    pub fn from_components(components: Vec<String>) -> Self {
        Self(components)
    }

    /// The ordered path components.
    #[must_use]
    pub fn components(&self) -> &[String] {
        &self.0
    }

    /// The function name (last component).
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.last().map_or("", String::as_str)
    }
}

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// Location of one artifact: the function identifier plus the argument digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CachePath {
    /// Identifier of the cached function
    pub func_id: FuncId,
    /// Hex digest of the filtered call arguments
    pub args_id: String,
}

impl CachePath {
    /// Pair a function identifier with an argument digest.
    #[must_use]
    pub fn new(func_id: FuncId, args_id: impl Into<String>) -> Self {
        Self {
            func_id,
            args_id: args_id.into(),
        }
    }
}

impl fmt::Display for CachePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.func_id, self.args_id)
    }
}

/// Metadata stored beside an artifact.
///
/// `get_metadata` returns the default (empty) value when nothing is stored,
/// so readers never have to distinguish "absent" from "empty".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallMetadata {
    /// Wall-clock duration of the computation, in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Printable representation of each (non-ignored) input argument
    #[serde(default)]
    pub input_args: BTreeMap<String, String>,
    /// When the artifact was produced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl CallMetadata {
    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.duration.is_none() && self.input_args.is_empty() && self.created_at.is_none()
    }
}

/// Human-readable description of a cached function inside a store.
#[derive(Debug, Clone)]
pub struct FuncInfo {
    /// Where the function's entries live, rendered for display
    pub location: String,
}

/// One stored artifact as seen by eviction.
#[derive(Debug, Clone)]
pub struct ItemInfo {
    /// The artifact's cache path
    pub path: CachePath,
    /// Total size of the artifact directory in bytes
    pub size: u64,
    /// Last time the artifact was read or written
    pub last_access: SystemTime,
}

/// Memory-mapping mode applied when loading artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MmapMode {
    /// Shared read-only view (`r`)
    Read,
    /// Shared read-write view (`r+`)
    ReadWrite,
    /// Read-write view of a fresh mapping (`w+`); loads behave like `r+`
    WriteNew,
    /// Private copy-on-write view (`c`)
    CopyOnWrite,
}

impl FromStr for MmapMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(Self::Read),
            "r+" => Ok(Self::ReadWrite),
            "w+" => Ok(Self::WriteNew),
            "c" => Ok(Self::CopyOnWrite),
            other => Err(Error::config(format!(
                "unknown mmap mode '{other}' (expected one of r, r+, w+, c)"
            ))),
        }
    }
}

impl fmt::Display for MmapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "r",
            Self::ReadWrite => "r+",
            Self::WriteNew => "w+",
            Self::CopyOnWrite => "c",
        };
        write!(f, "{s}")
    }
}

/// Bytes returned by [`StoreBackend::load_item`].
///
/// Either owned or a live file mapping; both deref to `&[u8]`. Callers must
/// drop this before deleting the underlying artifact so a mapping never
/// outlives a `clear`.
#[derive(Debug)]
pub enum ItemData {
    /// Heap-owned bytes
    Bytes(Vec<u8>),
    /// Shared read-only mapping
    Mapped(Mmap),
    /// Writable (shared or copy-on-write) mapping
    MappedMut(MmapMut),
}

impl AsRef<[u8]> for ItemData {
    fn as_ref(&self) -> &[u8] {
        match self {
            Self::Bytes(b) => b,
            Self::Mapped(m) => m,
            Self::MappedMut(m) => m,
        }
    }
}

/// One-time configuration handed to a backend factory.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory (or backend-specific address) of the store
    pub location: PathBuf,
    /// zlib compression level (1..=9); `None` disables compression
    pub compress: Option<u32>,
    /// Default mapping mode for loads; `None` reads into owned memory
    pub mmap_mode: Option<MmapMode>,
    /// Verbosity level for informational messages
    pub verbose: u32,
    /// Extra named options for non-default backends
    pub options: BTreeMap<String, serde_json::Value>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            location: PathBuf::new(),
            compress: None,
            mmap_mode: None,
            verbose: 0,
            options: BTreeMap::new(),
        }
    }
}

impl StoreConfig {
    /// Configuration with a location and defaults for everything else.
    #[must_use]
    pub fn at(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            ..Self::default()
        }
    }
}

/// Byte-level persistence contract for memoized results.
///
/// Implementations must provide read/write atomicity at artifact
/// granularity: writers finalize artifacts via rename or equivalent, and
/// readers that observe a partial write fail with [`Error::Load`]. The
/// engine performs no locking of its own on top of this.
pub trait StoreBackend: fmt::Debug + Send + Sync {
    /// Registry name of this backend (e.g. `"local"`).
    fn name(&self) -> &'static str;

    /// The configured store location.
    fn location(&self) -> &Path;

    /// Whether an artifact exists for `path`.
    fn contains_item(&self, path: &CachePath) -> bool;

    /// Read an artifact's bytes.
    ///
    /// `mmap` overrides the backend's configured default mapping mode. A
    /// successful read counts as a use for eviction purposes.
    fn load_item(&self, path: &CachePath, mmap: Option<MmapMode>) -> Result<ItemData>;

    /// Persist an artifact atomically, replacing any previous version.
    fn dump_item(&self, path: &CachePath, bytes: &[u8]) -> Result<()>;

    /// Metadata stored beside an artifact; empty when absent or unreadable.
    fn get_metadata(&self, path: &CachePath) -> CallMetadata;

    /// Persist metadata beside an artifact. Best-effort from the caller's
    /// perspective; failures are reported but need not be fatal.
    fn store_metadata(&self, path: &CachePath, metadata: &CallMetadata) -> Result<()>;

    /// The recorded source text for a function.
    fn get_cached_func_code(&self, func_id: &FuncId) -> Result<String>;

    /// Record a function's source text; with `None`, only ensure the
    /// function's container exists. Idempotent.
    fn store_cached_func_code(&self, func_id: &FuncId, source: Option<&str>) -> Result<()>;

    /// Human-readable description of a function's entries.
    fn get_cached_func_info(&self, func_id: &FuncId) -> FuncInfo;

    /// Delete one artifact (artifact and metadata together).
    fn clear_item(&self, path: &CachePath) -> Result<()>;

    /// Delete every entry of one function, including its recorded source.
    fn clear_path(&self, func_id: &FuncId) -> Result<()>;

    /// Delete the whole store.
    fn clear(&self) -> Result<()>;

    /// Enumerate stored artifacts with size and recency.
    fn items(&self) -> Result<Vec<ItemInfo>>;

    /// Evict least-recently-used artifacts until the total stored size is
    /// at most `bytes_limit`. Returns the number of bytes freed.
    fn reduce_store_size(&self, bytes_limit: u64) -> Result<u64>;
}

/// Constructor signature stored in the backend registry.
pub type BackendFactory = fn(StoreConfig) -> Result<Arc<dyn StoreBackend>>;

/// Name under which the reference filesystem backend is registered.
pub const LOCAL_BACKEND: &str = "local";

fn local_factory(config: StoreConfig) -> Result<Arc<dyn StoreBackend>> {
    Ok(Arc::new(FileSystemBackend::configure(config)?))
}

fn registry() -> &'static Mutex<HashMap<String, BackendFactory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, BackendFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, BackendFactory> = HashMap::new();
        map.insert(LOCAL_BACKEND.to_string(), local_factory);
        Mutex::new(map)
    })
}

/// Register (or replace) a store backend factory under `name`.
///
/// Intended to run at startup, before any context is built; the registry is
/// shared process-wide.
pub fn register_store_backend(name: impl Into<String>, factory: BackendFactory) {
    let name = name.into();
    tracing::debug!(backend = %name, "registering store backend");
    if let Ok(mut map) = registry().lock() {
        map.insert(name, factory);
    }
}

/// Construct a backend by registry name.
pub fn make_store_backend(name: &str, config: StoreConfig) -> Result<Arc<dyn StoreBackend>> {
    let factory = registry()
        .lock()
        .ok()
        .and_then(|map| map.get(name).copied())
        .ok_or_else(|| Error::config(format!("unknown store backend '{name}'")))?;
    factory(config)
}
