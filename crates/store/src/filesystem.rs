//! Reference filesystem store
//!
//! Artifacts live under `<root>/<func_id components…>/<args_id>/`:
//!
//! ```text
//! <root>/
//!   my_app/
//!     pipeline/
//!       resample/
//!         func_code.rs
//!         d3b07384d113edec49eaa6238ad5ff00.../
//!           output.bin        (or output.bin.z when compressed)
//!           metadata.json
//! ```
//!
//! Writers finalize artifacts with a tempfile-plus-rename so readers never
//! observe a partial write. Every successful read touches the artifact
//! directory's access time, which is what [`reduce_store_size`] sorts on
//! when picking least-recently-used victims.
//!
//! [`reduce_store_size`]: StoreBackend::reduce_store_size

use crate::backend::{
    CachePath, CallMetadata, FuncId, FuncInfo, ItemData, ItemInfo, MmapMode, StoreBackend,
    StoreConfig,
};
use crate::error::{Error, Result};
use filetime::FileTime;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

const OUTPUT_FILE: &str = "output.bin";
const OUTPUT_FILE_COMPRESSED: &str = "output.bin.z";
const METADATA_FILE: &str = "metadata.json";
const FUNC_CODE_FILE: &str = "func_code.rs";

/// Store backend on the local filesystem.
#[derive(Debug)]
pub struct FileSystemBackend {
    root: PathBuf,
    compress: Option<u32>,
    mmap_mode: Option<MmapMode>,
    verbose: u32,
}

impl FileSystemBackend {
    /// One-time initialization at `config.location`.
    ///
    /// Fails with [`Error::Config`] on an invalid compression level and
    /// [`Error::BackendUnavailable`] when the root cannot be created.
    pub fn configure(config: StoreConfig) -> Result<Self> {
        if let Some(level) = config.compress {
            if !(1..=9).contains(&level) {
                return Err(Error::config(format!(
                    "compression level must be within 1..=9, got {level}"
                )));
            }
        }
        if config.location.as_os_str().is_empty() {
            return Err(Error::config("filesystem store requires a location"));
        }
        fs::create_dir_all(&config.location).map_err(|e| {
            Error::unavailable(
                "local",
                format!("cannot create {}: {e}", config.location.display()),
            )
        })?;
        Ok(Self {
            root: config.location,
            compress: config.compress,
            mmap_mode: config.mmap_mode,
            verbose: config.verbose,
        })
    }

    fn func_dir(&self, func_id: &FuncId) -> PathBuf {
        func_id
            .components()
            .iter()
            .fold(self.root.clone(), |dir, part| dir.join(part))
    }

    fn item_dir(&self, path: &CachePath) -> PathBuf {
        self.func_dir(&path.func_id).join(&path.args_id)
    }

    /// The artifact file present in `dir`, preferring the uncompressed name.
    fn existing_output(dir: &Path) -> Option<PathBuf> {
        let plain = dir.join(OUTPUT_FILE);
        if plain.is_file() {
            return Some(plain);
        }
        let compressed = dir.join(OUTPUT_FILE_COMPRESSED);
        compressed.is_file().then_some(compressed)
    }

    fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
        let parent = target
            .parent()
            .ok_or_else(|| Error::config(format!("no parent for {}", target.display())))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| Error::io(e, parent, "create temp file"))?;
        tmp.write_all(bytes)
            .map_err(|e| Error::io(e, tmp.path(), "write"))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::io(e, tmp.path(), "sync"))?;
        tmp.persist(target)
            .map_err(|e| Error::io(e.error, target, "rename"))?;
        Ok(())
    }

    /// Record a use of the artifact directory for LRU accounting.
    fn touch(dir: &Path) {
        let now = FileTime::now();
        if let Err(e) = filetime::set_file_atime(dir, now) {
            tracing::debug!(dir = %dir.display(), "failed to touch access time: {e}");
        }
    }

    /// Map the artifact file according to `mode`.
    ///
    /// The backend never truncates an artifact in place; replacement goes
    /// through a rename, so an established mapping stays readable.
    #[allow(unsafe_code)]
    fn map_output(file_path: &Path, mode: MmapMode) -> Result<ItemData> {
        let as_load_err =
            |e: std::io::Error| Error::load(file_path, format!("mmap ({mode}): {e}"));
        match mode {
            MmapMode::Read => {
                let file = fs::File::open(file_path).map_err(as_load_err)?;
                let map = unsafe { memmap2::Mmap::map(&file) }.map_err(as_load_err)?;
                Ok(ItemData::Mapped(map))
            }
            MmapMode::ReadWrite | MmapMode::WriteNew => {
                let file = fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(file_path)
                    .map_err(as_load_err)?;
                let map = unsafe { memmap2::MmapMut::map_mut(&file) }.map_err(as_load_err)?;
                Ok(ItemData::MappedMut(map))
            }
            MmapMode::CopyOnWrite => {
                let file = fs::File::open(file_path).map_err(as_load_err)?;
                let map = unsafe { memmap2::MmapOptions::new().map_copy(&file) }
                    .map_err(as_load_err)?;
                Ok(ItemData::MappedMut(map))
            }
        }
    }

    fn directory_size(dir: &Path) -> u64 {
        let mut total = 0u64;
        for entry in WalkDir::new(dir).into_iter().filter_map(std::result::Result::ok) {
            if entry.file_type().is_file() {
                if let Ok(md) = entry.metadata() {
                    total += md.len();
                }
            }
        }
        total
    }

    fn last_access(dir: &Path) -> SystemTime {
        let Ok(md) = fs::metadata(dir) else {
            return SystemTime::UNIX_EPOCH;
        };
        // atime updates can be mounted away; a fresh write still moves mtime.
        md.accessed()
            .into_iter()
            .chain(md.modified())
            .max()
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    fn item_path_from_dir(&self, dir: &Path) -> Option<CachePath> {
        let relative = dir.strip_prefix(&self.root).ok()?;
        let mut components: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let args_id = components.pop()?;
        if components.is_empty() {
            return None;
        }
        Some(CachePath::new(FuncId::from_components(components), args_id))
    }
}

impl StoreBackend for FileSystemBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn location(&self) -> &Path {
        &self.root
    }

    fn contains_item(&self, path: &CachePath) -> bool {
        Self::existing_output(&self.item_dir(path)).is_some()
    }

    fn load_item(&self, path: &CachePath, mmap: Option<MmapMode>) -> Result<ItemData> {
        let dir = self.item_dir(path);
        let Some(file_path) = Self::existing_output(&dir) else {
            return Err(Error::not_found(format!("output of {path}")));
        };

        let compressed = file_path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("z"));
        let mode = mmap.or(self.mmap_mode);

        let data = if compressed {
            if mode.is_some() {
                tracing::debug!(item = %path, "compressed artifact cannot be memory-mapped; reading into memory");
            }
            let raw = fs::read(&file_path)
                .map_err(|e| Error::load(&file_path, format!("read: {e}")))?;
            let mut decoded = Vec::new();
            ZlibDecoder::new(raw.as_slice())
                .read_to_end(&mut decoded)
                .map_err(|e| Error::load(&file_path, format!("decompress: {e}")))?;
            ItemData::Bytes(decoded)
        } else if let Some(mode) = mode {
            Self::map_output(&file_path, mode)?
        } else {
            let raw = fs::read(&file_path)
                .map_err(|e| Error::load(&file_path, format!("read: {e}")))?;
            ItemData::Bytes(raw)
        };

        Self::touch(&dir);
        if self.verbose > 4 {
            tracing::debug!(item = %path, bytes = data.as_ref().len(), "loaded artifact");
        }
        Ok(data)
    }

    fn dump_item(&self, path: &CachePath, bytes: &[u8]) -> Result<()> {
        let dir = self.item_dir(path);
        fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir, "create_dir_all"))?;

        let (target, stale) = if let Some(level) = self.compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
            encoder
                .write_all(bytes)
                .map_err(|e| Error::io(e, &dir, "compress"))?;
            let compressed = encoder
                .finish()
                .map_err(|e| Error::io(e, &dir, "compress"))?;
            Self::write_atomic(&dir.join(OUTPUT_FILE_COMPRESSED), &compressed)?;
            (OUTPUT_FILE_COMPRESSED, dir.join(OUTPUT_FILE))
        } else {
            Self::write_atomic(&dir.join(OUTPUT_FILE), bytes)?;
            (OUTPUT_FILE, dir.join(OUTPUT_FILE_COMPRESSED))
        };

        // A leftover sibling from a different compression setting would
        // shadow or duplicate the artifact just written.
        let _ = fs::remove_file(stale);

        if self.verbose > 0 {
            tracing::debug!(item = %path, file = target, bytes = bytes.len(), "stored artifact");
        }
        Ok(())
    }

    fn get_metadata(&self, path: &CachePath) -> CallMetadata {
        let meta_path = self.item_dir(path).join(METADATA_FILE);
        fs::read_to_string(&meta_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    fn store_metadata(&self, path: &CachePath, metadata: &CallMetadata) -> Result<()> {
        let dir = self.item_dir(path);
        fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir, "create_dir_all"))?;
        let json = serde_json::to_vec_pretty(metadata)
            .map_err(|e| Error::serialization(format!("failed to serialize metadata: {e}")))?;
        Self::write_atomic(&dir.join(METADATA_FILE), &json)
    }

    fn get_cached_func_code(&self, func_id: &FuncId) -> Result<String> {
        let code_path = self.func_dir(func_id).join(FUNC_CODE_FILE);
        match fs::read_to_string(&code_path) {
            Ok(code) => Ok(code),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("source of {func_id}")))
            }
            Err(e) => Err(Error::io(e, &code_path, "read")),
        }
    }

    fn store_cached_func_code(&self, func_id: &FuncId, source: Option<&str>) -> Result<()> {
        let dir = self.func_dir(func_id);
        fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir, "create_dir_all"))?;
        if let Some(source) = source {
            Self::write_atomic(&dir.join(FUNC_CODE_FILE), source.as_bytes())?;
        }
        Ok(())
    }

    fn get_cached_func_info(&self, func_id: &FuncId) -> FuncInfo {
        FuncInfo {
            location: self.func_dir(func_id).display().to_string(),
        }
    }

    fn clear_item(&self, path: &CachePath) -> Result<()> {
        let dir = self.item_dir(path);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| Error::io(e, &dir, "remove_dir_all"))?;
        }
        Ok(())
    }

    fn clear_path(&self, func_id: &FuncId) -> Result<()> {
        let dir = self.func_dir(func_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| Error::io(e, &dir, "remove_dir_all"))?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(|e| Error::io(e, &self.root, "remove_dir_all"))?;
        }
        fs::create_dir_all(&self.root).map_err(|e| Error::io(e, &self.root, "create_dir_all"))
    }

    fn items(&self) -> Result<Vec<ItemInfo>> {
        let mut seen: BTreeMap<PathBuf, ItemInfo> = BTreeMap::new();
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            if file_name != OUTPUT_FILE && file_name != OUTPUT_FILE_COMPRESSED {
                continue;
            }
            let Some(dir) = entry.path().parent() else {
                continue;
            };
            let Some(path) = self.item_path_from_dir(dir) else {
                continue;
            };
            seen.entry(dir.to_path_buf()).or_insert_with(|| ItemInfo {
                path,
                size: Self::directory_size(dir),
                last_access: Self::last_access(dir),
            });
        }
        Ok(seen.into_values().collect())
    }

    fn reduce_store_size(&self, bytes_limit: u64) -> Result<u64> {
        let mut items = self.items()?;
        items.sort_by_key(|item| item.last_access);

        let mut total: u64 = items.iter().map(|item| item.size).sum();
        let mut freed = 0u64;
        for item in &items {
            if total <= bytes_limit {
                break;
            }
            self.clear_item(&item.path)?;
            total -= item.size;
            freed += item.size;
            tracing::debug!(
                item = %item.path,
                size = item.size,
                "evicted artifact to honor byte limit"
            );
        }
        Ok(freed)
    }
}
