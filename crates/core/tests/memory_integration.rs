//! Integration tests for the memoization pipeline
//!
//! Covers cache hits, clearing, transparency without a store, ignore
//! filtering, shelving, corruption recovery, redefinition invalidation,
//! and the byte ceiling.

use memoir_core::store::{
    FileSystemBackend, ItemData, StoreBackend, StoreConfig, register_store_backend,
};
use memoir_core::{
    CachePath, CallMetadata, FuncId, FuncSource, Memory, MmapMode, Shelved, StoredResult, callable,
    digest,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tracing_subscriber::fmt::MakeWriter;

fn quiet_memory(tmp: &TempDir) -> Memory {
    Memory::builder()
        .location(tmp.path())
        .verbose(0)
        .build()
        .unwrap()
}

/// Run `f` while capturing everything tracing emits at WARN or above.
fn capture_warnings<T>(f: impl FnOnce() -> T) -> (T, String) {
    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Ok(mut inner) = self.0.lock() {
                inner.extend_from_slice(buf);
            }
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buffer {
        type Writer = Buffer;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    let buffer = Buffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let out = tracing::subscriber::with_default(subscriber, f);
    let captured = String::from_utf8_lossy(&buffer.0.lock().unwrap()).into_owned();
    (out, captured)
}

/// Path of the artifact produced by calling `name` with `args`.
fn artifact_dir<A: serde::Serialize>(memory: &Memory, name: &str, args: &A) -> PathBuf {
    let filtered = digest::filtered_args(args, &[]).unwrap();
    let args_id = digest::args_digest(&filtered).unwrap();
    let mut dir = memory.store_location().unwrap().to_path_buf();
    for part in FuncId::from_qualified(module_path!(), name).components() {
        dir = dir.join(part);
    }
    dir.join(args_id)
}

#[test]
fn repeated_calls_compute_once_per_distinct_argument() {
    let tmp = TempDir::new().unwrap();
    let memory = quiet_memory(&tmp);

    let accumulator = Arc::new(Mutex::new(Vec::new()));
    let acc = Arc::clone(&accumulator);
    let f = memory
        .cache(callable!(identity_hits = move |x: &i64| {
            acc.lock().unwrap().push(*x);
            *x
        }))
        .unwrap();

    let mut results = Vec::new();
    for x in [0i64, 0, 1, 1, 2, 2] {
        results.push(f.call(&x).unwrap());
    }

    assert_eq!(results, [0, 0, 1, 1, 2, 2]);
    assert_eq!(accumulator.lock().unwrap().len(), 3);
}

#[test]
fn clear_forces_recomputation() {
    let tmp = TempDir::new().unwrap();
    let memory = quiet_memory(&tmp);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let f = memory
        .cache(callable!(clear_target = move |x: &i64| {
            counter.fetch_add(1, Ordering::SeqCst);
            *x
        }))
        .unwrap();

    assert_eq!(f.call(&1).unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    f.clear(false).unwrap();
    assert_eq!(f.call(&1).unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // And cached again after the recomputation.
    assert_eq!(f.call(&1).unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn eval_computes_at_most_once() {
    let tmp = TempDir::new().unwrap();
    let memory = quiet_memory(&tmp);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let (source, f) = callable!(evaled = move |x: &i64| {
        counter.fetch_add(1, Ordering::SeqCst);
        *x + 7
    });

    let first = memory.eval((source.clone(), &f), &1).unwrap();
    let second = memory.eval((source, &f), &1).unwrap();

    assert_eq!(first, 8);
    assert_eq!(second, 8);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_store_directory_is_rebuilt() {
    let tmp = TempDir::new().unwrap();
    let memory = quiet_memory(&tmp);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let f = memory
        .cache(callable!(rebuilt = move |x: &i64| {
            counter.fetch_add(1, Ordering::SeqCst);
            *x * 3
        }))
        .unwrap();

    assert_eq!(f.call(&2).unwrap(), 6);
    std::fs::remove_dir_all(memory.store_location().unwrap()).unwrap();

    assert_eq!(f.call(&2).unwrap(), 6);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(memory.store_location().unwrap().is_dir());
}

#[test]
fn no_location_means_pure_pass_through() {
    let memory = Memory::builder().verbose(0).build().unwrap();
    assert!(!memory.is_enabled());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let f = memory
        .cache(callable!(transparent = move |x: &i64| {
            counter.fetch_add(1, Ordering::SeqCst);
            *x
        }))
        .unwrap();

    for _ in 0..4 {
        assert_eq!(f.call(&1).unwrap(), 1);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    // Shelving without a store carries the value inline.
    let shelf = f.call_and_shelve(&5).unwrap();
    assert!(matches!(shelf, Shelved::Inline(_)));
    assert_eq!(shelf.get().unwrap(), 5);
    shelf.clear().unwrap();
    assert!(shelf.get().is_err());
}

#[derive(serde::Serialize)]
struct Job {
    x: i64,
    seed: u64,
}

#[test]
fn ignored_arguments_do_not_affect_hits() {
    let tmp = TempDir::new().unwrap();
    let memory = quiet_memory(&tmp);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let f = memory
        .cache(callable!(seeded = move |job: &Job| {
            counter.fetch_add(1, Ordering::SeqCst);
            job.x * 10
        }))
        .unwrap()
        .ignore(["seed"]);

    assert_eq!(f.call(&Job { x: 1, seed: 1 }).unwrap(), 10);
    assert_eq!(f.call(&Job { x: 1, seed: 2 }).unwrap(), 10);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(f.call(&Job { x: 2, seed: 1 }).unwrap(), 20);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn shelved_results_resolve_and_survive_serialization() {
    let tmp = TempDir::new().unwrap();
    let memory = quiet_memory(&tmp);

    let f = memory
        .cache(callable!(shelved = |x: &i64| vec![*x; 3]))
        .unwrap();

    let shelf = f.call_and_shelve(&4).unwrap();
    assert_eq!(shelf.get().unwrap(), vec![4, 4, 4]);
    assert_eq!(shelf.get().unwrap(), f.call(&4).unwrap());

    let Shelved::Stored(stored) = &shelf else {
        panic!("expected a stored reference");
    };
    assert!(stored.duration().is_some());
    assert_eq!(
        stored.metadata().unwrap().input_args.get("arg0"),
        Some(&"4".to_string())
    );

    // The reference reconstructs its backend after a serde round-trip, as
    // it would in another process.
    let json = serde_json::to_string(stored).unwrap();
    let revived: StoredResult<Vec<i64>> = serde_json::from_str(&json).unwrap();
    assert_eq!(revived.get().unwrap(), vec![4, 4, 4]);

    // Shelving an already-present result does not load it.
    let again = f.call_and_shelve(&4).unwrap();
    assert_eq!(again.get().unwrap(), vec![4, 4, 4]);

    again.clear().unwrap();
    assert!(revived.get().is_err());
}

#[test]
fn corrupted_artifacts_warn_and_recompute() {
    let tmp = TempDir::new().unwrap();
    let memory = quiet_memory(&tmp);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let f = memory
        .cache(callable!(corrupted = move |x: &i64| {
            counter.fetch_add(1, Ordering::SeqCst);
            *x * 2
        }))
        .unwrap();

    assert_eq!(f.call(&3).unwrap(), 6);

    let artifact = artifact_dir(&memory, "corrupted", &3i64).join("output.bin");
    assert!(artifact.is_file());
    std::fs::write(&artifact, b"definitely not the stored value").unwrap();

    let (value, warnings) = capture_warnings(|| f.call(&3).unwrap());
    assert_eq!(value, 6);
    assert!(
        warnings.contains("Exception while loading results"),
        "missing corruption warning in: {warnings}"
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // The recomputed artifact is good again.
    assert_eq!(f.call(&3).unwrap(), 6);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn redefinition_invalidates_previous_results() {
    let tmp = TempDir::new().unwrap();
    let memory = quiet_memory(&tmp);

    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let v1 = FuncSource::new(module_path!(), "redefined", "|x: &i64| { count(); *x + 1 }")
        .at(file!(), 1);
    let f1 = memory
        .cache((v1, move |x: &i64| {
            counter.fetch_add(1, Ordering::SeqCst);
            *x + 1
        }))
        .unwrap();
    assert_eq!(f1.call(&1).unwrap(), 2);
    assert_eq!(f1.call(&1).unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Same name and module, different body: the stored results must go.
    let counter = Arc::clone(&calls);
    let v2 = FuncSource::new(module_path!(), "redefined", "|x: &i64| { count(); *x + 10 }")
        .at(file!(), 1);
    let f2 = memory
        .cache((v2, move |x: &i64| {
            counter.fetch_add(1, Ordering::SeqCst);
            *x + 10
        }))
        .unwrap();
    assert_eq!(f2.call(&1).unwrap(), 11);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(f2.call(&1).unwrap(), 11);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn anonymous_redefinition_warns_about_collisions() {
    let tmp = TempDir::new().unwrap();
    let memory = quiet_memory(&tmp);

    let f1 = memory.cache(callable!(|x: &i64| *x + 1)).unwrap();
    assert_eq!(f1.call(&1).unwrap(), 2);

    let f2 = memory.cache(callable!(|x: &i64| *x + 2)).unwrap();
    let ((), warnings) = capture_warnings(|| {
        assert_eq!(f2.call(&1).unwrap(), 3);
    });
    assert!(
        warnings.contains("Cannot detect name collisions"),
        "missing collision warning in: {warnings}"
    );
}

#[test]
fn shared_names_in_one_file_warn_about_collisions() {
    let tmp = TempDir::new().unwrap();
    let memory = quiet_memory(&tmp);

    // Two distinct functions named `collide` live in the same file; the
    // first one's text stays intact at its recorded line.
    let source_file = tmp.path().join("collide_mod.rs");
    std::fs::write(
        &source_file,
        "// two functions share a name\nfn collide() {\n    1\n}\n\nfn collide() {\n    2\n}\n",
    )
    .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let first = FuncSource::new(module_path!(), "collide", "fn collide() {\n    1\n}")
        .at(&source_file, 2);
    let f1 = memory
        .cache((first, move |x: &i64| {
            counter.fetch_add(1, Ordering::SeqCst);
            *x + 1
        }))
        .unwrap();
    assert_eq!(f1.call(&1).unwrap(), 2);

    // The same name now points at the second definition further down the
    // file, while the stored text is still on disk at line 2: a probable
    // collision, not an edit.
    let counter = Arc::clone(&calls);
    let second = FuncSource::new(module_path!(), "collide", "fn collide() {\n    2\n}")
        .at(&source_file, 6);
    let f2 = memory
        .cache((second, move |x: &i64| {
            counter.fetch_add(1, Ordering::SeqCst);
            *x + 2
        }))
        .unwrap();

    let (value, warnings) = capture_warnings(|| f2.call(&1).unwrap());
    assert_eq!(value, 3);
    assert!(
        warnings.contains("Possible name collisions between functions"),
        "missing collision warning in: {warnings}"
    );
    // The collision is still treated as a redefinition: wiped and
    // recomputed.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn reduce_size_enforces_the_byte_ceiling() {
    let tmp = TempDir::new().unwrap();
    let memory = Memory::builder()
        .location(tmp.path())
        .verbose(0)
        .bytes_limit(3 * 1024)
        .build()
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let f = memory
        .cache(callable!(bulky = move |x: &u8| {
            counter.fetch_add(1, Ordering::SeqCst);
            vec![*x; 1024]
        }))
        .unwrap();

    for x in [1u8, 2, 3] {
        f.call(&x).unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Age the first two artifacts so eviction has a clear order.
    for (x, secs) in [(1u8, 1_000_000i64), (2u8, 2_000_000)] {
        let dir = artifact_dir(&memory, "bulky", &x);
        let stamp = filetime::FileTime::from_unix_time(secs, 0);
        filetime::set_file_times(&dir, stamp, stamp).unwrap();
    }

    let freed = memory.reduce_size().unwrap();
    assert!(freed > 0);

    // The most recently used artifact survived; an evicted one recomputes.
    f.call(&3).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    f.call(&1).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

// =========================================================================
// First-call mmap consistency, observed through a counting backend
// =========================================================================

static COUNTED_LOADS: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
struct CountingBackend {
    inner: FileSystemBackend,
}

impl StoreBackend for CountingBackend {
    fn name(&self) -> &'static str {
        "counting"
    }
    fn location(&self) -> &Path {
        self.inner.location()
    }
    fn contains_item(&self, path: &CachePath) -> bool {
        self.inner.contains_item(path)
    }
    fn load_item(
        &self,
        path: &CachePath,
        mmap: Option<MmapMode>,
    ) -> memoir_core::store::Result<ItemData> {
        COUNTED_LOADS.fetch_add(1, Ordering::SeqCst);
        self.inner.load_item(path, mmap)
    }
    fn dump_item(&self, path: &CachePath, bytes: &[u8]) -> memoir_core::store::Result<()> {
        self.inner.dump_item(path, bytes)
    }
    fn get_metadata(&self, path: &CachePath) -> CallMetadata {
        self.inner.get_metadata(path)
    }
    fn store_metadata(
        &self,
        path: &CachePath,
        metadata: &CallMetadata,
    ) -> memoir_core::store::Result<()> {
        self.inner.store_metadata(path, metadata)
    }
    fn get_cached_func_code(&self, func_id: &FuncId) -> memoir_core::store::Result<String> {
        self.inner.get_cached_func_code(func_id)
    }
    fn store_cached_func_code(
        &self,
        func_id: &FuncId,
        source: Option<&str>,
    ) -> memoir_core::store::Result<()> {
        self.inner.store_cached_func_code(func_id, source)
    }
    fn get_cached_func_info(&self, func_id: &FuncId) -> memoir_core::store::FuncInfo {
        self.inner.get_cached_func_info(func_id)
    }
    fn clear_item(&self, path: &CachePath) -> memoir_core::store::Result<()> {
        self.inner.clear_item(path)
    }
    fn clear_path(&self, func_id: &FuncId) -> memoir_core::store::Result<()> {
        self.inner.clear_path(func_id)
    }
    fn clear(&self) -> memoir_core::store::Result<()> {
        self.inner.clear()
    }
    fn items(&self) -> memoir_core::store::Result<Vec<memoir_core::store::ItemInfo>> {
        self.inner.items()
    }
    fn reduce_store_size(&self, bytes_limit: u64) -> memoir_core::store::Result<u64> {
        self.inner.reduce_store_size(bytes_limit)
    }
}

fn counting_factory(
    config: StoreConfig,
) -> memoir_core::store::Result<Arc<dyn StoreBackend>> {
    Ok(Arc::new(CountingBackend {
        inner: FileSystemBackend::configure(config)?,
    }))
}

#[test]
fn first_mmap_call_reloads_through_the_store() {
    register_store_backend("counting", counting_factory);
    let tmp = TempDir::new().unwrap();

    // Without mmap the first call returns the computed value directly.
    let plain = Memory::builder()
        .location(tmp.path().join("plain"))
        .backend("counting")
        .verbose(0)
        .build()
        .unwrap();
    let f = plain
        .cache(callable!(unmapped = |x: &i64| vec![*x; 8]))
        .unwrap();
    let before = COUNTED_LOADS.load(Ordering::SeqCst);
    f.call(&1).unwrap();
    assert_eq!(COUNTED_LOADS.load(Ordering::SeqCst), before);

    // With mmap the freshly computed value is read back immediately, so
    // the first call observes the same mapped view as every later one.
    let mapped = Memory::builder()
        .location(tmp.path().join("mapped"))
        .backend("counting")
        .mmap_mode(MmapMode::Read)
        .verbose(0)
        .build()
        .unwrap();
    let g = mapped
        .cache(callable!(mapped_f = |x: &i64| vec![*x; 8]))
        .unwrap();

    let before = COUNTED_LOADS.load(Ordering::SeqCst);
    let first = g.call(&1).unwrap();
    assert_eq!(COUNTED_LOADS.load(Ordering::SeqCst), before + 1);

    let second = g.call(&1).unwrap();
    assert_eq!(COUNTED_LOADS.load(Ordering::SeqCst), before + 2);
    assert_eq!(first, second);
}
