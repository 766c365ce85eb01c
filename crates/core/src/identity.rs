//! Function identity and redefinition detection
//!
//! Before every cached call the engine decides whether the store's recorded
//! source still matches the live callable. The checks run in order:
//!
//! 1. a process-wide digest table short-circuits the comparison when the
//!    same definition was already verified in this process;
//! 2. the recorded source is fetched and compared textually; absence means
//!    first-time registration;
//! 3. differing source is investigated: if the *old* text is still present
//!    at its recorded location on disk, two distinct functions probably
//!    share a name (collision); either way the function's cache is wiped
//!    and the recorded source replaced (redefinition).
//!
//! The digest table is keyed by the rendered function id, so renaming a
//! callable always takes the slow path, and anonymous callables are never
//! inserted at all.

use crate::error::Result;
use crate::source::{FuncSource, extract_first_line};
use memoir_store::{FuncId, StoreBackend};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::sync::{OnceLock, RwLock};

type SourceDigest = [u8; 32];

fn function_digests() -> &'static RwLock<HashMap<String, SourceDigest>> {
    static DIGESTS: OnceLock<RwLock<HashMap<String, SourceDigest>>> = OnceLock::new();
    DIGESTS.get_or_init(|| RwLock::new(HashMap::new()))
}

fn source_digest(source: &FuncSource) -> SourceDigest {
    let mut hasher = Sha256::new();
    if let Some(file) = &source.file {
        hasher.update(file.display().to_string().as_bytes());
    }
    hasher.update(source.first_line.map_or(-1, i64::from).to_le_bytes());
    hasher.update(source.code.as_bytes());
    hasher.finalize().into()
}

/// Record the source for `func_id` in the store and, for named callables,
/// in the in-process digest table.
pub(crate) fn write_func_code(
    store: &dyn StoreBackend,
    func_id: &FuncId,
    source: &FuncSource,
) -> Result<()> {
    store.store_cached_func_code(func_id, Some(&source.encode_stored()))?;
    if !source.is_anonymous() {
        if let Ok(mut digests) = function_digests().write() {
            digests.insert(func_id.to_string(), source_digest(source));
        }
    }
    Ok(())
}

/// Whether the *stored* text is still what sits at its recorded location.
///
/// If it is, the name now points at a different definition in the same
/// file: a probable collision rather than an edit.
fn old_code_still_on_disk(source: &FuncSource, old_first_line: u32, old_code: &str) -> bool {
    let Some(file) = &source.file else {
        return false;
    };
    let Ok(content) = fs::read_to_string(file) else {
        return false;
    };
    let line_count = old_code.lines().count();
    let on_disk: String = content
        .lines()
        .skip(old_first_line.saturating_sub(1) as usize)
        .take(line_count)
        .collect::<Vec<_>>()
        .join("\n");
    on_disk.trim_end() == old_code.trim_end()
}

/// Compare the live definition against the recorded one.
///
/// Returns `true` when they match. Any other outcome — first registration,
/// collision, redefinition — returns `false`, which forces the caller to
/// recompute; redefinitions additionally wipe the function's cache.
pub(crate) fn check_previous_func_code(
    store: &dyn StoreBackend,
    func_id: &FuncId,
    source: &FuncSource,
    verbose: u32,
) -> Result<bool> {
    let digest = source_digest(source);
    if let Ok(digests) = function_digests().read() {
        if digests.get(&func_id.to_string()) == Some(&digest) {
            return Ok(true);
        }
    }

    let stored = match store.get_cached_func_code(func_id) {
        Ok(stored) => stored,
        Err(e) if e.is_not_found() => {
            write_func_code(store, func_id, source)?;
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };
    let (old_code, old_first_line) = extract_first_line(&stored);

    if old_code == source.code {
        if !source.is_anonymous() {
            if let Ok(mut digests) = function_digests().write() {
                digests.insert(func_id.to_string(), digest);
            }
        }
        return Ok(true);
    }

    // Differing source: collision or redefinition?
    if (old_first_line.is_none() && source.first_line.is_none()) || source.is_anonymous() {
        tracing::warn!(
            func = %func_id,
            "Cannot detect name collisions for function '{}'",
            source.describe()
        );
    } else if let (Some(old_line), Some(file)) = (old_first_line, source.file.as_deref()) {
        if Some(old_line) != source.first_line && old_code_still_on_disk(source, old_line, &old_code)
        {
            tracing::warn!(
                func = %func_id,
                "Possible name collisions between functions '{}' ({}:{}) and '{}' ({}:{})",
                source.name,
                file.display(),
                old_line,
                source.name,
                file.display(),
                source.first_line.unwrap_or(0),
            );
        }
    }

    if verbose > 10 {
        tracing::debug!(func = %func_id, "function source has changed; clearing its cache");
    }
    store.clear_path(func_id)?;
    write_func_code(store, func_id, source)?;
    Ok(false)
}
