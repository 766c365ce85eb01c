//! Argument filtering and digesting
//!
//! A call's cache key is the SHA-256 of the canonical JSON encoding of its
//! *filtered argument map*. Arguments serialize through serde: a struct
//! keeps its field names, while tuples, sequences and bare values get
//! positional `arg0`, `arg1`, … names so ignoring and metadata always
//! operate on a name → value map. Map keys are kept sorted, making the
//! digest independent of declaration or insertion order.
//!
//! Hashing happens on serialized content, so two numeric buffers with equal
//! elements digest identically no matter how they are laid out or backed in
//! memory.

use crate::error::{Error, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Serialize `args` and drop every parameter named in `ignore`.
pub fn filtered_args<A: Serialize>(
    args: &A,
    ignore: &[String],
) -> Result<BTreeMap<String, serde_json::Value>> {
    let value = serde_json::to_value(args).map_err(Error::args)?;
    let mut named: BTreeMap<String, serde_json::Value> = match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        serde_json::Value::Null => BTreeMap::new(),
        serde_json::Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| (format!("arg{i}"), item))
            .collect(),
        other => std::iter::once(("arg0".to_string(), other)).collect(),
    };
    for name in ignore {
        named.remove(name);
    }
    Ok(named)
}

/// Hex SHA-256 over the canonical encoding of a filtered argument map.
pub fn args_digest(filtered: &BTreeMap<String, serde_json::Value>) -> Result<String> {
    let bytes = serde_json::to_vec(filtered)
        .map_err(|e| Error::args(format!("canonical encoding failed: {e}")))?;
    Ok(hex::encode(Sha256::digest(bytes)))
}

/// Printable form of each argument, for call metadata.
#[must_use]
pub fn printable_args(filtered: &BTreeMap<String, serde_json::Value>) -> BTreeMap<String, String> {
    filtered
        .iter()
        .map(|(name, value)| (name.clone(), value.to_string()))
        .collect()
}

/// Render a call like `name(x=1, y=2)` for warnings and verbose output.
#[must_use]
pub fn format_signature(name: &str, filtered: &BTreeMap<String, serde_json::Value>) -> String {
    let args: Vec<String> = filtered
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    format!("{name}({})", args.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Window {
        start: u64,
        len: u64,
    }

    #[test]
    fn struct_args_keep_field_names() {
        let filtered = filtered_args(&Window { start: 10, len: 4 }, &[]).unwrap();
        assert_eq!(filtered.len(), 2);
        assert!(filtered.contains_key("start"));
        assert!(filtered.contains_key("len"));
    }

    #[test]
    fn tuple_args_get_positional_names() {
        let filtered = filtered_args(&(1, "two"), &[]).unwrap();
        assert_eq!(
            filtered.keys().cloned().collect::<Vec<_>>(),
            ["arg0", "arg1"]
        );
    }

    #[test]
    fn scalar_args_are_wrapped() {
        let filtered = filtered_args(&42i64, &[]).unwrap();
        assert_eq!(filtered.get("arg0"), Some(&serde_json::json!(42)));
    }

    #[test]
    fn unit_args_hash_to_empty_map() {
        let filtered = filtered_args(&(), &[]).unwrap();
        assert!(filtered.is_empty());
    }

    #[test]
    fn ignored_names_do_not_reach_the_digest() {
        let with = filtered_args(&Window { start: 10, len: 4 }, &[]).unwrap();
        let without =
            filtered_args(&Window { start: 10, len: 9 }, &["len".to_string()]).unwrap();
        let base = filtered_args(&Window { start: 10, len: 4 }, &["len".to_string()]).unwrap();

        assert_ne!(args_digest(&with).unwrap(), args_digest(&without).unwrap());
        assert_eq!(args_digest(&base).unwrap(), args_digest(&without).unwrap());
    }

    #[test]
    fn digest_is_deterministic() {
        let a = filtered_args(&(3, 4), &[]).unwrap();
        let b = filtered_args(&(3, 4), &[]).unwrap();
        assert_eq!(args_digest(&a).unwrap(), args_digest(&b).unwrap());
    }

    #[test]
    fn equal_contents_digest_equally_across_buffer_kinds() {
        let owned: Vec<f64> = vec![1.0, 1.0, 1.0];
        let sliced: &[f64] = &[1.0, 1.0, 1.0];
        let a = filtered_args(&owned, &[]).unwrap();
        let b = filtered_args(&sliced, &[]).unwrap();
        assert_eq!(args_digest(&a).unwrap(), args_digest(&b).unwrap());
    }

    #[test]
    fn printable_args_render_json() {
        let filtered = filtered_args(&Window { start: 10, len: 4 }, &[]).unwrap();
        let printable = printable_args(&filtered);
        assert_eq!(printable.get("start"), Some(&"10".to_string()));
    }

    #[test]
    fn signatures_read_naturally() {
        let filtered = filtered_args(&Window { start: 10, len: 4 }, &[]).unwrap();
        assert_eq!(format_signature("window", &filtered), "window(len=4, start=10)");
    }
}
