//! Schema-less key/value documents.
//!
//! Saga context, step payloads, inputs and outputs are all JSON objects whose
//! shape is owned by the remote services. Merging is shallow: keys of the
//! overlay replace keys of the base.

use serde_json::{Map, Value};

/// A JSON object with string keys.
pub type Document = Map<String, Value>;

/// Copies every key of `overlay` into `base`, overwriting on collision.
pub fn merge(base: &mut Document, overlay: &Document) {
    for (key, value) in overlay {
        base.insert(key.clone(), value.clone());
    }
}

/// Returns a new document holding `base` overlaid with `overlay`.
pub fn merged(base: &Document, overlay: &Document) -> Document {
    let mut out = base.clone();
    merge(&mut out, overlay);
    out
}
