use serde_json::Value;

/// Attribute-name → value mapping for one record. Represented as a JSON
/// object so it is trivially diffable,
/// loggable, and serializable without the store needing to know anything
/// about a record's schema.
pub type AttrHash = serde_json::Map<String, Value>;

/// Merges `overlay` onto `base`, with `overlay` winning on overlapping keys.
/// Used during reconciliation to merge a committed snapshot with an
/// incoming server update.
pub fn merge(base: &AttrHash, overlay: &AttrHash) -> AttrHash {
    let mut merged = base.clone();
    for (k, v) in overlay {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Keys present in `next` whose value differs from `prev` (or is simply new).
pub fn diff_keys(prev: &AttrHash, next: &AttrHash) -> Vec<String> {
    next.iter()
        .filter(|(k, v)| prev.get(k.as_str()) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect()
}
