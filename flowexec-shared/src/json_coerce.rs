//! Coercing JSON serialization.
//!
//! Settings pulled from the host environment are heterogeneous; some values
//! (type references, engine-internal objects) do not implement `Serialize`
//! in a way that round-trips cleanly. Mirrors the reference codebase's
//! `SettingsJSONifier`: anything that fails to serialize normally falls back
//! to its `Display`/`Debug` string form rather than aborting the write.

use serde::Serialize;
use serde_json::Value;

/// Serialize `value`, coercing to a JSON string if direct serialization
/// fails. `fallback` supplies the string form (typically `format!("{value:?}")`
/// or a `Display` impl) for the failure path.
pub fn coerce_to_json<T: Serialize>(value: &T, fallback: impl FnOnce() -> String) -> Value {
    match serde_json::to_value(value) {
        Ok(v) => v,
        Err(_) => Value::String(fallback()),
    }
}

/// A settings map where every value is already a [`Value`], built by
/// coercing each entry through [`coerce_to_json`]. Used to assemble the
/// manifest-referenced JSON files the sandbox builder writes.
pub fn coerce_map<T: Serialize>(
    entries: impl IntoIterator<Item = (String, T)>,
    fallback: impl Fn(&str) -> String,
) -> serde_json::Map<String, Value> {
    let mut map = serde_json::Map::new();
    for (key, value) in entries {
        let coerced = coerce_to_json(&value, || fallback(&key));
        map.insert(key, coerced);
    }
    map
}
