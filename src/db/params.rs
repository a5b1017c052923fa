//! Normalization of operator-supplied parameter lists.
//!
//! Stations carry the set of parameters an operator wants tracked. Over time
//! that field has been filled in as a JSON array, a JSON object keyed by
//! parameter, or plain comma separated text. Every shape maps to one
//! `BTreeSet<String>`; input that fits none of them maps to the empty set.

use serde_json::Value;
use std::collections::BTreeSet;

/// Normalize a raw parameter list into a sorted, de-duplicated set.
///
/// - JSON array: its string items (other items are skipped)
/// - JSON object: its keys
/// - JSON string: the string, split as plain text
/// - plain text: split on `,`, `;` and newlines
///
/// Names are trimmed and empty names dropped. Other JSON values and
/// malformed JSON (input starting with `[` or `{`) give an empty set.
pub fn normalize_parameters(raw: &str) -> BTreeSet<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return BTreeSet::new();
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Array(items)) => collect_names(items.iter().filter_map(Value::as_str)),
        Ok(Value::Object(map)) => collect_names(map.keys().map(String::as_str)),
        Ok(Value::String(text)) => split_text(&text),
        Ok(_) => BTreeSet::new(),
        Err(_) if trimmed.starts_with('[') || trimmed.starts_with('{') => {
            tracing::debug!("Ignoring malformed parameter list: {}", trimmed);
            BTreeSet::new()
        }
        Err(_) => split_text(trimmed),
    }
}

fn split_text(text: &str) -> BTreeSet<String> {
    collect_names(text.split([',', ';', '\n']))
}

fn collect_names<'a>(names: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    names
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}
