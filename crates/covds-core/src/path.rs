//! Dotted-path lookups into nested JSON documents.
//!
//! `resolve` keeps the historical loader behaviour: a key whose value is falsy (`null`, `false`,
//! numeric zero, an empty string, array or object) ends the walk as if the key were missing.
//! A present-but-zero count therefore reads as absent. `resolve_strict` only treats missing keys
//! and `null` as absent; it is not wired into the mapper.

use serde_json::Value as JsonValue;

/// Path selecting the document root itself.
pub const ROOT_PATH: &str = ".";

pub fn resolve<'a>(root: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    walk(root, path, is_falsy)
}

pub fn resolve_strict<'a>(root: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    walk(root, path, JsonValue::is_null)
}

/// Mirrors the truthiness rules of the JSON producer's consumers.
pub fn is_falsy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Bool(b) => !b,
        JsonValue::Number(n) => n.as_f64().map(|f| f == 0.0).unwrap_or(false),
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(fields) => fields.is_empty(),
    }
}

fn walk<'a>(
    root: &'a JsonValue,
    path: &str,
    absent: impl Fn(&JsonValue) -> bool,
) -> Option<&'a JsonValue> {
    if path == ROOT_PATH {
        return Some(root);
    }
    let mut current = root;
    for part in path.split('.') {
        let next = current.as_object()?.get(part)?;
        if absent(next) {
            return None;
        }
        current = next;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> JsonValue {
        json!({
            "topBlock": {
                "sites": {"total": 100, "govt": 80},
                "sessions": {},
                "registration": {"total": 0},
                "flags": {"active": false}
            },
            "list": [1, 2],
            "empty": [],
            "zero": 0,
            "name": ""
        })
    }

    #[test]
    fn root_path_returns_document() {
        let d = doc();
        assert_eq!(resolve(&d, "."), Some(&d));
    }

    #[test]
    fn nested_paths_return_exact_value() {
        let d = doc();
        assert_eq!(
            resolve(&d, "topBlock.sites"),
            Some(&json!({"total": 100, "govt": 80}))
        );
        assert_eq!(resolve(&d, "topBlock.sites.total"), Some(&json!(100)));
        assert_eq!(resolve(&d, "list"), Some(&json!([1, 2])));
    }

    #[test]
    fn missing_keys_at_any_depth_are_absent() {
        let d = doc();
        assert_eq!(resolve(&d, "nope"), None);
        assert_eq!(resolve(&d, "topBlock.nope"), None);
        assert_eq!(resolve(&d, "topBlock.sites.total.deeper"), None);
        assert_eq!(resolve(&d, "list.0"), None);
    }

    // Known quirk: present but falsy values read as absent.
    #[test]
    fn falsy_values_are_treated_as_absent() {
        let d = doc();
        assert_eq!(resolve(&d, "zero"), None);
        assert_eq!(resolve(&d, "name"), None);
        assert_eq!(resolve(&d, "empty"), None);
        assert_eq!(resolve(&d, "topBlock.sessions"), None);
        assert_eq!(resolve(&d, "topBlock.registration.total"), None);
        assert_eq!(resolve(&d, "topBlock.flags.active"), None);
    }

    #[test]
    fn strict_resolution_keeps_falsy_values() {
        let d = doc();
        assert_eq!(resolve_strict(&d, "zero"), Some(&json!(0)));
        assert_eq!(resolve_strict(&d, "topBlock.sessions"), Some(&json!({})));
        assert_eq!(resolve_strict(&d, "topBlock.flags.active"), Some(&json!(false)));
        assert_eq!(resolve_strict(&d, "topBlock.nope"), None);
    }
}
