//! Settings merging and encoding.
//!
//! Per-resource settings win over shared settings; the merged map is handed
//! to children either as one JSON blob (`PREFIX={...}`) or flattened into
//! `PREFIX_path_to_leaf=value` entries.

use serde_json::Map;
use serde_json::Value;

use crate::error::AgentErr;

/// Deep-merge `shared` underneath `resource`: existing keys win, nested
/// objects are merged recursively.
pub fn combine(
    resource: Option<&Map<String, Value>>,
    shared: Option<&Map<String, Value>>,
) -> Map<String, Value> {
    let mut merged = resource.cloned().unwrap_or_default();
    if let Some(shared) = shared {
        fill_missing(&mut merged, shared);
    }
    merged
}

fn fill_missing(dst: &mut Map<String, Value>, src: &Map<String, Value>) {
    for (key, value) in src {
        match dst.get_mut(key) {
            None => {
                dst.insert(key.clone(), value.clone());
            }
            Some(Value::Object(existing)) => {
                if let Value::Object(incoming) = value {
                    fill_missing(existing, incoming);
                }
            }
            Some(_) => {}
        }
    }
}

/// Encode `settings` as environment entries under `prefix`.
///
/// `format` is `"flat"` for underscore-joined leaf paths, anything else
/// yields a single JSON entry.
pub fn to_envs(
    prefix: &str,
    settings: &Map<String, Value>,
    format: &str,
) -> Result<Vec<(String, String)>, AgentErr> {
    if format == "flat" {
        let mut entries = Vec::new();
        flatten_into(prefix, &Value::Object(settings.clone()), &mut entries);
        Ok(entries)
    } else {
        let encoded = serde_json::to_string(settings)?;
        Ok(vec![(prefix.to_string(), encoded)])
    }
}

fn flatten_into(path: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                flatten_into(&format!("{path}_{key}"), nested, out);
            }
        }
        Value::Array(items) => {
            for (index, nested) in items.iter().enumerate() {
                flatten_into(&format!("{path}_{index}"), nested, out);
            }
        }
        Value::Null => {}
        Value::String(s) => out.push((path.to_string(), s.clone())),
        other => out.push((path.to_string(), other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn resource_settings_win_over_shared() {
        let resource = object(json!({"db": {"host": "local"}, "tag": "r"}));
        let shared = object(json!({"db": {"host": "remote", "port": 5432}, "extra": true}));
        let merged = combine(Some(&resource), Some(&shared));
        assert_eq!(
            Value::Object(merged),
            json!({"db": {"host": "local", "port": 5432}, "tag": "r", "extra": true})
        );
    }

    #[test]
    fn json_format_produces_a_single_entry() {
        let settings = object(json!({"answer": 42}));
        let envs = to_envs("OPWIRE_SETTINGS", &settings, "json").expect("envs");
        assert_eq!(
            envs,
            vec![("OPWIRE_SETTINGS".to_string(), "{\"answer\":42}".to_string())]
        );
    }

    #[test]
    fn flat_format_joins_paths_with_underscores() {
        let settings = object(json!({
            "db": {"host": "local", "replicas": [1, 2]},
            "debug": true,
            "skipped": null
        }));
        let mut envs = to_envs("OPWIRE_SETTINGS", &settings, "flat").expect("envs");
        envs.sort();
        assert_eq!(
            envs,
            vec![
                ("OPWIRE_SETTINGS_db_host".to_string(), "local".to_string()),
                ("OPWIRE_SETTINGS_db_replicas_0".to_string(), "1".to_string()),
                ("OPWIRE_SETTINGS_db_replicas_1".to_string(), "2".to_string()),
                ("OPWIRE_SETTINGS_debug".to_string(), "true".to_string()),
            ]
        );
    }
}
