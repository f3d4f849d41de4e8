use crate::types::TreeId;
use serde_json::{Map, Value};

/// Encode a JSON value with object keys sorted at every depth.
///
/// Two option mappings holding the same key/value pairs encode identically
/// regardless of insertion order, whatever map representation serde_json
/// was built with.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn optional_id(id: Option<&TreeId>) -> Value {
    id.map_or(Value::Null, |id| Value::String(id.to_string()))
}

/// Compute the identity of a stage from its full causal history.
///
/// The hash covers, in order, the stage name, the identity of the pipeline
/// supplying the execution environment, the identity of the preceding stage,
/// and the options. Absent identities encode as JSON `null`, so a stage with
/// no predecessor never collides with one whose predecessor is named "null".
pub fn compute_stage_id(
    name: &str,
    build: Option<&TreeId>,
    base: Option<&TreeId>,
    options: &Map<String, Value>,
) -> TreeId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(canonical_json(&Value::String(name.to_owned())).as_bytes());
    hasher.update(canonical_json(&optional_id(build)).as_bytes());
    hasher.update(canonical_json(&optional_id(base)).as_bytes());
    hasher.update(canonical_json(&Value::Object(options.clone())).as_bytes());
    TreeId::new(hasher.finalize().to_hex().to_string())
}
