use anyhow::{Result, bail};

/// Extract a value from a JSON document using a `$.a.b.c` path expression.
///
/// The walker supports object-key traversal only; array indexing and filters
/// are not part of the expression grammar. Scalars render as their natural
/// string form, `null` as the empty string, and containers as compact JSON.
pub fn extract(json_text: &str, expr: &str) -> Result<String> {
    let root: serde_json::Value = serde_json::from_str(json_text)
        .map_err(|e| anyhow::anyhow!("source is not valid JSON: {}", e))?;

    let Some(path) = expr.strip_prefix('$') else {
        bail!("path expression '{}' must start with '$'", expr);
    };
    let path = path.strip_prefix('.').unwrap_or(path);

    let mut current = &root;
    if !path.is_empty() {
        for part in path.split('.') {
            if part.is_empty() {
                bail!("path expression '{}' has an empty segment", expr);
            }
            current = match current.get(part) {
                Some(v) => v,
                None => bail!("path '{}' not found in source", expr),
            };
        }
    }

    Ok(value_to_string(current))
}

fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
