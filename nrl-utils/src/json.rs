use anyhow::{anyhow, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{to_string, to_string_pretty, to_value, Map, Value};
use std::{fs, path::Path};

pub fn dejsonify<'a, T>(json_str: &'a str) -> serde_json::Result<T>
where
    T: Deserialize<'a>,
{
    serde_json::from_str::<T>(json_str)
}

/// Serializes with object keys sorted, so reports and configs diff cleanly.
pub fn jsonify<T>(obj: &T) -> Result<String>
where
    T: Serialize,
{
    Ok(to_string(&sort_keys(&to_value(obj)?))?)
}

pub fn jsonify_pretty<T>(obj: &T) -> Result<String>
where
    T: Serialize,
{
    Ok(to_string_pretty(&sort_keys(&to_value(obj)?))?)
}

fn sort_keys(json_value: &Value) -> Value {
    match json_value {
        Value::Object(obj) => {
            let mut sorted_map = Map::new();
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            for key in keys {
                if let Some(value) = obj.get(key) {
                    sorted_map.insert(key.clone(), sort_keys(value));
                }
            }
            Value::Object(sorted_map)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        _ => json_value.clone(),
    }
}

/// Accepts either an inline json string or a path ending in `.json`.
pub fn load_json<T>(source: &str) -> Result<T>
where
    T: DeserializeOwned,
{
    let text = if source.ends_with(".json") {
        fs::read_to_string(source).map_err(|e| anyhow!("Failed to read '{}': {}", source, e))?
    } else {
        source.to_string()
    };
    dejsonify::<T>(&text).map_err(|e| anyhow!("Failed to parse json: {}", e))
}

pub fn write_json<T, P>(path: P, obj: &T) -> Result<()>
where
    T: Serialize,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    fs::write(path, jsonify_pretty(obj)?)
        .map_err(|e| anyhow!("Failed to write '{}': {}", path.display(), e))
}
