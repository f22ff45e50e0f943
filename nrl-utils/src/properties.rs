use anyhow::{anyhow, Result};
use std::{collections::BTreeMap, fmt::Display, fs, path::Path, str::FromStr};

/// `key = v1, v2, ...` configuration file. `#` starts a comment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    entries: BTreeMap<String, Vec<String>>,
}

impl Properties {
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (line_no, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(idx) => &raw[..idx],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("line {}: expected 'key = value', got '{}'", line_no + 1, line))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(anyhow!("line {}: empty key", line_no + 1));
            }
            let values = value
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
            entries.insert(key.to_string(), values);
        }
        Ok(Self { entries })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read properties '{}': {}", path.display(), e))?;
        Self::parse(&text)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get_str(key) {
            Some(value) => parse_value(key, value).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_list<T>(&self, key: &str) -> Result<Option<Vec<T>>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.entries.get(key) {
            Some(values) => values
                .iter()
                .map(|value| parse_value(key, value))
                .collect::<Result<Vec<T>>>()
                .map(Some),
            None => Ok(None),
        }
    }

    /// Accepts `true`/`false` as well as `1`/`0`.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get_str(key) {
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Some(true)),
                "false" | "0" => Ok(Some(false)),
                _ => Err(anyhow!("'{}': expected a boolean, got '{}'", key, value)),
            },
            None => Ok(None),
        }
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse::<T>()
        .map_err(|e| anyhow!("'{}': cannot parse '{}': {}", key, value, e))
}
