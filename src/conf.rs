use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

/// Parsed `KEY=VALUE` configuration file.
///
/// Blank lines and lines starting with `#` are skipped. Whitespace around
/// keys and values is trimmed. Later occurrences of a key override earlier
/// ones.
#[derive(Debug, Clone, Default)]
pub struct ConfFile {
    values: HashMap<String, String>,
}

impl ConfFile {
    pub fn parse(text: &str) -> Self {
        let mut values = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Self { values }
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Typed accessor with a default for missing or unparseable values.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.values.get(key) {
            Some(v) => v.parse().unwrap_or(default),
            None => default,
        }
    }

    /// Split a comma-separated value into its non-empty trimmed parts.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.values
            .get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
