use std::collections::HashMap;
use std::ops::Index;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Flat `key=value` configuration, the way it is read from a properties file.
#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct Properties {
    name: String,
    properties: HashMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Properties {
            name: "".to_string(),
            properties: HashMap::new(),
        }
    }

    /// Parse `key=value` (or `key:value`) lines. Blank lines and lines starting
    /// with `#` or `!` are skipped.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut properties = Properties::new();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }

            let split_at = line
                .find(|c: char| c == '=' || c == ':')
                .ok_or(anyhow!("line {}: expected `key=value`, got `{}`", index + 1, line))?;
            let key = line[..split_at].trim();
            let value = line[split_at + 1..].trim();
            if key.is_empty() {
                return Err(anyhow!("line {}: empty key", index + 1));
            }
            properties.set_str(key, value);
        }
        Ok(properties)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("can't read config file {}. {}", path.display(), e))?;
        let mut properties = Self::parse(content.as_str())?;
        properties.name = path.display().to_string();
        Ok(properties)
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn as_map(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn contains(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.properties.insert(key.to_string(), value.to_string());
    }

    pub fn set_string(&mut self, key: String, value: String) {
        self.properties.insert(key, value);
    }

    pub fn get_string(&self, key: &str) -> anyhow::Result<String> {
        match self.properties.get(key) {
            Some(v) => Ok(v.clone()),
            None => Err(anyhow!("`{}` field not found", key)),
        }
    }

    fn get_parsed<T>(&self, key: &str) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.properties.get(key) {
            Some(v) => T::from_str(v.as_str()).map_err(|e| anyhow!("`{}`: {}", key, e)),
            None => Err(anyhow!("`{}` field not found", key)),
        }
    }

    pub fn get_i32(&self, key: &str) -> anyhow::Result<i32> {
        self.get_parsed(key)
    }

    pub fn get_u32(&self, key: &str) -> anyhow::Result<u32> {
        self.get_parsed(key)
    }

    pub fn set_usize(&mut self, key: &str, value: usize) {
        self.set_string(key.to_string(), value.to_string());
    }

    pub fn get_usize(&self, key: &str) -> anyhow::Result<usize> {
        self.get_parsed(key)
    }

    pub fn get_i64(&self, key: &str) -> anyhow::Result<i64> {
        self.get_parsed(key)
    }

    pub fn get_u64(&self, key: &str) -> anyhow::Result<u64> {
        self.get_parsed(key)
    }

    pub fn get_bool(&self, key: &str) -> anyhow::Result<bool> {
        self.get_parsed(key)
    }

    /// Durations are stored as milliseconds.
    pub fn get_duration(&self, key: &str) -> anyhow::Result<Duration> {
        let value = self.get_u64(key)?;
        Ok(Duration::from_millis(value))
    }

    pub fn to_sub_properties(&self, prefix_key: &str) -> Properties {
        let mut properties = Properties::new();
        properties.name = prefix_key.to_string();

        let pre_key = format!("{}.", prefix_key);
        for (key, value) in self.as_map() {
            if key.starts_with(pre_key.as_str()) {
                let key = key.index(pre_key.len()..);
                properties.set_string(key.to_owned(), value.to_owned());
            }
        }

        properties
    }
}
