//! Flat section/key/value configuration store.
//!
//! File syntax: `[section]` headers and `key=value` lines. A `#` or `;` in
//! column 1 marks a comment, whitespace around tokens is insignificant, and
//! everything is case-sensitive. Scalar values parse in order: boolean,
//! integer, floating-point, otherwise string. A key before any section
//! header is a load error.

use indexmap::IndexMap;
use std::fmt;
use std::path::Path;

/// A typed scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Parse a raw token with the bool -> int -> float -> string fallback
    /// chain.
    fn parse(raw: &str) -> Value {
        match raw {
            "true" => return Value::Bool(true),
            "false" => return Value::Bool(false),
            _ => {}
        }
        if let Ok(n) = raw.parse::<i64>() {
            return Value::Int(n);
        }
        if let Ok(f) = raw.parse::<f64>() {
            return Value::Float(f);
        }
        Value::Str(raw.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            // keep a decimal point so the value reloads as a float
            Value::Float(v) if v.fract() == 0.0 && v.is_finite() => write!(f, "{:.1}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{}", v),
        }
    }
}

/// Errors from loading or saving a config file.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    /// A `key=value` line appeared before any `[section]` header.
    KeyOutsideSection { line: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config io error: {}", e),
            ConfigError::KeyOutsideSection { line } => {
                write!(f, "key-value pair outside of any section at line {}", line)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::KeyOutsideSection { .. } => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

/// Ordered section -> key -> value bag.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    data: IndexMap<String, IndexMap<String, Value>>,
}

impl ConfigStore {
    pub fn new() -> ConfigStore {
        ConfigStore::default()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<ConfigStore, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        ConfigStore::parse(&text)
    }

    pub fn parse(text: &str) -> Result<ConfigStore, ConfigError> {
        let mut store = ConfigStore::new();
        let mut current_section: Option<String> = None;

        for (index, raw_line) in text.lines().enumerate() {
            // comments only count from column 1
            if raw_line.starts_with('#') || raw_line.starts_with(';') {
                continue;
            }
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                current_section = Some(line[1..line.len() - 1].trim().to_string());
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let section = current_section
                    .as_ref()
                    .ok_or(ConfigError::KeyOutsideSection { line: index + 1 })?;
                store
                    .data
                    .entry(section.clone())
                    .or_default()
                    .insert(key.trim().to_string(), Value::parse(value.trim()));
            }
            // anything else is silently skipped, matching the loose grammar
        }

        Ok(store)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let mut out = String::new();
        for (section, keys) in &self.data {
            out.push_str(&format!("[{}]\n", section));
            for (key, value) in keys {
                out.push_str(&format!("{}={}\n", key, value));
            }
            out.push('\n');
        }
        std::fs::write(path, out)?;
        Ok(())
    }

    pub fn set(&mut self, section: &str, key: &str, value: Value) {
        self.data
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
        self.data.get(section)?.get(key)
    }

    /// Typed getters return `None` both for missing keys and for values of
    /// a different parsed type.
    pub fn get_str(&self, section: &str, key: &str) -> Option<&str> {
        match self.get(section, key)? {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, section: &str, key: &str) -> Option<i64> {
        match self.get(section, key)? {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn get_bool(&self, section: &str, key: &str) -> Option<bool> {
        match self.get(section, key)? {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn get_float(&self, section: &str, key: &str) -> Option<f64> {
        match self.get(section, key)? {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.data.contains_key(section)
    }

    pub fn has_key(&self, section: &str, key: &str) -> bool {
        self.get(section, key).is_some()
    }

    pub fn sections(&self) -> Vec<&str> {
        self.data.keys().map(String::as_str).collect()
    }

    pub fn keys(&self, section: &str) -> Vec<&str> {
        self.data
            .get(section)
            .map(|keys| keys.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# capture settings
[capture]
interface = eth0
promiscuous = true
snaplen=65535

; storage settings
[storage]
database = /var/lib/netwatch/packets.db
flush_seconds = 5.5
";

    #[test]
    fn parses_sections_and_typed_values() {
        let cfg = ConfigStore::parse(SAMPLE).unwrap();
        assert_eq!(cfg.sections(), vec!["capture", "storage"]);
        assert_eq!(cfg.get_str("capture", "interface"), Some("eth0"));
        assert_eq!(cfg.get_bool("capture", "promiscuous"), Some(true));
        assert_eq!(cfg.get_int("capture", "snaplen"), Some(65535));
        assert_eq!(cfg.get_float("storage", "flush_seconds"), Some(5.5));
        assert_eq!(
            cfg.get_str("storage", "database"),
            Some("/var/lib/netwatch/packets.db")
        );
    }

    #[test]
    fn typed_getters_do_not_coerce() {
        let cfg = ConfigStore::parse("[a]\nn=42\n").unwrap();
        assert_eq!(cfg.get_int("a", "n"), Some(42));
        assert_eq!(cfg.get_str("a", "n"), None);
        assert_eq!(cfg.get_float("a", "n"), None);
        assert_eq!(cfg.get_bool("a", "n"), None);
    }

    #[test]
    fn key_outside_section_is_a_load_error() {
        let err = ConfigStore::parse("orphan=1\n[a]\n").unwrap_err();
        match err {
            ConfigError::KeyOutsideSection { line } => assert_eq!(line, 1),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let cfg = ConfigStore::parse("# top\n\n[a]\n; note\nx=1\n").unwrap();
        assert_eq!(cfg.get_int("a", "x"), Some(1));
        assert_eq!(cfg.keys("a"), vec!["x"]);
    }

    #[test]
    fn whitespace_around_tokens_is_insignificant() {
        let cfg = ConfigStore::parse("[ net ]\n  key  =  some value  \n").unwrap();
        assert!(cfg.has_section("net"));
        assert_eq!(cfg.get_str("net", "key"), Some("some value"));
    }

    #[test]
    fn sections_are_case_sensitive() {
        let cfg = ConfigStore::parse("[Net]\nx=1\n").unwrap();
        assert!(cfg.has_section("Net"));
        assert!(!cfg.has_section("net"));
    }

    #[test]
    fn save_and_reload_round_trip() {
        let mut cfg = ConfigStore::new();
        cfg.set("capture", "interface", Value::Str("wlan0".into()));
        cfg.set("capture", "promiscuous", Value::Bool(false));
        cfg.set("limits", "max_flows", Value::Int(100_000));
        cfg.set("limits", "timeout", Value::Float(60.0));

        let mut path = std::env::temp_dir();
        path.push(format!("netwatch-config-{}.conf", std::process::id()));
        cfg.save(&path).unwrap();

        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.get_str("capture", "interface"), Some("wlan0"));
        assert_eq!(reloaded.get_bool("capture", "promiscuous"), Some(false));
        assert_eq!(reloaded.get_int("limits", "max_flows"), Some(100_000));
        assert_eq!(reloaded.get_float("limits", "timeout"), Some(60.0));

        let _ = std::fs::remove_file(path);
    }
}
