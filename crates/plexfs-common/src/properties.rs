//! Flat configuration properties.
//!
//! Components take their runtime parameters as a flat `name -> value` map so
//! a single configuration file (or an admin RPC) can retune any of them with
//! one code path. Typed getters fall back to the supplied default on missing
//! or unparsable values, which lets callers keep their current setting as the
//! default.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Flat string properties with typed, defaulted getters.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct Properties {
    values: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, converting the value to its string form.
    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.values.insert(key.into(), value.to_string());
        self
    }

    /// Raw string lookup.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Parse the value under `key`, or return `default` when the key is
    /// missing or the value does not parse.
    pub fn get_or<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr,
    {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Boolean flag: any integer value other than zero is true.
    pub fn get_flag(&self, key: &str, default: bool) -> bool {
        self.get_or::<i64>(key, i64::from(default)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut props = Properties::new();
        for (k, v) in iter {
            props.set(k, v);
        }
        props
    }
}
