//! Scoped Persistent State
//!
//! A flat, string-keyed property set persisted under a scope name.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Scope holding cluster-wide identity and versioning data.
pub const GLOBAL_SCOPE: &str = "___global";

/// Property naming the version of the software that wrote the state.
pub const VERSION_PROPERTY: &str = "@version";

/// Property holding the RFC 3339 time the state was written.
pub const TIMESTAMP_PROPERTY: &str = "@timestamp";

// == Scoped Persistent State ==
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedPersistentState {
    scope: String,
    properties: BTreeMap<String, String>,
}

impl ScopedPersistentState {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn global() -> Self {
        Self::new(GLOBAL_SCOPE)
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn is_global(&self) -> bool {
        self.scope == GLOBAL_SCOPE
    }

    // == Setters ==
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn set_int_property(&mut self, key: impl Into<String>, value: i64) {
        self.properties.insert(key.into(), value.to_string());
    }

    pub fn set_float_property(&mut self, key: impl Into<String>, value: f64) {
        self.properties.insert(key.into(), value.to_string());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<String> {
        self.properties.remove(key)
    }

    // == Getters ==
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Integer property; fails with `Serialization` if the stored text is not an integer.
    pub fn int_property(&self, key: &str) -> Result<Option<i64>> {
        self.parse_property(key)
    }

    pub fn float_property(&self, key: &str) -> Result<Option<f64>> {
        self.parse_property(key)
    }

    fn parse_property<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.properties.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                CacheError::Serialization(format!(
                    "property {} of scope {} has malformed value '{}'",
                    key, self.scope, raw
                ))
            }),
        }
    }

    pub fn contains_property(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    /// Properties in key order.
    pub fn properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}
