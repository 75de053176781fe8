//! Two-way mapping between cache keys and a store's native string keys.

use std::marker::PhantomData;

use serde_json::Value;

use crate::error::{CacheError, Result};
use crate::types::CacheKey;

/// Converts keys to and from the string form a store indexes by.
pub trait KeyMapper<K>: Send + Sync {
    fn is_supported(&self, key: &K) -> bool;

    /// Fails with `UnsupportedKeyType` when the key has no string form.
    fn key_to_string(&self, key: &K) -> Result<String>;

    fn string_to_key(&self, stored: &str) -> Result<K>;
}

// == Default Two-Way Key Mapper ==
/// Maps string, number and boolean keys using a one-letter type prefix
/// (`S:`, `N:`, `B:`). Composite keys are rejected.
#[derive(Debug)]
pub struct DefaultTwoWayKeyMapper<K> {
    _key: PhantomData<fn() -> K>,
}

impl<K> Default for DefaultTwoWayKeyMapper<K> {
    fn default() -> Self {
        Self { _key: PhantomData }
    }
}

impl<K: CacheKey> DefaultTwoWayKeyMapper<K> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K: CacheKey> KeyMapper<K> for DefaultTwoWayKeyMapper<K> {
    fn is_supported(&self, key: &K) -> bool {
        matches!(
            serde_json::to_value(key),
            Ok(Value::String(_)) | Ok(Value::Number(_)) | Ok(Value::Bool(_))
        )
    }

    fn key_to_string(&self, key: &K) -> Result<String> {
        match serde_json::to_value(key)? {
            Value::String(s) => Ok(format!("S:{}", s)),
            Value::Number(n) => Ok(format!("N:{}", n)),
            Value::Bool(b) => Ok(format!("B:{}", b)),
            other => Err(CacheError::UnsupportedKeyType(format!(
                "key {} cannot be mapped to a string",
                other
            ))),
        }
    }

    fn string_to_key(&self, stored: &str) -> Result<K> {
        let prefix = stored.get(..2).unwrap_or_default();
        let body = stored.get(2..).unwrap_or_default();
        let value = match prefix {
            "S:" => Value::String(body.to_string()),
            "N:" | "B:" => serde_json::from_str(body)?,
            _ => {
                return Err(CacheError::UnsupportedKeyType(format!(
                    "stored key '{}' has no type prefix",
                    stored
                )))
            }
        };
        Ok(serde_json::from_value(value)?)
    }
}
