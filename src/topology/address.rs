//! Cluster member identity.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

// == Address ==
/// Opaque identifier of a cluster member.
///
/// Cheap to clone; ordering and hashing follow the underlying name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(Arc<str>);

impl Address {
    /// Creates an address from a non-empty name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CacheError::NullArgument("address name is empty".to_string()));
        }
        Ok(Self(Arc::from(name)))
    }

    /// Creates a random address with the given prefix, e.g. `node-5f3a`.
    pub fn random(prefix: &str) -> Self {
        let suffix: u32 = rand::random();
        Self(Arc::from(format!("{}-{:08x}", prefix, suffix)))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
