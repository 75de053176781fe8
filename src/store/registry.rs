//! Named store data shared between cache instances.
//!
//! The registry is owned by a `CacheManager` (or handed to several managers
//! that model one shared backend) instead of living in a process-wide static.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{CacheError, Result};

// == Store Registry ==
/// Map from store name to its shared backing data.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    stores: Arc<Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>>,
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("stores", &self.names())
            .finish()
    }
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // == Get Or Create ==
    /// Returns the data registered under `name`, creating it on first use.
    ///
    /// Fails with `IllegalState` when `name` already holds data of another type.
    pub fn get_or_create<T>(&self, name: &str) -> Result<Arc<T>>
    where
        T: Default + Send + Sync + 'static,
    {
        let mut stores = self.stores.lock();
        let existing = stores.get(name).cloned();
        match existing {
            Some(data) => {
                debug!("Reusing registered store {}", name);
                data.downcast::<T>().map_err(|_| {
                    CacheError::IllegalState(format!(
                        "store {} is registered with a different entry type",
                        name
                    ))
                })
            }
            None => {
                debug!("Registering new store {}", name);
                let data = Arc::new(T::default());
                stores.insert(name.to_string(), data.clone() as Arc<dyn Any + Send + Sync>);
                Ok(data)
            }
        }
    }

    /// Drops the data registered under `name`, returning whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        self.stores.lock().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stores.lock().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_same_name_same_data() {
        let registry = StoreRegistry::new();
        let a = registry.get_or_create::<AtomicU64>("s").unwrap();
        let b = registry.get_or_create::<AtomicU64>("s").unwrap();
        a.fetch_add(3, Ordering::SeqCst);
        assert_eq!(b.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_type_mismatch_is_illegal_state() {
        let registry = StoreRegistry::new();
        registry.get_or_create::<AtomicU64>("s").unwrap();
        let result = registry.get_or_create::<String>("s");
        assert!(matches!(result, Err(CacheError::IllegalState(_))));
    }

    #[test]
    fn test_remove_and_names() {
        let registry = StoreRegistry::new();
        registry.get_or_create::<AtomicU64>("b").unwrap();
        registry.get_or_create::<AtomicU64>("a").unwrap();
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        assert!(registry.remove("a"));
        assert!(!registry.contains("a"));
    }
}
