//! Property-Based Tests for Cache Stores
//!
//! Uses proptest to verify store round-trip, idempotence and expiry behaviour.

use proptest::prelude::*;
use std::collections::HashSet;
use std::thread::sleep;
use std::time::Duration;

use crate::store::{CacheEntry, CacheStore, InMemoryStore, Metadata};

// == Strategies ==
/// Generates valid store keys
fn key_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_]{1,64}"
}

/// Generates store values
fn value_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ]{0,256}"
}

fn started_store() -> InMemoryStore<String, String> {
    let store = InMemoryStore::new("prop");
    store.start().unwrap();
    store
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // store(e) followed by load(e.key) returns e for a live entry.
    #[test]
    fn prop_roundtrip_storage(key in key_strategy(), value in value_strategy(), version in any::<u64>()) {
        let store = started_store();
        let entry = CacheEntry::new(key.clone(), value).versioned(version);

        store.store(entry.clone()).unwrap();

        prop_assert_eq!(store.load(&key).unwrap(), Some(entry));
    }

    // store(e); store(e) leaves the same state as a single store(e).
    #[test]
    fn prop_store_is_idempotent(
        entries in prop::collection::vec((key_strategy(), value_strategy()), 1..30)
    ) {
        let once = started_store();
        let twice = started_store();

        for (key, value) in entries {
            let entry = CacheEntry::new(key, value);
            once.store(entry.clone()).unwrap();
            twice.store(entry.clone()).unwrap();
            twice.store(entry).unwrap();
        }

        let all_once: HashSet<String> = once.load_all_keys(&HashSet::new()).unwrap();
        let all_twice: HashSet<String> = twice.load_all_keys(&HashSet::new()).unwrap();
        prop_assert_eq!(&all_once, &all_twice);
        for key in all_once {
            prop_assert_eq!(once.load(&key).unwrap(), twice.load(&key).unwrap());
        }
    }

    // load_all_keys never returns an excluded key.
    #[test]
    fn prop_load_all_keys_respects_exclusions(
        keys in prop::collection::hash_set(key_strategy(), 1..40),
        exclude_every in 1usize..4,
    ) {
        let store = started_store();
        for key in &keys {
            store.store(CacheEntry::new(key.clone(), "v".to_string())).unwrap();
        }
        let excluding: HashSet<String> = keys.iter().step_by(exclude_every).cloned().collect();

        let loaded = store.load_all_keys(&excluding).unwrap();
        prop_assert!(loaded.is_disjoint(&excluding));
        prop_assert_eq!(loaded.len() + excluding.len(), keys.len());
    }
}

// Separate proptest block with fewer cases for time-sensitive expiry tests
proptest! {
    #![proptest_config(ProptestConfig::with_cases(5))]

    // An expired entry loads as None and disappears from load_all_keys.
    #[test]
    fn prop_expired_entry_is_absent(key in key_strategy(), value in value_strategy()) {
        let store = started_store();
        store.store(CacheEntry::with_metadata(
            key.clone(),
            value,
            Metadata::with_lifespan(Duration::from_millis(20)),
        )).unwrap();

        sleep(Duration::from_millis(40));

        prop_assert_eq!(store.load(&key).unwrap(), None);
        prop_assert!(!store.load_all_keys(&HashSet::new()).unwrap().contains(&key));
    }
}
