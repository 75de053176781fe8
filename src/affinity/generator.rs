//! Candidate key generators for the key affinity service.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Produces candidate keys. Called repeatedly from the generator task.
pub trait KeyGenerator<K>: Send + Sync + 'static {
    fn next_key(&self) -> K;
}

/// Random keys: uniform `u64`s, or 16 character alphanumeric strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomKeyGenerator;

impl KeyGenerator<u64> for RandomKeyGenerator {
    fn next_key(&self) -> u64 {
        rand::thread_rng().gen()
    }
}

impl KeyGenerator<String> for RandomKeyGenerator {
    fn next_key(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_string_keys_are_alphanumeric() {
        let key: String = RandomKeyGenerator.next_key();
        assert_eq!(key.len(), 16);
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_keys_vary() {
        let keys: HashSet<u64> = (0..100)
            .map(|_| KeyGenerator::<u64>::next_key(&RandomKeyGenerator))
            .collect();
        assert!(keys.len() > 90);
    }
}
