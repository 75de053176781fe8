//! Global State Manager
//!
//! Reads scoped state at startup and writes it back at shutdown. Each scope
//! lives in `<location>/<scope>.state` as a JSON object.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::GlobalStateConfig;
use crate::error::{CacheError, Result};
use crate::global_state::state::{TIMESTAMP_PROPERTY, VERSION_PROPERTY};
use crate::global_state::{ScopedPersistentState, GLOBAL_SCOPE};

/// Contributes to and restores from the global scope.
pub trait GlobalStateProvider: Send + Sync {
    /// Adds this provider's properties before the global state is written.
    fn prepare_for_persist(&self, state: &mut ScopedPersistentState);

    /// Receives the global state read at startup.
    fn prepare_for_restore(&self, state: &ScopedPersistentState);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalStateStatus {
    Uninitialized,
    Loaded,
    Active,
    Persisted,
}

// == Global State Manager ==
pub struct GlobalStateManager {
    location: Option<PathBuf>,
    status: Mutex<GlobalStateStatus>,
    providers: RwLock<Vec<Arc<dyn GlobalStateProvider>>>,
    restored: Mutex<Option<ScopedPersistentState>>,
}

impl GlobalStateManager {
    pub fn new(config: &GlobalStateConfig) -> Self {
        Self {
            location: config.location.clone(),
            status: Mutex::new(GlobalStateStatus::Uninitialized),
            providers: RwLock::new(Vec::new()),
            restored: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.location.is_some()
    }

    pub fn status(&self) -> GlobalStateStatus {
        *self.status.lock()
    }

    pub fn register_provider(&self, provider: Arc<dyn GlobalStateProvider>) {
        self.providers.write().push(provider);
    }

    /// Global state read at startup, if any existed.
    pub fn restored_state(&self) -> Option<ScopedPersistentState> {
        self.restored.lock().clone()
    }

    // == Start ==
    /// Loads the global scope and hands it to every provider.
    ///
    /// A missing or unreadable state file is not an error: providers keep
    /// their defaults.
    pub fn start(&self) -> Result<()> {
        {
            let mut status = self.status.lock();
            if *status != GlobalStateStatus::Uninitialized {
                return Err(CacheError::IllegalState(format!(
                    "global state manager cannot start while {:?}",
                    *status
                )));
            }
            *status = GlobalStateStatus::Loaded;
        }

        match self.read_scoped_state(GLOBAL_SCOPE) {
            Some(global) => {
                info!(
                    "Restoring global state written by version {} at {}",
                    global.property(VERSION_PROPERTY).unwrap_or("?"),
                    global.property(TIMESTAMP_PROPERTY).unwrap_or("?")
                );
                for provider in self.providers.read().iter() {
                    provider.prepare_for_restore(&global);
                }
                *self.restored.lock() = Some(global);
            }
            None => debug!("No previous global state, starting fresh"),
        }

        *self.status.lock() = GlobalStateStatus::Active;
        Ok(())
    }

    // == Persist ==
    /// Writes the global scope. Only valid while active.
    pub fn persist(&self) -> Result<()> {
        let status = self.status();
        if status != GlobalStateStatus::Active {
            return Err(CacheError::IllegalState(format!(
                "global state cannot be persisted while {:?}",
                status
            )));
        }

        let mut global = ScopedPersistentState::global();
        global.set_property(VERSION_PROPERTY, env!("CARGO_PKG_VERSION"));
        global.set_property(TIMESTAMP_PROPERTY, Utc::now().to_rfc3339());
        for provider in self.providers.read().iter() {
            provider.prepare_for_persist(&mut global);
        }
        self.write_scoped_state(&global)
    }

    /// Persists and moves to `Persisted`. Stopping twice is a no-op.
    pub fn stop(&self) -> Result<()> {
        match self.status() {
            GlobalStateStatus::Active => {
                self.persist()?;
                *self.status.lock() = GlobalStateStatus::Persisted;
                info!("Global state persisted");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // == Scoped State ==
    /// Reads one scope. Failures are logged and reported as absent.
    pub fn read_scoped_state(&self, scope: &str) -> Option<ScopedPersistentState> {
        let path = match self.scope_path(scope) {
            Ok(Some(path)) => path,
            Ok(None) => return None,
            Err(e) => {
                warn!("Cannot read global state scope: {}", e);
                return None;
            }
        };
        if !path.exists() {
            return None;
        }
        let parsed = fs::read(&path)
            .map_err(CacheError::from)
            .and_then(|raw| Ok(serde_json::from_slice::<ScopedPersistentState>(&raw)?));
        match parsed {
            Ok(state) if state.scope() == scope => Some(state),
            Ok(state) => {
                warn!(
                    "State file {} holds scope {} instead of {}, ignoring it",
                    path.display(),
                    state.scope(),
                    scope
                );
                None
            }
            Err(e) => {
                warn!("Could not read state file {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Writes one scope atomically. A disabled manager writes nothing.
    pub fn write_scoped_state(&self, state: &ScopedPersistentState) -> Result<()> {
        let Some(path) = self.scope_path(state.scope())? else {
            debug!("Global state disabled, scope {} not written", state.scope());
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = path.with_extension("state.tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        debug!("Wrote {} properties to {}", state.len(), path.display());
        Ok(())
    }

    pub fn delete_scoped_state(&self, scope: &str) -> Result<()> {
        let Some(path) = self.scope_path(scope)? else {
            return Ok(());
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn scope_path(&self, scope: &str) -> Result<Option<PathBuf>> {
        if scope.is_empty() {
            return Err(CacheError::NullArgument("scope".to_string()));
        }
        if scope.contains(['/', '\\']) || scope.starts_with('.') {
            return Err(CacheError::IllegalState(format!("invalid scope name '{}'", scope)));
        }
        Ok(self
            .location
            .as_deref()
            .map(|dir: &Path| dir.join(format!("{}.state", scope))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct CounterProvider {
        restarts: AtomicI64,
    }

    impl GlobalStateProvider for CounterProvider {
        fn prepare_for_persist(&self, state: &mut ScopedPersistentState) {
            state.set_int_property("restarts", self.restarts.load(Ordering::SeqCst) + 1);
        }

        fn prepare_for_restore(&self, state: &ScopedPersistentState) {
            if let Ok(Some(n)) = state.int_property("restarts") {
                self.restarts.store(n, Ordering::SeqCst);
            }
        }
    }

    fn manager_in(dir: &Path) -> GlobalStateManager {
        GlobalStateManager::new(&GlobalStateConfig {
            location: Some(dir.to_path_buf()),
        })
    }

    #[test]
    fn test_first_start_without_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());
        manager.start().unwrap();
        assert_eq!(manager.status(), GlobalStateStatus::Active);
        assert!(manager.restored_state().is_none());
    }

    #[test]
    fn test_persist_and_restore_across_restarts() {
        let dir = tempfile::tempdir().unwrap();

        for expected in 0..3 {
            let provider = Arc::new(CounterProvider {
                restarts: AtomicI64::new(0),
            });
            let manager = manager_in(dir.path());
            manager.register_provider(provider.clone());
            manager.start().unwrap();
            assert_eq!(provider.restarts.load(Ordering::SeqCst), expected);
            manager.stop().unwrap();
            assert_eq!(manager.status(), GlobalStateStatus::Persisted);
        }

        let manager = manager_in(dir.path());
        let global = manager.read_scoped_state(GLOBAL_SCOPE).unwrap();
        assert_eq!(global.property(VERSION_PROPERTY), Some(env!("CARGO_PKG_VERSION")));
        assert!(chrono::DateTime::parse_from_rfc3339(global.property(TIMESTAMP_PROPERTY).unwrap()).is_ok());
    }

    #[test]
    fn test_corrupt_state_is_non_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("___global.state"), b"{not json").unwrap();

        let manager = manager_in(dir.path());
        manager.start().unwrap();
        assert!(manager.restored_state().is_none());
    }

    #[test]
    fn test_scoped_state_round_trip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());

        let mut state = ScopedPersistentState::new("cache.users");
        state.set_int_property("segments", 64);
        manager.write_scoped_state(&state).unwrap();
        assert_eq!(manager.read_scoped_state("cache.users"), Some(state));

        manager.delete_scoped_state("cache.users").unwrap();
        manager.delete_scoped_state("cache.users").unwrap();
        assert!(manager.read_scoped_state("cache.users").is_none());
    }

    #[test]
    fn test_persist_requires_active() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());
        assert!(matches!(manager.persist(), Err(CacheError::IllegalState(_))));
        manager.start().unwrap();
        assert!(manager.start().is_err());
        manager.persist().unwrap();
    }

    #[test]
    fn test_disabled_manager() {
        let manager = GlobalStateManager::new(&GlobalStateConfig::default());
        assert!(!manager.is_enabled());
        manager.start().unwrap();
        manager.stop().unwrap();
        assert!(manager.read_scoped_state(GLOBAL_SCOPE).is_none());
        assert!(matches!(
            manager.write_scoped_state(&ScopedPersistentState::new("")),
            Err(CacheError::NullArgument(_))
        ));
    }
}
