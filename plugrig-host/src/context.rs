//! Shared plugin context
//!
//! An opaque key-value store built once by the host and handed, unchanged,
//! to every plugin factory. The runtime never reads or writes it; hosts put
//! handles in (a server, a UI model, flags) and plugins read them back with
//! typed getters.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

type Slot = Arc<dyn Any + Send + Sync>;

/// Cheaply cloneable handle to the shared context store
#[derive(Clone, Default)]
pub struct PluginContext {
    inner: Arc<RwLock<HashMap<String, Slot>>>,
}

impl PluginContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with<T: Any + Send + Sync>(self, key: impl Into<String>, value: T) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace a value
    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.insert_arc(key, Arc::new(value));
    }

    /// Insert a value that is already shared
    pub fn insert_arc<T: Any + Send + Sync>(&self, key: impl Into<String>, value: Arc<T>) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(key.into(), value);
    }

    /// Typed view of a value; `None` when absent or of another type
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.get(key).cloned()?.downcast::<T>().ok()
    }

    /// Copy out a `Clone` value
    pub fn get_cloned<T: Any + Send + Sync + Clone>(&self, key: &str) -> Option<T> {
        self.get::<T>(key).map(|value| (*value).clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(key).is_some()
    }

    /// Sorted key list
    pub fn keys(&self) -> Vec<String> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = map.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when both handles point at the same backing store
    pub fn same_store(&self, other: &PluginContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("keys", &self.keys())
            .finish()
    }
}
