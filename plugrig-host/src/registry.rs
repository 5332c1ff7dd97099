//! Plugin registry
//!
//! Thread-safe, priority-ordered mapping from plugin name to live instance.
//! The ordered list is published as an immutable snapshot and swapped on
//! every mutation, so dispatch never observes a partial update. Lifecycle
//! hooks run after the swap, outside the state lock.

use crate::manager::PluginManager;
use crate::plugin::PluginInstance;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Immutable, ordered point-in-time view of the registry
pub type Snapshot = Arc<[Arc<PluginInstance>]>;

/// Errors that can occur during registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// A registry lock could not be acquired in time; this indicates a
    /// deadlock, typically a lifecycle hook calling a mutating operation
    #[error("Timed out after {timeout:?} waiting for the registry {lock} lock")]
    LockTimeout {
        lock: &'static str,
        timeout: Duration,
    },
}

/// A thread-safe registry for live plugin instances
pub struct PluginRegistry {
    state: Mutex<RegistryState>,
    /// Serializes mutators so unload/load hooks of one change finish before
    /// the next change starts
    lifecycle: Mutex<()>,
    lock_timeout: Duration,
}

struct RegistryState {
    ordered: Snapshot,
    /// Name to position in `ordered`
    index: HashMap<String, usize>,
}

impl RegistryState {
    fn empty() -> Self {
        Self {
            ordered: Arc::from(Vec::new()),
            index: HashMap::new(),
        }
    }

    fn publish(&mut self, mut instances: Vec<Arc<PluginInstance>>) {
        instances.sort_by(|a, b| a.descriptor().sort_key().cmp(&b.descriptor().sort_key()));
        self.index = instances
            .iter()
            .enumerate()
            .map(|(pos, instance)| (instance.name().to_string(), pos))
            .collect();
        self.ordered = Arc::from(instances);
    }

    fn get(&self, name: &str) -> Option<Arc<PluginInstance>> {
        self.index.get(name).map(|&pos| Arc::clone(&self.ordered[pos]))
    }
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState::empty()),
            lifecycle: Mutex::new(()),
            lock_timeout,
        }
    }

    async fn acquire<'a, T>(
        &self,
        mutex: &'a Mutex<T>,
        lock: &'static str,
    ) -> Result<MutexGuard<'a, T>, RegistryError> {
        tokio::time::timeout(self.lock_timeout, mutex.lock())
            .await
            .map_err(|_| {
                tracing::error!(lock, timeout = ?self.lock_timeout, "Registry lock timed out");
                RegistryError::LockTimeout {
                    lock,
                    timeout: self.lock_timeout,
                }
            })
    }

    /// Install or replace an instance by name.
    ///
    /// Fires `on_unload` on the evicted instance (if any), then `on_load` on
    /// the new one. Returns the evicted instance.
    pub async fn upsert(
        &self,
        instance: PluginInstance,
        manager: &PluginManager,
    ) -> Result<Option<Arc<PluginInstance>>, RegistryError> {
        let _lifecycle = self.acquire(&self.lifecycle, "lifecycle").await?;
        let instance = Arc::new(instance);

        let evicted = {
            let mut state = self.acquire(&self.state, "state").await?;
            let evicted = state.get(instance.name());
            let mut next: Vec<Arc<PluginInstance>> = state
                .ordered
                .iter()
                .filter(|existing| existing.name() != instance.name())
                .cloned()
                .collect();
            next.push(Arc::clone(&instance));
            state.publish(next);
            evicted
        };

        match &evicted {
            Some(old) => tracing::info!(
                plugin = %instance.name(),
                old_instance = old.instance_id(),
                new_instance = instance.instance_id(),
                "Plugin replaced"
            ),
            None => tracing::info!(plugin = %instance.name(), "Plugin registered"),
        }

        if let Some(old) = &evicted {
            old.fire_unload(manager).await;
        }
        instance.fire_load(manager).await;

        Ok(evicted)
    }

    /// Remove an instance by name, firing its `on_unload`
    pub async fn remove(
        &self,
        name: &str,
        manager: &PluginManager,
    ) -> Result<Option<Arc<PluginInstance>>, RegistryError> {
        let _lifecycle = self.acquire(&self.lifecycle, "lifecycle").await?;

        let removed = {
            let mut state = self.acquire(&self.state, "state").await?;
            let removed = state.get(name);
            if removed.is_some() {
                let next = state
                    .ordered
                    .iter()
                    .filter(|existing| existing.name() != name)
                    .cloned()
                    .collect();
                state.publish(next);
            }
            removed
        };

        if let Some(old) = &removed {
            tracing::info!(plugin = %name, "Plugin unregistered");
            old.fire_unload(manager).await;
        }

        Ok(removed)
    }

    /// Atomically replace the whole contents.
    ///
    /// Every previous instance is retired (`on_unload`, in registry order)
    /// and every new one installed (`on_load`, in registry order). Names must
    /// already be unique.
    pub async fn replace_all(
        &self,
        instances: Vec<PluginInstance>,
        manager: &PluginManager,
    ) -> Result<(), RegistryError> {
        let _lifecycle = self.acquire(&self.lifecycle, "lifecycle").await?;

        let (retired, installed) = {
            let mut state = self.acquire(&self.state, "state").await?;
            let retired = Arc::clone(&state.ordered);
            state.publish(instances.into_iter().map(Arc::new).collect());
            (retired, Arc::clone(&state.ordered))
        };

        tracing::info!(retired = retired.len(), installed = installed.len(), "Registry replaced");

        for old in retired.iter() {
            old.fire_unload(manager).await;
        }
        for new in installed.iter() {
            new.fire_load(manager).await;
        }

        Ok(())
    }

    /// Remove everything, firing `on_unload` in registry order
    pub async fn clear(&self, manager: &PluginManager) -> Result<usize, RegistryError> {
        let _lifecycle = self.acquire(&self.lifecycle, "lifecycle").await?;

        let retired = {
            let mut state = self.acquire(&self.state, "state").await?;
            let retired = Arc::clone(&state.ordered);
            state.publish(Vec::new());
            retired
        };

        for old in retired.iter() {
            old.fire_unload(manager).await;
        }

        Ok(retired.len())
    }

    /// Ordered snapshot safe to iterate while mutations continue
    pub async fn snapshot(&self) -> Result<Snapshot, RegistryError> {
        let state = self.acquire(&self.state, "state").await?;
        Ok(Arc::clone(&state.ordered))
    }

    /// Look up an instance by name
    pub async fn get(&self, name: &str) -> Result<Option<Arc<PluginInstance>>, RegistryError> {
        let state = self.acquire(&self.state, "state").await?;
        Ok(state.get(name))
    }

    /// Names in registry order
    pub async fn names(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self
            .snapshot()
            .await?
            .iter()
            .map(|instance| instance.name().to_string())
            .collect())
    }

    /// Get the number of live plugins
    pub async fn len(&self) -> Result<usize, RegistryError> {
        Ok(self.snapshot().await?.len())
    }

    /// Check if the registry is empty
    pub async fn is_empty(&self) -> Result<bool, RegistryError> {
        Ok(self.len().await? == 0)
    }
}
