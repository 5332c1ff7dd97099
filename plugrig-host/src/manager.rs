//! Plugin manager
//!
//! The host-facing handle. It owns the configuration, the unit loader, the
//! registry, a ledger of the units currently on disk and the optional reload
//! watcher. Handles are cheap to clone; plugins receive one in every hook.

use crate::config::{ConfigError, ManagerConfig};
use crate::context::PluginContext;
use crate::discovery::{self, DiscoveredUnit, DiscoveryError, DiscoveryResult};
use crate::dispatch;
use crate::loader::{merge_loads, MergedLoads, PluginFailure, UnitError, UnitLoad, UnitLoader};
use crate::plugin::{PluginConfig, PluginFactories, PluginInfo, PluginInstance, PluginResult, Plugin, UnitKind};
use crate::registry::{PluginRegistry, RegistryError};
use crate::wasm::LoaderError;
use crate::watcher::{HotReloadWatcher, WatcherConfig, WatcherError};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{Instrument, Span};

/// Conditions that must reach the host. Everything a single plugin or unit
/// does wrong is logged and reported in [`LoadReport`] instead.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    LockTimeout(#[from] RegistryError),

    #[error("Failed to start hot reload watcher: {0}")]
    WatcherStart(#[from] WatcherError),

    #[error("Hot reload watcher panicked: {0}")]
    WatcherPanicked(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to initialize the Wasm engine: {0}")]
    Engine(#[source] LoaderError),

    #[error("Background load task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Something that went wrong during a load pass
#[derive(Debug, Clone, Serialize)]
pub struct LoadFailure {
    /// Root, unit file or package directory
    pub path: PathBuf,
    /// Set when a single plugin failed rather than the whole unit
    pub plugin: Option<String>,
    pub error: String,
}

impl LoadFailure {
    fn unit(path: &Path, error: &UnitError) -> Self {
        Self {
            path: path.to_path_buf(),
            plugin: None,
            error: error.to_string(),
        }
    }

    fn plugin(failure: &PluginFailure) -> Self {
        Self {
            path: failure.unit.clone(),
            plugin: Some(failure.plugin.clone()),
            error: failure.error.to_string(),
        }
    }

    fn discovery(error: &DiscoveryError) -> Self {
        Self {
            path: error.path().to_path_buf(),
            plugin: None,
            error: error.to_string(),
        }
    }

    fn duplicate(path: &Path, name: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            plugin: Some(name.to_string()),
            error: format!("Duplicate plugin name '{}', keeping the earlier registration", name),
        }
    }
}

/// Outcome of one load or reload pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    /// Names installed or replaced, in the order they went in
    pub loaded: Vec<String>,
    /// Names retired without a replacement
    pub removed: Vec<String>,
    pub failures: Vec<LoadFailure>,
}

impl LoadReport {
    /// Whether the registry changed
    pub fn has_changes(&self) -> bool {
        !self.loaded.is_empty() || !self.removed.is_empty()
    }
}

/// What the manager remembers about a unit between passes
#[derive(Debug, Clone)]
struct UnitRecord {
    mtime: SystemTime,
    kind: UnitKind,
    /// Names this unit currently owns in the registry
    names: Vec<String>,
    /// Names this unit declares that another unit owns
    shadowed: Vec<String>,
}

type Ledger = HashMap<PathBuf, UnitRecord>;

type UnitOutcome = (DiscoveredUnit, Result<UnitLoad, UnitError>);

struct ManagerInner {
    config: ManagerConfig,
    loader: Arc<UnitLoader>,
    registry: PluginRegistry,
    units: Mutex<Ledger>,
    watcher: Mutex<Option<HotReloadWatcher>>,
    running: AtomicBool,
    span: Span,
}

/// Handle to the plugin runtime
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<ManagerInner>,
}

/// Non-owning handle held by the reload watcher
#[derive(Clone)]
pub(crate) struct WeakManager(Weak<ManagerInner>);

impl WeakManager {
    pub(crate) fn upgrade(&self) -> Option<PluginManager> {
        self.0.upgrade().map(|inner| PluginManager { inner })
    }
}

/// Builder for [`PluginManager`]
pub struct PluginManagerBuilder {
    config: ManagerConfig,
    context: PluginContext,
    factories: PluginFactories,
    span: Option<Span>,
}

impl PluginManagerBuilder {
    /// Shared context handed to every plugin factory
    pub fn context(mut self, context: PluginContext) -> Self {
        self.context = context;
        self
    }

    /// Register a native plugin factory
    pub fn factory<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PluginContext, &PluginConfig) -> PluginResult<Arc<dyn Plugin>> + Send + Sync + 'static,
    {
        self.factories.register(name, factory);
        self
    }

    /// Replace the whole factory table
    pub fn factories(mut self, factories: PluginFactories) -> Self {
        self.factories = factories;
        self
    }

    /// Span every manager operation and the watcher task run in
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> Result<PluginManager, ManagerError> {
        self.config.validate()?;
        let loader = UnitLoader::new(self.factories, self.context, self.config.wasm_fuel)
            .map_err(ManagerError::Engine)?;
        let registry = PluginRegistry::new(self.config.lock_timeout);

        Ok(PluginManager {
            inner: Arc::new(ManagerInner {
                config: self.config,
                loader: Arc::new(loader),
                registry,
                units: Mutex::new(Ledger::new()),
                watcher: Mutex::new(None),
                running: AtomicBool::new(false),
                span: self.span.unwrap_or_else(|| tracing::info_span!("plugrig")),
            }),
        })
    }
}

impl PluginManager {
    pub fn builder(config: ManagerConfig) -> PluginManagerBuilder {
        PluginManagerBuilder {
            config,
            context: PluginContext::new(),
            factories: PluginFactories::new(),
            span: None,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// The shared context plugins were constructed with
    pub fn context(&self) -> &PluginContext {
        self.inner.loader.context()
    }

    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// True between `load_all` and `stop`
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub(crate) fn downgrade(&self) -> WeakManager {
        WeakManager(Arc::downgrade(&self.inner))
    }

    /// Load plugins from every root.
    ///
    /// With `force`, or on the first call, every unit is rebuilt and the
    /// registry is replaced wholesale. Otherwise this is one convergence
    /// pass: only new, changed and vanished units are touched. Starts the
    /// reload watcher when `hot_reload` is configured.
    pub async fn load_all(&self, force: bool) -> Result<LoadReport, ManagerError> {
        async {
            let mut ledger = self.lock_units().await?;
            let report = if force || ledger.is_empty() {
                self.load_everything(&mut ledger).await?
            } else {
                self.converge_units(&mut ledger).await?
            };
            drop(ledger);

            tracing::info!(
                loaded = report.loaded.len(),
                removed = report.removed.len(),
                failures = report.failures.len(),
                force,
                "Plugins loaded"
            );

            self.inner.running.store(true, Ordering::SeqCst);
            if self.inner.config.hot_reload {
                self.start_watcher().await?;
            }
            Ok(report)
        }
        .instrument(self.inner.span.clone())
        .await
    }

    /// One convergence pass against the disk. `Ok(None)` when another load
    /// holds the units; the next tick picks up whatever it missed.
    pub(crate) async fn converge(&self) -> Result<Option<LoadReport>, ManagerError> {
        let Ok(mut ledger) = self.inner.units.try_lock() else {
            tracing::debug!("Plugin units busy, skipping reload tick");
            return Ok(None);
        };
        self.converge_units(&mut ledger)
            .instrument(self.inner.span.clone())
            .await
            .map(Some)
    }

    /// Reload one unit now, regardless of its mtime. A path that no longer
    /// holds a unit has its plugins removed.
    pub async fn reload_unit(&self, path: impl AsRef<Path>) -> Result<LoadReport, ManagerError> {
        let path = path.as_ref().to_path_buf();
        async move {
            let mut ledger = self.lock_units().await?;
            let mut report = LoadReport::default();

            match self.inspect(&path).await? {
                Ok(Some(unit)) => {
                    for (unit, outcome) in self.load_units(vec![unit]).await? {
                        self.apply_unit(&mut ledger, unit, outcome, &mut report).await?;
                    }
                }
                Ok(None) => self.retire_unit(&mut ledger, &path, &mut report).await?,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to inspect plugin unit");
                    report.failures.push(LoadFailure::discovery(&e));
                }
            }

            self.adopt_released(&mut ledger, &mut report).await?;
            Ok(report)
        }
        .instrument(self.inner.span.clone())
        .await
    }

    /// Names in registry order
    pub async fn list_plugins(&self) -> Result<Vec<String>, ManagerError> {
        Ok(self.inner.registry.names().await?)
    }

    pub async fn get(&self, name: &str) -> Result<Option<Arc<PluginInstance>>, ManagerError> {
        Ok(self.inner.registry.get(name).await?)
    }

    /// Summaries in registry order, for help and listing screens
    pub async fn plugin_infos(&self) -> Result<Vec<PluginInfo>, ManagerError> {
        let snapshot = self.inner.registry.snapshot().await?;
        Ok(snapshot.iter().map(|instance| instance.info()).collect())
    }

    /// Offer an event to every interested plugin
    pub async fn dispatch_event(&self, event: &str, payload: &Value) -> Result<Vec<Value>, ManagerError> {
        let snapshot = self.inner.registry.snapshot().await?;
        Ok(dispatch::dispatch_event(&snapshot, event, payload, self)
            .instrument(self.inner.span.clone())
            .await)
    }

    /// Run the filter chain, then fan a command out to every handler
    pub async fn handle_message(&self, text: &str) -> Result<Vec<String>, ManagerError> {
        let snapshot = self.inner.registry.snapshot().await?;
        Ok(dispatch::handle_message(&snapshot, text, &self.inner.config.command_prefixes, self)
            .instrument(self.inner.span.clone())
            .await)
    }

    /// Stop the watcher, wait for its current tick, then unload every plugin
    /// in registry order. Safe to call more than once.
    ///
    /// Returns the error that ended the watcher, if any; plugins are unloaded
    /// either way.
    pub async fn stop(&self) -> Result<(), ManagerError> {
        async {
            let watcher = self.inner.watcher.lock().await.take();
            let watcher_result = match watcher {
                Some(watcher) => watcher.shutdown().await,
                None => Ok(()),
            };

            let mut ledger = self.lock_units().await?;
            let unloaded = self.inner.registry.clear(self).await?;
            ledger.clear();
            drop(ledger);

            if self.inner.running.swap(false, Ordering::SeqCst) {
                tracing::info!(unloaded, "Plugin manager stopped");
            }
            watcher_result
        }
        .instrument(self.inner.span.clone())
        .await
    }

    async fn start_watcher(&self) -> Result<(), ManagerError> {
        let mut slot = self.inner.watcher.lock().await;
        if slot.as_ref().is_some_and(HotReloadWatcher::is_running) {
            return Ok(());
        }

        let config = WatcherConfig {
            poll_interval: self.inner.config.poll_interval,
            debounce: self.inner.config.debounce,
        };
        *slot = Some(HotReloadWatcher::start(self, &self.inner.config.plugin_roots, config)?);
        Ok(())
    }

    async fn lock_units(&self) -> Result<MutexGuard<'_, Ledger>, ManagerError> {
        let timeout = self.inner.config.lock_timeout;
        tokio::time::timeout(timeout, self.inner.units.lock())
            .await
            .map_err(|_| {
                tracing::error!(lock = "units", timeout = ?timeout, "Registry lock timed out");
                ManagerError::LockTimeout(RegistryError::LockTimeout {
                    lock: "units",
                    timeout,
                })
            })
    }

    async fn discover(&self, report: &mut LoadReport) -> Result<DiscoveryResult, ManagerError> {
        let roots = self.inner.config.plugin_roots.clone();
        let result = tokio::task::spawn_blocking(move || discovery::scan_roots(&roots)).await?;

        for failure in &result.failures {
            tracing::warn!(path = %failure.path().display(), error = %failure, "Plugin discovery failed");
            report.failures.push(LoadFailure::discovery(failure));
        }
        Ok(result)
    }

    async fn inspect(&self, path: &Path) -> Result<Result<Option<DiscoveredUnit>, DiscoveryError>, ManagerError> {
        let path = path.to_path_buf();
        Ok(tokio::task::spawn_blocking(move || discovery::inspect_unit(&path)).await?)
    }

    async fn load_units(&self, units: Vec<DiscoveredUnit>) -> Result<Vec<UnitOutcome>, ManagerError> {
        if units.is_empty() {
            return Ok(Vec::new());
        }
        let loader = Arc::clone(&self.inner.loader);
        let outcomes = tokio::task::spawn_blocking(move || {
            units
                .into_iter()
                .map(|unit| {
                    let outcome = loader.load_unit(&unit);
                    (unit, outcome)
                })
                .collect::<Vec<UnitOutcome>>()
        })
        .await?;
        Ok(outcomes)
    }

    /// Rebuild every unit and replace the registry contents
    async fn load_everything(&self, ledger: &mut Ledger) -> Result<LoadReport, ManagerError> {
        let mut report = LoadReport::default();

        let units = self.discover(&mut report).await?.units;
        let mut next = Ledger::new();
        let mut loads = Vec::new();

        for (unit, outcome) in self.load_units(units).await? {
            next.insert(
                unit.path.clone(),
                UnitRecord {
                    mtime: unit.mtime,
                    kind: unit.kind,
                    names: Vec::new(),
                    shadowed: Vec::new(),
                },
            );
            match outcome {
                Ok(load) => {
                    report.failures.extend(load.failures.iter().map(LoadFailure::plugin));
                    loads.push(load);
                }
                Err(e) => {
                    tracing::warn!(path = %unit.path.display(), error = %e, "Failed to load plugin unit");
                    report.failures.push(LoadFailure::unit(&unit.path, &e));
                }
            }
        }

        let MergedLoads { instances, discarded } = merge_loads(loads);
        for instance in &instances {
            if let Some(record) = next.get_mut(&instance.descriptor().source_path) {
                record.names.push(instance.name().to_string());
            }
        }
        for instance in &discarded {
            let path = &instance.descriptor().source_path;
            report.failures.push(LoadFailure::duplicate(path, instance.name()));
            if let Some(record) = next.get_mut(path) {
                record.shadowed.push(instance.name().to_string());
            }
        }

        let installed: HashSet<&str> = instances.iter().map(|i| i.name()).collect();
        report.removed = self
            .inner
            .registry
            .names()
            .await?
            .into_iter()
            .filter(|name| !installed.contains(name.as_str()))
            .collect();
        report.loaded = instances.iter().map(|i| i.name().to_string()).collect();

        self.inner.registry.replace_all(instances, self).await?;
        *ledger = next;
        Ok(report)
    }

    /// Touch only what changed on disk since the last pass
    async fn converge_units(&self, ledger: &mut Ledger) -> Result<LoadReport, ManagerError> {
        let mut report = LoadReport::default();

        let DiscoveryResult { units, failures } = self.discover(&mut report).await?;

        // Units under an unreadable root, or that could not be stat'ed, are
        // not gone. A missing root is.
        let vanished: Vec<PathBuf> = {
            let present: HashSet<&Path> = units.iter().map(|u| u.path.as_path()).collect();
            let unreadable: Vec<&Path> = failures
                .iter()
                .filter(|f| !matches!(f, DiscoveryError::RootNotFound(_)))
                .map(DiscoveryError::path)
                .collect();
            ledger
                .keys()
                .filter(|path| !present.contains(path.as_path()))
                .filter(|path| !unreadable.iter().any(|p| path.starts_with(p)))
                .cloned()
                .collect()
        };
        for path in vanished {
            self.retire_unit(ledger, &path, &mut report).await?;
        }

        let changed: Vec<DiscoveredUnit> = units
            .into_iter()
            .filter(|unit| {
                ledger
                    .get(&unit.path)
                    .map_or(true, |record| record.mtime != unit.mtime || record.kind != unit.kind)
            })
            .collect();

        for (unit, outcome) in self.load_units(changed).await? {
            self.apply_unit(ledger, unit, outcome, &mut report).await?;
        }

        self.adopt_released(ledger, &mut report).await?;
        Ok(report)
    }

    /// Remove every plugin a vanished unit owned
    async fn retire_unit(
        &self,
        ledger: &mut Ledger,
        path: &Path,
        report: &mut LoadReport,
    ) -> Result<(), ManagerError> {
        let Some(record) = ledger.remove(path) else {
            return Ok(());
        };
        tracing::info!(path = %path.display(), plugins = record.names.len(), "Plugin unit removed");

        for name in record.names {
            if self.inner.registry.remove(&name, self).await?.is_some() {
                report.removed.push(name);
            }
        }
        Ok(())
    }

    /// Fold one freshly loaded unit into the registry.
    ///
    /// A unit-level failure keeps the previous instances. A plugin whose
    /// construction failed keeps its previous instance; a name the unit no
    /// longer declares is removed; a name owned by another unit stays there
    /// and is remembered as shadowed.
    async fn apply_unit(
        &self,
        ledger: &mut Ledger,
        unit: DiscoveredUnit,
        outcome: Result<UnitLoad, UnitError>,
        report: &mut LoadReport,
    ) -> Result<(), ManagerError> {
        let (previous, previous_shadowed) = ledger
            .get(&unit.path)
            .map(|record| (record.names.clone(), record.shadowed.clone()))
            .unwrap_or_default();

        let load = match outcome {
            Ok(load) => load,
            Err(e) => {
                tracing::warn!(
                    path = %unit.path.display(),
                    error = %e,
                    "Failed to load plugin unit, keeping previous instances"
                );
                report.failures.push(LoadFailure::unit(&unit.path, &e));
                ledger.insert(
                    unit.path.clone(),
                    UnitRecord {
                        mtime: unit.mtime,
                        kind: unit.kind,
                        names: previous,
                        shadowed: previous_shadowed,
                    },
                );
                return Ok(());
            }
        };

        report.failures.extend(load.failures.iter().map(LoadFailure::plugin));
        let failed: HashSet<String> = load.failed_names().into_iter().map(str::to_string).collect();

        let mut names = Vec::new();
        let mut shadowed = Vec::new();
        for instance in load.instances {
            let name = instance.name().to_string();
            if owned_elsewhere(ledger, &unit.path, &name) {
                tracing::warn!(
                    plugin = %name,
                    path = %unit.path.display(),
                    "Duplicate plugin name, keeping the earlier registration"
                );
                report.failures.push(LoadFailure::duplicate(&unit.path, &name));
                shadowed.push(name);
                continue;
            }
            self.inner.registry.upsert(instance, self).await?;
            report.loaded.push(name.clone());
            names.push(name);
        }

        for name in previous {
            if names.contains(&name) {
                continue;
            }
            if failed.contains(&name) {
                tracing::warn!(plugin = %name, "Keeping previous instance after failed reload");
                names.push(name);
                continue;
            }
            if self.inner.registry.remove(&name, self).await?.is_some() {
                report.removed.push(name);
            }
        }

        ledger.insert(
            unit.path,
            UnitRecord {
                mtime: unit.mtime,
                kind: unit.kind,
                names,
                shadowed,
            },
        );
        Ok(())
    }

    /// Hand names whose owner went away to the next unit that declares them.
    ///
    /// Candidates are visited in discovery order, so the unit that would win
    /// a full load wins here too. A candidate whose file changed since its
    /// record was taken is applied in full instead.
    async fn adopt_released(&self, ledger: &mut Ledger, report: &mut LoadReport) -> Result<(), ManagerError> {
        let mut candidates: Vec<PathBuf> = ledger
            .iter()
            .filter(|(_, record)| !record.shadowed.is_empty())
            .map(|(path, _)| path.clone())
            .collect();
        candidates.sort_by_key(|path| self.discovery_rank(path));

        for path in candidates {
            if !is_waiting(ledger, &path) {
                continue;
            }

            let unit = match self.inspect(&path).await? {
                Ok(Some(unit)) => unit,
                Ok(None) => {
                    self.retire_unit(ledger, &path, report).await?;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to inspect plugin unit");
                    report.failures.push(LoadFailure::discovery(&e));
                    continue;
                }
            };

            for (unit, outcome) in self.load_units(vec![unit]).await? {
                let unchanged = ledger
                    .get(&unit.path)
                    .is_some_and(|record| record.mtime == unit.mtime && record.kind == unit.kind);
                if unchanged {
                    self.adopt_from(ledger, &unit.path, outcome, report).await?;
                } else {
                    self.apply_unit(ledger, unit, outcome, report).await?;
                }
            }
        }
        Ok(())
    }

    /// Install the shadowed names of an unchanged unit that nobody owns any
    /// more. Names that still fail, or vanished from the load, stop waiting.
    async fn adopt_from(
        &self,
        ledger: &mut Ledger,
        path: &Path,
        outcome: Result<UnitLoad, UnitError>,
        report: &mut LoadReport,
    ) -> Result<(), ManagerError> {
        let load = match outcome {
            Ok(load) => load,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to load plugin unit");
                report.failures.push(LoadFailure::unit(path, &e));
                if let Some(record) = ledger.get_mut(path) {
                    record.shadowed.clear();
                }
                return Ok(());
            }
        };
        report.failures.extend(load.failures.iter().map(LoadFailure::plugin));

        let shadowed = ledger
            .get_mut(path)
            .map(|record| std::mem::take(&mut record.shadowed))
            .unwrap_or_default();

        let mut adopted = Vec::new();
        let mut still_shadowed = Vec::new();
        for instance in load.instances {
            let name = instance.name().to_string();
            if !shadowed.contains(&name) {
                continue;
            }
            if owned_elsewhere(ledger, path, &name) {
                still_shadowed.push(name);
                continue;
            }
            tracing::info!(plugin = %name, path = %path.display(), "Plugin name released, adopting");
            self.inner.registry.upsert(instance, self).await?;
            report.loaded.push(name.clone());
            adopted.push(name);
        }

        if let Some(record) = ledger.get_mut(path) {
            record.names.extend(adopted);
            record.shadowed = still_shadowed;
        }
        Ok(())
    }

    /// Position a unit would take in a full scan: root order, then file name
    fn discovery_rank(&self, path: &Path) -> (usize, Option<std::ffi::OsString>) {
        let root = self
            .inner
            .config
            .plugin_roots
            .iter()
            .position(|root| path.parent() == Some(root.as_path()))
            .unwrap_or(usize::MAX);
        (root, path.file_name().map(|name| name.to_os_string()))
    }
}

fn owned_elsewhere(ledger: &Ledger, path: &Path, name: &str) -> bool {
    ledger
        .iter()
        .any(|(owner, record)| owner != path && record.names.iter().any(|n| n == name))
}

/// Whether a unit declares a name that nobody owns any more
fn is_waiting(ledger: &Ledger, path: &Path) -> bool {
    ledger.get(path).is_some_and(|record| {
        record
            .shadowed
            .iter()
            .any(|name| !owned_elsewhere(ledger, path, name))
    })
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugin_roots", &self.inner.config.plugin_roots)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_build_validates_config() {
        let result = PluginManager::builder(ManagerConfig::default()).build();
        assert!(matches!(result, Err(ManagerError::Config(ConfigError::NoPluginRoots))));
    }

    #[test]
    fn test_context_is_shared() {
        let temp = TempDir::new().unwrap();
        let context = PluginContext::new().with("bot", 7u32);
        let manager = PluginManager::builder(ManagerConfig::new([temp.path()]))
            .context(context.clone())
            .build()
            .unwrap();

        assert!(manager.context().same_store(&context));
        assert_eq!(manager.context().get_cloned::<u32>("bot"), Some(7));
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_empty_root_loads_nothing() {
        let temp = TempDir::new().unwrap();
        let manager = PluginManager::builder(ManagerConfig::new([temp.path()]))
            .build()
            .unwrap();

        let report = manager.load_all(false).await.unwrap();
        assert!(!report.has_changes());
        assert!(report.failures.is_empty());
        assert!(manager.is_running());
        assert!(manager.list_plugins().await.unwrap().is_empty());

        manager.stop().await.unwrap();
        manager.stop().await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_missing_root_is_reported() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("absent");
        let manager = PluginManager::builder(ManagerConfig::new([missing.clone()]))
            .build()
            .unwrap();

        let report = manager.load_all(true).await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, missing);
    }

    #[tokio::test]
    async fn test_wasm_unit_answers_commands() {
        use crate::wasm::fixtures::module_wat;
        use plugrig_api::{GuestResponse, PluginSpec, UnitManifest};

        let temp = TempDir::new().unwrap();
        let manifest = UnitManifest::new().plugin(PluginSpec::new("ping").priority(7).command("ping"));
        std::fs::write(
            temp.path().join("ping.wasm"),
            module_wat(&manifest, &GuestResponse::text("pong!")),
        )
        .unwrap();

        let manager = PluginManager::builder(ManagerConfig::new([temp.path()]))
            .build()
            .unwrap();
        manager.load_all(false).await.unwrap();

        let infos = manager.plugin_infos().await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "ping");
        assert_eq!(infos[0].priority, 7);
        assert_eq!(manager.handle_message("/ping").await.unwrap(), vec!["pong!"]);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_units_lock_timeout_is_fatal() {
        let temp = TempDir::new().unwrap();
        let manager = PluginManager::builder(
            ManagerConfig::new([temp.path()]).lock_timeout(std::time::Duration::from_millis(20)),
        )
        .build()
        .unwrap();

        let _held = manager.inner.units.lock().await;
        assert!(matches!(
            manager.load_all(false).await,
            Err(ManagerError::LockTimeout(RegistryError::LockTimeout { lock: "units", .. }))
        ));
    }

    #[tokio::test]
    async fn test_converge_skips_while_units_are_held() {
        let temp = TempDir::new().unwrap();
        let manager = PluginManager::builder(
            ManagerConfig::new([temp.path()]).lock_timeout(std::time::Duration::from_millis(20)),
        )
        .build()
        .unwrap();
        manager.load_all(false).await.unwrap();

        let held = manager.inner.units.lock().await;
        assert!(manager.converge().await.unwrap().is_none());
        drop(held);

        assert!(manager.converge().await.unwrap().is_some());
    }
}
