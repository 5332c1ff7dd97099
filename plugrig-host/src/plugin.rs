//! The plugin contract
//!
//! A plugin is any `Send + Sync` value implementing [`Plugin`]. Every hook
//! except [`Plugin::capabilities`] has a no-op default; the capability set
//! returned at construction decides which hooks the runtime will call.

use crate::context::PluginContext;
use crate::manager::PluginManager;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

pub use plugrig_api::{Capabilities, DEFAULT_PRIORITY};

/// Errors a plugin raises from a hook or its factory
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{0}")]
    Failed(String),

    #[error("Plugin panicked: {0}")]
    Panicked(String),

    #[error("Unknown plugin factory: {0}")]
    UnknownFactory(String),

    #[error("Invalid plugin config: {0}")]
    InvalidConfig(String),

    #[error("Duplicate plugin name '{0}' in unit, keeping the first declaration")]
    DuplicateName(String),

    #[error("Guest reported an error: {0}")]
    Guest(String),

    #[error("Unexpected guest response to {request}: {response}")]
    Protocol {
        request: &'static str,
        response: String,
    },

    #[error(transparent)]
    Wasm(#[from] crate::wasm::LoaderError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PluginError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

pub type PluginResult<T> = Result<T, PluginError>;

/// Keyword state handed to a factory: the `config` table of the plugin's
/// manifest entry
pub type PluginConfig = toml::Table;

/// Shape of a plugin unit on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// One file directly under a plugin root
    SingleFile,
    /// A directory holding an entry manifest
    Package,
}

/// Identity and location metadata tracked per plugin name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Lower runs earlier
    pub priority: i32,
    pub source_path: PathBuf,
    pub source_mtime: SystemTime,
    pub kind: UnitKind,
}

impl PluginDescriptor {
    /// Registry order key
    pub fn sort_key(&self) -> (i32, &str) {
        (self.priority, self.name.as_str())
    }
}

/// Capabilities a plugin may implement
///
/// Hooks return `Ok(None)` for "no opinion". Returning an error, or
/// panicking, is logged by the runtime and treated the same as `Ok(None)`.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Which optional hooks this plugin implements. Read once at construction.
    fn capabilities(&self) -> Capabilities;

    /// Called once after the instance is installed in the registry
    async fn on_load(&self, _manager: &PluginManager) -> PluginResult<()> {
        Ok(())
    }

    /// Called once after the instance is retired from the registry
    async fn on_unload(&self, _manager: &PluginManager) -> PluginResult<()> {
        Ok(())
    }

    /// Cheap pre-check consulted before `on_event` when `EVENT_FILTER` is set
    fn handles(&self, _event: &str) -> bool {
        true
    }

    async fn on_event(
        &self,
        _event: &str,
        _payload: &Value,
        _manager: &PluginManager,
    ) -> PluginResult<Option<Value>> {
        Ok(None)
    }

    /// One stage of the filter chain; `None` leaves the text unchanged
    async fn filter_message(
        &self,
        _text: &str,
        _manager: &PluginManager,
    ) -> PluginResult<Option<String>> {
        Ok(None)
    }

    /// `command` arrives with its prefix character already stripped
    async fn handle_command(
        &self,
        _command: &str,
        _args: &str,
        _manager: &PluginManager,
    ) -> PluginResult<Option<String>> {
        Ok(None)
    }

    /// Command names for help screens; not enforced at dispatch time
    fn commands(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Constructs a plugin from the shared context and its keyword state
pub type PluginFactory =
    Arc<dyn Fn(&PluginContext, &PluginConfig) -> PluginResult<Arc<dyn Plugin>> + Send + Sync>;

/// Table of compiled-in plugin factories, looked up by the `factory` key of
/// a unit manifest entry
#[derive(Clone, Default)]
pub struct PluginFactories {
    factories: HashMap<String, PluginFactory>,
}

impl PluginFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous one
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&PluginContext, &PluginConfig) -> PluginResult<Arc<dyn Plugin>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Builder-style [`register`](Self::register)
    pub fn with<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PluginContext, &PluginConfig) -> PluginResult<Arc<dyn Plugin>> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn get(&self, name: &str) -> Option<&PluginFactory> {
        self.factories.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Sorted factory names
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for PluginFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginFactories")
            .field("names", &self.names())
            .finish()
    }
}

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// A live plugin: descriptor, plugin object and the context it was built with
pub struct PluginInstance {
    descriptor: PluginDescriptor,
    plugin: Arc<dyn Plugin>,
    context: PluginContext,
    capabilities: Capabilities,
    loaded_at: DateTime<Utc>,
    instance_id: u64,
}

impl PluginInstance {
    pub fn new(descriptor: PluginDescriptor, plugin: Arc<dyn Plugin>, context: PluginContext) -> Self {
        let capabilities = plugin.capabilities();
        Self {
            descriptor,
            plugin,
            context,
            capabilities,
            loaded_at: Utc::now(),
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub fn plugin(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }

    pub fn context(&self) -> &PluginContext {
        &self.context
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn has(&self, capability: Capabilities) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Process-unique id; a reload always yields a new one
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Declared command names; a panicking plugin yields none
    pub fn commands(&self) -> Vec<String> {
        std::panic::catch_unwind(AssertUnwindSafe(|| self.plugin.commands())).unwrap_or_else(|panic| {
            tracing::warn!(plugin = %self.name(), panic = %panic_message(&*panic), "Plugin panicked in commands()");
            Vec::new()
        })
    }

    /// Summary for listing and help screens
    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.descriptor.name.clone(),
            version: self.descriptor.version.clone(),
            description: self.descriptor.description.clone(),
            priority: self.descriptor.priority,
            commands: self.commands(),
            capabilities: self.capabilities.names(),
            source_path: self.descriptor.source_path.clone(),
            kind: self.descriptor.kind,
            loaded_at: self.loaded_at,
        }
    }

    /// Whether an event should be offered to this instance
    pub(crate) fn accepts_event(&self, event: &str) -> bool {
        if !self.has(Capabilities::EVENTS) {
            return false;
        }
        if !self.has(Capabilities::EVENT_FILTER) {
            return true;
        }
        std::panic::catch_unwind(AssertUnwindSafe(|| self.plugin.handles(event))).unwrap_or_else(|panic| {
            tracing::warn!(plugin = %self.name(), event, panic = %panic_message(&*panic), "Plugin panicked in handles()");
            false
        })
    }

    pub(crate) async fn fire_load(&self, manager: &PluginManager) {
        if self.has(Capabilities::LIFECYCLE) {
            guarded(self.name(), "on_load", self.plugin.on_load(manager)).await;
        }
        tracing::debug!(plugin = %self.name(), instance = self.instance_id, "Plugin loaded");
    }

    pub(crate) async fn fire_unload(&self, manager: &PluginManager) {
        if self.has(Capabilities::LIFECYCLE) {
            guarded(self.name(), "on_unload", self.plugin.on_unload(manager)).await;
        }
        tracing::debug!(plugin = %self.name(), instance = self.instance_id, "Plugin unloaded");
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("descriptor", &self.descriptor)
            .field("capabilities", &self.capabilities)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

/// Serializable plugin summary
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub priority: i32,
    pub commands: Vec<String>,
    pub capabilities: Vec<&'static str>,
    pub source_path: PathBuf,
    pub kind: UnitKind,
    pub loaded_at: DateTime<Utc>,
}

/// Run one plugin hook, absorbing errors and panics into a log line
pub(crate) async fn guarded<T, F>(plugin: &str, hook: &'static str, call: F) -> Option<T>
where
    F: Future<Output = PluginResult<T>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::warn!(plugin = %plugin, hook, error = %e, "Plugin hook failed");
            None
        }
        Err(panic) => {
            tracing::error!(plugin = %plugin, hook, panic = %panic_message(&*panic), "Plugin panicked");
            None
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quiet;

    impl Plugin for Quiet {
        fn capabilities(&self) -> Capabilities {
            Capabilities::EVENTS | Capabilities::EVENT_FILTER
        }

        fn handles(&self, event: &str) -> bool {
            if event == "boom" {
                panic!("bad probe");
            }
            event == "tick"
        }

        fn commands(&self) -> Vec<String> {
            vec!["/quiet".into()]
        }
    }

    fn descriptor(name: &str, priority: i32) -> PluginDescriptor {
        PluginDescriptor {
            name: name.into(),
            version: "1.0.0".into(),
            description: String::new(),
            priority,
            source_path: PathBuf::from("plugins/quiet.toml"),
            source_mtime: SystemTime::UNIX_EPOCH,
            kind: UnitKind::SingleFile,
        }
    }

    #[test]
    fn test_capabilities_probed_once() {
        let instance = PluginInstance::new(descriptor("quiet", 5), Arc::new(Quiet), PluginContext::new());
        assert!(instance.has(Capabilities::EVENTS));
        assert!(!instance.has(Capabilities::COMMANDS));
        assert_eq!(instance.descriptor().sort_key(), (5, "quiet"));
    }

    #[test]
    fn test_accepts_event_uses_probe() {
        let instance = PluginInstance::new(descriptor("quiet", 5), Arc::new(Quiet), PluginContext::new());
        assert!(instance.accepts_event("tick"));
        assert!(!instance.accepts_event("other"));
        // A panicking probe skips the instance instead of unwinding
        assert!(!instance.accepts_event("boom"));
    }

    #[test]
    fn test_instance_ids_are_unique() {
        let a = PluginInstance::new(descriptor("quiet", 5), Arc::new(Quiet), PluginContext::new());
        let b = PluginInstance::new(descriptor("quiet", 5), Arc::new(Quiet), PluginContext::new());
        assert_ne!(a.instance_id(), b.instance_id());
    }

    #[test]
    fn test_info_summary() {
        let info = PluginInstance::new(descriptor("quiet", 5), Arc::new(Quiet), PluginContext::new()).info();
        assert_eq!(info.commands, vec!["/quiet"]);
        assert_eq!(info.capabilities, vec!["events", "event_filter"]);
        assert_eq!(info.kind, UnitKind::SingleFile);
    }

    #[test]
    fn test_factories_lookup() {
        let factories = PluginFactories::new()
            .with("quiet", |_ctx: &PluginContext, _cfg: &PluginConfig| Ok(Arc::new(Quiet) as Arc<dyn Plugin>));
        assert!(factories.contains("quiet"));
        assert!(factories.get("loud").is_none());
        assert_eq!(factories.names(), vec!["quiet"]);
    }

    #[tokio::test]
    async fn test_guarded_absorbs_errors_and_panics() {
        let ok = guarded("p", "on_event", async { Ok::<_, PluginError>(7) }).await;
        assert_eq!(ok, Some(7));

        let err = guarded("p", "on_event", async { Err::<u32, _>(PluginError::failed("nope")) }).await;
        assert_eq!(err, None);

        let panicked = guarded("p", "on_event", async {
            if true {
                panic!("kaboom");
            }
            Ok::<u32, PluginError>(1)
        })
        .await;
        assert_eq!(panicked, None);
    }
}
