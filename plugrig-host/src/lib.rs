//! plugrig-host: plugin runtime with hot reload
//!
//! Loads plugin units from an ordered list of roots, keeps a
//! priority-ordered registry of live instances, reloads units that change
//! on disk, and routes events and messages through the plugin set.
//!
//! ```no_run
//! use plugrig_host::{ManagerConfig, PluginManager};
//!
//! # async fn run() -> Result<(), plugrig_host::ManagerError> {
//! let manager = PluginManager::builder(ManagerConfig::new(["plugins"]).hot_reload(true)).build()?;
//! manager.load_all(false).await?;
//! let replies = manager.handle_message("/hello world").await?;
//! # let _ = replies;
//! manager.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod discovery;
pub mod dispatch;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod plugin;
pub mod registry;
pub mod wasm;
pub mod watcher;

pub use config::{ConfigError, ManagerConfig};
pub use context::PluginContext;
pub use discovery::{default_plugin_roots, DiscoveredUnit, DiscoveryError, UnitFormat};
pub use loader::{UnitError, UnitLoad, UnitLoader};
pub use manager::{LoadFailure, LoadReport, ManagerError, PluginManager, PluginManagerBuilder};
pub use plugin::{
    Capabilities, Plugin, PluginConfig, PluginDescriptor, PluginError, PluginFactories,
    PluginFactory, PluginInfo, PluginInstance, PluginResult, UnitKind,
};
pub use registry::{PluginRegistry, RegistryError, Snapshot};
pub use wasm::{LoaderError, WasmLoader};
pub use watcher::{HotReloadWatcher, WatcherConfig, WatcherError};

pub use async_trait::async_trait;
pub use plugrig_api::{GuestRequest, GuestResponse, PluginSpec, UnitManifest, API_VERSION};
