//! Unit loader
//!
//! Turns one discovered unit into live plugin instances. Native entries are
//! built by compiled-in factories; Wasm entries come from the module's own
//! manifest. A failing plugin is reported on its own and never stops the
//! rest of the unit from loading.

use crate::context::PluginContext;
use crate::discovery::{DiscoveredUnit, UnitFormat};
use crate::manifest::{ManifestEntry, ManifestError, NativeManifest};
use crate::plugin::{
    panic_message, Plugin, PluginDescriptor, PluginError, PluginFactories, PluginInstance,
    DEFAULT_PRIORITY,
};
use crate::wasm::{self, LoaderError, WasmLoader};
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// A whole unit failed to load
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: ManifestError,
    },

    #[error("Failed to load Wasm module {path}: {source}")]
    Wasm {
        path: PathBuf,
        #[source]
        source: LoaderError,
    },
}

/// One plugin of a unit that could not be constructed
#[derive(Debug)]
pub struct PluginFailure {
    pub unit: PathBuf,
    pub plugin: String,
    pub error: PluginError,
}

impl fmt::Display for PluginFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.plugin, self.unit.display(), self.error)
    }
}

/// Everything one unit produced
#[derive(Debug)]
pub struct UnitLoad {
    pub unit: DiscoveredUnit,
    /// Instances in declaration order, names unique within the unit
    pub instances: Vec<PluginInstance>,
    pub failures: Vec<PluginFailure>,
}

impl UnitLoad {
    /// Names whose construction failed in this load
    pub fn failed_names(&self) -> HashSet<&str> {
        self.failures.iter().map(|f| f.plugin.as_str()).collect()
    }
}

/// Builds plugin instances from units, injecting the shared context
pub struct UnitLoader {
    factories: PluginFactories,
    context: PluginContext,
    wasm: WasmLoader,
}

impl UnitLoader {
    pub fn new(factories: PluginFactories, context: PluginContext, fuel: u64) -> Result<Self, LoaderError> {
        Ok(Self {
            factories,
            context,
            wasm: WasmLoader::new(fuel)?,
        })
    }

    pub fn context(&self) -> &PluginContext {
        &self.context
    }

    pub fn factories(&self) -> &PluginFactories {
        &self.factories
    }

    /// Load every plugin a unit declares
    pub fn load_unit(&self, unit: &DiscoveredUnit) -> Result<UnitLoad, UnitError> {
        let mut load = UnitLoad {
            unit: unit.clone(),
            instances: Vec::new(),
            failures: Vec::new(),
        };

        match unit.format {
            UnitFormat::Wasm => self.load_wasm(unit, &unit.entry_path(), &mut load)?,
            UnitFormat::Native => {
                let entry = unit.entry_path();
                let manifest = read_manifest(&entry)?;

                // A package's wasm module is declared first in the unit
                if let Some(module) = &manifest.wasm {
                    let module_path = unit.path.join(module);
                    self.load_wasm(unit, &module_path, &mut load)?;
                }
                for entry in manifest.enabled() {
                    match self.construct(entry) {
                        Ok(plugin) => load.instances.push(PluginInstance::new(
                            descriptor(unit, &entry.name, &entry.version, &entry.description, entry.priority),
                            plugin,
                            self.context.clone(),
                        )),
                        Err(error) => load.failures.push(PluginFailure {
                            unit: unit.path.clone(),
                            plugin: entry.name.clone(),
                            error,
                        }),
                    }
                }
            }
        }

        drop_unit_duplicates(&mut load);
        for failure in &load.failures {
            tracing::warn!(
                plugin = %failure.plugin,
                path = %failure.unit.display(),
                error = %failure.error,
                "Plugin left out of unit load"
            );
        }

        Ok(load)
    }

    fn load_wasm(&self, unit: &DiscoveredUnit, path: &Path, load: &mut UnitLoad) -> Result<(), UnitError> {
        let bytes = std::fs::read(path).map_err(|source| UnitError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let module = self.wasm.load(&bytes).map_err(|source| UnitError::Wasm {
            path: path.to_path_buf(),
            source,
        })?;

        for (spec, plugin) in wasm::unit_plugins(module) {
            if spec.name.trim().is_empty() {
                load.failures.push(PluginFailure {
                    unit: unit.path.clone(),
                    plugin: spec.name,
                    error: PluginError::failed("Wasm plugin declared an empty name"),
                });
                continue;
            }
            let version = spec.version.as_deref().unwrap_or("0.0.0");
            let priority = spec.priority.unwrap_or(DEFAULT_PRIORITY);
            load.instances.push(PluginInstance::new(
                descriptor(unit, &spec.name, version, &spec.description, priority),
                plugin,
                self.context.clone(),
            ));
        }
        Ok(())
    }

    /// Run the factory for one entry, treating a panic as a failure
    fn construct(&self, entry: &ManifestEntry) -> Result<Arc<dyn Plugin>, PluginError> {
        let factory = self
            .factories
            .get(entry.factory_name())
            .ok_or_else(|| PluginError::UnknownFactory(entry.factory_name().to_string()))?;

        std::panic::catch_unwind(AssertUnwindSafe(|| factory(&self.context, &entry.config)))
            .unwrap_or_else(|panic| Err(PluginError::Panicked(panic_message(&*panic))))
    }
}

fn read_manifest(path: &Path) -> Result<NativeManifest, UnitError> {
    let text = std::fs::read_to_string(path).map_err(|source| UnitError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    NativeManifest::parse(&text).map_err(|source| UnitError::Manifest {
        path: path.to_path_buf(),
        source,
    })
}

fn descriptor(
    unit: &DiscoveredUnit,
    name: &str,
    version: &str,
    description: &str,
    priority: i32,
) -> PluginDescriptor {
    PluginDescriptor {
        name: name.to_string(),
        version: version.to_string(),
        description: description.to_string(),
        priority,
        source_path: unit.path.clone(),
        source_mtime: unit.mtime,
        kind: unit.kind,
    }
}

/// Within one unit the first declaration of a name wins; later ones are
/// reported as failures of that unit
fn drop_unit_duplicates(load: &mut UnitLoad) {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(load.instances.len());
    for instance in load.instances.drain(..) {
        if seen.insert(instance.name().to_string()) {
            kept.push(instance);
        } else {
            load.failures.push(PluginFailure {
                unit: load.unit.path.clone(),
                plugin: instance.name().to_string(),
                error: PluginError::DuplicateName(instance.name().to_string()),
            });
        }
    }
    load.instances = kept;
}

/// Result of [`merge_loads`]
#[derive(Debug, Default)]
pub struct MergedLoads {
    /// Instances to install, names unique across the whole set
    pub instances: Vec<PluginInstance>,
    /// Instances that lost their name to an earlier registration
    pub discarded: Vec<PluginInstance>,
}

/// Merge unit loads in discovery order; the first registration of a name
/// wins across the whole set
pub fn merge_loads(loads: Vec<UnitLoad>) -> MergedLoads {
    let mut seen = HashSet::new();
    let mut merged = MergedLoads::default();
    for load in loads {
        for instance in load.instances {
            if seen.insert(instance.name().to_string()) {
                merged.instances.push(instance);
            } else {
                tracing::warn!(
                    plugin = %instance.name(),
                    path = %instance.descriptor().source_path.display(),
                    "Duplicate plugin name, keeping the earlier registration"
                );
                merged.discarded.push(instance);
            }
        }
    }
    merged
}
