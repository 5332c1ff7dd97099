//! Wasm plugin units using wasmtime
//!
//! Loads a Wasm module, reads its unit manifest, and exposes each declared
//! plugin as a [`Plugin`] that forwards hook calls into the guest. All
//! plugins of one module share a single module instance.

use crate::manager::PluginManager;
use crate::plugin::{Plugin, PluginError, PluginResult};
use async_trait::async_trait;
use plugrig_api::{Capabilities, GuestRequest, GuestResponse, PluginSpec, UnitManifest, API_VERSION};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use wasmtime::*;

/// Default fuel granted to each guest call
pub const DEFAULT_FUEL: u64 = 10_000_000;

/// Errors that can occur while loading or calling a Wasm unit
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Engine creation failed: {0}")]
    EngineCreation(#[source] anyhow::Error),

    #[error("Module compilation failed: {0}")]
    ModuleCompilation(#[source] anyhow::Error),

    #[error("Instantiation failed: {0}")]
    Instantiation(#[source] anyhow::Error),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Function call failed: {function} - {source}")]
    FunctionCall {
        function: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("API version mismatch: expected {expected}, got {actual}")]
    ApiVersionMismatch { expected: u32, actual: u32 },

    #[error("Deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    #[error("Memory access error: {0}")]
    MemoryAccess(String),

    #[error("Fuel exhausted (CPU limit exceeded)")]
    FuelExhausted,
}

/// Wasm loader with a shared wasmtime engine
pub struct WasmLoader {
    engine: Engine,
    fuel: u64,
}

/// A loaded Wasm unit: its manifest and the live module
pub struct WasmUnit {
    pub manifest: UnitManifest,
    pub module: WasmModule,
}

/// A module instance that answers [`GuestRequest`]s
pub struct WasmModule {
    store: Store<()>,
    memory: Memory,
    alloc_fn: TypedFunc<i32, i32>,
    dealloc_fn: TypedFunc<(i32, i32), ()>,
    call_fn: TypedFunc<(i32, i32), i64>,
    fuel: u64,
}

/// Unpack ptr and len from a packed i64
#[inline]
fn unpack_ptr_len(packed: i64) -> (i32, i32) {
    let ptr = (packed >> 32) as i32;
    let len = (packed & 0xFFFFFFFF) as i32;
    (ptr, len)
}

fn call_error(function: &'static str, e: anyhow::Error) -> LoaderError {
    if matches!(e.downcast_ref::<Trap>(), Some(Trap::OutOfFuel)) {
        LoaderError::FuelExhausted
    } else {
        LoaderError::FunctionCall {
            function,
            source: e,
        }
    }
}

impl WasmLoader {
    /// Create a loader granting `fuel` units per guest call
    pub fn new(fuel: u64) -> Result<Self, LoaderError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.wasm_memory64(false);

        let engine = Engine::new(&config).map_err(LoaderError::EngineCreation)?;

        Ok(Self { engine, fuel })
    }

    /// Load a unit from Wasm bytes (or WAT text)
    pub fn load(&self, wasm_bytes: &[u8]) -> Result<WasmUnit, LoaderError> {
        let module =
            Module::new(&self.engine, wasm_bytes).map_err(LoaderError::ModuleCompilation)?;

        let mut store = Store::new(&self.engine, ());
        store
            .set_fuel(self.fuel)
            .map_err(LoaderError::EngineCreation)?;

        // No host imports: guests are pure functions of their requests
        let linker = Linker::new(&self.engine);

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(LoaderError::Instantiation)?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| LoaderError::FunctionNotFound("memory".to_string()))?;

        let alloc_fn = instance
            .get_typed_func::<i32, i32>(&mut store, "plugin_alloc")
            .map_err(|_| LoaderError::FunctionNotFound("plugin_alloc".to_string()))?;

        let dealloc_fn = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, "plugin_dealloc")
            .map_err(|_| LoaderError::FunctionNotFound("plugin_dealloc".to_string()))?;

        let call_fn = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, "plugin_call")
            .map_err(|_| LoaderError::FunctionNotFound("plugin_call".to_string()))?;

        let manifest_fn = instance
            .get_typed_func::<(), i64>(&mut store, "plugin_manifest")
            .map_err(|_| LoaderError::FunctionNotFound("plugin_manifest".to_string()))?;

        let packed = manifest_fn
            .call(&mut store, ())
            .map_err(|e| call_error("plugin_manifest", e))?;
        let (ptr, len) = unpack_ptr_len(packed);

        let manifest_bytes = read_memory(&store, &memory, ptr, len)?;
        let manifest: UnitManifest =
            plugrig_api::decode(&manifest_bytes).map_err(LoaderError::Deserialization)?;

        if manifest.api_version != API_VERSION {
            return Err(LoaderError::ApiVersionMismatch {
                expected: API_VERSION,
                actual: manifest.api_version,
            });
        }

        dealloc_fn
            .call(&mut store, (ptr, len))
            .map_err(|e| call_error("plugin_dealloc", e))?;

        Ok(WasmUnit {
            manifest,
            module: WasmModule {
                store,
                memory,
                alloc_fn,
                dealloc_fn,
                call_fn,
                fuel: self.fuel,
            },
        })
    }
}

fn read_memory(store: &Store<()>, memory: &Memory, ptr: i32, len: i32) -> Result<Vec<u8>, LoaderError> {
    let data = memory.data(store);
    let (start, len) = (ptr as u32 as usize, len as u32 as usize);
    match start.checked_add(len) {
        Some(end) if end <= data.len() => Ok(data[start..end].to_vec()),
        _ => Err(LoaderError::MemoryAccess(format!(
            "Out of bounds: ptr={}, len={}, memory_size={}",
            start,
            len,
            data.len()
        ))),
    }
}

impl WasmModule {
    /// Send one request to the guest and decode its response
    pub fn call(&mut self, request: &GuestRequest) -> Result<GuestResponse, LoaderError> {
        let request_bytes = plugrig_api::encode(request).map_err(LoaderError::Serialization)?;

        let request_len = request_bytes.len() as i32;
        let request_ptr = self
            .alloc_fn
            .call(&mut self.store, request_len)
            .map_err(|e| call_error("plugin_alloc", e))?;

        self.memory
            .write(&mut self.store, request_ptr as u32 as usize, &request_bytes)
            .map_err(|e| LoaderError::MemoryAccess(format!("Failed to write request: {}", e)))?;

        // Each call gets a fresh fuel budget
        self.store
            .set_fuel(self.fuel)
            .map_err(LoaderError::EngineCreation)?;

        let packed = self
            .call_fn
            .call(&mut self.store, (request_ptr, request_len))
            .map_err(|e| call_error("plugin_call", e))?;
        let (response_ptr, response_len) = unpack_ptr_len(packed);

        let response_bytes = read_memory(&self.store, &self.memory, response_ptr, response_len)?;
        let response: GuestResponse =
            plugrig_api::decode(&response_bytes).map_err(LoaderError::Deserialization)?;

        self.dealloc_fn
            .call(&mut self.store, (request_ptr, request_len))
            .ok();
        self.dealloc_fn
            .call(&mut self.store, (response_ptr, response_len))
            .ok();

        Ok(response)
    }
}

/// One plugin of a shared Wasm module
pub struct WasmPlugin {
    spec: PluginSpec,
    module: Arc<Mutex<WasmModule>>,
}

impl WasmPlugin {
    pub fn spec(&self) -> &PluginSpec {
        &self.spec
    }

    async fn request(&self, request: GuestRequest) -> PluginResult<GuestResponse> {
        let mut module = self.module.lock().await;
        match module.call(&request)? {
            GuestResponse::Error(message) => Err(PluginError::Guest(message)),
            response => Ok(response),
        }
    }
}

/// Split a loaded unit into one plugin per declared spec
pub fn unit_plugins(unit: WasmUnit) -> Vec<(PluginSpec, Arc<dyn Plugin>)> {
    let module = Arc::new(Mutex::new(unit.module));
    unit.manifest
        .plugins
        .into_iter()
        .map(|spec| {
            let plugin: Arc<dyn Plugin> = Arc::new(WasmPlugin {
                spec: spec.clone(),
                module: Arc::clone(&module),
            });
            (spec, plugin)
        })
        .collect()
}

fn unexpected(request: &'static str, response: GuestResponse) -> PluginError {
    PluginError::Protocol {
        request,
        response: format!("{:?}", response),
    }
}

#[async_trait]
impl Plugin for WasmPlugin {
    fn capabilities(&self) -> Capabilities {
        self.spec.capabilities
    }

    async fn on_load(&self, _manager: &PluginManager) -> PluginResult<()> {
        let plugin = self.spec.name.clone();
        match self.request(GuestRequest::OnLoad { plugin }).await? {
            GuestResponse::Done => Ok(()),
            other => Err(unexpected("on_load", other)),
        }
    }

    async fn on_unload(&self, _manager: &PluginManager) -> PluginResult<()> {
        let plugin = self.spec.name.clone();
        match self.request(GuestRequest::OnUnload { plugin }).await? {
            GuestResponse::Done => Ok(()),
            other => Err(unexpected("on_unload", other)),
        }
    }

    fn handles(&self, event: &str) -> bool {
        self.spec.events.iter().any(|e| e == event)
    }

    async fn on_event(
        &self,
        event: &str,
        payload: &Value,
        _manager: &PluginManager,
    ) -> PluginResult<Option<Value>> {
        let request = GuestRequest::OnEvent {
            plugin: self.spec.name.clone(),
            event: event.to_string(),
            payload: payload.clone(),
        };
        match self.request(request).await? {
            GuestResponse::Value(value) => Ok(value),
            other => Err(unexpected("on_event", other)),
        }
    }

    async fn filter_message(
        &self,
        text: &str,
        _manager: &PluginManager,
    ) -> PluginResult<Option<String>> {
        let request = GuestRequest::FilterMessage {
            plugin: self.spec.name.clone(),
            text: text.to_string(),
        };
        match self.request(request).await? {
            GuestResponse::Text(text) => Ok(text),
            other => Err(unexpected("filter_message", other)),
        }
    }

    async fn handle_command(
        &self,
        command: &str,
        args: &str,
        _manager: &PluginManager,
    ) -> PluginResult<Option<String>> {
        let request = GuestRequest::HandleCommand {
            plugin: self.spec.name.clone(),
            command: command.to_string(),
            args: args.to_string(),
        };
        match self.request(request).await? {
            GuestResponse::Text(text) => Ok(text),
            other => Err(unexpected("handle_command", other)),
        }
    }

    fn commands(&self) -> Vec<String> {
        self.spec.commands.clone()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::module_wat;
    use super::*;
    use plugrig_api::PluginSpec;

    #[test]
    fn test_loader_creation() {
        assert!(WasmLoader::new(DEFAULT_FUEL).is_ok());
    }

    #[test]
    fn test_pack_unpack() {
        let ptr = 0x12345678_i32;
        let len = 0x00000100_i32;
        let packed = ((ptr as i64) << 32) | (len as i64 & 0xFFFFFFFF);
        let (up, ul) = unpack_ptr_len(packed);
        assert_eq!(up, ptr);
        assert_eq!(ul, len);
    }

    #[test]
    fn test_load_reads_manifest_and_calls_guest() {
        let manifest = UnitManifest::new()
            .plugin(PluginSpec::new("ping").version("1.0.0").command("ping"))
            .plugin(PluginSpec::new("pong").priority(5));
        let wat = module_wat(&manifest, &GuestResponse::text("pong!"));

        let loader = WasmLoader::new(DEFAULT_FUEL).unwrap();
        let mut unit = loader.load(wat.as_bytes()).unwrap();

        let names: Vec<&str> = unit.manifest.plugins.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["ping", "pong"]);
        assert_eq!(unit.manifest.plugins[1].priority, Some(5));

        let response = unit
            .module
            .call(&GuestRequest::HandleCommand {
                plugin: "ping".into(),
                command: "ping".into(),
                args: String::new(),
            })
            .unwrap();
        assert_eq!(response, GuestResponse::text("pong!"));
    }

    #[test]
    fn test_api_version_mismatch() {
        let mut manifest = UnitManifest::new().plugin(PluginSpec::new("old"));
        manifest.api_version = API_VERSION + 1;
        let wat = module_wat(&manifest, &GuestResponse::Done);

        let loader = WasmLoader::new(DEFAULT_FUEL).unwrap();
        match loader.load(wat.as_bytes()) {
            Err(LoaderError::ApiVersionMismatch { actual, .. }) => assert_eq!(actual, API_VERSION + 1),
            Err(e) => panic!("Expected version mismatch, got {}", e),
            Ok(_) => panic!("Expected version mismatch"),
        }
    }

    #[test]
    fn test_garbage_bytes_fail_compilation() {
        let loader = WasmLoader::new(DEFAULT_FUEL).unwrap();
        assert!(matches!(
            loader.load(b"definitely not wasm"),
            Err(LoaderError::ModuleCompilation(_))
        ));
    }

    #[test]
    fn test_missing_exports() {
        let loader = WasmLoader::new(DEFAULT_FUEL).unwrap();
        let wat = r#"(module (memory (export "memory") 1))"#;
        assert!(matches!(
            loader.load(wat.as_bytes()),
            Err(LoaderError::FunctionNotFound(name)) if name == "plugin_alloc"
        ));
    }

    #[test]
    fn test_runaway_guest_exhausts_fuel() {
        let manifest = plugrig_api::encode(&UnitManifest::new()).unwrap();
        let packed = (1024_i64 << 32) | manifest.len() as i64;
        let data: String = manifest.iter().map(|b| format!("\\{:02x}", b)).collect();
        let wat = format!(
            r#"(module
  (memory (export "memory") 1)
  (data (i32.const 1024) "{data}")
  (func (export "plugin_alloc") (param i32) (result i32) (i32.const 16384))
  (func (export "plugin_dealloc") (param i32 i32))
  (func (export "plugin_manifest") (result i64) (i64.const {packed}))
  (func (export "plugin_call") (param i32 i32) (result i64) (loop $spin (br $spin)) (i64.const 0))
)"#
        );

        let loader = WasmLoader::new(10_000).unwrap();
        let mut unit = loader.load(wat.as_bytes()).unwrap();
        let result = unit.module.call(&GuestRequest::OnLoad {
            plugin: "spin".into(),
        });
        assert!(matches!(result, Err(LoaderError::FuelExhausted)));
    }

    #[tokio::test]
    async fn test_unit_plugins_share_module() {
        let manifest = UnitManifest::new()
            .plugin(PluginSpec::new("a").event("tick"))
            .plugin(PluginSpec::new("b").capabilities(Capabilities::FILTER));
        let wat = module_wat(&manifest, &GuestResponse::error("guest says no"));

        let loader = WasmLoader::new(DEFAULT_FUEL).unwrap();
        let plugins = unit_plugins(loader.load(wat.as_bytes()).unwrap());

        assert_eq!(plugins.len(), 2);
        let (spec_a, plugin_a) = &plugins[0];
        assert_eq!(spec_a.name, "a");
        assert!(plugin_a.handles("tick"));
        assert!(!plugin_a.handles("tock"));
        assert_eq!(plugins[1].1.capabilities(), Capabilities::FILTER);
    }
}
