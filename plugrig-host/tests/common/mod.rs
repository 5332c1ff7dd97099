//! Shared fixtures for the integration tests
//!
//! Plugins come from one configurable `recorder` factory; each instance writes
//! what happens to it into a journal stored in the plugin context.

#![allow(dead_code)]

use plugrig_host::{
    async_trait, Capabilities, ManagerConfig, Plugin, PluginConfig, PluginContext, PluginError,
    PluginFactories, PluginManager, PluginResult,
};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing_subscriber::EnvFilter;

#[derive(Default)]
pub struct Journal(Mutex<Vec<String>>);

impl Journal {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }
}

pub struct Recorder {
    tag: String,
    journal: Arc<Journal>,
    capabilities: Capabilities,
    upper: bool,
    append: Option<String>,
    replace: Option<(String, String)>,
    greet: Option<String>,
    echo: bool,
    events: Vec<String>,
    fail: bool,
    panic: bool,
    introspect: bool,
    slow_load: Option<Duration>,
}

fn string(config: &PluginConfig, key: &str) -> Option<String> {
    config.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn flag(config: &PluginConfig, key: &str) -> bool {
    config.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn strings(config: &PluginConfig, key: &str) -> Vec<String> {
    config
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

impl Recorder {
    fn from_config(context: &PluginContext, config: &PluginConfig) -> PluginResult<Self> {
        let journal = context
            .get::<Journal>("journal")
            .ok_or_else(|| PluginError::failed("no journal in context"))?;

        let replace = match strings(config, "replace").as_slice() {
            [] => None,
            [from, to] => Some((from.clone(), to.clone())),
            _ => return Err(PluginError::InvalidConfig("replace takes [from, to]".into())),
        };

        let mut recorder = Recorder {
            tag: string(config, "tag").unwrap_or_else(|| "anon".into()),
            journal,
            capabilities: Capabilities::LIFECYCLE,
            upper: flag(config, "upper"),
            append: string(config, "append"),
            replace,
            greet: string(config, "greet"),
            echo: flag(config, "echo"),
            events: strings(config, "events"),
            fail: flag(config, "fail"),
            panic: flag(config, "panic"),
            introspect: flag(config, "introspect"),
            slow_load: config
                .get("slow_load_ms")
                .and_then(|v| v.as_integer())
                .map(|ms| Duration::from_millis(ms.max(0) as u64)),
        };

        if recorder.upper || recorder.append.is_some() || recorder.replace.is_some() {
            recorder.capabilities |= Capabilities::FILTER;
        }
        if recorder.greet.is_some() || recorder.echo {
            recorder.capabilities |= Capabilities::COMMANDS;
        }
        if !recorder.events.is_empty() {
            recorder.capabilities |= Capabilities::EVENTS | Capabilities::EVENT_FILTER;
        }
        if flag(config, "all_events") {
            recorder.capabilities |= Capabilities::EVENTS;
        }
        Ok(recorder)
    }

    fn misbehave(&self) -> PluginResult<()> {
        if self.panic {
            panic!("recorder {} exploded", self.tag);
        }
        if self.fail {
            return Err(PluginError::failed(format!("recorder {} failed", self.tag)));
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for Recorder {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn on_load(&self, manager: &PluginManager) -> PluginResult<()> {
        self.journal.push(format!("load {}", self.tag));
        if self.introspect {
            let names = manager
                .list_plugins()
                .await
                .map_err(|e| PluginError::failed(e.to_string()))?;
            self.journal.push(format!("sees {}", names.join(",")));
        }
        if let Some(delay) = self.slow_load {
            tokio::time::sleep(delay).await;
            self.journal.push(format!("loaded {}", self.tag));
        }
        Ok(())
    }

    async fn on_unload(&self, _manager: &PluginManager) -> PluginResult<()> {
        self.journal.push(format!("unload {}", self.tag));
        Ok(())
    }

    fn handles(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event)
    }

    async fn on_event(
        &self,
        event: &str,
        payload: &Value,
        _manager: &PluginManager,
    ) -> PluginResult<Option<Value>> {
        self.journal.push(format!("event {} {}", self.tag, event));
        self.misbehave()?;
        Ok(Some(json!({ "tag": self.tag, "event": event, "payload": payload })))
    }

    async fn filter_message(&self, text: &str, _manager: &PluginManager) -> PluginResult<Option<String>> {
        let mut out = text.to_string();
        if self.upper {
            out = out.to_uppercase();
        }
        if let Some((from, to)) = &self.replace {
            out = out.replace(from.as_str(), to);
        }
        if let Some(suffix) = &self.append {
            out.push_str(suffix);
        }
        Ok(Some(out))
    }

    async fn handle_command(
        &self,
        command: &str,
        args: &str,
        _manager: &PluginManager,
    ) -> PluginResult<Option<String>> {
        self.misbehave()?;
        if let Some(greet) = &self.greet {
            return Ok((command == greet).then(|| format!("Hello, {}!", args)));
        }
        if self.echo {
            return Ok(Some(format!("{}:{}:{}", self.tag, command, args)));
        }
        Ok(None)
    }

    fn commands(&self) -> Vec<String> {
        self.greet.iter().cloned().collect()
    }
}

pub fn factories() -> PluginFactories {
    PluginFactories::new()
        .with("recorder", |ctx: &PluginContext, cfg: &PluginConfig| -> PluginResult<Arc<dyn Plugin>> {
            Ok(Arc::new(Recorder::from_config(ctx, cfg)?))
        })
        .with("broken", |_ctx: &PluginContext, _cfg: &PluginConfig| -> PluginResult<Arc<dyn Plugin>> {
            Err(PluginError::failed("constructor raised"))
        })
}

/// Log to the test harness; `RUST_LOG=plugrig_host=debug` shows the runtime
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn manager_with(config: ManagerConfig) -> (PluginManager, Arc<Journal>) {
    init_tracing();
    let journal = Arc::new(Journal::default());
    let context = PluginContext::new();
    context.insert_arc("journal", Arc::clone(&journal));

    let manager = PluginManager::builder(config)
        .context(context)
        .factories(factories())
        .build()
        .expect("Failed to build manager");
    (manager, journal)
}

pub fn manager(roots: &[&Path]) -> (PluginManager, Arc<Journal>) {
    manager_with(ManagerConfig::new(roots.iter().copied()))
}

/// One `[[plugin]]` table using the recorder factory
pub fn recorder(name: &str, priority: i32, config: &str) -> String {
    format!(
        "[[plugin]]\nname = \"{name}\"\nfactory = \"recorder\"\npriority = {priority}\n[plugin.config]\ntag = \"{name}\"\n{config}\n\n"
    )
}

/// Write a unit file in one step, so a reload never sees it half written
pub fn write_unit(dir: &Path, file: &str, contents: &str) -> PathBuf {
    let path = dir.join(file);
    let partial = dir.join(format!(".{}.partial", file));
    fs::write(&partial, contents).expect("Failed to write unit");
    fs::rename(&partial, &path).expect("Failed to move unit into place");
    path
}

/// Move a file's mtime `secs` into the future so a rewrite is always seen
pub fn touch(path: &Path, secs: u64) {
    let when = SystemTime::now() + Duration::from_secs(secs);
    fs::File::options()
        .write(true)
        .open(path)
        .expect("Failed to open unit")
        .set_modified(when)
        .expect("Failed to set mtime");
}

pub async fn instance_id(manager: &PluginManager, name: &str) -> u64 {
    manager
        .get(name)
        .await
        .expect("registry lock")
        .unwrap_or_else(|| panic!("{} is not loaded", name))
        .instance_id()
}
