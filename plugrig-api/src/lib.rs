//! plugrig-api: Shared types for the plugrig plugin runtime
//!
//! This crate defines the protocol between the host and Wasm plugin units.
//! Communication uses MessagePack serialization.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// API version for compatibility checking
pub const API_VERSION: u32 = 1;

/// Default dispatch priority; lower values run earlier
pub const DEFAULT_PRIORITY: i32 = 100;

/// The optional capabilities a plugin implements.
///
/// Determined once when the plugin is constructed and consulted by the
/// dispatcher instead of probing the plugin on every call.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(u32);

impl Capabilities {
    /// `on_load` / `on_unload` hooks
    pub const LIFECYCLE: Self = Self(1);
    /// `on_event`
    pub const EVENTS: Self = Self(1 << 1);
    /// `handles(event)` probe, consulted before `on_event`
    pub const EVENT_FILTER: Self = Self(1 << 2);
    /// `filter_message`
    pub const FILTER: Self = Self(1 << 3);
    /// `handle_command`
    pub const COMMANDS: Self = Self(1 << 4);

    const ALL_BITS: u32 = 0b1_1111;

    const NAMES: [(Self, &'static str); 5] = [
        (Self::LIFECYCLE, "lifecycle"),
        (Self::EVENTS, "events"),
        (Self::EVENT_FILTER, "event_filter"),
        (Self::FILTER, "filter"),
        (Self::COMMANDS, "commands"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(Self::ALL_BITS)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, dropping unknown ones
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL_BITS)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Names of the set capabilities, in declaration order
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(cap, _)| self.contains(*cap))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capabilities({})", self.names().join(" | "))
    }
}

/// One plugin declared by a Wasm unit's `plugin_manifest()` export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSpec {
    /// Plugin name, unique across the whole loaded set
    pub name: String,

    /// Plugin version (semver)
    #[serde(default)]
    pub version: Option<String>,

    /// Short description for help text
    #[serde(default)]
    pub description: String,

    /// Dispatch priority (defaults to [`DEFAULT_PRIORITY`])
    #[serde(default)]
    pub priority: Option<i32>,

    /// Capabilities the guest implements
    #[serde(default)]
    pub capabilities: Capabilities,

    /// Command names, for introspection only
    #[serde(default)]
    pub commands: Vec<String>,

    /// Event names answered by `handles`; used when `EVENT_FILTER` is set
    #[serde(default)]
    pub events: Vec<String>,
}

impl PluginSpec {
    /// Create a new plugin spec with no capabilities
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            description: String::new(),
            priority: None,
            capabilities: Capabilities::empty(),
            commands: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Add version
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set priority
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Add capabilities
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities |= capabilities;
        self
    }

    /// Declare a command (implies `COMMANDS`)
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self.capabilities |= Capabilities::COMMANDS;
        self
    }

    /// Restrict events to the given name (implies `EVENTS | EVENT_FILTER`)
    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.events.push(event.into());
        self.capabilities |= Capabilities::EVENTS | Capabilities::EVENT_FILTER;
        self
    }
}

/// Unit manifest with API version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitManifest {
    /// API version for compatibility
    pub api_version: u32,

    /// Plugins defined by this unit, in declaration order
    pub plugins: Vec<PluginSpec>,
}

impl UnitManifest {
    pub fn new() -> Self {
        Self {
            api_version: API_VERSION,
            plugins: Vec::new(),
        }
    }

    /// Add a plugin
    pub fn plugin(mut self, spec: PluginSpec) -> Self {
        self.plugins.push(spec);
        self
    }
}

impl Default for UnitManifest {
    fn default() -> Self {
        Self::new()
    }
}

/// A call from the host into a guest plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GuestRequest {
    OnLoad {
        plugin: String,
    },
    OnUnload {
        plugin: String,
    },
    OnEvent {
        plugin: String,
        event: String,
        payload: serde_json::Value,
    },
    FilterMessage {
        plugin: String,
        text: String,
    },
    HandleCommand {
        plugin: String,
        command: String,
        args: String,
    },
}

impl GuestRequest {
    /// Name of the plugin this request targets
    pub fn plugin(&self) -> &str {
        match self {
            Self::OnLoad { plugin }
            | Self::OnUnload { plugin }
            | Self::OnEvent { plugin, .. }
            | Self::FilterMessage { plugin, .. }
            | Self::HandleCommand { plugin, .. } => plugin,
        }
    }
}

/// A guest's answer to a [`GuestRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GuestResponse {
    /// Lifecycle hook completed
    Done,

    /// Event result; `None` means "no opinion"
    Value(Option<serde_json::Value>),

    /// Filter or command result; `None` means "unchanged" / "not handled"
    Text(Option<String>),

    /// The guest failed to handle the request
    Error(String),
}

impl GuestResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(Some(text.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }
}

/// Encode a protocol value as MessagePack with field names
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(value)
}

/// Decode a protocol value from MessagePack
pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_ops() {
        let caps = Capabilities::FILTER | Capabilities::COMMANDS;
        assert!(caps.contains(Capabilities::FILTER));
        assert!(!caps.contains(Capabilities::EVENTS));
        assert!(!caps.contains(Capabilities::FILTER | Capabilities::EVENTS));
        assert_eq!(caps.names(), vec!["filter", "commands"]);
        assert_eq!(Capabilities::from_bits_truncate(0xFFFF_FFFF), Capabilities::all());
        assert!(Capabilities::empty().is_empty());
    }

    #[test]
    fn test_spec_builder_sets_implied_capabilities() {
        let spec = PluginSpec::new("echo").command("echo").event("tick");
        assert!(spec.capabilities.contains(Capabilities::COMMANDS));
        assert!(spec
            .capabilities
            .contains(Capabilities::EVENTS | Capabilities::EVENT_FILTER));
        assert_eq!(spec.commands, vec!["echo"]);
    }

    #[test]
    fn test_manifest_serialization() {
        let manifest = UnitManifest::new()
            .plugin(PluginSpec::new("upper").priority(10).capabilities(Capabilities::FILTER))
            .plugin(PluginSpec::new("echo").version("1.0.0").command("echo"));

        let bytes = encode(&manifest).unwrap();
        let decoded: UnitManifest = decode(&bytes).unwrap();

        assert_eq!(decoded.api_version, API_VERSION);
        assert_eq!(decoded.plugins.len(), 2);
        assert_eq!(decoded.plugins[0].priority, Some(10));
        assert_eq!(decoded.plugins[1].version.as_deref(), Some("1.0.0"));
        assert_eq!(decoded.plugins[1].capabilities, Capabilities::COMMANDS);
    }

    #[test]
    fn test_event_request_carries_json_payload() {
        let request = GuestRequest::OnEvent {
            plugin: "web".into(),
            event: "web_request_echo".into(),
            payload: serde_json::json!({"method": "POST", "data": {"n": 3}}),
        };
        let decoded: GuestRequest = decode(&encode(&request).unwrap()).unwrap();

        assert_eq!(decoded.plugin(), "web");
        match decoded {
            GuestRequest::OnEvent { payload, .. } => {
                assert_eq!(payload["data"]["n"], 3);
            }
            other => panic!("Expected OnEvent, got {:?}", other),
        }
    }
}
