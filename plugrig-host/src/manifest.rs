//! Native unit manifests
//!
//! A native unit is a TOML file listing the plugins it contributes:
//!
//! ```toml
//! [[plugin]]
//! name = "profanity_filter"
//! factory = "profanity"     # defaults to `name`
//! version = "1.0.0"
//! priority = 10
//! description = "Censors bad words"
//!
//! [plugin.config]
//! words = ["darn", "heck"]
//! ```
//!
//! A package's `plugin.toml` may additionally point at a Wasm entry module
//! with a top-level `wasm = "module.wasm"`.

use crate::plugin::{PluginConfig, DEFAULT_PRIORITY};
use serde::Deserialize;
use std::path::PathBuf;

/// Parsed native unit manifest
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NativeManifest {
    /// Wasm module to load alongside the native entries, relative to the unit
    #[serde(default)]
    pub wasm: Option<PathBuf>,

    /// Plugin entries, in declaration order
    #[serde(default, rename = "plugin")]
    pub plugins: Vec<ManifestEntry>,
}

/// One `[[plugin]]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestEntry {
    pub name: String,

    #[serde(default)]
    pub factory: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default)]
    pub description: String,

    /// Disabled entries are parsed but never constructed
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub config: PluginConfig,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_enabled() -> bool {
    true
}

/// Why a manifest was rejected
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("plugin entry #{0} has an empty name")]
    EmptyName(usize),

    #[error("manifest declares no plugins and no wasm module")]
    Empty,
}

impl ManifestEntry {
    /// Factory key for this entry
    pub fn factory_name(&self) -> &str {
        self.factory.as_deref().unwrap_or(&self.name)
    }
}

impl NativeManifest {
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let manifest: NativeManifest = toml::from_str(text)?;

        for (idx, entry) in manifest.plugins.iter().enumerate() {
            if entry.name.trim().is_empty() {
                return Err(ManifestError::EmptyName(idx));
            }
        }
        if manifest.plugins.is_empty() && manifest.wasm.is_none() {
            return Err(ManifestError::Empty);
        }

        Ok(manifest)
    }

    /// Enabled entries, in declaration order
    pub fn enabled(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.plugins.iter().filter(|entry| entry.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_entry() {
        let manifest = NativeManifest::parse(
            r#"
            [[plugin]]
            name = "profanity_filter"
            factory = "profanity"
            version = "1.0.0"
            priority = 10
            description = "Censors bad words"

            [plugin.config]
            words = ["darn"]

            [[plugin]]
            name = "echo"
            "#,
        )
        .unwrap();

        assert_eq!(manifest.plugins.len(), 2);
        let filter = &manifest.plugins[0];
        assert_eq!(filter.factory_name(), "profanity");
        assert_eq!(filter.priority, 10);
        assert_eq!(filter.config["words"].as_array().unwrap().len(), 1);

        let echo = &manifest.plugins[1];
        assert_eq!(echo.factory_name(), "echo");
        assert_eq!(echo.version, "0.0.0");
        assert_eq!(echo.priority, DEFAULT_PRIORITY);
        assert!(echo.enabled);
    }

    #[test]
    fn test_disabled_entries_are_skipped() {
        let manifest = NativeManifest::parse(
            r#"
            [[plugin]]
            name = "a"
            enabled = false

            [[plugin]]
            name = "b"
            "#,
        )
        .unwrap();

        let names: Vec<&str> = manifest.enabled().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn test_rejects_bad_manifests() {
        assert!(matches!(
            NativeManifest::parse("[[plugin]]\nname = \"\""),
            Err(ManifestError::EmptyName(0))
        ));
        assert!(matches!(NativeManifest::parse(""), Err(ManifestError::Empty)));
        assert!(matches!(
            NativeManifest::parse("[[plugin]]\nname = \"x\"\nbogus = 1"),
            Err(ManifestError::Toml(_))
        ));
    }

    #[test]
    fn test_wasm_only_package_manifest() {
        let manifest = NativeManifest::parse("wasm = \"filters.wasm\"").unwrap();
        assert_eq!(manifest.wasm, Some(PathBuf::from("filters.wasm")));
        assert!(manifest.plugins.is_empty());
    }
}
