//! Plugin unit discovery
//!
//! Enumerates the units under each plugin root. A unit is either a single
//! file directly under the root (`*.toml` native manifest or `*.wasm`
//! module) or a package directory holding a `plugin.toml` entry manifest.
//! Both forms may coexist in one root.

use crate::plugin::UnitKind;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// Entry manifest that marks a directory as a package unit
pub const PACKAGE_ENTRY: &str = "plugin.toml";

/// Errors that can occur during unit discovery
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Plugin root not found: {0}")]
    RootNotFound(PathBuf),

    #[error("Failed to read plugin root {path}: {source}")]
    ReadRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to stat {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DiscoveryError {
    /// The root or entry the error is about
    pub fn path(&self) -> &Path {
        match self {
            Self::RootNotFound(path) => path,
            Self::ReadRoot { path, .. } | Self::Metadata { path, .. } => path,
        }
    }
}

/// How the entry of a unit is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitFormat {
    /// TOML manifest naming compiled-in factories (and optionally a wasm entry)
    Native,
    /// Wasm module exporting a unit manifest
    Wasm,
}

/// A unit found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredUnit {
    /// The file, or the package directory
    pub path: PathBuf,
    pub kind: UnitKind,
    pub format: UnitFormat,
    /// File mtime, or the newest mtime inside a package
    pub mtime: SystemTime,
}

impl DiscoveredUnit {
    /// The file the loader reads first
    pub fn entry_path(&self) -> PathBuf {
        match self.kind {
            UnitKind::SingleFile => self.path.clone(),
            UnitKind::Package => self.path.join(PACKAGE_ENTRY),
        }
    }
}

/// Result of scanning one or more roots
#[derive(Debug, Default)]
pub struct DiscoveryResult {
    /// Units in root order, then file-name order
    pub units: Vec<DiscoveredUnit>,

    /// Roots or entries that could not be inspected
    pub failures: Vec<DiscoveryError>,
}

impl DiscoveryResult {
    /// Returns true if every root and entry could be inspected
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Classify a root child as a unit, if it is one
pub fn classify(path: &Path) -> Option<(UnitKind, UnitFormat)> {
    let file_name = path.file_name()?.to_str()?;
    if file_name.starts_with('.') {
        return None;
    }

    if path.is_dir() {
        return path
            .join(PACKAGE_ENTRY)
            .is_file()
            .then_some((UnitKind::Package, UnitFormat::Native));
    }

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => Some((UnitKind::SingleFile, UnitFormat::Native)),
        Some("wasm") => Some((UnitKind::SingleFile, UnitFormat::Wasm)),
        _ => None,
    }
}

/// Modification time of a unit; a package reports its newest file
pub fn unit_mtime(path: &Path, kind: UnitKind) -> io::Result<SystemTime> {
    match kind {
        UnitKind::SingleFile => fs::metadata(path)?.modified(),
        UnitKind::Package => newest_mtime(path),
    }
}

fn newest_mtime(dir: &Path) -> io::Result<SystemTime> {
    let mut newest = fs::metadata(dir)?.modified()?;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let modified = if entry.file_type()?.is_dir() {
            newest_mtime(&path)?
        } else {
            entry.metadata()?.modified()?
        };
        newest = newest.max(modified);
    }
    Ok(newest)
}

/// Inspect one path as a unit. `Ok(None)` when it is missing or not a unit.
pub fn inspect_unit(path: &Path) -> Result<Option<DiscoveredUnit>, DiscoveryError> {
    if !path.exists() {
        return Ok(None);
    }
    let Some((kind, format)) = classify(path) else {
        return Ok(None);
    };
    let mtime = unit_mtime(path, kind).map_err(|source| DiscoveryError::Metadata {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(DiscoveredUnit {
        path: path.to_path_buf(),
        kind,
        format,
        mtime,
    }))
}

/// Scan one root
pub fn scan_root(root: &Path) -> Result<DiscoveryResult, DiscoveryError> {
    if !root.is_dir() {
        return Err(DiscoveryError::RootNotFound(root.to_path_buf()));
    }

    let entries = fs::read_dir(root).map_err(|source| DiscoveryError::ReadRoot {
        path: root.to_path_buf(),
        source,
    })?;

    let mut result = DiscoveryResult::default();
    let mut paths = Vec::new();
    for entry in entries {
        match entry {
            Ok(entry) => paths.push(entry.path()),
            Err(source) => result.failures.push(DiscoveryError::ReadRoot {
                path: root.to_path_buf(),
                source,
            }),
        }
    }
    // Deterministic order: lexical by file name
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    for path in paths {
        match inspect_unit(&path) {
            Ok(Some(unit)) => result.units.push(unit),
            Ok(None) => {}
            Err(e) => result.failures.push(e),
        }
    }

    Ok(result)
}

/// Scan multiple roots in order
pub fn scan_roots(roots: impl IntoIterator<Item = impl AsRef<Path>>) -> DiscoveryResult {
    let mut all = DiscoveryResult::default();

    for root in roots {
        match scan_root(root.as_ref()) {
            Ok(result) => {
                all.units.extend(result.units);
                all.failures.extend(result.failures);
            }
            Err(e) => all.failures.push(e),
        }
    }

    all
}

/// Default plugin roots for the current platform
pub fn default_plugin_roots(app_name: &str) -> Vec<PathBuf> {
    let mut roots = Vec::new();

    // User-local plugins
    if let Some(data_dir) = dirs::data_local_dir() {
        roots.push(data_dir.join(app_name).join("plugins"));
    }

    // Current directory plugins
    roots.push(PathBuf::from("plugins"));

    roots
}
