//! Ecosystem plug-ins
//!
//! A closed registry of handlers, one per supported package ecosystem.
//! Each handler knows how to detect and parse its manifests, which
//! install-script patterns matter for it, and how to build registry URLs.
//! Adding a third ecosystem is a pure plug-in change: implement
//! `EcosystemHandler` and register it in `HandlerRegistry::new`.

use chainscan_core::{Ecosystem, ScanError, Severity};
use std::path::{Path, PathBuf};

pub mod npm;
pub mod pypi;

pub use npm::NpmHandler;
pub use pypi::PyPiHandler;

/// A dependency as declared in a manifest, before resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredDependency {
    pub name: String,
    /// Raw version specifier exactly as written
    pub spec: String,
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    Runtime,
    Dev,
    Peer,
    Optional,
}

/// A script found in a manifest
#[derive(Debug, Clone)]
pub struct ManifestScript {
    /// Hook name, e.g. `preinstall` or `setup.py`
    pub hook: String,
    pub command: String,
    /// Whether the package manager runs this hook automatically on install
    pub lifecycle: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedManifest {
    /// (name, version) of the root package, when the format declares one
    pub root_package: Option<(String, String)>,
    pub dependencies: Vec<DeclaredDependency>,
    pub scripts: Vec<ManifestScript>,
}

/// One row of an install-script pattern table
#[derive(Debug, Clone, Copy)]
pub struct ScriptPattern {
    pub id: &'static str,
    pub pattern: &'static str,
    pub severity: Severity,
    pub attack_family: &'static str,
    /// Promoted one severity level when matched inside a lifecycle hook
    pub lifecycle_sensitive: bool,
}

/// Metadata and latest-version endpoints for a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEndpoints {
    pub metadata_url: String,
    pub latest_url: String,
}

/// Capability set every ecosystem plug-in provides
pub trait EcosystemHandler: Send + Sync {
    fn ecosystem(&self) -> Ecosystem;

    /// Manifest filenames this ecosystem recognises, in preference order
    fn manifest_names(&self) -> &'static [&'static str];

    /// First manifest present under `root`, if any
    fn detect(&self, root: &Path) -> Option<PathBuf> {
        self.manifest_names()
            .iter()
            .map(|name| root.join(name))
            .find(|p| p.exists())
    }

    fn parse_manifest(&self, path: &Path) -> Result<ParsedManifest, ScanError>;

    /// Install-script pattern table for the rule scanner
    fn script_patterns(&self) -> &'static [ScriptPattern];

    /// Hook names the package manager invokes automatically on install
    fn lifecycle_hooks(&self) -> &'static [&'static str];

    /// Popular package names used as typosquat anchors
    fn popular_packages(&self) -> &'static [&'static str];

    /// Registry URLs for `(name, version)`; `version = None` targets latest
    fn registry_endpoints(
        &self,
        name: &str,
        version: Option<&str>,
        base_url: &str,
    ) -> RegistryEndpoints;

    /// Extract a concrete pin from a raw specifier, if the specifier is exact
    fn exact_pin(&self, spec: &str) -> Option<String>;
}

/// Closed registry of ecosystem handlers
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn EcosystemHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: vec![Box::new(NpmHandler), Box::new(PyPiHandler)],
        }
    }

    pub fn get(&self, ecosystem: Ecosystem) -> &dyn EcosystemHandler {
        self.handlers
            .iter()
            .find(|h| h.ecosystem() == ecosystem)
            .map(|h| h.as_ref())
            .unwrap_or_else(|| unreachable!("registry covers the closed ecosystem set"))
    }

    /// Ecosystems whose manifests exist under `root`
    pub fn detect_all(&self, root: &Path) -> Vec<Ecosystem> {
        self.handlers
            .iter()
            .filter(|h| h.detect(root).is_some())
            .map(|h| h.ecosystem())
            .collect()
    }

    /// Pick the ecosystem for a run: honour an explicit choice, otherwise
    /// accept a single detected ecosystem, otherwise fail with guidance.
    pub fn select(
        &self,
        root: &Path,
        requested: Option<Ecosystem>,
    ) -> Result<Ecosystem, ScanError> {
        if let Some(eco) = requested {
            if self.get(eco).detect(root).is_none() {
                return Err(ScanError::InputValidation(format!(
                    "no {} manifest found in {}",
                    eco,
                    root.display()
                )));
            }
            return Ok(eco);
        }
        let detected = self.detect_all(root);
        match detected.as_slice() {
            [] => Err(ScanError::InputValidation(format!(
                "no supported manifest found in {}",
                root.display()
            ))),
            [single] => Ok(*single),
            many => Err(ScanError::InputValidation(format!(
                "multiple ecosystems detected ({}); pass --ecosystem to pick one",
                many.iter()
                    .map(|e| e.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
