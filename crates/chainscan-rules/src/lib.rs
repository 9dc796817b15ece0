//! Rule-based scanner
//!
//! The deterministic first layer of the hybrid engine. Runs before any
//! network call and without waiting for one: install-script pattern
//! matching, known-malicious lookup, typosquat detection, and a few
//! metadata heuristics. Scanning the same manifest twice yields the same
//! multiset of findings.

pub mod heuristics;
pub mod install_scripts;
pub mod malicious;
pub mod typosquat;

pub use malicious::MaliciousDb;

use chainscan_core::{Ecosystem, Finding, PackageRef};
use chainscan_ecosystems::{HandlerRegistry, ParsedManifest};
use install_scripts::ScriptMatcher;
use std::collections::HashSet;
use tracing::debug;

pub const SOURCE: &str = "rule_scanner";

pub struct RuleScanner {
    handlers: HandlerRegistry,
    matcher: ScriptMatcher,
    malicious: MaliciousDb,
}

impl RuleScanner {
    pub fn new(malicious: MaliciousDb) -> Self {
        let handlers = HandlerRegistry::new();
        let matcher = ScriptMatcher::compile(&handlers);
        Self {
            handlers,
            matcher,
            malicious,
        }
    }

    /// Scan the root manifest plus the resolved package set.
    ///
    /// `transitive` may be empty when the graph has not been built yet; the
    /// manifest's declared dependencies are always covered.
    pub fn scan(
        &self,
        ecosystem: Ecosystem,
        manifest: &ParsedManifest,
        transitive: &[PackageRef],
    ) -> Vec<Finding> {
        let handler = self.handlers.get(ecosystem);
        let mut findings = Vec::new();

        let root_ref = manifest
            .root_package
            .as_ref()
            .map(|(name, version)| PackageRef::new(name.clone(), version.clone(), ecosystem))
            .unwrap_or_else(|| PackageRef::new("(root manifest)", "-", ecosystem));
        for script in &manifest.scripts {
            findings.extend(self.matcher.scan_script(handler, &root_ref, script));
        }

        // one package-level pass per distinct name
        let mut seen: HashSet<String> = HashSet::new();
        let declared = manifest.dependencies.iter().map(|d| {
            PackageRef::new(d.name.clone(), d.spec.clone(), ecosystem)
        });
        for package in declared.chain(transitive.iter().cloned()) {
            let key = package.normalized().name;
            if !seen.insert(key) {
                continue;
            }
            if let Some(finding) = self.malicious.check(&package) {
                findings.push(finding);
            }
            if let Some(finding) = typosquat::check(&package, handler.popular_packages()) {
                findings.push(finding);
            }
            findings.extend(heuristics::check(&package));
        }

        debug!(count = findings.len(), "rule scan complete");
        findings
    }
}
