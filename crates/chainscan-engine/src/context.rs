//! Per-run shared state
//!
//! The orchestrator owns the `SharedContext`; stages receive it immutably
//! and return their contribution. Stage results are appended strictly in
//! stage order, and the high-risk set only ever grows.

use chainscan_advisories::OsvClient;
use chainscan_cache::AnalysisCache;
use chainscan_core::{
    CancellationToken, ChainscanConfig, Ecosystem, Finding, PackageRef, Severity, StageResult,
    WorkerPool,
};
use chainscan_ecosystems::ParsedManifest;
use chainscan_registry::RegistryClient;
use chainscan_resolver::DependencyArena;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

/// External clients shared by the stages for one run
pub struct Services {
    pub registry: RegistryClient,
    pub osv: OsvClient,
    pub llm: Option<crate::llm::LlmClient>,
    pub cache: Arc<AnalysisCache>,
    pub pool: WorkerPool,
    pub config: ChainscanConfig,
}

impl Services {
    pub fn new(config: ChainscanConfig, cache: Arc<AnalysisCache>) -> Self {
        // registry and OSV calls share one bounded pool for the whole run
        let pool = WorkerPool::new(config.worker_pool_size);
        let registry = RegistryClient::new(
            config.registry.clone(),
            cache.clone(),
            pool.clone(),
            config.cache.ttl.registry_metadata,
            config.cache.ttl.not_found,
        );
        let osv = OsvClient::new(
            config.osv.clone(),
            cache.clone(),
            pool.clone(),
            config.cache.ttl.osv,
        );
        let llm = crate::llm::LlmClient::from_config(&config.llm, cache.clone(), config.cache.ttl.llm);
        Self {
            registry,
            osv,
            llm,
            cache,
            pool,
            config,
        }
    }
}

pub struct SharedContext {
    pub target: PathBuf,
    pub ecosystem: Ecosystem,
    pub root_package: PackageRef,
    pub manifest: ParsedManifest,
    pub arena: DependencyArena,
    /// Findings from the rule layer; produced before any stage runs
    pub rule_findings: Vec<Finding>,
    /// stage name → result, append-only, written in stage order
    pub stage_results: BTreeMap<String, StageResult>,
    /// Packages flagged high-risk by any earlier layer; additive only
    pub high_risk: HashSet<PackageRef>,
    pub cancel: CancellationToken,
}

impl SharedContext {
    pub fn new(
        target: PathBuf,
        ecosystem: Ecosystem,
        root_package: PackageRef,
        manifest: ParsedManifest,
        arena: DependencyArena,
        rule_findings: Vec<Finding>,
        cancel: CancellationToken,
    ) -> Self {
        let mut ctx = Self {
            target,
            ecosystem,
            root_package,
            manifest,
            arena,
            rule_findings,
            stage_results: BTreeMap::new(),
            high_risk: HashSet::new(),
            cancel,
        };
        ctx.seed_high_risk_from_rules();
        ctx
    }

    /// Critical/high rule findings mark their packages before stage one
    fn seed_high_risk_from_rules(&mut self) {
        let flagged: Vec<PackageRef> = self
            .rule_findings
            .iter()
            .filter(|f| f.severity >= Severity::High)
            .map(|f| f.package.clone())
            .collect();
        self.high_risk.extend(flagged);
    }

    /// Distinct packages under analysis (root excluded)
    pub fn packages(&self) -> Vec<PackageRef> {
        let mut seen = HashSet::new();
        self.arena
            .packages()
            .into_iter()
            .filter(|p| seen.insert(p.cache_key()))
            .collect()
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stage_results.get(name)
    }

    pub fn mark_high_risk(&mut self, packages: impl IntoIterator<Item = PackageRef>) {
        self.high_risk.extend(packages);
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::context_with_packages;
    use super::*;
    use chainscan_core::DetectionMethod;

    #[test]
    fn test_packages_deduplicated() {
        let ctx = context_with_packages(&[("a", "1.0.0"), ("b", "2.0.0")]);
        assert_eq!(ctx.packages().len(), 2);
    }

    #[test]
    fn test_rule_findings_seed_high_risk() {
        let mut ctx = context_with_packages(&[("evil", "1.0.0")]);
        let finding = Finding {
            package: PackageRef::new("evil", "1.0.0", Ecosystem::Npm),
            finding_type: "malicious_package".to_string(),
            severity: Severity::Critical,
            confidence: 0.95,
            evidence: vec![],
            source: "rule_scanner".to_string(),
            recommendation: None,
            references: vec![],
            detection_method: DetectionMethod::RuleBased,
        };
        ctx.rule_findings.push(finding);
        ctx.seed_high_risk_from_rules();
        assert!(ctx
            .high_risk
            .contains(&PackageRef::new("evil", "1.0.0", Ecosystem::Npm)));
    }
}
