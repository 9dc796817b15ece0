//! Report assembly
//!
//! Deterministic construction of the package-centric report from the shared
//! context. This is the path synthesis always has available: it never
//! touches the network, and the LLM variant must match this schema or be
//! discarded. Dedup rules: one vulnerability row per `id × package`, one
//! finding per `(package, type, evidence-hash)`; a package whose findings
//! all share one remediation gets it once at package level.

use crate::context::SharedContext;
use crate::stages::{CODE, REPUTATION, SUPPLY_CHAIN, SYNTHESIS, VULNERABILITY};
use chainscan_core::report::{
    AnalysisStatus, PackageEntry, Recommendation, RecommendationPriority, Report, ReportMetadata,
    ReportSummary, ReportVulnerability, StageDiagnostics,
};
use chainscan_core::{
    AttackLikelihood, Finding, PackageRef, RiskLevel, Severity, StageData, StageResult,
    StageStatus,
};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

/// Degradation ladder output
#[derive(Debug, Clone)]
pub struct Degradation {
    pub status: AnalysisStatus,
    pub confidence: f64,
    pub missing_analysis: Vec<String>,
    pub degradation_reason: Option<String>,
    pub retry_recommended: bool,
}

/// Build the full report from stage data. Call with every finished stage
/// result in the context; metadata reflects what is present.
pub fn assemble(ctx: &SharedContext, started_at: DateTime<Utc>) -> Report {
    let mut accum: BTreeMap<String, PackageAccum> = BTreeMap::new();

    // the graph defines the package universe
    for package in ctx.packages() {
        accum.entry(package.cache_key()).or_insert_with(|| PackageAccum::new(package));
    }
    // root-manifest findings may reference the root itself
    for finding in &ctx.rule_findings {
        accum
            .entry(finding.package.cache_key())
            .or_insert_with(|| PackageAccum::new(finding.package.clone()))
            .risk_factors
            .push(finding.clone());
    }

    if let Some(StageData::Vulnerability { packages }) =
        ctx.stage(VULNERABILITY).map(|r| &r.data)
    {
        for entry in packages {
            let slot = accum
                .entry(entry.package.cache_key())
                .or_insert_with(|| PackageAccum::new(entry.package.clone()));
            slot.vulnerabilities = entry.vulnerabilities.clone();
            slot.vuln_risk = Some(entry.combined_risk);
        }
    }
    if let Some(StageData::Reputation { assessments }) = ctx.stage(REPUTATION).map(|r| &r.data) {
        for assessment in assessments {
            accum
                .entry(assessment.package.cache_key())
                .or_insert_with(|| PackageAccum::new(assessment.package.clone()))
                .reputation = Some(assessment.clone());
        }
    }
    if let Some(StageData::Code { reports }) = ctx.stage(CODE).map(|r| &r.data) {
        for report in reports {
            let slot = accum
                .entry(report.package.cache_key())
                .or_insert_with(|| PackageAccum::new(report.package.clone()));
            slot.code_issues.extend(report.findings.iter().cloned());
        }
    }
    if let Some(StageData::SupplyChain { assessments }) =
        ctx.stage(SUPPLY_CHAIN).map(|r| &r.data)
    {
        for assessment in assessments {
            let slot = accum
                .entry(assessment.package.cache_key())
                .or_insert_with(|| PackageAccum::new(assessment.package.clone()));
            slot.supply_chain.extend(assessment.findings.iter().cloned());
            slot.attack_likelihood = Some(assessment.attack_likelihood);
        }
    }

    let vulnerabilities = collect_vulnerabilities(&accum);
    let packages: Vec<PackageEntry> = accum.values().map(PackageAccum::to_entry).collect();
    let summary = summarize(ctx, &vulnerabilities, &packages);
    let recommendations = select_recommendations(ctx, &summary, &packages);
    let analysis_details = diagnostics(&ctx.stage_results);
    let degradation = degrade(&ctx.stage_results);

    Report {
        metadata: ReportMetadata {
            analysis_id: analysis_id(&ctx.target.display().to_string(), started_at),
            target: ctx.target.display().to_string(),
            ecosystem: ctx.ecosystem,
            started_at,
            completed_at: Utc::now(),
            agents_executed: ctx.stage_results.len(),
            agents_successful: ctx
                .stage_results
                .values()
                .filter(|r| r.status == StageStatus::Success)
                .count(),
            analysis_status: degradation.status,
            confidence: degradation.confidence,
            missing_analysis: degradation.missing_analysis,
            degradation_reason: degradation.degradation_reason,
            retry_recommended: degradation.retry_recommended,
        },
        summary,
        vulnerabilities,
        packages,
        recommendations,
        analysis_details,
    }
}

/// Recompute metadata and diagnostics from the final stage results.
/// Applied after synthesis, including over an LLM-produced report, whose
/// metadata is never trusted upstream.
pub fn finalize(report: &mut Report, ctx: &SharedContext, started_at: DateTime<Utc>) {
    let degradation = degrade(&ctx.stage_results);
    report.metadata.analysis_id = analysis_id(&ctx.target.display().to_string(), started_at);
    report.metadata.target = ctx.target.display().to_string();
    report.metadata.ecosystem = ctx.ecosystem;
    report.metadata.started_at = started_at;
    report.metadata.completed_at = Utc::now();
    report.metadata.agents_executed = ctx.stage_results.len();
    report.metadata.agents_successful = ctx
        .stage_results
        .values()
        .filter(|r| r.status == StageStatus::Success)
        .count();
    report.metadata.analysis_status = degradation.status;
    report.metadata.confidence = degradation.confidence;
    report.metadata.missing_analysis = degradation.missing_analysis;
    report.metadata.degradation_reason = degradation.degradation_reason;
    report.metadata.retry_recommended = degradation.retry_recommended;
    report.analysis_details = diagnostics(&ctx.stage_results);
}

pub fn analysis_id(target: &str, started_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", started_at.format("%Y%m%d%H%M%S"), &digest[..8])
}

pub fn diagnostics(results: &BTreeMap<String, StageResult>) -> BTreeMap<String, StageDiagnostics> {
    results
        .iter()
        .map(|(name, r)| {
            (
                name.clone(),
                StageDiagnostics {
                    status: r.status,
                    duration_seconds: r.duration_seconds,
                    confidence: r.confidence,
                    error: r.error.clone(),
                },
            )
        })
        .collect()
}

/// The degradation ladder of the orchestrator contract.
/// Skipped conditional stages do not reduce the level.
pub fn degrade(results: &BTreeMap<String, StageResult>) -> Degradation {
    let required = crate::stages::REQUIRED_STAGES;
    let optional = [CODE, SUPPLY_CHAIN];

    let is_success = |name: &str| {
        results
            .get(name)
            .map(|r| r.status == StageStatus::Success)
            .unwrap_or(false)
    };
    let is_acceptable_optional = |name: &str| {
        results
            .get(name)
            .map(|r| matches!(r.status, StageStatus::Success | StageStatus::Skipped))
            // a stage that never got to run is not held against the report
            .unwrap_or(true)
    };

    let required_ok = required.iter().filter(|n| is_success(n)).count();
    let all_required = required_ok == required.len();
    let optional_ok = optional.iter().all(|n| is_acceptable_optional(n));

    let (status, confidence) = if all_required && optional_ok {
        (AnalysisStatus::Full, 0.95)
    } else if all_required {
        (AnalysisStatus::Partial, 0.75)
    } else if required_ok > 0 {
        (AnalysisStatus::Basic, 0.55)
    } else {
        (AnalysisStatus::Minimal, 0.35)
    };

    let missing_analysis: Vec<String> = [VULNERABILITY, REPUTATION, CODE, SUPPLY_CHAIN, SYNTHESIS]
        .iter()
        .filter(|name| {
            results
                .get(**name)
                .map(|r| {
                    !matches!(r.status, StageStatus::Success | StageStatus::Skipped)
                })
                .unwrap_or(false)
        })
        .map(|n| n.to_string())
        .collect();

    let retry_recommended = results.values().any(|r| r.is_network_failure());
    let degradation_reason = if missing_analysis.is_empty() {
        None
    } else {
        Some(format!("stages unavailable: {}", missing_analysis.join(", ")))
    };

    Degradation {
        status,
        confidence,
        missing_analysis,
        degradation_reason,
        retry_recommended,
    }
}

struct PackageAccum {
    package: PackageRef,
    vulnerabilities: Vec<chainscan_core::Vulnerability>,
    vuln_risk: Option<Severity>,
    reputation: Option<chainscan_core::ReputationAssessment>,
    risk_factors: Vec<Finding>,
    code_issues: Vec<Finding>,
    supply_chain: Vec<Finding>,
    attack_likelihood: Option<AttackLikelihood>,
}

impl PackageAccum {
    fn new(package: PackageRef) -> Self {
        Self {
            package,
            vulnerabilities: Vec::new(),
            vuln_risk: None,
            reputation: None,
            risk_factors: Vec::new(),
            code_issues: Vec::new(),
            supply_chain: Vec::new(),
            attack_likelihood: None,
        }
    }

    fn to_entry(&self) -> PackageEntry {
        let mut risk_factors = dedup_findings(&self.risk_factors);
        let mut code_issues = dedup_findings(&self.code_issues);
        let mut supply_chain_risks = dedup_findings(&self.supply_chain);

        let overall_risk = self.overall_risk(&risk_factors, &code_issues, &supply_chain_risks);

        // consolidate a single shared remediation to package level
        let all: Vec<&Finding> = risk_factors
            .iter()
            .chain(code_issues.iter())
            .chain(supply_chain_risks.iter())
            .collect();
        let shared: Option<String> = match all.as_slice() {
            [] => None,
            [first, rest @ ..] => first.recommendation.clone().filter(|r| {
                rest.iter().all(|f| f.recommendation.as_deref() == Some(r))
            }),
        };
        if shared.is_some() {
            for list in [&mut risk_factors, &mut code_issues, &mut supply_chain_risks] {
                for finding in list.iter_mut() {
                    finding.recommendation = None;
                }
            }
        }

        PackageEntry {
            package: self.package.clone(),
            vulnerability_count: self.vulnerabilities.len(),
            finding_count: risk_factors.len() + code_issues.len() + supply_chain_risks.len(),
            reputation: self.reputation.clone(),
            risk_factors,
            code_issues,
            supply_chain_risks,
            attack_likelihood: self.attack_likelihood,
            overall_risk,
            recommendation: shared,
        }
    }

    fn overall_risk(
        &self,
        risk_factors: &[Finding],
        code_issues: &[Finding],
        supply_chain: &[Finding],
    ) -> Severity {
        let mut risk = self.vuln_risk.unwrap_or(Severity::Info);
        for finding in risk_factors.iter().chain(code_issues).chain(supply_chain) {
            risk = risk.max(finding.severity);
        }
        if let Some(reputation) = &self.reputation {
            let from_reputation = match reputation.risk_level {
                RiskLevel::High => Severity::High,
                RiskLevel::Medium => Severity::Medium,
                RiskLevel::Low | RiskLevel::Trusted => Severity::Info,
            };
            risk = risk.max(from_reputation);
        }
        if let Some(likelihood) = self.attack_likelihood {
            let from_attack = match likelihood {
                AttackLikelihood::Critical => Severity::Critical,
                AttackLikelihood::High => Severity::High,
                AttackLikelihood::Medium => Severity::Medium,
                AttackLikelihood::Low => Severity::Low,
                AttackLikelihood::None => Severity::Info,
            };
            risk = risk.max(from_attack);
        }
        risk
    }
}

fn dedup_findings(findings: &[Finding]) -> Vec<Finding> {
    let mut seen = HashSet::new();
    findings
        .iter()
        .filter(|f| seen.insert(f.dedup_key()))
        .cloned()
        .collect()
}

fn collect_vulnerabilities(accum: &BTreeMap<String, PackageAccum>) -> Vec<ReportVulnerability> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut out = Vec::new();
    for slot in accum.values() {
        for vuln in &slot.vulnerabilities {
            if !seen.insert((vuln.id.clone(), slot.package.cache_key())) {
                continue;
            }
            out.push(ReportVulnerability {
                id: vuln.id.clone(),
                package: slot.package.clone(),
                aliases: vuln.aliases.clone(),
                summary: vuln.summary.clone(),
                severity: vuln.severity,
                cvss_score: vuln.cvss_score,
                is_current_version_affected: vuln.is_current_version_affected,
                status: vuln.status,
                fixed_versions: vuln.fixed_versions.clone(),
                references: vuln.references.clone(),
            });
        }
    }
    out
}

fn summarize(
    ctx: &SharedContext,
    vulnerabilities: &[ReportVulnerability],
    packages: &[PackageEntry],
) -> ReportSummary {
    let malicious: HashSet<String> = ctx
        .rule_findings
        .iter()
        .filter(|f| f.finding_type == "malicious_package")
        .map(|f| f.package.cache_key())
        .collect();
    ReportSummary {
        total_packages: ctx.packages().len(),
        total_vulnerabilities: vulnerabilities.len(),
        critical_vulnerabilities: vulnerabilities
            .iter()
            .filter(|v| v.severity == Severity::Critical)
            .count(),
        high_vulnerabilities: vulnerabilities
            .iter()
            .filter(|v| v.severity == Severity::High)
            .count(),
        malicious_packages: malicious.len(),
        high_risk_packages: packages
            .iter()
            .filter(|p| p.overall_risk >= Severity::High)
            .count(),
        total_findings: packages.iter().map(|p| p.finding_count).sum(),
    }
}

/// The deterministic recommendation-selection table, evaluated in priority
/// order. Always yields at least the monitoring entry.
fn select_recommendations(
    ctx: &SharedContext,
    summary: &ReportSummary,
    packages: &[PackageEntry],
) -> Vec<Recommendation> {
    let mut out = Vec::new();

    let named = |predicate: &dyn Fn(&PackageEntry) -> bool| -> Vec<String> {
        packages
            .iter()
            .filter(|p| predicate(p))
            .map(|p| p.package.name.clone())
            .collect()
    };

    let critical_vuln_packages = named(&|p| {
        p.vulnerability_count > 0 && p.overall_risk == Severity::Critical
    });
    if summary.critical_vulnerabilities > 0 {
        out.push(Recommendation {
            priority: RecommendationPriority::Critical,
            action: format!(
                "Update {} packages with {} critical vulnerabilities ({})",
                critical_vuln_packages.len().max(1),
                summary.critical_vulnerabilities,
                sample(&critical_vuln_packages)
            ),
            details: critical_vuln_packages.join(", "),
            impact: "Removes known-exploitable code paths from the build".to_string(),
        });
    }

    let attack_packages = named(&|p| {
        p.attack_likelihood
            .map(|l| l >= AttackLikelihood::High)
            .unwrap_or(false)
    });
    if !attack_packages.is_empty() {
        out.push(Recommendation {
            priority: RecommendationPriority::Critical,
            action: format!(
                "Remove {} packages with supply-chain attack indicators ({}); rotate exposed credentials",
                attack_packages.len(),
                sample(&attack_packages)
            ),
            details: attack_packages.join(", "),
            impact: "Contains a live compromise and limits credential exposure".to_string(),
        });
    }

    let unfixed_high = named(&|p| {
        p.vulnerability_count > 0
            && p.overall_risk >= Severity::High
            && p.overall_risk < Severity::Critical
    });
    if !unfixed_high.is_empty() {
        out.push(Recommendation {
            priority: RecommendationPriority::High,
            action: format!(
                "Mitigate {} packages with high-severity vulnerabilities",
                unfixed_high.len()
            ),
            details: unfixed_high.join(", "),
            impact: "Reduces exploitable surface until fixes ship".to_string(),
        });
    }

    let obfuscated = named(&|p| {
        p.code_issues
            .iter()
            .chain(p.risk_factors.iter())
            .any(|f| f.finding_type == "obfuscation")
    });
    if !obfuscated.is_empty() {
        out.push(Recommendation {
            priority: RecommendationPriority::High,
            action: format!(
                "Review {} packages with obfuscated code; verify or replace",
                obfuscated.len()
            ),
            details: obfuscated.join(", "),
            impact: "Obfuscation hides intent; manual review resolves it".to_string(),
        });
    }

    let low_reputation = named(&|p| {
        p.reputation.as_ref().map(|r| r.score < 0.3).unwrap_or(false)
    });
    if !low_reputation.is_empty() {
        out.push(Recommendation {
            priority: RecommendationPriority::Medium,
            action: format!(
                "Replace {} low-reputation packages with trusted alternatives",
                low_reputation.len()
            ),
            details: low_reputation.join(", "),
            impact: "Lowers the chance of abandonment or takeover".to_string(),
        });
    }

    let cycles = chainscan_graph::detect_cycles(&ctx.arena);
    if !cycles.is_empty() {
        out.push(Recommendation {
            priority: RecommendationPriority::Low,
            action: format!("Resolve {} circular dependencies", cycles.len()),
            details: cycles
                .iter()
                .map(|c| {
                    c.iter()
                        .map(|p| p.name.as_str())
                        .collect::<Vec<_>>()
                        .join(" -> ")
                })
                .collect::<Vec<_>>()
                .join("; "),
            impact: "Simplifies upgrades and removes resolution ambiguity".to_string(),
        });
    }

    if out.is_empty() {
        out.push(Recommendation {
            priority: RecommendationPriority::Low,
            action: "No critical issues detected; maintain monitoring".to_string(),
            details: String::new(),
            impact: "Periodic rescans catch newly disclosed vulnerabilities".to_string(),
        });
    }
    out
}

fn sample(names: &[String]) -> String {
    let mut shown: Vec<&str> = names.iter().take(3).map(String::as_str).collect();
    if shown.is_empty() {
        shown.push("see details");
    }
    let suffix = if names.len() > 3 { ", …" } else { "" };
    format!("{}{}", shown.join(", "), suffix)
}
