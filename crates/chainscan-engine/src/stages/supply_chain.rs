//! Supply-chain attack stage
//!
//! Conditional: runs when the reputation or code stage flagged at least one
//! high-risk package. For each such package the registry timeline is pulled
//! and checked for the classic attack shapes: maintainer handoff, unusual
//! publishing cadence, dependency additions that import network or
//! environment access, delayed-activation markers, and credential
//! exfiltration paths. Observed indicators are scored against known attack
//! fingerprints by set overlap.

use super::{Stage, StageOutput, CODE, REPUTATION, SUPPLY_CHAIN};
use crate::context::{Services, SharedContext};
use async_trait::async_trait;
use chainscan_core::model::AttackAssessment;
use chainscan_core::{
    AttackLikelihood, ChainscanConfig, DetectionMethod, Finding, PackageRef, RiskLevel, ScanError,
    Severity, StageData,
};
use chainscan_registry::PackageTimeline;
use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::info;

pub const SOURCE: &str = "supply_chain_analysis";

/// Overlap at or above this flags a fingerprint match
pub const FINGERPRINT_CUTOFF: f64 = 0.4;

pub struct SupplyChainStage;

struct AttackFingerprint {
    name: &'static str,
    indicators: &'static [&'static str],
}

/// Indicator sets distilled from published supply-chain incidents
const FINGERPRINTS: &[AttackFingerprint] = &[
    AttackFingerprint {
        name: "maintainer-handoff injection",
        indicators: &["maintainer_change", "dependency_added", "dormant_then_active"],
    },
    AttackFingerprint {
        name: "account-takeover release burst",
        indicators: &["maintainer_change", "rapid_release"],
    },
    AttackFingerprint {
        name: "delayed payload",
        indicators: &["delayed_activation", "dependency_added"],
    },
    AttackFingerprint {
        name: "credential harvest",
        indicators: &["credential_exfiltration", "new_dependency_reaches_network"],
    },
];

lazy_static! {
    static ref DELAYED_ACTIVATION: Regex = Regex::new(
        r"set(Timeout|Interval)\s*\([^)]*(Date|86400|604800|3600000)|time\.sleep\s*\(\s*[0-9]{4,}|datetime\.(now|today)\(\)\s*[<>]"
    )
    .unwrap();
    static ref CREDENTIAL_EXFIL: Regex = Regex::new(
        r"\.ssh/|id_rsa|\.aws/credentials|\.npmrc|\.pypirc|\.netrc|process\.env|os\.environ"
    )
    .unwrap();
    static ref NETWORKISH_DEP: Regex =
        Regex::new(r"(?i)(http|request|fetch|socket|tunnel|proxy|dns|env|dotenv)").unwrap();
}

#[async_trait]
impl Stage for SupplyChainStage {
    fn name(&self) -> &'static str {
        SUPPLY_CHAIN
    }

    fn deadline(&self, config: &ChainscanConfig) -> Duration {
        Duration::from_secs(config.stages.supply_chain)
    }

    fn should_run(&self, ctx: &SharedContext) -> bool {
        !selected_packages(ctx).is_empty()
    }

    async fn execute(
        &self,
        ctx: &SharedContext,
        services: &Services,
    ) -> Result<StageOutput, ScanError> {
        let targets = selected_packages(ctx);

        let script_material: String = ctx
            .manifest
            .scripts
            .iter()
            .map(|s| s.command.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let timelines: Vec<(PackageRef, Option<PackageTimeline>)> =
            stream::iter(targets.into_iter())
                .map(|package| {
                    let cancel = ctx.cancel.clone();
                    async move {
                        if cancel.is_cancelled() {
                            return (package, None);
                        }
                        let timeline = services
                            .registry
                            .fetch_timeline(&package.name, package.ecosystem)
                            .await
                            .unwrap_or(None);
                        (package, timeline)
                    }
                })
                .buffer_unordered(services.config.worker_pool_size.max(1))
                .collect()
                .await;

        ctx.cancel.check()?;

        let mut assessments = Vec::new();
        for (package, timeline) in timelines {
            let assessment = assess(&package, timeline.as_ref(), &script_material);
            assessments.push(assessment);
        }

        let high_risk: Vec<PackageRef> = assessments
            .iter()
            .filter(|a| a.attack_likelihood >= AttackLikelihood::High)
            .map(|a| a.package.clone())
            .collect();
        let confidence = if assessments.is_empty() { 0.8 } else { 0.75 };

        info!(
            assessed = assessments.len(),
            flagged = high_risk.len(),
            "supply-chain stage complete"
        );
        Ok(
            StageOutput::success(StageData::SupplyChain { assessments }, confidence)
                .with_high_risk(high_risk),
        )
    }
}

/// High-risk packages surfaced by the reputation or code stages
fn selected_packages(ctx: &SharedContext) -> Vec<PackageRef> {
    let mut out: Vec<PackageRef> = Vec::new();
    if let Some(StageData::Reputation { assessments }) = ctx.stage(REPUTATION).map(|r| &r.data) {
        out.extend(
            assessments
                .iter()
                .filter(|a| a.risk_level == RiskLevel::High)
                .map(|a| a.package.clone()),
        );
    }
    if let Some(StageData::Code { reports }) = ctx.stage(CODE).map(|r| &r.data) {
        out.extend(
            reports
                .iter()
                .filter(|r| r.findings.iter().any(|f| f.severity >= Severity::High))
                .map(|r| r.package.clone()),
        );
    }
    out.sort_by_key(|p| p.cache_key());
    out.dedup_by_key(|p| p.cache_key());
    out
}

fn assess(
    package: &PackageRef,
    timeline: Option<&PackageTimeline>,
    script_material: &str,
) -> AttackAssessment {
    let mut indicators: BTreeSet<&'static str> = BTreeSet::new();
    let mut findings: Vec<Finding> = Vec::new();

    if let Some(timeline) = timeline {
        if maintainer_changed(timeline) {
            indicators.insert("maintainer_change");
            findings.push(finding(
                package,
                "maintainer_change",
                Severity::Medium,
                vec![
                    format!(
                        "maintainers changed between releases: {:?} -> {:?}",
                        timeline.previous_maintainers, timeline.current_maintainers
                    ),
                ],
            ));
        }
        if rapid_release(timeline) {
            indicators.insert("rapid_release");
            findings.push(finding(
                package,
                "rapid_release",
                Severity::Low,
                vec!["three or more releases inside thirty days".to_string()],
            ));
        }
        if dormant_then_active(timeline) {
            indicators.insert("dormant_then_active");
            findings.push(finding(
                package,
                "dormant_then_active",
                Severity::Medium,
                vec!["package dormant for over a year, then suddenly republished".to_string()],
            ));
        }
        let added = added_dependencies(timeline);
        if !added.is_empty() {
            indicators.insert("dependency_added");
            if added.iter().any(|d| NETWORKISH_DEP.is_match(d)) {
                indicators.insert("new_dependency_reaches_network");
            }
            findings.push(finding(
                package,
                "dependency_added",
                Severity::Medium,
                vec![format!(
                    "dependencies added in the latest release: {}",
                    added.join(", ")
                )],
            ));
        }
    }

    if DELAYED_ACTIVATION.is_match(script_material) {
        indicators.insert("delayed_activation");
        findings.push(finding(
            package,
            "delayed_activation",
            Severity::High,
            vec!["time- or date-gated execution in install material".to_string()],
        ));
    }
    if CREDENTIAL_EXFIL.is_match(script_material) {
        indicators.insert("credential_exfiltration");
        findings.push(finding(
            package,
            "credential_exfiltration",
            Severity::High,
            vec!["install material touches credential stores or the environment".to_string()],
        ));
    }

    let matched: Vec<String> = FINGERPRINTS
        .iter()
        .filter(|fp| jaccard(&indicators, fp.indicators) >= FINGERPRINT_CUTOFF)
        .map(|fp| fp.name.to_string())
        .collect();

    let attack_likelihood = likelihood(&indicators, &matched, &findings);
    AttackAssessment {
        package: package.clone(),
        findings,
        attack_likelihood,
        matched_fingerprints: matched,
    }
}

fn finding(
    package: &PackageRef,
    finding_type: &str,
    severity: Severity,
    evidence: Vec<String>,
) -> Finding {
    Finding {
        package: package.clone(),
        finding_type: finding_type.to_string(),
        severity,
        confidence: 0.7,
        evidence,
        source: SOURCE.to_string(),
        recommendation: None,
        references: vec![],
        detection_method: DetectionMethod::AgentBased,
    }
}

fn maintainer_changed(timeline: &PackageTimeline) -> bool {
    let prev: BTreeSet<&String> = timeline.previous_maintainers.iter().collect();
    let current: BTreeSet<&String> = timeline.current_maintainers.iter().collect();
    !prev.is_empty() && !current.is_empty() && prev != current
}

fn rapid_release(timeline: &PackageTimeline) -> bool {
    let Some(latest) = timeline.releases.last().and_then(|r| r.released_at) else {
        return false;
    };
    let window = latest - ChronoDuration::days(30);
    timeline
        .releases
        .iter()
        .filter(|r| r.released_at.map(|t| t >= window).unwrap_or(false))
        .count()
        >= 3
}

fn dormant_then_active(timeline: &PackageTimeline) -> bool {
    let times: Vec<_> = timeline
        .releases
        .iter()
        .filter_map(|r| r.released_at)
        .collect();
    let [.., previous, latest] = times.as_slice() else {
        return false;
    };
    *latest - *previous > ChronoDuration::days(365)
        && Utc::now() - *latest < ChronoDuration::days(90)
}

fn added_dependencies(timeline: &PackageTimeline) -> Vec<String> {
    if timeline.previous_dependencies.is_empty() {
        return Vec::new();
    }
    let previous: BTreeSet<&String> = timeline.previous_dependencies.iter().collect();
    timeline
        .latest_dependencies
        .iter()
        .filter(|d| !previous.contains(d))
        .cloned()
        .collect()
}

fn jaccard(observed: &BTreeSet<&'static str>, fingerprint: &[&'static str]) -> f64 {
    if observed.is_empty() || fingerprint.is_empty() {
        return 0.0;
    }
    let fp: BTreeSet<&&str> = fingerprint.iter().collect();
    let intersection = fingerprint
        .iter()
        .filter(|i| observed.contains(**i))
        .count();
    let union = observed.len() + fp.len() - intersection;
    intersection as f64 / union as f64
}

fn likelihood(
    indicators: &BTreeSet<&'static str>,
    matched: &[String],
    findings: &[Finding],
) -> AttackLikelihood {
    let max_severity = findings.iter().map(|f| f.severity).max();
    if !matched.is_empty() && max_severity >= Some(Severity::High) {
        AttackLikelihood::Critical
    } else if !matched.is_empty() {
        AttackLikelihood::High
    } else if indicators.len() >= 2 {
        AttackLikelihood::Medium
    } else if indicators.len() == 1 {
        AttackLikelihood::Low
    } else {
        AttackLikelihood::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainscan_core::Ecosystem;
    use chainscan_registry::VersionRelease;

    fn pkg() -> PackageRef {
        PackageRef::new("event-stream", "3.3.6", Ecosystem::Npm)
    }

    fn timeline(
        previous_maintainers: &[&str],
        current_maintainers: &[&str],
        previous_deps: &[&str],
        latest_deps: &[&str],
    ) -> PackageTimeline {
        let now = Utc::now();
        PackageTimeline {
            name: "event-stream".to_string(),
            releases: vec![
                VersionRelease {
                    version: "3.3.5".to_string(),
                    released_at: Some(now - ChronoDuration::days(500)),
                },
                VersionRelease {
                    version: "3.3.6".to_string(),
                    released_at: Some(now - ChronoDuration::days(10)),
                },
            ],
            created_at: Some(now - ChronoDuration::days(2000)),
            latest_version: Some("3.3.6".to_string()),
            current_maintainers: current_maintainers.iter().map(|s| s.to_string()).collect(),
            previous_maintainers: previous_maintainers.iter().map(|s| s.to_string()).collect(),
            latest_dependencies: latest_deps.iter().map(|s| s.to_string()).collect(),
            previous_dependencies: previous_deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_handoff_with_injected_dependency_is_critical_or_high() {
        let t = timeline(
            &["dominictarr"],
            &["right9ctrl"],
            &["through"],
            &["through", "flatmap-stream"],
        );
        let a = assess(&pkg(), Some(&t), "");
        assert!(a.attack_likelihood >= AttackLikelihood::High);
        assert!(!a.matched_fingerprints.is_empty());
        let types: Vec<&str> = a.findings.iter().map(|f| f.finding_type.as_str()).collect();
        assert!(types.contains(&"maintainer_change"));
        assert!(types.contains(&"dependency_added"));
        assert!(types.contains(&"dormant_then_active"));
    }

    #[test]
    fn test_quiet_package_none() {
        let t = timeline(&["alice"], &["alice"], &["through"], &["through"]);
        let a = assess(&pkg(), Some(&t), "");
        assert_eq!(a.attack_likelihood, AttackLikelihood::None);
        assert!(a.findings.is_empty());
    }

    #[test]
    fn test_delayed_activation_in_scripts() {
        let a = assess(
            &pkg(),
            None,
            "setTimeout(run, 86400 * 1000); if (new Date() > trigger) run();",
        );
        assert!(a
            .findings
            .iter()
            .any(|f| f.finding_type == "delayed_activation"));
        assert!(a.attack_likelihood >= AttackLikelihood::Low);
    }

    #[test]
    fn test_jaccard_cutoff_boundary() {
        // observed exactly equal to a two-element fingerprint: overlap 1.0
        let mut observed = BTreeSet::new();
        observed.insert("maintainer_change");
        observed.insert("rapid_release");
        assert!(jaccard(&observed, &["maintainer_change", "rapid_release"]) >= FINGERPRINT_CUTOFF);

        // one of four unrelated indicators: 1 ∩ / 4 ∪ = 0.25 < cutoff
        let mut observed = BTreeSet::new();
        observed.insert("rapid_release");
        assert!(
            jaccard(
                &observed,
                &["maintainer_change", "dependency_added", "dormant_then_active", "rapid_release"]
            ) < FINGERPRINT_CUTOFF
        );
    }

    #[test]
    fn test_networkish_added_dependency_tagged() {
        let t = timeline(&["a"], &["a"], &["x"], &["x", "http-fetcher"]);
        let a = assess(&pkg(), Some(&t), "");
        // dependency_added + network tag = two indicators
        assert!(a.attack_likelihood >= AttackLikelihood::Medium);
    }
}
