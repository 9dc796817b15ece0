//! Shared data model
//!
//! Identity is the `(name, version, ecosystem)` triple. Findings,
//! vulnerabilities, and stage results are immutable once produced; they are
//! built by one component and consumed read-only by the report assembler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Supported package ecosystems (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Npm,
    PyPi,
}

impl Ecosystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ecosystem::Npm => "npm",
            Ecosystem::PyPi => "pypi",
        }
    }

    /// Ecosystem name as OSV spells it
    pub fn osv_name(&self) -> &'static str {
        match self {
            Ecosystem::Npm => "npm",
            Ecosystem::PyPi => "PyPI",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "npm" | "node" | "nodejs" => Some(Ecosystem::Npm),
            "pypi" | "python" | "pip" => Some(Ecosystem::PyPi),
            _ => None,
        }
    }
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Package identity: `(name, version, ecosystem)`
///
/// `version` may be a concrete version or a raw specifier; the resolver
/// normalises before the triple is used as a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageRef {
    pub name: String,
    pub version: String,
    pub ecosystem: Ecosystem,
}

impl PackageRef {
    pub fn new(name: impl Into<String>, version: impl Into<String>, ecosystem: Ecosystem) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ecosystem,
        }
    }

    /// Canonical form used for identity and cache keys.
    ///
    /// PyPI names are case-insensitive with `-`/`_`/`.` treated as
    /// equivalent (PEP 503); npm names are already canonical.
    pub fn normalized(&self) -> Self {
        let name = match self.ecosystem {
            Ecosystem::Npm => self.name.clone(),
            Ecosystem::PyPi => normalize_pypi_name(&self.name),
        };
        Self {
            name,
            version: self.version.trim().to_string(),
            ecosystem: self.ecosystem,
        }
    }

    pub fn cache_key(&self) -> String {
        let n = self.normalized();
        format!("{}:{}:{}", n.ecosystem, n.name, n.version)
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.name, self.version, self.ecosystem)
    }
}

fn normalize_pypi_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c == '-' || c == '_' || c == '.' {
            if !last_dash {
                out.push('-');
            }
            last_dash = true;
        } else {
            out.push(c);
            last_dash = false;
        }
    }
    out
}

/// Severity of a finding or vulnerability.
///
/// Variants are declared in ascending order so the derived `Ord` ranks
/// `Critical` highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// CVSS bucket mapping: 0–3.9 low, 4.0–6.9 medium, 7.0–8.9 high, 9.0+ critical
    pub fn from_cvss(score: f64) -> Self {
        if score >= 9.0 {
            Severity::Critical
        } else if score >= 7.0 {
            Severity::High
        } else if score >= 4.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "critical" => Some(Severity::Critical),
            "high" => Some(Severity::High),
            "medium" | "moderate" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            "info" | "informational" | "none" => Some(Severity::Info),
            _ => None,
        }
    }

    /// One level up, saturating at critical
    pub fn promote(self) -> Self {
        match self {
            Severity::Info => Severity::Low,
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }
}

/// How a finding was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    RuleBased,
    AgentBased,
}

/// A single observation about a package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub package: PackageRef,
    pub finding_type: String,
    pub severity: Severity,
    pub confidence: f64,
    pub evidence: Vec<String>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub references: Vec<String>,
    pub detection_method: DetectionMethod,
}

impl Finding {
    /// Stable hash of the evidence list, used for deduplication
    pub fn evidence_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for line in &self.evidence {
            hasher.update(line.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Dedup key: `(package, finding_type, evidence-hash)`
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.package.cache_key(),
            self.finding_type,
            self.evidence_hash()
        )
    }
}

/// Three-valued answer for "is the current version affected?"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriState {
    Yes,
    No,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VulnStatus {
    Active,
    Fixed,
    NotApplicable,
    NotAvailable,
}

/// A known vulnerability attributed to a package version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub aliases: Vec<String>,
    pub summary: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cvss_score: Option<f64>,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub affected_versions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub fixed_versions: Vec<String>,
    pub is_current_version_affected: TriState,
    pub status: VulnStatus,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub references: Vec<String>,
}

/// Per-factor reputation scores, each in `[0, 1]`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReputationFactors {
    pub age: f64,
    pub downloads: f64,
    pub author: f64,
    pub maintenance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReputationFlag {
    NewPackage,
    LowDownloads,
    UnknownAuthor,
    Unmaintained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Trusted,
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// `high` < 0.3, `medium` < 0.6, `low` < 0.8, else `trusted`
    pub fn from_score(score: f64) -> Self {
        if score < 0.3 {
            RiskLevel::High
        } else if score < 0.6 {
            RiskLevel::Medium
        } else if score < 0.8 {
            RiskLevel::Low
        } else {
            RiskLevel::Trusted
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationAssessment {
    pub package: PackageRef,
    pub score: f64,
    pub factors: ReputationFactors,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub flags: Vec<ReputationFlag>,
    pub risk_level: RiskLevel,
    pub confidence: f64,
}

/// Stage completion status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Timeout,
    Failed,
    Fallback,
    Skipped,
    NotAvailable,
    /// The stage's upstream host did not resolve; the run continued without it
    Offline,
}

/// Structured stage error for diagnostics (never a stack trace)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageError {
    pub kind: crate::error::ErrorKind,
    pub message: String,
}

/// Attack likelihood emitted by the supply-chain stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackLikelihood {
    None,
    Low,
    Medium,
    High,
    Critical,
}

/// Per-package outcome of the vulnerability stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageVulnerabilities {
    pub package: PackageRef,
    pub vulnerabilities: Vec<Vulnerability>,
    /// Max severity, promoted once when three or more high-or-above hits exist
    pub combined_risk: Severity,
    pub confidence: f64,
}

/// Complexity summary produced by the code stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComplexitySummary {
    pub lines: usize,
    pub max_nesting: usize,
    pub control_flow_density: f64,
    pub long_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeReport {
    pub package: PackageRef,
    pub findings: Vec<Finding>,
    pub complexity: ComplexitySummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackAssessment {
    pub package: PackageRef,
    pub findings: Vec<Finding>,
    pub attack_likelihood: AttackLikelihood,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub matched_fingerprints: Vec<String>,
}

/// Stage-specific payload, one variant per stage
///
/// Replaces the dictionary-valued results the analysis pipeline would
/// otherwise pass around; the report assembler matches on the variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageData {
    Vulnerability { packages: Vec<PackageVulnerabilities> },
    Reputation { assessments: Vec<ReputationAssessment> },
    Code { reports: Vec<CodeReport> },
    SupplyChain { assessments: Vec<AttackAssessment> },
    Synthesis { report: Box<crate::report::Report> },
    /// Schema-valid empty payload substituted for a failed required stage
    Empty,
}

/// Immutable outcome of one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_name: String,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub confidence: f64,
    pub data: StageData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    pub status: StageStatus,
}

impl StageResult {
    pub fn skipped(stage_name: &str) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            success: false,
            started_at: Utc::now(),
            duration_seconds: 0.0,
            confidence: 0.0,
            data: StageData::Empty,
            error: None,
            status: StageStatus::Skipped,
        }
    }

    pub fn is_network_failure(&self) -> bool {
        matches!(self.status, StageStatus::Offline)
            || self
                .error
                .as_ref()
                .map(|e| e.kind.is_network())
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Low > Severity::Info);
    }

    #[test]
    fn test_severity_from_cvss_buckets() {
        assert_eq!(Severity::from_cvss(0.0), Severity::Low);
        assert_eq!(Severity::from_cvss(3.9), Severity::Low);
        assert_eq!(Severity::from_cvss(4.0), Severity::Medium);
        assert_eq!(Severity::from_cvss(6.9), Severity::Medium);
        assert_eq!(Severity::from_cvss(7.0), Severity::High);
        assert_eq!(Severity::from_cvss(8.9), Severity::High);
        assert_eq!(Severity::from_cvss(9.0), Severity::Critical);
        assert_eq!(Severity::from_cvss(10.0), Severity::Critical);
    }

    #[test]
    fn test_severity_promote_saturates() {
        assert_eq!(Severity::Medium.promote(), Severity::High);
        assert_eq!(Severity::Critical.promote(), Severity::Critical);
    }

    #[test]
    fn test_pypi_name_normalization() {
        let r = PackageRef::new("Typing_Extensions", "4.0.0", Ecosystem::PyPi);
        assert_eq!(r.normalized().name, "typing-extensions");

        let r = PackageRef::new("zope.interface", "5.0", Ecosystem::PyPi);
        assert_eq!(r.normalized().name, "zope-interface");
    }

    #[test]
    fn test_npm_name_untouched() {
        let r = PackageRef::new("@types/Node", "18.0.0", Ecosystem::Npm);
        assert_eq!(r.normalized().name, "@types/Node");
    }

    #[test]
    fn test_cache_key_stable() {
        let a = PackageRef::new("Requests", "2.31.0", Ecosystem::PyPi);
        let b = PackageRef::new("requests", "2.31.0", Ecosystem::PyPi);
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_risk_level_thresholds() {
        assert_eq!(RiskLevel::from_score(0.29), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(0.3), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.6), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.8), RiskLevel::Trusted);
    }

    #[test]
    fn test_evidence_hash_order_sensitive_but_stable() {
        let mk = |evidence: Vec<String>| Finding {
            package: PackageRef::new("a", "1.0.0", Ecosystem::Npm),
            finding_type: "test".to_string(),
            severity: Severity::Low,
            confidence: 0.5,
            evidence,
            source: "rule_scanner".to_string(),
            recommendation: None,
            references: vec![],
            detection_method: DetectionMethod::RuleBased,
        };
        let a = mk(vec!["x".to_string(), "y".to_string()]);
        let b = mk(vec!["x".to_string(), "y".to_string()]);
        assert_eq!(a.evidence_hash(), b.evidence_hash());
        assert_eq!(a.dedup_key(), b.dedup_key());
    }
}
