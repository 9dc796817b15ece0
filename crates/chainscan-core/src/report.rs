//! Package-centric report schema
//!
//! The report is the only contractual output the UI collaborator consumes.
//! Field names are snake_case on the wire; `parse(serialise(report)) ==
//! report` holds for every field.

use crate::model::{
    AttackLikelihood, Ecosystem, Finding, PackageRef, ReputationAssessment, Severity, StageError,
    StageStatus, TriState, VulnStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Full,
    Partial,
    Basic,
    Minimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationPriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub analysis_id: String,
    pub target: String,
    pub ecosystem: Ecosystem,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub agents_executed: usize,
    pub agents_successful: usize,
    pub analysis_status: AnalysisStatus,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub missing_analysis: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degradation_reason: Option<String>,
    pub retry_recommended: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_packages: usize,
    pub total_vulnerabilities: usize,
    pub critical_vulnerabilities: usize,
    pub high_vulnerabilities: usize,
    pub malicious_packages: usize,
    pub high_risk_packages: usize,
    pub total_findings: usize,
}

/// One row per `id × package_ref`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportVulnerability {
    pub id: String,
    pub package: PackageRef,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub aliases: Vec<String>,
    pub summary: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cvss_score: Option<f64>,
    pub is_current_version_affected: TriState,
    pub status: VulnStatus,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub fixed_versions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub references: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageEntry {
    pub package: PackageRef,
    pub vulnerability_count: usize,
    pub finding_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reputation: Option<ReputationAssessment>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub risk_factors: Vec<Finding>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub code_issues: Vec<Finding>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub supply_chain_risks: Vec<Finding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attack_likelihood: Option<AttackLikelihood>,
    pub overall_risk: Severity,
    /// Present when every finding in this package shares one remediation;
    /// the individual findings then omit theirs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: RecommendationPriority,
    pub action: String,
    pub details: String,
    pub impact: String,
}

/// Per-stage diagnostics exposed to the UI (`analysis_details` block)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostics {
    pub status: StageStatus,
    pub duration_seconds: f64,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub summary: ReportSummary,
    pub vulnerabilities: Vec<ReportVulnerability>,
    pub packages: Vec<PackageEntry>,
    pub recommendations: Vec<Recommendation>,
    pub analysis_details: BTreeMap<String, StageDiagnostics>,
}

impl PartialEq for StageError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.message == other.message
    }
}

impl PartialEq for ReputationAssessment {
    fn eq(&self, other: &Self) -> bool {
        self.package == other.package
            && self.score == other.score
            && self.risk_level == other.risk_level
    }
}

impl PartialEq for Finding {
    fn eq(&self, other: &Self) -> bool {
        self.dedup_key() == other.dedup_key() && self.severity == other.severity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> Report {
        Report {
            metadata: ReportMetadata {
                analysis_id: "20260801-abc123".to_string(),
                target: "/tmp/project".to_string(),
                ecosystem: Ecosystem::Npm,
                started_at: Utc::now(),
                completed_at: Utc::now(),
                agents_executed: 5,
                agents_successful: 5,
                analysis_status: AnalysisStatus::Full,
                confidence: 0.95,
                missing_analysis: vec![],
                degradation_reason: None,
                retry_recommended: false,
            },
            summary: ReportSummary {
                total_packages: 1,
                total_vulnerabilities: 1,
                critical_vulnerabilities: 1,
                high_vulnerabilities: 0,
                malicious_packages: 1,
                high_risk_packages: 1,
                total_findings: 1,
            },
            vulnerabilities: vec![ReportVulnerability {
                id: "MAL-2018-0001".to_string(),
                package: PackageRef::new("flatmap-stream", "0.1.1", Ecosystem::Npm),
                aliases: vec![],
                summary: "malicious code injection".to_string(),
                severity: Severity::Critical,
                cvss_score: Some(9.8),
                is_current_version_affected: TriState::Yes,
                status: VulnStatus::Active,
                fixed_versions: vec![],
                references: vec![],
            }],
            packages: vec![PackageEntry {
                package: PackageRef::new("flatmap-stream", "0.1.1", Ecosystem::Npm),
                vulnerability_count: 1,
                finding_count: 1,
                reputation: None,
                risk_factors: vec![],
                code_issues: vec![],
                supply_chain_risks: vec![],
                attack_likelihood: None,
                overall_risk: Severity::Critical,
                recommendation: Some("Remove this package immediately".to_string()),
            }],
            recommendations: vec![Recommendation {
                priority: RecommendationPriority::Critical,
                action: "Update 1 package with 1 critical vulnerability".to_string(),
                details: "flatmap-stream".to_string(),
                impact: "Removes known-exploited code from the build".to_string(),
            }],
            analysis_details: BTreeMap::new(),
        }
    }

    #[test]
    fn test_report_round_trip() {
        let report = sample_report();
        let json = serde_json::to_string_pretty(&report).unwrap();
        let parsed: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }

    #[test]
    fn test_snake_case_field_names() {
        let report = sample_report();
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"analysis_status\":\"full\""));
        assert!(json.contains("\"retry_recommended\":false"));
        assert!(json.contains("\"is_current_version_affected\":\"yes\""));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(RecommendationPriority::Critical > RecommendationPriority::High);
        assert!(RecommendationPriority::High > RecommendationPriority::Medium);
        assert!(RecommendationPriority::Medium > RecommendationPriority::Low);
    }
}
