//! OSV → core vulnerability conversion
//!
//! CVSS extraction prefers an explicit numeric score, then a score embedded
//! in the vector string, then the database-specific severity label. The
//! affected check is three-valued: ambiguous or unparseable ranges answer
//! `unknown`, never a guess.

use crate::wire::{OsvAffected, OsvVulnerability};
use chainscan_core::{Severity, TriState, VulnStatus, Vulnerability};
use semver::Version;
use serde::{Deserialize, Serialize};

/// How well-scored this package's vulnerabilities are; drives the
/// vulnerability stage's per-package confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreQuality {
    /// At least one structured CVSS score
    Structured,
    /// Only severity labels
    LabelOnly,
    /// No scoring information at all
    Unscored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageVulns {
    pub vulnerabilities: Vec<Vulnerability>,
    pub score_quality: ScoreQuality,
}

pub fn to_package_vulns(osv_vulns: Vec<OsvVulnerability>, current_version: &str) -> PackageVulns {
    let mut any_structured = false;
    let mut any_label = false;
    let vulnerabilities = osv_vulns
        .into_iter()
        .map(|v| {
            let (vuln, quality) = convert_one(v, current_version);
            match quality {
                ScoreQuality::Structured => any_structured = true,
                ScoreQuality::LabelOnly => any_label = true,
                ScoreQuality::Unscored => {}
            }
            vuln
        })
        .collect();

    let score_quality = if any_structured {
        ScoreQuality::Structured
    } else if any_label {
        ScoreQuality::LabelOnly
    } else {
        ScoreQuality::Unscored
    };
    PackageVulns {
        vulnerabilities,
        score_quality,
    }
}

fn convert_one(osv: OsvVulnerability, current_version: &str) -> (Vulnerability, ScoreQuality) {
    let cvss_score = extract_cvss(&osv);
    let label = severity_label(&osv);

    let (severity, quality) = match (cvss_score, label) {
        (Some(score), _) => (Severity::from_cvss(score), ScoreQuality::Structured),
        (None, Some(sev)) => (sev, ScoreQuality::LabelOnly),
        (None, None) => (Severity::Medium, ScoreQuality::Unscored),
    };

    let affected = is_affected(&osv.affected, current_version);
    let fixed_versions = fixed_versions(&osv.affected);
    let status = match affected {
        TriState::Yes => VulnStatus::Active,
        TriState::No if !fixed_versions.is_empty() => VulnStatus::Fixed,
        TriState::No => VulnStatus::NotApplicable,
        TriState::Unknown => VulnStatus::NotAvailable,
    };

    let vuln = Vulnerability {
        summary: osv.summary.unwrap_or_else(|| osv.id.clone()),
        details: osv.details.unwrap_or_default(),
        id: osv.id,
        aliases: osv.aliases,
        cvss_score,
        severity,
        affected_versions: affected_versions(&osv.affected),
        fixed_versions,
        is_current_version_affected: affected,
        status,
        references: osv.references.into_iter().map(|r| r.url).collect(),
    };
    (vuln, quality)
}

/// Numeric score from the severity entries, or embedded in the CVSS vector
fn extract_cvss(osv: &OsvVulnerability) -> Option<f64> {
    for entry in &osv.severity {
        if !entry.severity_type.starts_with("CVSS") {
            continue;
        }
        if let Ok(score) = entry.score.parse::<f64>() {
            if (0.0..=10.0).contains(&score) {
                return Some(score);
            }
        }
        // vector strings occasionally append the base score
        if let Some(score) = entry
            .score
            .split('/')
            .filter_map(|part| part.parse::<f64>().ok())
            .find(|s| (0.0..=10.0).contains(s))
        {
            return Some(score);
        }
    }
    osv.database_specific
        .as_ref()
        .and_then(|d| d.get("cvss_score"))
        .and_then(|s| s.as_f64())
        .filter(|s| (0.0..=10.0).contains(s))
}

fn severity_label(osv: &OsvVulnerability) -> Option<Severity> {
    osv.database_specific
        .as_ref()
        .and_then(|d| d.get("severity"))
        .and_then(|s| s.as_str())
        .and_then(Severity::from_label)
}

/// Tri-state affected check across every range and version list
pub fn is_affected(affected: &[OsvAffected], current_version: &str) -> TriState {
    if affected.is_empty() {
        return TriState::Unknown;
    }
    let current = Version::parse(current_version).ok();
    let mut saw_unknown = false;

    for entry in affected {
        if entry.versions.iter().any(|v| v == current_version) {
            return TriState::Yes;
        }
        for range in &entry.ranges {
            if range.range_type != "SEMVER" && range.range_type != "ECOSYSTEM" {
                saw_unknown = true;
                continue;
            }
            let Some(current) = current.as_ref() else {
                saw_unknown = true;
                continue;
            };
            match range_contains(range, current) {
                Some(true) => return TriState::Yes,
                Some(false) => {}
                None => saw_unknown = true,
            }
        }
    }

    if saw_unknown {
        TriState::Unknown
    } else {
        TriState::No
    }
}

/// introduced/fixed/last_affected event walk; `None` when nothing parses
fn range_contains(range: &crate::wire::OsvRange, current: &Version) -> Option<bool> {
    let mut introduced: Option<Version> = None;
    let mut fixed: Option<Version> = None;
    let mut last_affected: Option<Version> = None;
    let mut parsed_any = false;

    for event in &range.events {
        if let Some(v) = &event.introduced {
            if v == "0" {
                introduced = Some(Version::new(0, 0, 0));
                parsed_any = true;
            } else if let Ok(parsed) = Version::parse(v) {
                introduced = Some(parsed);
                parsed_any = true;
            }
        }
        if let Some(v) = &event.fixed {
            if let Ok(parsed) = Version::parse(v) {
                fixed = Some(parsed);
                parsed_any = true;
            }
        }
        if let Some(v) = &event.last_affected {
            if let Ok(parsed) = Version::parse(v) {
                last_affected = Some(parsed);
                parsed_any = true;
            }
        }
    }

    if !parsed_any {
        return None;
    }

    let after_introduced = introduced.map_or(true, |i| *current >= i);
    let before_upper = match (&fixed, &last_affected) {
        (Some(f), _) => current < f,
        (None, Some(l)) => current <= l,
        (None, None) => true,
    };
    Some(after_introduced && before_upper)
}

fn fixed_versions(affected: &[OsvAffected]) -> Vec<String> {
    let mut out = Vec::new();
    for entry in affected {
        for range in &entry.ranges {
            for event in &range.events {
                if let Some(f) = &event.fixed {
                    if !out.contains(f) {
                        out.push(f.clone());
                    }
                }
            }
        }
    }
    out
}

fn affected_versions(affected: &[OsvAffected]) -> Vec<String> {
    let mut out = Vec::new();
    for entry in affected {
        for v in &entry.versions {
            if !out.contains(v) {
                out.push(v.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{OsvEvent, OsvRange, OsvSeverity};

    fn semver_range(introduced: &str, fixed: Option<&str>) -> OsvAffected {
        OsvAffected {
            ranges: vec![OsvRange {
                range_type: "SEMVER".to_string(),
                events: vec![
                    OsvEvent {
                        introduced: Some(introduced.to_string()),
                        ..Default::default()
                    },
                    OsvEvent {
                        fixed: fixed.map(String::from),
                        ..Default::default()
                    },
                ],
            }],
            versions: vec![],
        }
    }

    fn vuln(id: &str) -> OsvVulnerability {
        OsvVulnerability {
            id: id.to_string(),
            aliases: vec![],
            summary: Some("test".to_string()),
            details: None,
            severity: vec![],
            affected: vec![],
            references: vec![],
            database_specific: None,
        }
    }

    #[test]
    fn test_affected_inside_range() {
        let ranges = vec![semver_range("1.0.0", Some("2.0.0"))];
        assert_eq!(is_affected(&ranges, "1.5.0"), TriState::Yes);
        assert_eq!(is_affected(&ranges, "2.0.0"), TriState::No);
        assert_eq!(is_affected(&ranges, "0.9.0"), TriState::No);
    }

    #[test]
    fn test_exact_version_list_hit() {
        let affected = vec![OsvAffected {
            ranges: vec![],
            versions: vec!["0.1.1".to_string()],
        }];
        assert_eq!(is_affected(&affected, "0.1.1"), TriState::Yes);
        assert_eq!(is_affected(&affected, "0.1.2"), TriState::No);
    }

    #[test]
    fn test_unparseable_version_is_unknown() {
        let ranges = vec![semver_range("1.0.0", Some("2.0.0"))];
        assert_eq!(is_affected(&ranges, "not-a-version"), TriState::Unknown);
    }

    #[test]
    fn test_git_range_is_unknown() {
        let affected = vec![OsvAffected {
            ranges: vec![OsvRange {
                range_type: "GIT".to_string(),
                events: vec![],
            }],
            versions: vec![],
        }];
        assert_eq!(is_affected(&affected, "1.0.0"), TriState::Unknown);
    }

    #[test]
    fn test_no_affected_info_is_unknown() {
        assert_eq!(is_affected(&[], "1.0.0"), TriState::Unknown);
    }

    #[test]
    fn test_cvss_numeric_score() {
        let mut v = vuln("GHSA-1");
        v.severity = vec![OsvSeverity {
            severity_type: "CVSS_V3".to_string(),
            score: "9.8".to_string(),
        }];
        let pack = to_package_vulns(vec![v], "1.0.0");
        assert_eq!(pack.score_quality, ScoreQuality::Structured);
        assert_eq!(pack.vulnerabilities[0].cvss_score, Some(9.8));
        assert_eq!(pack.vulnerabilities[0].severity, Severity::Critical);
    }

    #[test]
    fn test_severity_label_fallback() {
        let mut v = vuln("GHSA-2");
        v.database_specific = Some(serde_json::json!({"severity": "HIGH"}));
        let pack = to_package_vulns(vec![v], "1.0.0");
        assert_eq!(pack.score_quality, ScoreQuality::LabelOnly);
        assert_eq!(pack.vulnerabilities[0].severity, Severity::High);
        assert_eq!(pack.vulnerabilities[0].cvss_score, None);
    }

    #[test]
    fn test_unscored_defaults_medium() {
        let pack = to_package_vulns(vec![vuln("OSV-3")], "1.0.0");
        assert_eq!(pack.score_quality, ScoreQuality::Unscored);
        assert_eq!(pack.vulnerabilities[0].severity, Severity::Medium);
    }

    #[test]
    fn test_status_from_affected_and_fixes() {
        let mut active = vuln("A");
        active.affected = vec![semver_range("0", Some("2.0.0"))];
        let pack = to_package_vulns(vec![active], "1.0.0");
        assert_eq!(pack.vulnerabilities[0].status, VulnStatus::Active);

        let mut fixed = vuln("B");
        fixed.affected = vec![semver_range("0", Some("2.0.0"))];
        let pack = to_package_vulns(vec![fixed], "2.1.0");
        assert_eq!(pack.vulnerabilities[0].status, VulnStatus::Fixed);
        assert_eq!(
            pack.vulnerabilities[0].fixed_versions,
            vec!["2.0.0".to_string()]
        );
    }

    #[test]
    fn test_severity_bucket_boundaries() {
        for (score, expected) in [
            (3.9, Severity::Low),
            (4.0, Severity::Medium),
            (6.9, Severity::Medium),
            (7.0, Severity::High),
            (8.9, Severity::High),
            (9.0, Severity::Critical),
        ] {
            let mut v = vuln("X");
            v.severity = vec![OsvSeverity {
                severity_type: "CVSS_V3".to_string(),
                score: score.to_string(),
            }];
            let pack = to_package_vulns(vec![v], "1.0.0");
            assert_eq!(pack.vulnerabilities[0].severity, expected, "score {score}");
        }
    }
}
