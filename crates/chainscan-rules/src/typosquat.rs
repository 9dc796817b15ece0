//! Typosquat detection
//!
//! Compares each package name against the ecosystem's popular list using
//! Damerau-Levenshtein distance, so a single transposition ("reqeusts")
//! counts as one edit. Distance 1 or 2 flags the package unless the name
//! is itself on the popular list.

use crate::SOURCE;
use chainscan_core::{DetectionMethod, Finding, PackageRef, Severity};
use strsim::damerau_levenshtein;

pub fn check(package: &PackageRef, popular: &[&str]) -> Option<Finding> {
    let name = package.normalized().name;
    if name.len() < 3 || popular.contains(&name.as_str()) {
        return None;
    }

    let (candidate, distance) = popular
        .iter()
        .map(|p| (*p, damerau_levenshtein(&name, p)))
        .min_by_key(|(_, d)| *d)?;
    if !(1..=2).contains(&distance) {
        return None;
    }

    Some(Finding {
        package: package.clone(),
        finding_type: "typosquat".to_string(),
        severity: Severity::Medium,
        confidence: if distance == 1 { 0.7 } else { 0.5 },
        evidence: vec![
            format!("'{}' resembles the popular package '{}'", package.name, candidate),
            format!("edit distance {distance}"),
        ],
        source: SOURCE.to_string(),
        recommendation: Some(format!(
            "Verify the intended package; did you mean '{candidate}'?"
        )),
        references: vec![],
        detection_method: DetectionMethod::RuleBased,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainscan_core::Ecosystem;

    const POPULAR: &[&str] = &["requests", "lodash", "express", "numpy"];

    fn pypi(name: &str) -> PackageRef {
        PackageRef::new(name, "1.0.0", Ecosystem::PyPi)
    }

    #[test]
    fn test_transposition_is_distance_one() {
        let finding = check(&pypi("reqeusts"), POPULAR).unwrap();
        assert_eq!(finding.severity, Severity::Medium);
        assert!(finding.evidence.iter().any(|e| e.contains("requests")));
        assert!(finding.evidence.iter().any(|e| e.contains("edit distance 1")));
    }

    #[test]
    fn test_two_edits_flagged_lower_confidence() {
        let one = check(&pypi("request"), POPULAR).unwrap();
        let two = check(&pypi("reqest"), POPULAR).unwrap();
        assert!(one.confidence > two.confidence);
    }

    #[test]
    fn test_popular_name_itself_clean() {
        assert!(check(&pypi("requests"), POPULAR).is_none());
    }

    #[test]
    fn test_distant_name_clean() {
        assert!(check(&pypi("completely-unrelated"), POPULAR).is_none());
    }

    #[test]
    fn test_short_names_ignored() {
        // two-character names are all near everything; not meaningful
        assert!(check(&pypi("np"), POPULAR).is_none());
    }
}
