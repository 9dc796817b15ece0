//! Reputation stage
//!
//! Scores each package on four factors (age, downloads, author,
//! maintenance) weighted 0.30/0.30/0.20/0.20. Factors the registry cannot
//! answer are dropped and the weights renormalised; confidence tracks how
//! many factors were available. Risk level is derived from the score.

use super::{Stage, StageOutput, REPUTATION};
use crate::context::{Services, SharedContext};
use async_trait::async_trait;
use chainscan_core::{
    ChainscanConfig, PackageRef, ReputationAssessment, ReputationFactors, ReputationFlag,
    RiskLevel, ScanError, StageData,
};
use chainscan_registry::{FetchOutcome, PackageMetadata, PackageTimeline};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tracing::info;

pub struct ReputationStage;

#[async_trait]
impl Stage for ReputationStage {
    fn name(&self) -> &'static str {
        REPUTATION
    }

    fn deadline(&self, config: &ChainscanConfig) -> Duration {
        Duration::from_secs(config.stages.reputation)
    }

    async fn execute(
        &self,
        ctx: &SharedContext,
        services: &Services,
    ) -> Result<StageOutput, ScanError> {
        let refs = ctx.packages();
        let total = refs.len();

        let fetched: Vec<(PackageRef, Result<AssessmentInputs, ScanError>)> =
            stream::iter(refs.into_iter())
                .map(|package| {
                    let cancel = ctx.cancel.clone();
                    async move {
                        if cancel.is_cancelled() {
                            return (package, Err(ScanError::Cancelled));
                        }
                        let inputs = fetch_inputs(services, &package).await;
                        (package, inputs)
                    }
                })
                .buffer_unordered(services.config.worker_pool_size.max(1))
                .collect()
                .await;

        ctx.cancel.check()?;

        let mut assessments = Vec::new();
        let mut failures = 0usize;
        for (package, inputs) in fetched {
            match inputs {
                Ok(inputs) => assessments.push(assess(package, &inputs)),
                Err(ScanError::Cancelled) => return Err(ScanError::Cancelled),
                Err(_) => failures += 1,
            }
        }

        if total > 0 && assessments.is_empty() {
            return Err(ScanError::NetworkTransient(format!(
                "all {failures} reputation lookups failed"
            )));
        }

        let high_risk: Vec<PackageRef> = assessments
            .iter()
            .filter(|a| a.risk_level == RiskLevel::High)
            .map(|a| a.package.clone())
            .collect();
        let confidence = if assessments.is_empty() {
            0.5
        } else {
            assessments.iter().map(|a| a.confidence).sum::<f64>() / assessments.len() as f64
        };

        info!(
            assessed = assessments.len(),
            failures, "reputation stage complete"
        );
        Ok(
            StageOutput::success(StageData::Reputation { assessments }, confidence)
                .with_high_risk(high_risk),
        )
    }
}

struct AssessmentInputs {
    metadata: Option<PackageMetadata>,
    timeline: Option<PackageTimeline>,
}

async fn fetch_inputs(
    services: &Services,
    package: &PackageRef,
) -> Result<AssessmentInputs, ScanError> {
    let metadata = match services
        .registry
        .fetch_metadata(&package.name, &package.version, package.ecosystem)
        .await?
    {
        FetchOutcome::Found(m) => Some(m),
        FetchOutcome::NotFound => None,
    };
    // the timeline is a second, cacheable document; a failure here only
    // costs the age/maintenance factors
    let timeline = services
        .registry
        .fetch_timeline(&package.name, package.ecosystem)
        .await
        .unwrap_or(None);
    Ok(AssessmentInputs { metadata, timeline })
}

const WEIGHT_AGE: f64 = 0.30;
const WEIGHT_DOWNLOADS: f64 = 0.30;
const WEIGHT_AUTHOR: f64 = 0.20;
const WEIGHT_MAINTENANCE: f64 = 0.20;
const FLAG_THRESHOLD: f64 = 0.5;

fn assess(package: PackageRef, inputs: &AssessmentInputs) -> ReputationAssessment {
    let age = age_score(inputs);
    let downloads = downloads_score(inputs);
    let author = author_score(inputs);
    let maintenance = maintenance_score(inputs);

    let factors: [(Option<f64>, f64); 4] = [
        (age, WEIGHT_AGE),
        (downloads, WEIGHT_DOWNLOADS),
        (author, WEIGHT_AUTHOR),
        (maintenance, WEIGHT_MAINTENANCE),
    ];
    let available = factors.iter().filter(|(f, _)| f.is_some()).count();
    let weight_sum: f64 = factors
        .iter()
        .filter(|(f, _)| f.is_some())
        .map(|(_, w)| w)
        .sum();
    let score = if weight_sum > 0.0 {
        factors
            .iter()
            .filter_map(|(f, w)| f.map(|f| f * w))
            .sum::<f64>()
            / weight_sum
    } else {
        // nothing known; middling score, low confidence
        0.5
    };

    let confidence = match available {
        4 => 1.0,
        3 => 0.75,
        2 => 0.5,
        _ => 0.3,
    };

    let mut flags = Vec::new();
    if age.map(|v| v < FLAG_THRESHOLD).unwrap_or(false) {
        flags.push(ReputationFlag::NewPackage);
    }
    if downloads.map(|v| v < FLAG_THRESHOLD).unwrap_or(false) {
        flags.push(ReputationFlag::LowDownloads);
    }
    if author.map(|v| v < FLAG_THRESHOLD).unwrap_or(false) {
        flags.push(ReputationFlag::UnknownAuthor);
    }
    if maintenance.map(|v| v < FLAG_THRESHOLD).unwrap_or(false) {
        flags.push(ReputationFlag::Unmaintained);
    }

    ReputationAssessment {
        package,
        score,
        factors: ReputationFactors {
            age: age.unwrap_or(0.0),
            downloads: downloads.unwrap_or(0.0),
            author: author.unwrap_or(0.0),
            maintenance: maintenance.unwrap_or(0.0),
        },
        flags,
        risk_level: RiskLevel::from_score(score),
        confidence,
    }
}

fn age_score(inputs: &AssessmentInputs) -> Option<f64> {
    let created = inputs
        .timeline
        .as_ref()
        .and_then(|t| t.created_at)
        .or_else(|| inputs.metadata.as_ref().and_then(|m| m.published_at))?;
    let days = (Utc::now() - created).num_days();
    Some(match days {
        d if d < 30 => 0.1,
        d if d < 90 => 0.3,
        d if d < 365 => 0.6,
        d if d < 730 => 0.8,
        _ => 1.0,
    })
}

fn downloads_score(inputs: &AssessmentInputs) -> Option<f64> {
    let weekly = inputs.metadata.as_ref().and_then(|m| m.weekly_downloads)?;
    Some(match weekly {
        w if w >= 1_000_000 => 1.0,
        w if w >= 100_000 => 0.8,
        w if w >= 10_000 => 0.6,
        w if w >= 1_000 => 0.4,
        _ => 0.2,
    })
}

fn author_score(inputs: &AssessmentInputs) -> Option<f64> {
    let metadata = inputs.metadata.as_ref()?;
    let maintainers = metadata.maintainers.len();
    let base: f64 = match maintainers {
        0 => 0.1,
        1 => 0.5,
        2 => 0.8,
        _ => 1.0,
    };
    // a public repository is weak evidence of a real project
    let bonus = if metadata.repository.is_some() { 0.1 } else { 0.0 };
    Some((base + bonus).min(1.0))
}

fn maintenance_score(inputs: &AssessmentInputs) -> Option<f64> {
    if inputs.metadata.as_ref().map(|m| m.deprecated).unwrap_or(false) {
        return Some(0.0);
    }
    let last_release = inputs
        .timeline
        .as_ref()
        .and_then(|t| t.releases.last())
        .and_then(|r| r.released_at)?;
    let days = (Utc::now() - last_release).num_days();
    Some(match days {
        d if d < 90 => 1.0,
        d if d < 365 => 0.7,
        d if d < 730 => 0.4,
        _ => 0.1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainscan_core::Ecosystem;
    use chainscan_registry::VersionRelease;
    use chrono::Duration as ChronoDuration;

    fn pkg() -> PackageRef {
        PackageRef::new("demo", "1.0.0", Ecosystem::Npm)
    }

    fn metadata(maintainers: usize, downloads: Option<u64>, deprecated: bool) -> PackageMetadata {
        PackageMetadata {
            package: pkg(),
            description: None,
            published_at: None,
            maintainers: (0..maintainers).map(|i| format!("m{i}")).collect(),
            weekly_downloads: downloads,
            dependencies: vec![],
            deprecated,
            repository: None,
            latest_version: None,
        }
    }

    fn timeline(age_days: i64, last_release_days: i64) -> PackageTimeline {
        let now = Utc::now();
        PackageTimeline {
            name: "demo".to_string(),
            releases: vec![VersionRelease {
                version: "1.0.0".to_string(),
                released_at: Some(now - ChronoDuration::days(last_release_days)),
            }],
            created_at: Some(now - ChronoDuration::days(age_days)),
            latest_version: Some("1.0.0".to_string()),
            current_maintainers: vec![],
            previous_maintainers: vec![],
            latest_dependencies: vec![],
            previous_dependencies: vec![],
        }
    }

    #[test]
    fn test_established_package_trusted() {
        let inputs = AssessmentInputs {
            metadata: Some(metadata(3, Some(2_000_000), false)),
            timeline: Some(timeline(1500, 20)),
        };
        let a = assess(pkg(), &inputs);
        assert_eq!(a.confidence, 1.0);
        assert_eq!(a.risk_level, RiskLevel::Trusted);
        assert!(a.flags.is_empty());
    }

    #[test]
    fn test_brand_new_single_author_package_risky() {
        let inputs = AssessmentInputs {
            metadata: Some(metadata(1, Some(50), false)),
            timeline: Some(timeline(10, 5)),
        };
        let a = assess(pkg(), &inputs);
        assert!(a.score < 0.6, "score was {}", a.score);
        assert!(a.flags.contains(&ReputationFlag::NewPackage));
        assert!(a.flags.contains(&ReputationFlag::LowDownloads));
    }

    #[test]
    fn test_missing_factors_lower_confidence() {
        // no downloads, no timeline: only the author factor remains
        let inputs = AssessmentInputs {
            metadata: Some(metadata(2, None, false)),
            timeline: None,
        };
        let a = assess(pkg(), &inputs);
        assert!(a.confidence <= 0.5);
    }

    #[test]
    fn test_deprecated_package_unmaintained() {
        let inputs = AssessmentInputs {
            metadata: Some(metadata(2, Some(500_000), true)),
            timeline: Some(timeline(2000, 1000)),
        };
        let a = assess(pkg(), &inputs);
        assert!(a.flags.contains(&ReputationFlag::Unmaintained));
        assert_eq!(a.factors.maintenance, 0.0);
    }

    #[test]
    fn test_score_within_bounds() {
        let inputs = AssessmentInputs {
            metadata: None,
            timeline: None,
        };
        let a = assess(pkg(), &inputs);
        assert!((0.0..=1.0).contains(&a.score));
        assert!((0.0..=1.0).contains(&a.confidence));
    }
}
