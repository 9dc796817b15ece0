//! Vulnerability stage
//!
//! Queries OSV for every package in the graph through the bounded batch
//! client. Per-package confidence reflects the scoring quality of what OSV
//! returned; combined package risk is the maximum severity, promoted one
//! level when three or more high-or-above vulnerabilities pile up.

use super::{Stage, StageOutput, VULNERABILITY};
use crate::context::{Services, SharedContext};
use async_trait::async_trait;
use chainscan_advisories::{BatchStatus, ScoreQuality};
use chainscan_core::{
    ChainscanConfig, PackageRef, ScanError, Severity, StageData, StageStatus,
    model::PackageVulnerabilities,
};
use std::time::Duration;
use tracing::info;

pub struct VulnerabilityStage;

#[async_trait]
impl Stage for VulnerabilityStage {
    fn name(&self) -> &'static str {
        VULNERABILITY
    }

    fn deadline(&self, config: &ChainscanConfig) -> Duration {
        Duration::from_secs(config.stages.vulnerability)
    }

    async fn execute(
        &self,
        ctx: &SharedContext,
        services: &Services,
    ) -> Result<StageOutput, ScanError> {
        let refs = ctx.packages();
        let batch = services.osv.query_batch(&refs, &ctx.cancel).await?;

        if batch.status == BatchStatus::Offline {
            return Ok(StageOutput {
                data: StageData::Vulnerability { packages: vec![] },
                confidence: 0.0,
                high_risk: vec![],
                status: StageStatus::Offline,
            });
        }

        let mut packages: Vec<PackageVulnerabilities> = Vec::new();
        let mut errors = 0usize;
        for (package, outcome) in batch.results {
            match outcome {
                Ok(vulns) if vulns.vulnerabilities.is_empty() => {}
                Ok(vulns) => {
                    let confidence = match vulns.score_quality {
                        ScoreQuality::Structured => 0.95,
                        ScoreQuality::Unscored => 0.8,
                        ScoreQuality::LabelOnly => 0.7,
                    };
                    packages.push(PackageVulnerabilities {
                        combined_risk: combined_risk(&vulns.vulnerabilities),
                        package,
                        vulnerabilities: vulns.vulnerabilities,
                        confidence,
                    });
                }
                Err(_) => errors += 1,
            }
        }

        if errors > 0 && packages.is_empty() && errors == refs.len() {
            return Err(ScanError::NetworkTransient(format!(
                "all {errors} vulnerability queries failed"
            )));
        }

        let high_risk: Vec<PackageRef> = packages
            .iter()
            .filter(|p| p.combined_risk >= Severity::High)
            .map(|p| p.package.clone())
            .collect();

        let confidence = if packages.is_empty() {
            0.9
        } else {
            packages.iter().map(|p| p.confidence).sum::<f64>() / packages.len() as f64
        };

        info!(
            vulnerable = packages.len(),
            query_errors = errors,
            "vulnerability stage complete"
        );
        Ok(StageOutput::success(
            StageData::Vulnerability { packages },
            confidence,
        )
        .with_high_risk(high_risk))
    }
}

/// Max severity, promoted once when ≥3 high-or-above findings are present
fn combined_risk(vulns: &[chainscan_core::Vulnerability]) -> Severity {
    let max = vulns
        .iter()
        .map(|v| v.severity)
        .max()
        .unwrap_or(Severity::Info);
    let high_count = vulns
        .iter()
        .filter(|v| v.severity >= Severity::High)
        .count();
    if high_count >= 3 {
        max.promote()
    } else {
        max
    }
}
