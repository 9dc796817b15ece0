//! Synthesis stage
//!
//! Aggregates every finished stage result into the report. The
//! deterministic assembler is the source of truth; the LLM variant is only
//! attempted for small runs (≤ 50 packages) with a configured endpoint, and
//! only used when its output validates against the report schema.

use super::{Stage, StageOutput, SYNTHESIS};
use crate::context::{Services, SharedContext};
use crate::report;
use async_trait::async_trait;
use chainscan_core::{ChainscanConfig, ScanError, StageData};
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info};

/// Above this package count synthesis never consults the LLM
pub const LLM_PACKAGE_LIMIT: usize = 50;

pub struct SynthesisStage;

#[async_trait]
impl Stage for SynthesisStage {
    fn name(&self) -> &'static str {
        SYNTHESIS
    }

    fn deadline(&self, config: &ChainscanConfig) -> Duration {
        Duration::from_secs(config.stages.synthesis)
    }

    async fn execute(
        &self,
        ctx: &SharedContext,
        services: &Services,
    ) -> Result<StageOutput, ScanError> {
        let started_at = Utc::now();
        let deterministic = report::assemble(ctx, started_at);

        let package_count = ctx.packages().len();
        let report = if package_count <= LLM_PACKAGE_LIMIT {
            match &services.llm {
                Some(llm) => {
                    let digest = serde_json::json!({
                        "summary": deterministic.summary,
                        "packages": deterministic.packages,
                        "vulnerabilities": deterministic.vulnerabilities,
                    });
                    match llm.synthesize_report(&digest, &ctx.cancel).await {
                        Some(validated) => {
                            debug!("using validated model-synthesised report");
                            validated
                        }
                        None => deterministic,
                    }
                }
                None => deterministic,
            }
        } else {
            debug!(package_count, "package count above limit; deterministic synthesis");
            deterministic
        };

        info!(
            packages = report.packages.len(),
            vulnerabilities = report.vulnerabilities.len(),
            "synthesis complete"
        );
        Ok(StageOutput::success(
            StageData::Synthesis {
                report: Box::new(report),
            },
            0.9,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testutil::context_with_packages;
    use chainscan_cache::{AnalysisCache, MemoryStore};
    use chainscan_core::ChainscanConfig;
    use std::sync::Arc;

    fn services() -> Services {
        Services::new(
            ChainscanConfig::default(),
            Arc::new(AnalysisCache::new(Box::new(MemoryStore::new(1 << 20)))),
        )
    }

    #[tokio::test]
    async fn test_deterministic_synthesis_without_llm() {
        let ctx = context_with_packages(&[("a", "1.0.0"), ("b", "2.0.0")]);
        let output = SynthesisStage.execute(&ctx, &services()).await.unwrap();
        match output.data {
            StageData::Synthesis { report } => {
                assert_eq!(report.summary.total_packages, 2);
            }
            other => panic!("unexpected stage data: {other:?}"),
        }
    }

    #[test]
    fn test_always_runs() {
        let ctx = context_with_packages(&[]);
        assert!(SynthesisStage.should_run(&ctx));
    }
}
