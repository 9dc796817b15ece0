//! Multi-stage orchestrator
//!
//! Runs the registered stages under a strict sequential protocol: one stage
//! at a time, each under its own deadline, with at most two retries (1 s
//! backoff, doubling) on transient network failure. Timeouts and permanent
//! failures produce a failed stage result and the run proceeds; a failed
//! required stage leaves a schema-valid empty payload so synthesis can
//! still assemble. Parallelism lives inside stages, never between them.

use crate::context::{Services, SharedContext};
use crate::report;
use crate::stages::{default_stages, Stage, SYNTHESIS};
use chainscan_core::{Report, ScanError, StageData, StageError, StageResult, StageStatus};
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const MAX_RETRIES: u32 = 2;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

pub struct Orchestrator {
    stages: Vec<Box<dyn Stage>>,
}

impl Orchestrator {
    /// The production five-stage pipeline
    pub fn new() -> Self {
        Self {
            stages: default_stages(),
        }
    }

    /// Explicit stage registration, used by tests and embedders
    pub fn with_stages(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Execute all stages in order and assemble the final report.
    /// Never fails: degradation is expressed inside the report.
    pub async fn run(
        &self,
        ctx: &mut SharedContext,
        services: &Services,
        started_at: DateTime<Utc>,
    ) -> Report {
        for stage in &self.stages {
            if ctx.cancel.is_cancelled() {
                warn!("run cancelled; skipping remaining stages");
                break;
            }
            let name = stage.name();
            if ctx.stage_results.contains_key(name) {
                // pre-seeded by the caller (e.g. vulnerability queries
                // disabled for the run); honour it
                info!(stage = name, "result pre-seeded, not re-running");
                continue;
            }
            if !stage.should_run(ctx) {
                info!(stage = name, "condition not met, skipped");
                ctx.stage_results
                    .insert(name.to_string(), StageResult::skipped(name));
                continue;
            }

            info!(stage = name, "starting");
            let (result, high_risk) = self.run_stage(stage.as_ref(), ctx, services).await;
            info!(
                stage = name,
                status = ?result.status,
                duration = result.duration_seconds,
                "finished"
            );
            ctx.mark_high_risk(high_risk);
            ctx.stage_results.insert(name.to_string(), result);
        }

        let mut report = match ctx.stage(SYNTHESIS).map(|r| &r.data) {
            Some(StageData::Synthesis { report }) => (**report).clone(),
            // synthesis failed or never ran: the deterministic assembler
            // still produces a valid artefact from whatever completed
            _ => report::assemble(ctx, started_at),
        };
        report::finalize(&mut report, ctx, started_at);
        report
    }

    async fn run_stage(
        &self,
        stage: &dyn Stage,
        ctx: &SharedContext,
        services: &Services,
    ) -> (StageResult, Vec<chainscan_core::PackageRef>) {
        let deadline = stage.deadline(&services.config);
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0u32;

        loop {
            match tokio::time::timeout(deadline, stage.execute(ctx, services)).await {
                Ok(Ok(output)) => {
                    let success = output.status == StageStatus::Success;
                    return (
                        StageResult {
                            stage_name: stage.name().to_string(),
                            success,
                            started_at,
                            duration_seconds: clock.elapsed().as_secs_f64(),
                            confidence: output.confidence,
                            data: output.data,
                            error: None,
                            status: output.status,
                        },
                        output.high_risk,
                    );
                }
                Ok(Err(e)) if e.is_transient() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    warn!(
                        stage = stage.name(),
                        attempt, "transient failure, backing off: {e}"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Ok(Err(e)) => {
                    return (
                        failed_result(stage.name(), started_at, clock, StageStatus::Failed, &e),
                        Vec::new(),
                    );
                }
                Err(_elapsed) => {
                    // deadline expired; no retry for timeouts
                    let e = ScanError::NetworkTransient(format!(
                        "stage deadline of {deadline:?} expired"
                    ));
                    return (
                        failed_result(stage.name(), started_at, clock, StageStatus::Timeout, &e),
                        Vec::new(),
                    );
                }
            }
        }
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

fn failed_result(
    name: &str,
    started_at: DateTime<Utc>,
    clock: Instant,
    status: StageStatus,
    error: &ScanError,
) -> StageResult {
    StageResult {
        stage_name: name.to_string(),
        success: false,
        started_at,
        duration_seconds: clock.elapsed().as_secs_f64(),
        confidence: 0.0,
        // schema-valid empty payload so synthesis can still run
        data: StageData::Empty,
        error: Some(StageError {
            kind: error.kind(),
            message: error.to_string(),
        }),
        status,
    }
}
