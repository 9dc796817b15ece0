//! Specialist analysis stages
//!
//! The closed set of five stages the orchestrator sequences. Each stage is
//! a request–response function over the shared context: it reads, fans out
//! through the clients, and returns its typed payload. Registration is
//! explicit at orchestrator construction; there is no dynamic discovery.

pub mod code;
pub mod reputation;
pub mod supply_chain;
pub mod synthesis;
pub mod vulnerability;

use crate::context::{Services, SharedContext};
use async_trait::async_trait;
use chainscan_core::{ChainscanConfig, PackageRef, ScanError, StageData, StageStatus};
use std::time::Duration;

pub const VULNERABILITY: &str = "vulnerability_analysis";
pub const REPUTATION: &str = "reputation_analysis";
pub const CODE: &str = "code_analysis";
pub const SUPPLY_CHAIN: &str = "supply_chain_analysis";
pub const SYNTHESIS: &str = "synthesis";

/// Stages the degradation ladder treats as required
pub const REQUIRED_STAGES: &[&str] = &[VULNERABILITY, REPUTATION, SYNTHESIS];

/// What a stage hands back on completion
pub struct StageOutput {
    pub data: StageData,
    pub confidence: f64,
    /// Packages to add to the run's high-risk set (additive only)
    pub high_risk: Vec<PackageRef>,
    /// `Success` unless the stage degraded in a way worth surfacing
    pub status: StageStatus,
}

impl StageOutput {
    pub fn success(data: StageData, confidence: f64) -> Self {
        Self {
            data,
            confidence,
            high_risk: Vec::new(),
            status: StageStatus::Success,
        }
    }

    pub fn with_high_risk(mut self, packages: Vec<PackageRef>) -> Self {
        self.high_risk = packages;
        self
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn deadline(&self, config: &ChainscanConfig) -> Duration;

    /// Conditional stages answer false to be recorded as skipped
    fn should_run(&self, _ctx: &SharedContext) -> bool {
        true
    }

    async fn execute(
        &self,
        ctx: &SharedContext,
        services: &Services,
    ) -> Result<StageOutput, ScanError>;
}

/// The production stage set, in execution order
pub fn default_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(vulnerability::VulnerabilityStage),
        Box::new(reputation::ReputationStage),
        Box::new(code::CodeStage),
        Box::new(supply_chain::SupplyChainStage),
        Box::new(synthesis::SynthesisStage),
    ]
}
