//! Core types for chainscan
//!
//! This crate holds the data model shared by every other chainscan crate:
//! - Package identity and the closed ecosystem set
//! - Findings, vulnerabilities, and reputation assessments
//! - Stage results with tagged per-stage payloads
//! - The package-centric report schema
//! - Configuration, error kinds, and the run-wide cancellation token

pub mod cancel;
pub mod config;
pub mod error;
pub mod model;
pub mod pool;
pub mod report;

pub use cancel::CancellationToken;
pub use pool::WorkerPool;
pub use config::ChainscanConfig;
pub use error::{ErrorKind, ScanError};
pub use model::{
    AttackLikelihood, DetectionMethod, Ecosystem, Finding, PackageRef, ReputationAssessment,
    ReputationFactors, ReputationFlag, RiskLevel, Severity, StageData, StageError, StageResult,
    StageStatus, TriState, VulnStatus, Vulnerability,
};
pub use report::Report;
