//! chainscan: supply-chain risk analysis for npm and PyPI projects
//!
//! A hybrid analysis engine: a deterministic rule layer (install-script
//! patterns, malicious-package lookup, typosquat detection) followed by a
//! five-stage pipeline (vulnerability, reputation, code, supply-chain,
//! synthesis) that fans out across the registries and OSV with bounded
//! concurrency and degrades gracefully when the network does not
//! cooperate. The output is a package-centric JSON report.

pub mod cli;
pub mod commands;
