//! Command-line interface definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "chainscan", version, about = "Supply-chain risk analysis for npm and PyPI projects")]
pub struct Cli {
    /// Path to chainscan.toml (defaults to ./chainscan.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Analyse a project directory or repository URL
    Scan(ScanArgs),
    /// Inspect or maintain the analysis cache
    Cache(CacheArgs),
    /// Resolve a project's dependency graph and print it as DOT
    Graph(GraphArgs),
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Local directory or remote repository URL
    pub target: String,

    /// Ecosystem to analyse when more than one manifest is present
    #[arg(long)]
    pub ecosystem: Option<String>,

    /// Skip external vulnerability queries
    #[arg(long)]
    pub offline: bool,

    /// Run with a fresh in-memory cache
    #[arg(long)]
    pub no_cache: bool,

    /// Output directory for the report artefact
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Maximum transitive resolution depth
    #[arg(long)]
    pub max_depth: Option<usize>,

    /// Drop findings below this confidence from the report
    #[arg(long, default_value_t = 0.0)]
    pub confidence_threshold: f64,

    /// Token for cloning private repositories
    #[arg(long, env = "CHAINSCAN_SCM_TOKEN")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Hit/miss counters, entry count, and size on disk
    Stats,
    /// Remove expired entries
    Prune,
    /// Drop every entry in one namespace
    Purge { namespace: String },
}

#[derive(Debug, Args)]
pub struct GraphArgs {
    /// Local project directory
    pub target: PathBuf,

    #[arg(long)]
    pub ecosystem: Option<String>,

    /// Depth cap for the rendered graph
    #[arg(long, default_value_t = 3)]
    pub depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_args_parse() {
        let cli = Cli::parse_from(["chainscan", "scan", ".", "--offline", "--ecosystem", "npm"]);
        match cli.command {
            Command::Scan(args) => {
                assert_eq!(args.target, ".");
                assert!(args.offline);
                assert_eq!(args.ecosystem.as_deref(), Some("npm"));
            }
            _ => panic!("expected scan"),
        }
    }

    #[test]
    fn test_cache_purge_parse() {
        let cli = Cli::parse_from(["chainscan", "cache", "purge", "osv"]);
        match cli.command {
            Command::Cache(args) => match args.command {
                CacheCommand::Purge { namespace } => assert_eq!(namespace, "osv"),
                _ => panic!("expected purge"),
            },
            _ => panic!("expected cache"),
        }
    }
}
