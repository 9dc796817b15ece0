//! Code-analysis stage
//!
//! Conditional: runs only when an earlier layer produced a high-risk signal
//! (malicious match, obfuscation evidence, reputation below 0.4). Scans the
//! script and source material the ecosystem exposes locally (manifest
//! scripts plus project source files) for two pattern families:
//! obfuscation and suspicious behaviour. A complexity summary accompanies
//! each report. When local evidence is ambiguous and an LLM endpoint is
//! configured, a deeper assessment is requested; any failure there degrades
//! silently back to the pattern evidence.

use super::{Stage, StageOutput, CODE, REPUTATION};
use crate::context::{Services, SharedContext};
use async_trait::async_trait;
use chainscan_core::model::{CodeReport, ComplexitySummary};
use chainscan_core::{
    ChainscanConfig, DetectionMethod, Ecosystem, Finding, PackageRef, ScanError, Severity,
    StageData,
};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

pub const SOURCE: &str = "code_analysis";

const MAX_FILES: usize = 40;
const MAX_FILE_BYTES: u64 = 200 * 1024;
const AMBIGUOUS_CONFIDENCE: f64 = 0.6;

pub struct CodeStage;

lazy_static! {
    static ref OBFUSCATION: Vec<(Regex, &'static str, Severity)> = vec![
        (
            Regex::new(r#"(Buffer\.from|atob|base64\.b64decode)\s*\([^)]*\)[^\n]*(eval|exec|Function|spawn)"#).unwrap(),
            "base64 decode feeding execution",
            Severity::High,
        ),
        (
            Regex::new(r"\beval\s*\(|new\s+Function\s*\(").unwrap(),
            "dynamic code evaluation",
            Severity::Medium,
        ),
        (
            Regex::new(r"\bexec\s*\(|child_process|subprocess\.|os\.system").unwrap(),
            "dynamic process execution",
            Severity::Medium,
        ),
        (
            Regex::new(r"String\.fromCharCode\s*\(|(\\x[0-9a-fA-F]{2}){10,}").unwrap(),
            "character-code or hex obfuscation",
            Severity::Medium,
        ),
    ];

    static ref SUSPICIOUS: Vec<(Regex, &'static str, Severity)> = vec![
        (
            Regex::new(r"https?://[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}|net\.connect|socket\.socket").unwrap(),
            "network access",
            Severity::Medium,
        ),
        (
            Regex::new(r"fs\.(unlink|rm|writeFile)Sync?\s*\(|shutil\.rmtree|open\s*\([^)]*['\x22]w").unwrap(),
            "filesystem modification",
            Severity::Low,
        ),
        (
            Regex::new(r"spawn\s*\(|execSync|Popen").unwrap(),
            "process spawn",
            Severity::Medium,
        ),
        (
            Regex::new(r"process\.env\b|os\.environ").unwrap(),
            "environment variable access",
            Severity::Low,
        ),
        (
            Regex::new(r"crypto\.createCipher|Crypto\.Cipher|createDecipher").unwrap(),
            "cryptographic primitives",
            Severity::Low,
        ),
    ];
}

#[async_trait]
impl Stage for CodeStage {
    fn name(&self) -> &'static str {
        CODE
    }

    fn deadline(&self, config: &ChainscanConfig) -> Duration {
        Duration::from_secs(config.stages.code)
    }

    fn should_run(&self, ctx: &SharedContext) -> bool {
        if !ctx.high_risk.is_empty() {
            return true;
        }
        let rule_signal = ctx.rule_findings.iter().any(|f| {
            f.finding_type == "malicious_package" || f.finding_type == "obfuscation"
        });
        if rule_signal {
            return true;
        }
        ctx.stage(REPUTATION)
            .map(|r| match &r.data {
                StageData::Reputation { assessments } => {
                    assessments.iter().any(|a| a.score < 0.4)
                }
                _ => false,
            })
            .unwrap_or(false)
    }

    async fn execute(
        &self,
        ctx: &SharedContext,
        services: &Services,
    ) -> Result<StageOutput, ScanError> {
        let mut findings: Vec<Finding> = Vec::new();
        let mut complexity = ComplexitySummary::default();

        for script in &ctx.manifest.scripts {
            ctx.cancel.check()?;
            findings.extend(scan_snippet(
                &ctx.root_package,
                &format!("manifest script `{}`", script.hook),
                &script.command,
            ));
        }

        for (label, content) in collect_sources(&ctx.target, ctx.ecosystem, &ctx.cancel)? {
            findings.extend(scan_snippet(&ctx.root_package, &label, &content));
            merge_complexity(&mut complexity, &measure_complexity(&content));
        }

        // deeper pass on ambiguous evidence, best effort only
        if let Some(llm) = &services.llm {
            let ambiguous: Vec<&Finding> = findings
                .iter()
                .filter(|f| f.confidence < AMBIGUOUS_CONFIDENCE)
                .collect();
            if !ambiguous.is_empty() {
                if let Some(note) = llm.assess_code_findings(&ambiguous, &ctx.cancel).await {
                    debug!("attached model assessment to ambiguous code findings");
                    for finding in findings
                        .iter_mut()
                        .filter(|f| f.confidence < AMBIGUOUS_CONFIDENCE)
                    {
                        finding.evidence.push(format!("assistant review: {note}"));
                    }
                }
            }
        }

        let high_risk: Vec<PackageRef> = if findings.iter().any(|f| f.severity >= Severity::High) {
            vec![ctx.root_package.clone()]
        } else {
            vec![]
        };

        let confidence = if findings.is_empty() {
            0.9
        } else {
            findings.iter().map(|f| f.confidence).sum::<f64>() / findings.len() as f64
        };

        let report = CodeReport {
            package: ctx.root_package.clone(),
            findings,
            complexity,
        };
        info!(
            findings = report.findings.len(),
            lines = report.complexity.lines,
            "code stage complete"
        );
        Ok(StageOutput::success(
            StageData::Code {
                reports: vec![report],
            },
            confidence,
        )
        .with_high_risk(high_risk))
    }
}

fn scan_snippet(package: &PackageRef, where_found: &str, content: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    for (family, table, base_confidence) in [
        ("obfuscation", &*OBFUSCATION, 0.7),
        ("suspicious_behaviour", &*SUSPICIOUS, 0.5),
    ] {
        for (re, label, severity) in table.iter() {
            if let Some(m) = re.find(content) {
                findings.push(Finding {
                    package: package.clone(),
                    finding_type: family.to_string(),
                    severity: *severity,
                    confidence: base_confidence,
                    evidence: vec![
                        format!("{where_found}: {label}"),
                        format!("matched `{}`", truncate(m.as_str(), 120)),
                    ],
                    source: SOURCE.to_string(),
                    recommendation: None,
                    references: vec![],
                    detection_method: DetectionMethod::AgentBased,
                });
            }
        }
    }
    findings
}

/// Source files the ecosystem exposes under the target, bounded in count,
/// size, and directory depth
fn collect_sources(
    target: &Path,
    ecosystem: Ecosystem,
    cancel: &chainscan_core::CancellationToken,
) -> Result<Vec<(String, String)>, ScanError> {
    let extension = match ecosystem {
        Ecosystem::Npm => "js",
        Ecosystem::PyPi => "py",
    };
    let mut out = Vec::new();
    let mut stack = vec![(target.to_path_buf(), 0usize)];
    while let Some((dir, depth)) = stack.pop() {
        cancel.check()?;
        if depth > 3 || out.len() >= MAX_FILES {
            continue;
        }
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            if out.len() >= MAX_FILES {
                break;
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() {
                if !matches!(
                    name.as_str(),
                    "node_modules" | ".git" | "venv" | ".venv" | "__pycache__" | "dist" | "build"
                ) {
                    stack.push((path, depth + 1));
                }
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            let small_enough = entry
                .metadata()
                .map(|m| m.len() <= MAX_FILE_BYTES)
                .unwrap_or(false);
            if !small_enough {
                continue;
            }
            if let Ok(content) = std::fs::read_to_string(&path) {
                let label = path
                    .strip_prefix(target)
                    .unwrap_or(&path)
                    .display()
                    .to_string();
                out.push((label, content));
            }
        }
    }
    Ok(out)
}

fn measure_complexity(content: &str) -> ComplexitySummary {
    let mut max_nesting = 0usize;
    let mut nesting = 0usize;
    let mut branches = 0usize;
    let mut long_lines = 0usize;
    let mut lines = 0usize;

    for line in content.lines() {
        lines += 1;
        if line.len() > 120 {
            long_lines += 1;
        }
        let trimmed = line.trim_start();
        for keyword in ["if ", "if(", "for ", "for(", "while ", "while(", "match ", "case ", "elif "] {
            if trimmed.starts_with(keyword) {
                branches += 1;
                break;
            }
        }
        for c in line.chars() {
            match c {
                '{' | '(' => {
                    nesting += 1;
                    max_nesting = max_nesting.max(nesting);
                }
                '}' | ')' => nesting = nesting.saturating_sub(1),
                _ => {}
            }
        }
    }

    ComplexitySummary {
        lines,
        max_nesting,
        control_flow_density: if lines > 0 {
            branches as f64 / lines as f64
        } else {
            0.0
        },
        long_lines,
    }
}

fn merge_complexity(total: &mut ComplexitySummary, file: &ComplexitySummary) {
    let branches_total = total.control_flow_density * total.lines as f64
        + file.control_flow_density * file.lines as f64;
    total.lines += file.lines;
    total.max_nesting = total.max_nesting.max(file.max_nesting);
    total.long_lines += file.long_lines;
    total.control_flow_density = if total.lines > 0 {
        branches_total / total.lines as f64
    } else {
        0.0
    };
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        s.to_string()
    } else {
        let mut cut = limit;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &s[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg() -> PackageRef {
        PackageRef::new("demo", "1.0.0", Ecosystem::Npm)
    }

    #[test]
    fn test_detects_base64_exec_chain() {
        let code = r#"const p = Buffer.from(data, "base64"); eval(p.toString());"#;
        let findings = scan_snippet(&pkg(), "index.js", code);
        assert!(findings
            .iter()
            .any(|f| f.finding_type == "obfuscation" && f.severity == Severity::High));
    }

    #[test]
    fn test_detects_env_access_as_suspicious() {
        let findings = scan_snippet(&pkg(), "index.js", "send(process.env.TOKEN)");
        assert!(findings
            .iter()
            .any(|f| f.finding_type == "suspicious_behaviour"));
    }

    #[test]
    fn test_clean_code_no_findings() {
        let findings = scan_snippet(&pkg(), "math.js", "const add = (a, b) => a + b;");
        assert!(findings.is_empty());
    }

    #[test]
    fn test_complexity_metrics() {
        let code = "if (a) {\n  if (b) {\n    deep(x, y);\n  }\n}\n";
        let c = measure_complexity(code);
        assert_eq!(c.lines, 5);
        assert!(c.max_nesting >= 2);
        assert!(c.control_flow_density > 0.0);
    }

    #[test]
    fn test_long_line_count() {
        let code = format!("{}\nshort\n", "x".repeat(150));
        let c = measure_complexity(&code);
        assert_eq!(c.long_lines, 1);
    }

    #[test]
    fn test_collect_sources_skips_node_modules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.js"), "eval(x)").unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/dep")).unwrap();
        std::fs::write(dir.path().join("node_modules/dep/index.js"), "eval(y)").unwrap();

        let sources = collect_sources(
            dir.path(),
            Ecosystem::Npm,
            &chainscan_core::CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].0, "app.js");
    }
}
