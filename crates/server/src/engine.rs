// Analysis engine seam.
//
// The engine is an external collaborator: the server submits a content
// snapshot plus the requested capability set and awaits a structured report
// or a failure. How results are computed is not this crate's concern; the
// heuristic engine below exists so the server runs standalone and tests
// have deterministic output.

use async_trait::async_trait;
use atelier_common::types::{AnalysisReport, Capability, Issue, Severity, TriggerMode};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("analysis engine rejected the request: {0}")]
    Rejected(String),
    #[error("analysis engine failed: {0}")]
    Failed(String),
}

/// External analysis collaborator.
///
/// Calls may be slow; callers enforce their own operation timeout and must
/// not assume cancellation of an in-flight call.
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    async fn analyze(
        &self,
        content: &str,
        capabilities: &[Capability],
        mode: TriggerMode,
    ) -> Result<AnalysisReport, EngineError>;
}

/// Pattern-matching engine for development and tests.
///
/// Flags a handful of well-known smart-contract hazards and style issues;
/// deliberately cheap so `auto`-mode runs stay interactive.
pub struct HeuristicEngine;

struct Rule {
    needle: &'static str,
    capability: Capability,
    severity: Severity,
    message: &'static str,
}

const RULES: &[Rule] = &[
    Rule {
        needle: "tx.origin",
        capability: Capability::Security,
        severity: Severity::Error,
        message: "tx.origin used for authorization",
    },
    Rule {
        needle: "selfdestruct",
        capability: Capability::Security,
        severity: Severity::Warning,
        message: "selfdestruct is reachable",
    },
    Rule {
        needle: "block.timestamp",
        capability: Capability::Security,
        severity: Severity::Warning,
        message: "block.timestamp used as entropy or deadline",
    },
    Rule {
        needle: "TODO",
        capability: Capability::Lint,
        severity: Severity::Info,
        message: "unresolved TODO marker",
    },
];

const MAX_LINE_LENGTH: usize = 120;

#[async_trait]
impl AnalysisEngine for HeuristicEngine {
    async fn analyze(
        &self,
        content: &str,
        capabilities: &[Capability],
        _mode: TriggerMode,
    ) -> Result<AnalysisReport, EngineError> {
        let wants = |capability: Capability| {
            capabilities.is_empty() || capabilities.contains(&capability)
        };

        let mut issues = Vec::new();
        let mut line_count = 0u32;
        for (index, line) in content.lines().enumerate() {
            line_count += 1;
            let line_number = index as u32 + 1;

            for rule in RULES {
                if wants(rule.capability) && line.contains(rule.needle) {
                    issues.push(Issue {
                        line: line_number,
                        severity: rule.severity,
                        capability: rule.capability,
                        message: rule.message.to_string(),
                    });
                }
            }

            if wants(Capability::Style) && line.chars().count() > MAX_LINE_LENGTH {
                issues.push(Issue {
                    line: line_number,
                    severity: Severity::Info,
                    capability: Capability::Style,
                    message: format!("line exceeds {MAX_LINE_LENGTH} characters"),
                });
            }
        }

        let mut penalty = 0u32;
        for issue in &issues {
            penalty += match issue.severity {
                Severity::Error => 25,
                Severity::Warning => 10,
                Severity::Info => 2,
            };
        }

        Ok(AnalysisReport {
            score: 100u32.saturating_sub(penalty),
            issues,
            analyzed_lines: line_count,
            analyzed_bytes: content.len(),
        })
    }
}
