//! Text analysis applied to step output and collected logs.
//!
//! Two analyzers exist: output analysis turns regex hits into boolean
//! parameters for later entry criteria, diagnostic analysis turns matches into
//! diagnostic codes. Both write through an [`AnalysisScope`] into the shared
//! context and result collector.

pub mod diagnostic;
pub mod output;

pub use diagnostic::DiagnosticAnalyzer;
pub use output::OutputAnalyzer;

use crate::context::DiagnosticContext;
use crate::results::{CodeMap, ResultCollector};
use hwv_common::errors::{Coded, ErrorCode};
use hwv_common::Step;
use regex::{Regex, RegexBuilder};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Invalid regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Unknown analysis kind: {0}")]
    UnknownKind(String),
}

impl Coded for AnalysisError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidRegex { .. } => ErrorCode::AnalysisInvalidRegex,
            Self::UnknownKind(_) => ErrorCode::StepTypeUnknown,
        }
    }
}

/// Where analysis results are written.
#[derive(Clone, Copy)]
pub struct AnalysisScope<'a> {
    pub test_id: &'a str,
    pub step_id: &'a str,
    pub context: &'a DiagnosticContext,
    pub results: &'a ResultCollector,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisReport {
    /// `parameter_to_set -> value` for every rule that names one.
    pub parameters: BTreeMap<String, bool>,
    /// Codes found across all rules, deduplicated per code.
    pub codes: CodeMap,
}

impl AnalysisReport {
    pub fn merge(&mut self, other: AnalysisReport) {
        self.parameters.extend(other.parameters);
        for (code, values) in other.codes {
            let slot = self.codes.entry(code).or_default();
            for value in values {
                if !slot.contains(&value) {
                    slot.push(value);
                }
            }
        }
    }
}

pub trait Analyzer: Send + Sync {
    fn analyze(&self, text: &str, scope: &AnalysisScope<'_>) -> Result<AnalysisReport, AnalysisError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisKind {
    Output,
    Diagnostic,
}

impl FromStr for AnalysisKind {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "output" | "output_analysis" => Ok(Self::Output),
            "diagnostic" | "diagnostic_analysis" => Ok(Self::Diagnostic),
            other => Err(AnalysisError::UnknownKind(other.to_string())),
        }
    }
}

/// Analyzer of `kind` configured with the step's rules.
pub fn analyzer(kind: AnalysisKind, step: &Step) -> Box<dyn Analyzer> {
    match kind {
        AnalysisKind::Output => Box::new(OutputAnalyzer::new(step.output_analysis.clone())),
        AnalysisKind::Diagnostic => {
            Box::new(DiagnosticAnalyzer::new(step.diagnostic_analysis.clone()))
        }
    }
}

/// Run every analyzer the step has rules for.
pub fn analyze_step(
    step: &Step,
    text: &str,
    scope: &AnalysisScope<'_>,
) -> Result<AnalysisReport, AnalysisError> {
    let mut report = AnalysisReport::default();
    if !step.output_analysis.is_empty() {
        report.merge(analyzer(AnalysisKind::Output, step).analyze(text, scope)?);
    }
    if !step.diagnostic_analysis.is_empty() {
        report.merge(analyzer(AnalysisKind::Diagnostic, step).analyze(text, scope)?);
    }
    Ok(report)
}

fn invalid(pattern: &str) -> impl FnOnce(regex::Error) -> AnalysisError + '_ {
    move |source| AnalysisError::InvalidRegex {
        pattern: pattern.to_string(),
        source,
    }
}

/// Compile a diagnostic pattern; `.` spans lines and anchors match per line.
pub(crate) fn compile(pattern: &str) -> Result<Regex, AnalysisError> {
    RegexBuilder::new(pattern)
        .dot_matches_new_line(true)
        .multi_line(true)
        .build()
        .map_err(invalid(pattern))
}

/// Compile an output-analysis pattern with default flags: `^`/`$` bind to the
/// whole text and `.` stops at newlines.
pub(crate) fn compile_plain(pattern: &str) -> Result<Regex, AnalysisError> {
    Regex::new(pattern).map_err(invalid(pattern))
}

/// Record a boolean parameter in both the context and the collector.
pub(crate) fn set_parameter(scope: &AnalysisScope<'_>, key: &str, value: bool) {
    scope
        .context
        .update_diagnostic_context(scope.test_id, scope.step_id, key, value);
    scope
        .results
        .add_diagnostic_keys(scope.test_id, scope.step_id, key, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwv_common::{DiagnosticRule, OutputRule};
    use serde_json::json;

    fn step() -> Step {
        serde_json::from_value(json!({"step_id": "1", "step_type": "command_execution"})).unwrap()
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("output_analysis".parse::<AnalysisKind>().unwrap(), AnalysisKind::Output);
        assert_eq!("diagnostic".parse::<AnalysisKind>().unwrap(), AnalysisKind::Diagnostic);
        assert!("other".parse::<AnalysisKind>().is_err());
    }

    #[test]
    fn test_analyze_step_runs_both_kinds() {
        let mut step = step();
        step.output_analysis = vec![OutputRule {
            regex: "ok".into(),
            parameter_to_set: "ok_seen".into(),
        }];
        step.diagnostic_analysis = vec![DiagnosticRule {
            search_string: Some("ERR".into()),
            diagnostic_result_code: Some("E1".into()),
            ..Default::default()
        }];

        let context = DiagnosticContext::new();
        let results = ResultCollector::new();
        let scope = AnalysisScope {
            test_id: "T1",
            step_id: "1",
            context: &context,
            results: &results,
        };
        let report = analyze_step(&step, "ok then ERR", &scope).unwrap();
        assert_eq!(report.parameters.get("ok_seen"), Some(&true));
        assert!(report.codes.contains_key("E1"));
    }

    #[test]
    fn test_compile_is_multiline() {
        let re = compile("^b$").unwrap();
        assert!(re.is_match("a\nb\nc"));
        assert!(compile("start.end").unwrap().is_match("start\nend"));
        assert!(matches!(compile("(unclosed"), Err(AnalysisError::InvalidRegex { .. })));
    }

    #[test]
    fn test_compile_plain_keeps_default_flags() {
        assert!(!compile_plain("^b$").unwrap().is_match("a\nb\nc"));
        assert!(!compile_plain("start.end").unwrap().is_match("start\nend"));
        assert!(matches!(compile_plain("(unclosed"), Err(AnalysisError::InvalidRegex { .. })));
    }
}
