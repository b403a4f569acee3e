use super::{AnalysisError, AnalysisReport, AnalysisScope, Analyzer, compile_plain, set_parameter};
use hwv_common::OutputRule;
use tracing::debug;

/// Sets `parameter_to_set` to whether `regex` matches anywhere in the text.
pub struct OutputAnalyzer {
    rules: Vec<OutputRule>,
}

impl OutputAnalyzer {
    pub fn new(rules: Vec<OutputRule>) -> Self {
        Self { rules }
    }
}

impl Analyzer for OutputAnalyzer {
    fn analyze(&self, text: &str, scope: &AnalysisScope<'_>) -> Result<AnalysisReport, AnalysisError> {
        let mut report = AnalysisReport::default();
        for rule in &self.rules {
            let re = compile_plain(&rule.regex)?;
            // `$` also accepts a position just before one final newline.
            let found = re.is_match(text)
                || text.strip_suffix('\n').is_some_and(|trimmed| re.is_match(trimmed));
            debug!(
                step_id = %scope.step_id,
                parameter = %rule.parameter_to_set,
                found,
                "Output analysis"
            );
            set_parameter(scope, &rule.parameter_to_set, found);
            report.parameters.insert(rule.parameter_to_set.clone(), found);
        }
        Ok(report)
    }
}
