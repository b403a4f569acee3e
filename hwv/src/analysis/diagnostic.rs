//! Diagnostic code extraction.
//!
//! A rule comes in one of two shapes:
//!
//! * `search_string` + `diagnostic_result_code`: every match reports the fixed
//!   code, unless the code names a capture group, in which case the group's
//!   text is the code.
//! * `diagnostic_search_string`: the code is derived from each match. The
//!   group named by `diagnostic_result_code` wins, then the first non-empty
//!   named group, then a tuple of the non-empty positional groups when there
//!   are two or more, then the single group, then the whole match.
//!
//! When both shapes are present the derived shape is used.

use super::{AnalysisError, AnalysisReport, AnalysisScope, Analyzer, compile, set_parameter};
use crate::results::CodeMap;
use hwv_common::DiagnosticRule;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

pub struct DiagnosticAnalyzer {
    rules: Vec<DiagnosticRule>,
}

enum Shape<'r> {
    Fixed { pattern: &'r str, code: &'r str },
    Derived { pattern: &'r str, code_group: Option<&'r str> },
}

fn shape_of(rule: &DiagnosticRule) -> Option<Shape<'_>> {
    let code = rule.diagnostic_result_code.as_deref().filter(|c| !c.is_empty());
    match (rule.search_string.as_deref(), rule.diagnostic_search_string.as_deref()) {
        (Some(_), Some(pattern)) => {
            warn!(
                pattern,
                "Rule has both search_string and diagnostic_search_string, using diagnostic_search_string"
            );
            Some(Shape::Derived { pattern, code_group: code })
        }
        (None, Some(pattern)) => Some(Shape::Derived { pattern, code_group: code }),
        (Some(pattern), None) => match code {
            Some(code) => Some(Shape::Fixed { pattern, code }),
            None => {
                warn!(pattern, "Rule has search_string but no diagnostic_result_code, skipping");
                None
            }
        },
        (None, None) => {
            warn!("Rule has neither search_string nor diagnostic_search_string, skipping");
            None
        }
    }
}

fn non_empty<'t>(caps: &Captures<'t>, idx: usize) -> Option<&'t str> {
    caps.get(idx).map(|m| m.as_str()).filter(|s| !s.is_empty())
}

fn named_group<'t>(re: &Regex, caps: &Captures<'t>, name: &str) -> Option<&'t str> {
    re.capture_names()
        .any(|n| n == Some(name))
        .then(|| caps.name(name).map(|m| m.as_str()))
        .flatten()
        .filter(|s| !s.is_empty())
}

fn has_named_groups(re: &Regex) -> bool {
    re.capture_names().flatten().next().is_some()
}

fn derive_code(re: &Regex, caps: &Captures<'_>) -> String {
    if let Some(first_named) = re
        .capture_names()
        .enumerate()
        .filter(|(_, name)| name.is_some())
        .find_map(|(idx, _)| non_empty(caps, idx))
    {
        return first_named.to_string();
    }
    let positional: Vec<&str> = (1..caps.len()).filter_map(|idx| non_empty(caps, idx)).collect();
    match positional.as_slice() {
        [] => caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default(),
        [single] => (*single).to_string(),
        several => format!("({})", several.join(", ")),
    }
}

/// Value recorded for one match, if its groups captured anything.
///
/// Named groups give an object, one positional group its text, several the
/// list of non-empty groups. A pattern without groups records nothing.
fn captured_value(re: &Regex, caps: &Captures<'_>) -> Option<Value> {
    if has_named_groups(re) {
        let fields: Map<String, Value> = re
            .capture_names()
            .flatten()
            .map(|name| {
                let value = caps
                    .name(name)
                    .map_or(Value::Null, |m| Value::String(m.as_str().to_string()));
                (name.to_string(), value)
            })
            .collect();
        return Some(Value::Object(fields));
    }
    match caps.len() {
        1 => None,
        2 => caps.get(1).map(|m| Value::String(m.as_str().to_string())),
        _ => {
            let groups: Vec<Value> = (1..caps.len())
                .filter_map(|idx| non_empty(caps, idx))
                .map(|s| Value::String(s.to_string()))
                .collect();
            (!groups.is_empty()).then_some(Value::Array(groups))
        }
    }
}

/// The code is always recorded; the value only when present and not yet seen.
fn insert_unique(codes: &mut CodeMap, code: String, value: Option<Value>) {
    let slot = codes.entry(code).or_default();
    if let Some(value) = value
        && !slot.contains(&value)
    {
        slot.push(value);
    }
}

impl DiagnosticAnalyzer {
    pub fn new(rules: Vec<DiagnosticRule>) -> Self {
        Self { rules }
    }

    /// Codes produced by one rule over `text`.
    pub fn scan(rule: &DiagnosticRule, text: &str) -> Result<Option<CodeMap>, AnalysisError> {
        let Some(shape) = shape_of(rule) else {
            return Ok(None);
        };
        let mut codes = CodeMap::new();
        match shape {
            Shape::Fixed { pattern, code } => {
                let re = compile(pattern)?;
                for caps in re.captures_iter(text) {
                    let resolved = named_group(&re, &caps, code).unwrap_or(code);
                    insert_unique(&mut codes, resolved.to_string(), captured_value(&re, &caps));
                }
            }
            Shape::Derived { pattern, code_group } => {
                let re = compile(pattern)?;
                for caps in re.captures_iter(text) {
                    let code = code_group
                        .and_then(|group| named_group(&re, &caps, group))
                        .map(str::to_string)
                        .unwrap_or_else(|| derive_code(&re, &caps));
                    if code.is_empty() {
                        continue;
                    }
                    insert_unique(&mut codes, code, captured_value(&re, &caps));
                }
            }
        }
        Ok(Some(codes))
    }
}

impl Analyzer for DiagnosticAnalyzer {
    fn analyze(&self, text: &str, scope: &AnalysisScope<'_>) -> Result<AnalysisReport, AnalysisError> {
        let mut report = AnalysisReport::default();
        for rule in &self.rules {
            let Some(codes) = Self::scan(rule, text)? else {
                continue;
            };
            let found = !codes.is_empty();
            if let Some(parameter) = rule.parameter_to_set.as_deref().filter(|p| !p.is_empty()) {
                set_parameter(scope, parameter, found);
                report.parameters.insert(parameter.to_string(), found);
            }
            if !found {
                debug!(step_id = %scope.step_id, "No diagnostic codes matched");
                continue;
            }

            let names: Vec<&str> = codes.keys().map(String::as_str).collect();
            info!(test_id = %scope.test_id, step_id = %scope.step_id, "Found codes: {}", names.join(", "));
            let ledger_entry: Map<String, Value> = codes
                .iter()
                .map(|(code, values)| (code.clone(), Value::Array(values.clone())))
                .collect();
            scope
                .context
                .add_diagnostic_code(scope.test_id, scope.step_id, [Value::Object(ledger_entry)]);
            scope.results.add_diagnostic(
                scope.test_id,
                scope.step_id,
                codes.clone(),
                format!("Found codes: {}", names.join(", ")),
            );
            report.merge(AnalysisReport {
                parameters: Default::default(),
                codes,
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DiagnosticContext;
    use crate::results::ResultCollector;
    use serde_json::json;

    fn fixed(pattern: &str, code: &str) -> DiagnosticRule {
        DiagnosticRule {
            search_string: Some(pattern.into()),
            diagnostic_result_code: Some(code.into()),
            ..Default::default()
        }
    }

    fn derived(pattern: &str) -> DiagnosticRule {
        DiagnosticRule {
            diagnostic_search_string: Some(pattern.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_fixed_code_dedups_values() {
        let codes = DiagnosticAnalyzer::scan(&fixed("EDAC (\\w+) error", "MEM001"), "EDAC mc0 error\nEDAC mc0 error\nEDAC mc1 error")
            .unwrap()
            .unwrap();
        assert_eq!(codes["MEM001"], vec![json!("mc0"), json!("mc1")]);
    }

    #[test]
    fn test_fixed_code_naming_a_group() {
        let codes = DiagnosticAnalyzer::scan(&fixed("code=(?P<code>E\\d+)", "code"), "code=E12 code=E13")
            .unwrap()
            .unwrap();
        assert_eq!(codes.keys().collect::<Vec<_>>(), vec!["E12", "E13"]);
        assert_eq!(codes["E12"], vec![json!({"code": "E12"})]);
    }

    #[test]
    fn test_derived_named_group_and_tuple() {
        let codes = DiagnosticAnalyzer::scan(&derived("(?P<err>ERR\\d+) slot (?P<slot>\\d)"), "ERR7 slot 3")
            .unwrap()
            .unwrap();
        assert_eq!(codes["ERR7"], vec![json!({"err": "ERR7", "slot": "3"})]);

        let codes = DiagnosticAnalyzer::scan(&derived("(\\w+):(\\d+)"), "cpu:9").unwrap().unwrap();
        assert_eq!(codes["(cpu, 9)"], vec![json!(["cpu", "9"])]);

        let codes = DiagnosticAnalyzer::scan(&derived("PCIe \\w+"), "PCIe fault").unwrap().unwrap();
        assert_eq!(codes["PCIe fault"], Vec::<Value>::new());
    }

    #[test]
    fn test_codes_without_captures_have_no_values() {
        let codes = DiagnosticAnalyzer::scan(&fixed("MCE", "CPU9"), "MCE here").unwrap().unwrap();
        assert_eq!(codes["CPU9"], Vec::<Value>::new());

        let codes = DiagnosticAnalyzer::scan(&fixed("ERR(X)?", "E1"), "ERR").unwrap().unwrap();
        assert_eq!(codes["E1"], Vec::<Value>::new());

        let codes = DiagnosticAnalyzer::scan(&fixed("ERR(X)?", "E1"), "ERR ERRX").unwrap().unwrap();
        assert_eq!(codes["E1"], vec![json!("X")]);
    }

    #[test]
    fn test_derived_result_code_selects_group() {
        let rule = DiagnosticRule {
            diagnostic_search_string: Some("(?P<dev>\\w+) reports (?P<code>E\\d+)".into()),
            diagnostic_result_code: Some("code".into()),
            ..Default::default()
        };
        let codes = DiagnosticAnalyzer::scan(&rule, "nic0 reports E42").unwrap().unwrap();
        assert!(codes.contains_key("E42"));
    }

    #[test]
    fn test_conflicting_rule_uses_diagnostic_search_string() {
        let rule = DiagnosticRule {
            search_string: Some("NEVER".into()),
            diagnostic_search_string: Some("(E\\d+)".into()),
            ..Default::default()
        };
        let codes = DiagnosticAnalyzer::scan(&rule, "E5").unwrap().unwrap();
        assert!(codes.contains_key("E5"));
    }

    #[test]
    fn test_search_string_without_code_is_skipped() {
        let rule = DiagnosticRule {
            search_string: Some("E\\d".into()),
            ..Default::default()
        };
        assert!(DiagnosticAnalyzer::scan(&rule, "E1").unwrap().is_none());
    }

    #[test]
    fn test_analyze_records_everywhere() {
        let context = DiagnosticContext::new();
        let results = ResultCollector::new();
        let scope = AnalysisScope {
            test_id: "T1",
            step_id: "2",
            context: &context,
            results: &results,
        };
        let mut hit = fixed("MCE", "CPU9");
        hit.parameter_to_set = Some("mce_seen".into());
        let mut miss = fixed("THERMAL", "TMP1");
        miss.parameter_to_set = Some("thermal_seen".into());

        let report = DiagnosticAnalyzer::new(vec![hit, miss])
            .analyze("MCE logged", &scope)
            .unwrap();
        assert!(report.codes.contains_key("CPU9"));
        assert_eq!(report.parameters["mce_seen"], true);
        assert_eq!(report.parameters["thermal_seen"], false);

        let ledger = context.diagnostic_codes();
        assert_eq!(ledger["T1"]["2"][0]["CPU9"], json!([]));
        let collected = results.results();
        assert_eq!(collected.diagnostic_codes, vec!["CPU9"]);
        assert_eq!(collected.diagnostics[0].message, "Found codes: CPU9");
        assert_eq!(context.parameters_to_set()["thermal_seen"], json!(false));
    }
}
