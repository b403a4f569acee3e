//! Step outcomes and diagnostics for one run.
//!
//! The collector is shared by the step executor, analyzers and background
//! finalization, so every table sits behind one mutex. Exports are plain
//! JSON; the tables are rendered as text grids for the log.

use crate::context::DiagnosticKeys;
use chrono::{DateTime, Utc};
use hwv_common::errors::{Coded, ErrorCode};
use hwv_common::shorten;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ResultError {
    #[error("No result found for step '{step_id}' in scenario '{scenario_id}'")]
    UnknownStep {
        scenario_id: String,
        step_id: String,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize results: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Coded for ResultError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::UnknownStep { .. } => ErrorCode::InternalStepUnknown,
            Self::Write { .. } | Self::Serialize(_) => ErrorCode::InternalResultsWrite,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Fail,
    Skip,
}

impl StepStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Skip => "skip",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub scenario_id: String,
    pub step_id: String,
    pub step_name: String,
    pub step_type: String,
    pub status: StepStatus,
    /// Seconds, rounded to milliseconds.
    pub duration: f64,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
    /// Extra fields such as entry-criteria details or the background task status.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StepResult {
    pub fn new(
        scenario_id: &str,
        step_id: &str,
        step_name: &str,
        step_type: &str,
        status: StepStatus,
        duration: f64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            scenario_id: scenario_id.to_string(),
            step_id: step_id.to_string(),
            step_name: step_name.to_string(),
            step_type: step_type.to_string(),
            status,
            duration: round_millis(duration),
            message: message.into(),
            recorded_at: Utc::now(),
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

pub fn round_millis(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

/// Codes found by one analysis rule: `code -> [captured values]`.
pub type CodeMap = BTreeMap<String, Vec<Value>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub scenario_id: String,
    pub step_id: String,
    pub codes: CodeMap,
    pub message: String,
}

/// Full export: `{diagnostic_codes, diagnostics, keys, steps}`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultsReport {
    pub diagnostic_codes: Vec<String>,
    pub diagnostics: Vec<DiagnosticRecord>,
    pub keys: DiagnosticKeys,
    pub steps: Vec<StepResult>,
}

#[derive(Default)]
struct Inner {
    steps: Vec<StepResult>,
    index: HashMap<(String, String), usize>,
    keys: DiagnosticKeys,
    diagnostics: Vec<DiagnosticRecord>,
    codes: Vec<String>,
}

#[derive(Default)]
pub struct ResultCollector {
    inner: Mutex<Inner>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn reset(&self) {
        *self.inner() = Inner::default();
    }

    // ── Steps ───────────────────────────────────────────────────────────

    pub fn add_step_result(&self, result: StepResult) {
        let mut inner = self.inner();
        let key = (result.scenario_id.clone(), result.step_id.clone());
        let idx = inner.steps.len();
        inner.index.insert(key, idx);
        inner.steps.push(result);
    }

    /// Update the latest result recorded for a step in place.
    pub fn update_step_result(
        &self,
        scenario_id: &str,
        step_id: &str,
        update: impl FnOnce(&mut StepResult),
    ) -> Result<(), ResultError> {
        let mut inner = self.inner();
        let idx = inner
            .index
            .get(&(scenario_id.to_string(), step_id.to_string()))
            .copied()
            .ok_or_else(|| ResultError::UnknownStep {
                scenario_id: scenario_id.to_string(),
                step_id: step_id.to_string(),
            })?;
        update(&mut inner.steps[idx]);
        Ok(())
    }

    pub fn step_result(&self, scenario_id: &str, step_id: &str) -> Option<StepResult> {
        let inner = self.inner();
        inner
            .index
            .get(&(scenario_id.to_string(), step_id.to_string()))
            .map(|&idx| inner.steps[idx].clone())
    }

    pub fn steps(&self) -> Vec<StepResult> {
        self.inner().steps.clone()
    }

    // ── Diagnostics ─────────────────────────────────────────────────────

    pub fn add_diagnostic(
        &self,
        scenario_id: &str,
        step_id: &str,
        codes: CodeMap,
        message: impl Into<String>,
    ) {
        let mut inner = self.inner();
        inner.codes.extend(codes.keys().cloned());
        inner.diagnostics.push(DiagnosticRecord {
            scenario_id: scenario_id.to_string(),
            step_id: step_id.to_string(),
            codes,
            message: message.into(),
        });
    }

    pub fn add_diagnostic_keys(&self, test_id: &str, step_id: &str, key: &str, value: impl Into<Value>) {
        self.inner()
            .keys
            .entry(test_id.to_string())
            .or_default()
            .entry(step_id.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    /// `step_id -> key -> value` for one test id.
    pub fn diagnostic_keys(&self, test_id: &str) -> BTreeMap<String, BTreeMap<String, Value>> {
        self.inner().keys.get(test_id).cloned().unwrap_or_default()
    }

    pub fn diagnostics(&self) -> Vec<DiagnosticRecord> {
        self.inner().diagnostics.clone()
    }

    pub fn results(&self) -> ResultsReport {
        let inner = self.inner();
        ResultsReport {
            diagnostic_codes: inner.codes.clone(),
            diagnostics: inner.diagnostics.clone(),
            keys: inner.keys.clone(),
            steps: inner.steps.clone(),
        }
    }

    pub fn unique_diagnostics(&self) -> CodeMap {
        filter_unique_diagnostics(&self.inner().diagnostics)
    }

    /// How many diagnostic records reported each code. A record counts once per
    /// code however many values it captured.
    pub fn records_per_code(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.inner().diagnostics {
            for code in record.codes.keys() {
                *counts.entry(code.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    // ── Reports ─────────────────────────────────────────────────────────

    pub fn summary_table(&self) -> String {
        let headers = ["Step Name", "Type", "Status", "Duration (s)", "Message"];
        let rows: Vec<Vec<String>> = self
            .inner()
            .steps
            .iter()
            .map(|r| {
                vec![
                    r.step_name.clone(),
                    r.step_type.clone(),
                    r.status.to_string(),
                    format!("{:.2}", r.duration),
                    shorten(&r.message, 50),
                ]
            })
            .collect();
        render_grid(&headers.map(String::from), &rows)
    }

    /// One row per captured value; object entries spread into their own columns.
    pub fn diagnostic_table(&self) -> String {
        diagnostic_table(&self.unique_diagnostics())
    }

    pub fn code_count_table(&self) -> String {
        let rows: Vec<Vec<String>> = self
            .records_per_code()
            .into_iter()
            .map(|(code, count)| vec![code, count.to_string()])
            .collect();
        render_grid(&["Diagnostic Code".to_string(), "Occurrences".to_string()], &rows)
    }

    /// Log one line per step, then the diagnostic and key tables.
    pub fn log_summary(&self) {
        for r in self.steps() {
            let icon = if r.status == StepStatus::Fail { "[FAIL]" } else { "[PASS]" };
            info!(
                "{icon} Step: {} | Type: {} | Status: {} | Time: {:.2}s | Msg: {}",
                r.step_name, r.step_type, r.status, r.duration, r.message
            );
        }
        let report = self.results();
        if !report.diagnostics.is_empty() {
            info!("Detected diagnostic issues:\n{}", self.diagnostic_table());
            info!("Diagnostic code summary:\n{}", self.code_count_table());
        }
        for (test_id, steps) in &report.keys {
            for (step_id, keys) in steps {
                let keys = serde_json::Value::Object(keys.clone().into_iter().collect::<Map<_, _>>());
                info!(test_id = %test_id, step_id = %step_id, "Context keys: {keys}");
            }
        }
    }

    pub fn dump_results(&self, path: &Path) -> Result<(), ResultError> {
        write_json(path, &self.results())?;
        info!(path = %path.display(), "Results saved");
        Ok(())
    }

    pub fn dump_diagnostics(&self, path: &Path) -> Result<(), ResultError> {
        write_json(path, &self.unique_diagnostics())?;
        info!(path = %path.display(), "Diagnostics saved");
        Ok(())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ResultError> {
    let text = serde_json::to_string_pretty(value)?;
    let write_err = |source| ResultError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    std::fs::write(path, text).map_err(write_err)
}

/// Merge every record's codes into one `code -> unique values` view.
///
/// String entries equal to their code and object fields whose value equals
/// the code are dropped first; remaining entries are merged by structural
/// equality. Applying the filter to its own output changes nothing.
pub fn filter_unique_diagnostics(records: &[DiagnosticRecord]) -> CodeMap {
    let mut merged = CodeMap::new();
    for record in records {
        for (code, entries) in &record.codes {
            let slot = merged.entry(code.clone()).or_default();
            for entry in entries {
                let Some(entry) = strip_self_reference(code, entry) else {
                    continue;
                };
                if !slot.contains(&entry) {
                    slot.push(entry);
                }
            }
        }
    }
    merged
}

fn strip_self_reference(code: &str, entry: &Value) -> Option<Value> {
    match entry {
        Value::String(s) if s.trim() == code => None,
        Value::Object(fields) => {
            let kept: Map<String, Value> = fields
                .iter()
                .filter(|(_, v)| v.as_str() != Some(code))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            (!kept.is_empty()).then_some(Value::Object(kept))
        }
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::Array(items) if items.is_empty() => None,
        other => Some(other.clone()),
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn diagnostic_table(unique: &CodeMap) -> String {
    let mut columns = vec!["Diagnostic Code".to_string()];
    let mut rows: Vec<BTreeMap<String, String>> = Vec::new();
    for (code, entries) in unique {
        if entries.is_empty() {
            rows.push(BTreeMap::from([(columns[0].clone(), code.clone())]));
        }
        for entry in entries {
            let mut row = BTreeMap::from([(columns[0].clone(), code.clone())]);
            match entry {
                Value::Object(fields) => {
                    for (k, v) in fields {
                        if !columns.contains(k) {
                            columns.push(k.clone());
                        }
                        row.insert(k.clone(), cell(v));
                    }
                }
                other => {
                    if !columns.iter().any(|c| c == "Value") {
                        columns.push("Value".to_string());
                    }
                    row.insert("Value".to_string(), cell(other));
                }
            }
            rows.push(row);
        }
    }
    if rows.is_empty() {
        return "No diagnostic data to display.".to_string();
    }
    let grid: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|c| shorten(row.get(c).map(String::as_str).unwrap_or(""), 40))
                .collect()
        })
        .collect();
    render_grid(&columns, &grid)
}

/// Render a bordered text table.
pub fn render_grid(headers: &[String], rows: &[Vec<String>]) -> String {
    let clean = |s: &str| s.replace(['\n', '\r'], " ");
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, value) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(clean(value).chars().count());
        }
    }

    let border = |fill: char| {
        let mut line = String::from("+");
        for w in &widths {
            line.push_str(&fill.to_string().repeat(w + 2));
            line.push('+');
        }
        line
    };
    let line = |cells: &[String]| {
        let mut out = String::from("|");
        for (i, w) in widths.iter().enumerate() {
            let value = clean(cells.get(i).map(String::as_str).unwrap_or(""));
            let pad = w - value.chars().count();
            let _ = write!(out, " {value}{} |", " ".repeat(pad));
        }
        out
    };

    let mut out = border('-');
    out.push('\n');
    out.push_str(&line(headers));
    out.push('\n');
    out.push_str(&border('='));
    for row in rows {
        out.push('\n');
        out.push_str(&line(row));
        out.push('\n');
        out.push_str(&border('-'));
    }
    if rows.is_empty() {
        out.push('\n');
        out.push_str(&border('-'));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn codes(pairs: &[(&str, Vec<Value>)]) -> CodeMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_step_results_and_update() {
        let rc = ResultCollector::new();
        rc.add_step_result(StepResult::new("T1", "1", "echo", "command_execution", StepStatus::Success, 0.12345, "ok"));
        assert_eq!(rc.steps()[0].duration, 0.123);

        rc.update_step_result("T1", "1", |r| {
            r.status = StepStatus::Fail;
            r.message = "late failure".into();
        })
        .unwrap();
        let updated = rc.step_result("T1", "1").unwrap();
        assert_eq!(updated.status, StepStatus::Fail);
        assert_eq!(rc.steps().len(), 1);

        let err = rc.update_step_result("T1", "9", |_| {}).unwrap_err();
        assert!(matches!(err, ResultError::UnknownStep { .. }));
    }

    #[test]
    fn test_extra_fields_flatten() {
        let r = StepResult::new("T1", "1", "n", "t", StepStatus::Skip, 0.0, "Entry criteria not met")
            .with_extra("details", json!(["x"]));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["status"], "skip");
        assert_eq!(v["details"], json!(["x"]));
    }

    #[test]
    fn test_filter_strips_self_reference_and_merges() {
        let records = vec![
            DiagnosticRecord {
                scenario_id: "T1".into(),
                step_id: "1".into(),
                codes: codes(&[
                    ("E100", vec![json!("E100"), json!({"code": "E100", "slot": "3"})]),
                    ("E200", vec![json!(["a", "b"])]),
                ]),
                message: String::new(),
            },
            DiagnosticRecord {
                scenario_id: "T1".into(),
                step_id: "2".into(),
                codes: codes(&[
                    ("E100", vec![json!({"slot": "3", "code": "E100"})]),
                    ("E200", vec![json!(["a", "b"]), json!("c")]),
                ]),
                message: String::new(),
            },
        ];
        let unique = filter_unique_diagnostics(&records);
        assert_eq!(unique["E100"], vec![json!({"slot": "3"})]);
        assert_eq!(unique["E200"], vec![json!(["a", "b"]), json!("c")]);
    }

    #[test]
    fn test_records_per_code_counts_each_record_once() {
        let rc = ResultCollector::new();
        rc.add_diagnostic(
            "T1",
            "1",
            codes(&[("E1", vec![json!("a"), json!("b"), json!("c")]), ("E2", vec![])]),
            "Found codes: ",
        );
        rc.add_diagnostic("T1", "2", codes(&[("E1", vec![])]), "Found codes: ");
        let counts = rc.records_per_code();
        assert_eq!(counts["E1"], 2);
        assert_eq!(counts["E2"], 1);
        assert_eq!(rc.results().diagnostic_codes, vec!["E1", "E2", "E1"]);
    }

    #[test]
    fn test_tables_render() {
        let rc = ResultCollector::new();
        rc.add_step_result(StepResult::new("T1", "1", "check dimm", "command_execution", StepStatus::Success, 1.0, "x".repeat(80)));
        let table = rc.summary_table();
        assert!(table.contains("| Step Name"));
        assert!(table.contains("check dimm"));
        assert!(table.contains("..."));

        rc.add_diagnostic("T1", "1", codes(&[("E7", vec![json!({"slot": "3"}), json!("raw")])]), "");
        let diag = rc.diagnostic_table();
        assert!(diag.contains("Diagnostic Code"));
        assert!(diag.contains("slot"));
        assert!(diag.contains("Value"));
    }

    #[test]
    fn test_log_summary_with_keys_and_codes() {
        let rc = ResultCollector::new();
        rc.add_step_result(StepResult::new("T1", "1", "s", "command_execution", StepStatus::Fail, 0.5, "boom"));
        rc.add_diagnostic_keys("T1", "1", "ok_seen", false);
        rc.add_diagnostic("T1", "1", codes(&[("E1", vec![])]), "Found codes: E1");
        rc.log_summary();
        assert!(rc.code_count_table().contains("E1"));
    }

    #[test]
    fn test_dump_results_and_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let rc = ResultCollector::new();
        rc.add_step_result(StepResult::new("T1", "1", "s", "command_execution", StepStatus::Success, 0.5, ""));
        rc.add_diagnostic_keys("T1", "1", "ok_seen", true);
        rc.add_diagnostic("T1", "1", codes(&[("E1", vec![json!("v")])]), "");

        let results = dir.path().join("out/test_results.json");
        rc.dump_results(&results).unwrap();
        let v: Value = serde_json::from_str(&std::fs::read_to_string(&results).unwrap()).unwrap();
        assert_eq!(v["keys"]["T1"]["1"]["ok_seen"], true);
        assert_eq!(v["steps"][0]["status"], "success");

        let diag = dir.path().join("diagnostics_codes.json");
        rc.dump_diagnostics(&diag).unwrap();
        let v: Value = serde_json::from_str(&std::fs::read_to_string(&diag).unwrap()).unwrap();
        assert_eq!(v["E1"], json!(["v"]));
    }

    #[test]
    fn test_reset() {
        let rc = ResultCollector::new();
        rc.add_diagnostic_keys("T1", "1", "k", 1);
        rc.reset();
        assert!(rc.diagnostic_keys("T1").is_empty());
    }

    fn entry_strategy() -> impl Strategy<Value = Value> {
        prop_oneof![
            "[A-C][0-9]".prop_map(Value::String),
            prop::collection::vec("[a-c]", 0..3).prop_map(|v| json!(v)),
            ("[a-c]", "[A-C][0-9]").prop_map(|(k, v)| json!({ k: v })),
        ]
    }

    proptest! {
        #[test]
        fn prop_filter_is_idempotent(
            raw in prop::collection::vec(
                ("[A-C][0-9]", prop::collection::vec(entry_strategy(), 0..4)),
                0..6,
            )
        ) {
            let records: Vec<DiagnosticRecord> = raw
                .into_iter()
                .map(|(code, entries)| DiagnosticRecord {
                    scenario_id: "T".into(),
                    step_id: "1".into(),
                    codes: CodeMap::from([(code, entries)]),
                    message: String::new(),
                })
                .collect();
            let once = filter_unique_diagnostics(&records);
            let again = filter_unique_diagnostics(&[DiagnosticRecord {
                scenario_id: "T".into(),
                step_id: "1".into(),
                codes: once.clone(),
                message: String::new(),
            }]);
            prop_assert_eq!(once, again);
        }
    }
}
