//! Run journal: structured JSON-lines record of a run.
//!
//! Every record is appended to `{workspace}/{test_id}_run.jsonl` once the
//! journal is opened, and broadcast to in-process subscribers either way.

use chrono::Utc;
use hwv_common::sanitize_file_stem;
use serde::Serialize;
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEvent {
    RunStart,
    StepStart,
    Log,
    Diagnosis,
    StepEnd,
    RunEnd,
}

impl JournalEvent {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RunStart => "run_start",
            Self::StepStart => "step_start",
            Self::Log => "log",
            Self::Diagnosis => "diagnosis",
            Self::StepEnd => "step_end",
            Self::RunEnd => "run_end",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Passed,
    Failed,
    Skipped,
}

pub struct RunJournal {
    sender: broadcast::Sender<String>,
    file: Mutex<Option<(PathBuf, File)>>,
}

impl Default for RunJournal {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl RunJournal {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(DEFAULT_BUFFER));
        Self {
            sender,
            file: Mutex::new(None),
        }
    }

    /// Start appending to `{workspace}/{test_id}_run.jsonl`.
    pub fn open(&self, workspace: &Path, test_id: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(workspace)?;
        let path = workspace.join(format!("{}_run.jsonl", sanitize_file_stem(test_id)));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        *self.file.lock().unwrap_or_else(|e| e.into_inner()) = Some((path.clone(), file));
        Ok(path)
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.file
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(path, _)| path.clone())
    }

    pub fn close(&self) {
        if let Some((_, mut file)) = self.file.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = file.flush();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    pub fn emit<T: Serialize>(&self, event: JournalEvent, data: &T) {
        let payload = json!({
            "event": event,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let line = match serde_json::to_string(&payload) {
            Ok(line) => line,
            Err(err) => {
                warn!("Failed to serialize journal event {}: {}", event.as_str(), err);
                return;
            }
        };

        if let Some((path, file)) = self.file.lock().unwrap_or_else(|e| e.into_inner()).as_mut()
            && let Err(err) = writeln!(file, "{line}")
        {
            warn!(path = %path.display(), "Failed to write journal record: {err}");
        }
        let _ = self.sender.send(line);
    }

    // ── Typed records ───────────────────────────────────────────────────

    pub fn run_start(&self, test_id: &str, test_name: &str) {
        self.emit(
            JournalEvent::RunStart,
            &json!({ "test_id": test_id, "test_name": test_name }),
        );
    }

    pub fn run_end(&self, test_id: &str, passed: bool, message: &str) {
        self.emit(
            JournalEvent::RunEnd,
            &json!({ "test_id": test_id, "passed": passed, "message": message }),
        );
    }

    pub fn step_start(&self, scenario_id: &str, step_id: &str, step_name: &str) {
        self.emit(
            JournalEvent::StepStart,
            &json!({ "scenario_id": scenario_id, "step_id": step_id, "step_name": step_name }),
        );
    }

    pub fn step_end(&self, scenario_id: &str, step_id: &str, status: &str, duration: f64, message: &str) {
        self.emit(
            JournalEvent::StepEnd,
            &json!({
                "scenario_id": scenario_id,
                "step_id": step_id,
                "status": status,
                "duration": duration,
                "message": message,
            }),
        );
    }

    pub fn log(&self, severity: Severity, step_id: Option<&str>, message: &str) {
        self.emit(
            JournalEvent::Log,
            &json!({ "severity": severity, "step_id": step_id, "message": message }),
        );
    }

    pub fn diagnosis(&self, scenario_id: &str, step_id: &str, verdict: Verdict, message: &str) {
        self.emit(
            JournalEvent::Diagnosis,
            &json!({
                "scenario_id": scenario_id,
                "step_id": step_id,
                "verdict": verdict,
                "message": message,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::time::Duration;

    #[tokio::test]
    async fn test_emit_broadcasts_json_with_timestamp() {
        let journal = RunJournal::default();
        let mut rx = journal.subscribe();
        journal.step_start("T1", "1", "echo");

        let msg = tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .expect("timed out waiting for record")
            .expect("broadcast recv failed");
        let parsed: Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["event"], "step_start");
        assert_eq!(parsed["data"]["step_id"], "1");
        let ts = parsed["timestamp"].as_str().unwrap();
        chrono::DateTime::parse_from_rfc3339(ts).expect("timestamp should be RFC3339");
    }

    #[test]
    fn test_open_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let journal = RunJournal::default();
        // Records before open are broadcast only.
        journal.log(Severity::Info, None, "not persisted");
        let path = journal.open(dir.path(), "T 1").unwrap();
        assert_eq!(path.file_name().unwrap(), "T_1_run.jsonl");

        journal.run_start("T 1", "demo");
        journal.diagnosis("T 1", "1", Verdict::Passed, "ok");
        journal.run_end("T 1", true, "done");
        journal.close();

        let text = std::fs::read_to_string(&path).unwrap();
        let events: Vec<String> = text
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["event"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(events, vec!["run_start", "diagnosis", "run_end"]);
        assert!(journal.path().is_none());
    }
}
