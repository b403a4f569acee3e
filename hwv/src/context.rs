//! Shared diagnostic state for one run.
//!
//! One [`DiagnosticContext`] is created per orchestrator run and handed to
//! every executor and analyzer through the engine. All tables are internally
//! synchronised; readers get snapshots.

use hwv_common::Step;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// `keys[test_id][step_id][key] = value`.
pub type DiagnosticKeys = BTreeMap<String, BTreeMap<String, BTreeMap<String, Value>>>;

/// `codes[test_id][step_id] = [code maps...]`.
pub type CodeLedger = BTreeMap<String, BTreeMap<String, Vec<Value>>>;

/// A step started in background mode, pending validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContinuedStep {
    pub scenario_id: String,
    pub step: Step,
    pub connection_name: String,
    pub connection_type: String,
    pub task_id: String,
    pub validated: bool,
}

impl ContinuedStep {
    pub fn step_id(&self) -> &str {
        &self.step.step_id
    }
}

#[derive(Debug, Default)]
pub struct DiagnosticContext {
    data: RwLock<HashMap<String, Value>>,
    keys: RwLock<DiagnosticKeys>,
    parameters: RwLock<HashMap<String, Value>>,
    codes: RwLock<CodeLedger>,
    // Registration order is the finalization order.
    continued: RwLock<Vec<ContinuedStep>>,
}

impl DiagnosticContext {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Scenario data ───────────────────────────────────────────────────

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// String value of `key`, or `default` when unset or not a string.
    pub fn get_str_or(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => default.to_string(),
        }
    }

    /// Current `test_id`, empty when no scenario is running.
    pub fn test_id(&self) -> String {
        self.get_str_or("test_id", "")
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.data.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ── Diagnostic keys ─────────────────────────────────────────────────

    /// Record `key = value` for a step and refresh the flat parameter view.
    pub fn update_diagnostic_context(
        &self,
        test_id: &str,
        step_id: &str,
        key: &str,
        value: impl Into<Value>,
    ) {
        let value = value.into();
        {
            let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
            keys.entry(test_id.to_string())
                .or_default()
                .entry(step_id.to_string())
                .or_default()
                .insert(key.to_string(), value.clone());
        }
        self.parameters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
    }

    /// Flat `key -> last value` map used by entry criteria.
    pub fn parameters_to_set(&self) -> HashMap<String, Value> {
        self.parameters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn diagnostic_keys(&self) -> DiagnosticKeys {
        self.keys.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ── Code ledger ─────────────────────────────────────────────────────

    /// Append codes for a step. Duplicates are kept.
    pub fn add_diagnostic_code(
        &self,
        test_id: &str,
        step_id: &str,
        codes: impl IntoIterator<Item = Value>,
    ) {
        self.codes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(test_id.to_string())
            .or_default()
            .entry(step_id.to_string())
            .or_default()
            .extend(codes);
    }

    pub fn diagnostic_codes(&self) -> CodeLedger {
        self.codes.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ── Continued steps ─────────────────────────────────────────────────

    /// Register a continued step, replacing an entry with the same ids.
    pub fn add_continued_step(&self, info: ContinuedStep) {
        let mut continued = self.continued.write().unwrap_or_else(|e| e.into_inner());
        match continued
            .iter_mut()
            .find(|c| c.scenario_id == info.scenario_id && c.step.step_id == info.step.step_id)
        {
            Some(existing) => *existing = info,
            None => continued.push(info),
        }
    }

    /// Apply `update` to an existing entry. Returns false when the entry is unknown.
    pub fn update_continued_step(
        &self,
        scenario_id: &str,
        step_id: &str,
        update: impl FnOnce(&mut ContinuedStep),
    ) -> bool {
        let mut continued = self.continued.write().unwrap_or_else(|e| e.into_inner());
        match continued
            .iter_mut()
            .find(|c| c.scenario_id == scenario_id && c.step.step_id == step_id)
        {
            Some(entry) => {
                update(entry);
                true
            }
            None => false,
        }
    }

    /// Update an entry, registering `info` first when it is missing.
    pub fn upsert_continued_step(
        &self,
        info: ContinuedStep,
        update: impl FnOnce(&mut ContinuedStep),
    ) {
        let mut continued = self.continued.write().unwrap_or_else(|e| e.into_inner());
        let idx = match continued
            .iter()
            .position(|c| c.scenario_id == info.scenario_id && c.step.step_id == info.step.step_id)
        {
            Some(idx) => idx,
            None => {
                continued.push(info);
                continued.len() - 1
            }
        };
        update(&mut continued[idx]);
    }

    pub fn mark_validated(&self, scenario_id: &str, step_id: &str) -> bool {
        self.update_continued_step(scenario_id, step_id, |c| c.validated = true)
    }

    pub fn continued_step(&self, scenario_id: &str, step_id: &str) -> Option<ContinuedStep> {
        self.continued
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|c| c.scenario_id == scenario_id && c.step.step_id == step_id)
            .cloned()
    }

    /// All continued steps in registration order.
    pub fn continued_steps(&self) -> Vec<ContinuedStep> {
        self.continued
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn reset(&self) {
        self.data.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.keys.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.parameters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.codes.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.continued
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
