//! Expected-output matching.
//!
//! [`search`] looks for `expected` inside `actual`, recursing through JSON
//! arrays and objects. Text is matched as a regex first, then as a substring,
//! then as a case-insensitive token subset.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub matched: bool,
    pub reason: String,
}

impl Validation {
    fn hit(reason: impl Into<String>) -> Self {
        Self { matched: true, reason: reason.into() }
    }

    fn miss(reason: impl Into<String>) -> Self {
        Self { matched: false, reason: reason.into() }
    }
}

pub fn search(expected: &Value, actual: &Value) -> Validation {
    match (expected, actual) {
        (Value::String(e), Value::String(a)) => match_text(e, a),
        (Value::String(_), Value::Array(items)) => {
            for item in items {
                let v = search(expected, item);
                if v.matched {
                    return Validation::hit(format!("Matched in iterable: {}", v.reason));
                }
            }
            Validation::miss("No match in iterable")
        }
        (Value::String(e), Value::Object(fields)) => {
            for (key, value) in fields {
                let v = match_text(e, key);
                if v.matched {
                    return Validation::hit(format!("Matched in dict key: {}", v.reason));
                }
                let v = search(expected, value);
                if v.matched {
                    return Validation::hit(format!("Matched in dict value: {}", v.reason));
                }
            }
            Validation::miss("No match in dict")
        }
        (Value::Object(e), Value::Object(a)) => match_object(e, a),
        (Value::Object(e), Value::Array(items)) => {
            for item in items {
                if let Value::Object(a) = item {
                    let v = match_object(e, a);
                    if v.matched {
                        return Validation::hit(format!("Matched sub-dict in list: {}", v.reason));
                    }
                }
            }
            Validation::miss("No sub-dict match in list")
        }
        (Value::Array(options), _) => {
            for option in options {
                let v = search(option, actual);
                if v.matched {
                    return Validation::hit(format!(
                        "Matched item from expected iterable: {}",
                        v.reason
                    ));
                }
            }
            Validation::miss("No match from expected iterable")
        }
        _ if expected == actual => Validation::hit("Exact match"),
        _ => Validation::miss("Expected and actual values do not match"),
    }
}

/// Validate raw command output. Structured expectations are matched against
/// the output parsed as JSON when it parses, and against the text otherwise.
pub fn validate_output(expected: &Value, output: &str) -> Validation {
    let actual = match expected {
        Value::String(_) => Value::String(output.to_string()),
        _ => serde_json::from_str(output).unwrap_or_else(|_| Value::String(output.to_string())),
    };
    search(expected, &actual)
}

fn match_text(expected: &str, actual: &str) -> Validation {
    let expected = expected.trim();
    let actual = actual.trim();

    if let Ok(re) = Regex::new(expected)
        && re.is_match(actual)
    {
        return Validation::hit(format!("Regex matched: `{expected}`"));
    }
    if actual.contains(expected) {
        return Validation::hit("Substring matched");
    }
    let actual_lower = actual.to_lowercase();
    let actual_tokens: HashSet<&str> = actual_lower.split_whitespace().collect();
    let expected_lower = expected.to_lowercase();
    if expected_lower
        .split_whitespace()
        .all(|token| actual_tokens.contains(token))
    {
        return Validation::hit("Token match");
    }
    Validation::miss("Expected and actual strings do not match")
}

fn match_object(expected: &Map<String, Value>, actual: &Map<String, Value>) -> Validation {
    for (key, value) in expected {
        let Some(found) = actual.get(key) else {
            return Validation::miss(format!("Key '{key}' not found in actual"));
        };
        let v = search(value, found);
        if !v.matched {
            return Validation::miss(format!("Value mismatch for key '{key}': {}", v.reason));
        }
    }
    Validation::hit("Sub-dict matched")
}
