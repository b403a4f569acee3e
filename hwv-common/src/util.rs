//! Shared utilities.

use regex::Regex;
use std::sync::LazyLock;

/// A credential key or flag followed by its value. The value is a quoted
/// string (escapes allowed in double quotes) or a run of non-space characters.
static SECRET_ASSIGNMENT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(concat!(
        r#"(?P<key>\bsshpass -p |\b[A-Z_]*(?:PASSWORD|PASS|TOKEN|API_KEY|SECRET)=|--(?:password|token)[ =])"#,
        r#"(?:"(?:[^"\\]|\\.)*"|'[^']*'|\S+)"#,
    ))
    .ok()
});

/// Mask credentials in a command line before it is logged.
///
/// Covers `sshpass -p`, password/token environment assignments and the
/// usual `--password`/`--token` flags. The key or flag is kept, the value
/// becomes `***`.
pub fn mask_sensitive_command(cmd: &str) -> String {
    match SECRET_ASSIGNMENT.as_ref() {
        Some(re) => re.replace_all(cmd, "${key}***").into_owned(),
        // Never log the raw command when the masker is unavailable.
        None => "***".to_string(),
    }
}

/// Collapse every run of non-word characters into `_` for use in file names.
pub fn sanitize_file_stem(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.chars() {
        if c.is_alphanumeric() || c == '_' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

/// Truncate to `max` characters, marking the cut with `...`.
pub fn shorten(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}
