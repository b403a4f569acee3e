//! Entry-criteria expressions.
//!
//! A small boolean language evaluated against the flat diagnostic parameter
//! map. Nothing is ever executed: expressions are tokenized, parsed into an
//! [`Expr`] tree and folded over JSON values.
//!
//! ```text
//! expr   := or
//! or     := and ("or" and)*
//! and    := not ("and" not)*
//! not    := "not" not | cmp
//! cmp    := atom (("=="|"!="|">"|">="|"<"|"<=") atom)?
//! atom   := IDENT | NUMBER | STRING | true | false | none | "(" expr ")"
//! ```

use hwv_common::EntryCriterion;
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("cannot compare {left} {op} {right}")]
    TypeMismatch {
        op: CmpOp,
        left: String,
        right: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(Value),
    And,
    Or,
    Not,
    Cmp(CmpOp),
    LParen,
    RParen,
}

fn syntax(offset: usize, message: impl Into<String>) -> ExpressionError {
    ExpressionError::Syntax {
        offset,
        message: message.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let peek = chars.get(i + 1).map(|(_, c)| *c);

        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '=' | '!' | '<' | '>' => {
                let op = match (c, peek) {
                    ('=', Some('=')) => CmpOp::Eq,
                    ('!', Some('=')) => CmpOp::Ne,
                    ('>', Some('=')) => CmpOp::Ge,
                    ('<', Some('=')) => CmpOp::Le,
                    ('>', _) => CmpOp::Gt,
                    ('<', _) => CmpOp::Lt,
                    _ => return Err(syntax(offset, format!("unexpected '{c}'"))),
                };
                if matches!(op, CmpOp::Eq | CmpOp::Ne | CmpOp::Ge | CmpOp::Le) {
                    i += 1;
                }
                Token::Cmp(op)
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                let mut closed = false;
                i += 1;
                while i < chars.len() {
                    let (_, ch) = chars[i];
                    if ch == '\\' {
                        if let Some((_, escaped)) = chars.get(i + 1) {
                            text.push(*escaped);
                            i += 2;
                            continue;
                        }
                    }
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    text.push(ch);
                    i += 1;
                }
                if !closed {
                    return Err(syntax(offset, "unterminated string"));
                }
                Token::Literal(Value::String(text))
            }
            c if c.is_ascii_digit() || (c == '-' && peek.is_some_and(|p| p.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                tokens.push((offset, Token::Literal(parse_number(&text, offset)?)));
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let token = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" | "True" => Token::Literal(Value::Bool(true)),
                    "false" | "False" => Token::Literal(Value::Bool(false)),
                    "none" | "None" | "null" => Token::Literal(Value::Null),
                    _ => Token::Ident(word),
                };
                tokens.push((offset, token));
                continue;
            }
            other => return Err(syntax(offset, format!("unexpected '{other}'"))),
        };
        tokens.push((offset, token));
        i += 1;
    }
    Ok(tokens)
}

fn parse_number(text: &str, offset: usize) -> Result<Value, ExpressionError> {
    if let Ok(int) = text.parse::<i64>() {
        return Ok(Value::Number(int.into()));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| syntax(offset, format!("invalid number '{text}'")))
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Ident(String),
    Literal(Value),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(o, _)| *o).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.not()?));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.cmp()
    }

    fn cmp(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.atom()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.atom()?;
            return Ok(Expr::Cmp(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn atom(&mut self) -> Result<Expr, ExpressionError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(syntax(self.offset(), "expected ')'")),
                }
            }
            Some(other) => Err(syntax(offset, format!("unexpected {other:?}"))),
            None => Err(syntax(offset, "unexpected end of expression")),
        }
    }
}

/// Parse `input` into an expression tree.
pub fn parse(input: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
    };
    let expr = parser.or()?;
    if parser.pos < parser.tokens.len() {
        return Err(syntax(parser.offset(), "unexpected trailing input"));
    }
    Ok(expr)
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Numbers, with booleans standing in as 1 and 0.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (numeric(left), numeric(right)) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, ExpressionError> {
    use std::cmp::Ordering;
    match op {
        CmpOp::Eq => return Ok(values_equal(left, right)),
        CmpOp::Ne => return Ok(!values_equal(left, right)),
        _ => {}
    }
    let ordering = match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => numeric(left).zip(numeric(right)).and_then(|(a, b)| a.partial_cmp(&b)),
    };
    let Some(ordering) = ordering else {
        return Err(ExpressionError::TypeMismatch {
            op,
            left: left.to_string(),
            right: right.to_string(),
        });
    };
    Ok(match op {
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Eq | CmpOp::Ne => ordering == Ordering::Equal,
    })
}

impl Expr {
    /// Fold the tree to a value. `and`/`or` short-circuit.
    pub fn eval(&self, vars: &HashMap<String, Value>) -> Result<Value, ExpressionError> {
        Ok(match self {
            Self::Ident(name) => vars
                .get(name)
                .cloned()
                .ok_or_else(|| ExpressionError::UnknownIdentifier(name.clone()))?,
            Self::Literal(value) => value.clone(),
            Self::Not(inner) => Value::Bool(!truthy(&inner.eval(vars)?)),
            Self::And(left, right) => {
                Value::Bool(truthy(&left.eval(vars)?) && truthy(&right.eval(vars)?))
            }
            Self::Or(left, right) => {
                Value::Bool(truthy(&left.eval(vars)?) || truthy(&right.eval(vars)?))
            }
            Self::Cmp(op, left, right) => {
                Value::Bool(compare(*op, &left.eval(vars)?, &right.eval(vars)?)?)
            }
        })
    }
}

/// Parse and evaluate one expression to a boolean.
pub fn evaluate_expression(
    input: &str,
    vars: &HashMap<String, Value>,
) -> Result<bool, ExpressionError> {
    Ok(truthy(&parse(input)?.eval(vars)?))
}

/// Result of checking a step's entry criteria.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CriteriaOutcome {
    pub met: bool,
    /// One line per criterion that did not hold.
    pub unmet: Vec<String>,
}

/// Check every criterion; all must hold. Missing or malformed expressions count as unmet.
pub fn evaluate_detailed(
    criteria: &[EntryCriterion],
    vars: &HashMap<String, Value>,
) -> CriteriaOutcome {
    let mut unmet = Vec::new();
    for criterion in criteria {
        let Some(expression) = criterion.expression.as_deref().filter(|e| !e.trim().is_empty())
        else {
            warn!("Entry criterion without an expression");
            unmet.push("<missing expression>".to_string());
            continue;
        };
        match evaluate_expression(expression, vars) {
            Ok(true) => debug!(expression, "Entry criterion met"),
            Ok(false) => unmet.push(expression.to_string()),
            Err(e) => {
                warn!(expression, "Entry criterion could not be evaluated: {e}");
                unmet.push(format!("{expression} ({e})"));
            }
        }
    }
    CriteriaOutcome {
        met: unmet.is_empty(),
        unmet,
    }
}

pub fn evaluate(criteria: &[EntryCriterion], vars: &HashMap<String, Value>) -> bool {
    evaluate_detailed(criteria, vars).met
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn criteria(exprs: &[&str]) -> Vec<EntryCriterion> {
        exprs
            .iter()
            .map(|e| EntryCriterion {
                expression: Some(e.to_string()),
            })
            .collect()
    }

    #[test]
    fn test_and_not_example() {
        let c = criteria(&["x and not y"]);
        assert!(evaluate(&c, &vars(&[("x", json!(true)), ("y", json!(false))])));
        assert!(!evaluate(&c, &vars(&[("x", json!(true)), ("y", json!(true))])));
    }

    #[test]
    fn test_precedence() {
        let v = vars(&[("a", json!(true)), ("b", json!(false)), ("c", json!(false))]);
        // and binds tighter than or
        assert!(evaluate_expression("a or b and c", &v).unwrap());
        assert!(!evaluate_expression("(a or b) and c", &v).unwrap());
        assert!(evaluate_expression("not b and not c", &v).unwrap());
    }

    #[test]
    fn test_comparisons() {
        let v = vars(&[("temp", json!(71.5)), ("count", json!(3)), ("state", json!("Enabled"))]);
        assert!(evaluate_expression("temp > 70", &v).unwrap());
        assert!(evaluate_expression("count == 3.0", &v).unwrap());
        assert!(evaluate_expression("count <= 3 and count >= 3", &v).unwrap());
        assert!(evaluate_expression("state == 'Enabled'", &v).unwrap());
        assert!(evaluate_expression("state != \"Disabled\"", &v).unwrap());
        assert!(evaluate_expression("-1 < count", &v).unwrap());
    }

    #[test]
    fn test_booleans_compare_as_one_and_zero() {
        let v = vars(&[("ok_seen", json!(true)), ("fail_seen", json!(false))]);
        assert!(evaluate_expression("ok_seen == 1", &v).unwrap());
        assert!(evaluate_expression("fail_seen == 0", &v).unwrap());
        assert!(!evaluate_expression("ok_seen == 2", &v).unwrap());
        assert!(evaluate_expression("ok_seen != fail_seen", &v).unwrap());
        assert!(evaluate_expression("ok_seen > fail_seen", &v).unwrap());
        assert!(!evaluate_expression("ok_seen == 'True'", &v).unwrap());
    }

    #[test]
    fn test_literals_and_truthiness() {
        let v = vars(&[("empty", json!("")), ("list", json!([1]))]);
        assert!(evaluate_expression("True and not False", &v).unwrap());
        assert!(!evaluate_expression("none", &v).unwrap());
        assert!(!evaluate_expression("empty", &v).unwrap());
        assert!(evaluate_expression("list", &v).unwrap());
    }

    #[test]
    fn test_errors() {
        let v = vars(&[("s", json!("x"))]);
        assert!(matches!(
            evaluate_expression("missing", &v),
            Err(ExpressionError::UnknownIdentifier(n)) if n == "missing"
        ));
        assert!(matches!(
            evaluate_expression("s > 1", &v),
            Err(ExpressionError::TypeMismatch { .. })
        ));
        assert!(matches!(parse("a and"), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(parse("(a"), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(parse("a b"), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(parse("'open"), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(parse("a = b"), Err(ExpressionError::Syntax { .. })));
    }

    #[test]
    fn test_no_code_execution() {
        // Calls and attribute access are not part of the grammar.
        assert!(parse("__import__('os').system('true')").is_err());
    }

    #[test]
    fn test_malformed_or_missing_is_unmet() {
        let v = vars(&[("x", json!(true))]);
        assert!(!evaluate(&criteria(&["x and"]), &v));
        let missing = vec![EntryCriterion { expression: None }];
        let outcome = evaluate_detailed(&missing, &v);
        assert!(!outcome.met);
        assert_eq!(outcome.unmet.len(), 1);
    }

    #[test]
    fn test_all_criteria_must_hold() {
        let v = vars(&[("x", json!(true)), ("y", json!(false))]);
        let outcome = evaluate_detailed(&criteria(&["x", "y", "x or y"]), &v);
        assert!(!outcome.met);
        assert_eq!(outcome.unmet, vec!["y".to_string()]);
        assert!(evaluate(&[], &v));
    }

    proptest! {
        #[test]
        fn prop_tokenizer_never_panics(input in ".{0,64}") {
            let _ = parse(&input);
        }

        #[test]
        fn prop_x_and_not_x_is_false(x in any::<bool>(), y in any::<bool>()) {
            let v = vars(&[("x", json!(x)), ("y", json!(y))]);
            prop_assert!(!evaluate_expression("x and not x", &v).unwrap());
            prop_assert_eq!(evaluate_expression("x and not y", &v).unwrap(), x && !y);
        }
    }
}
