//! Condition and template evaluator
//!
//! A deliberately small expression language: a dotted-path lookup on the
//! left, one comparison operator, and a literal on the right. The grammar is
//! fixed; anything richer belongs in a transform node.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

/// A parsed condition: either a bare truthiness test on a path, or a
/// comparison between a path and a literal.
#[derive(Debug, Clone)]
pub enum Condition {
    Truthy(String),
    Compare { path: String, op: Op, rhs: Value },
}

/// Operator tokens, longest first so `>=` wins over `>`
const OPS: [(&str, Op); 6] = [
    ("===", Op::Eq),
    ("!==", Op::Ne),
    (">=", Op::Ge),
    ("<=", Op::Le),
    (">", Op::Gt),
    ("<", Op::Lt),
];

/// Parse a condition string. Errors carry a human-readable message.
pub fn parse(raw: &str) -> Result<Condition, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty condition".to_string());
    }

    for (token, op) in OPS {
        if let Some(index) = raw.find(token) {
            let path = raw[..index].trim();
            let rhs = raw[index + token.len()..].trim();
            if path.is_empty() {
                return Err(format!("missing left-hand path before `{token}`"));
            }
            if rhs.is_empty() {
                return Err(format!("missing right-hand literal after `{token}`"));
            }
            return Ok(Condition::Compare {
                path: path.to_string(),
                op,
                rhs: coerce_literal(rhs),
            });
        }
    }

    Ok(Condition::Truthy(raw.to_string()))
}

/// Evaluate a condition against an input value. Unparseable conditions and
/// missing paths evaluate to false.
pub fn evaluate(raw: &str, input: &Value) -> bool {
    match parse(raw) {
        Ok(condition) => evaluate_parsed(&condition, input),
        Err(_) => false,
    }
}

pub fn evaluate_parsed(condition: &Condition, input: &Value) -> bool {
    match condition {
        Condition::Truthy(path) => truthy(lookup(input, path).unwrap_or(&Value::Null)),
        Condition::Compare { path, op, rhs } => {
            let lhs = lookup(input, path).unwrap_or(&Value::Null);
            match op {
                Op::Eq => loose_eq(lhs, rhs),
                Op::Ne => !loose_eq(lhs, rhs),
                Op::Gt | Op::Lt | Op::Ge | Op::Le => {
                    let (Some(l), Some(r)) = (as_number(lhs), as_number(rhs)) else {
                        return false;
                    };
                    match op {
                        Op::Gt => l > r,
                        Op::Lt => l < r,
                        Op::Ge => l >= r,
                        Op::Le => l <= r,
                        _ => unreachable!(),
                    }
                }
            }
        }
    }
}

/// Dotted-path lookup. Array indices are numeric segments.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Right-hand literal coercion: quoted string, booleans, null, number;
/// anything else is taken as a bare string.
fn coerce_literal(raw: &str) -> Value {
    let raw = raw.trim();
    if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
        || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
    {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = raw.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(n) {
            return Value::Number(number);
        }
    }
    Value::String(raw.to_string())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Numbers compare numerically regardless of representation; everything else
/// compares structurally.
fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    if let (Some(l), Some(r)) = (as_number_strict(lhs), as_number_strict(rhs)) {
        return l == r;
    }
    lhs == rhs
}

fn as_number_strict(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Replace `{{dotted.path}}` placeholders with values from the input.
/// Unknown paths render as empty strings.
pub fn render_template(template: &str, input: &Value) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            output.push_str(&rest[start..]);
            return output;
        };
        let path = after[..end].trim();
        match lookup(input, path) {
            Some(Value::String(s)) => output.push_str(s),
            Some(Value::Null) | None => {}
            Some(value) => output.push_str(&value.to_string()),
        }
        rest = &after[end + 2..];
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_nested() {
        let value = json!({"payload": {"score": 12, "tags": ["a", "b"]}});
        assert_eq!(lookup(&value, "payload.score"), Some(&json!(12)));
        assert_eq!(lookup(&value, "payload.tags.1"), Some(&json!("b")));
        assert_eq!(lookup(&value, "payload.missing"), None);
    }

    #[test]
    fn test_comparisons() {
        let input = json!({"score": 10, "name": "acme", "open": true});

        assert!(evaluate("score >= 10", &input));
        assert!(evaluate("score > 5", &input));
        assert!(!evaluate("score < 10", &input));
        assert!(evaluate("name === \"acme\"", &input));
        assert!(evaluate("name !== 'globex'", &input));
        assert!(evaluate("open === true", &input));
        assert!(!evaluate("open === false", &input));
    }

    #[test]
    fn test_null_and_missing() {
        let input = json!({"gone": null});
        assert!(evaluate("gone === null", &input));
        assert!(evaluate("missing === null", &input));
        assert!(!evaluate("missing", &input));
    }

    #[test]
    fn test_truthiness() {
        let input = json!({"items": [1], "empty": [], "label": ""});
        assert!(evaluate("items", &input));
        assert!(!evaluate("empty", &input));
        assert!(!evaluate("label", &input));
    }

    #[test]
    fn test_relational_on_non_numbers_is_false() {
        let input = json!({"name": "acme"});
        assert!(!evaluate("name > 3", &input));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("score >=").is_err());
        assert!(parse(">= 3").is_err());
    }

    #[test]
    fn test_template_rendering() {
        let input = json!({"user": {"name": "Ada"}, "count": 3});
        assert_eq!(
            render_template("Hi {{user.name}}, {{count}} new, {{missing}} gone", &input),
            "Hi Ada, 3 new,  gone"
        );
    }
}
