//! Attribute filters for clipping layers, written in CQL2-JSON.
//!
//! Supported: `=`, `!=`/`<>`, `<`, `<=`, `>`, `>=`, `in`, `between`, `like`,
//! `isNull`, `and`, `or`, `not`. Logical operators are accepted both as
//! `{"op": "and", "args": [..]}` and as `{"and": [..]}` / `{"not": q}`.
//! Property references are `{"property": "name"}`; a missing property reads
//! as `null`.

use std::cmp::Ordering;

use serde_json::{Map, Value, json};

use crate::error::Cql2Error;

pub fn evaluate(query: &Value, properties: &Map<String, Value>) -> Result<bool, Cql2Error> {
    let obj = match query {
        Value::Null => return Err(Cql2Error::NullQuery),
        Value::Object(obj) => obj,
        Value::String(s) => return Err(Cql2Error::InvalidFormat(s.clone())),
        other => return Err(Cql2Error::InvalidFormat(other.to_string())),
    };

    if let Some(args) = obj.get("and") {
        return all(args, properties, "and");
    }
    if let Some(args) = obj.get("or") {
        return any(args, properties, "or");
    }
    if let Some(inner) = obj.get("not") {
        return Ok(!evaluate(inner, properties)?);
    }

    let op = obj
        .get("op")
        .and_then(Value::as_str)
        .ok_or_else(|| Cql2Error::InvalidFormat(query.to_string()))?;
    let args = obj
        .get("args")
        .and_then(Value::as_array)
        .ok_or_else(|| Cql2Error::InvalidArguments(op.to_string()))?;
    let arity = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(Cql2Error::InvalidArguments(op.to_string()))
        }
    };

    match op {
        "and" => all_of(args, properties),
        "or" => any_of(args, properties),
        "not" => {
            arity(1)?;
            Ok(!evaluate(&args[0], properties)?)
        }
        "=" | "!=" | "<>" | "<" | "<=" | ">" | ">=" => {
            arity(2)?;
            let l = operand(&args[0], properties);
            let r = operand(&args[1], properties);
            Ok(match op {
                "=" => values_equal(&l, &r),
                "!=" | "<>" => !values_equal(&l, &r),
                "<" => compare(&l, &r) == Some(Ordering::Less),
                "<=" => matches!(compare(&l, &r), Some(Ordering::Less | Ordering::Equal)),
                ">" => compare(&l, &r) == Some(Ordering::Greater),
                _ => matches!(compare(&l, &r), Some(Ordering::Greater | Ordering::Equal)),
            })
        }
        "in" => {
            arity(2)?;
            let v = operand(&args[0], properties);
            Ok(match &args[1] {
                Value::Array(items) => items
                    .iter()
                    .any(|i| values_equal(&v, &operand(i, properties))),
                _ => false,
            })
        }
        "between" => {
            arity(3)?;
            let v = operand(&args[0], properties);
            let lo = operand(&args[1], properties);
            let hi = operand(&args[2], properties);
            Ok(
                matches!(compare(&v, &lo), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(compare(&v, &hi), Some(Ordering::Less | Ordering::Equal)),
            )
        }
        "like" => {
            arity(2)?;
            let v = operand(&args[0], properties);
            let pattern = operand(&args[1], properties);
            Ok(match (v.as_str(), pattern.as_str()) {
                (Some(s), Some(p)) => like(s, p),
                _ => false,
            })
        }
        "isNull" => {
            arity(1)?;
            Ok(operand(&args[0], properties).is_null())
        }
        other => Err(Cql2Error::UnsupportedOperator(other.to_string())),
    }
}

/// Combines two optional filters so that a feature passes if either would.
pub fn consolidate_queries(a: Option<Value>, b: Option<Value>) -> Option<Value> {
    match (a, b) {
        (None, None) => None,
        (Some(q), None) | (None, Some(q)) => Some(q),
        (Some(a), Some(b)) => Some(json!({ "op": "or", "args": [a, b] })),
    }
}

fn all(args: &Value, properties: &Map<String, Value>, op: &str) -> Result<bool, Cql2Error> {
    let list = args
        .as_array()
        .ok_or_else(|| Cql2Error::InvalidArguments(op.to_string()))?;
    all_of(list, properties)
}

fn any(args: &Value, properties: &Map<String, Value>, op: &str) -> Result<bool, Cql2Error> {
    let list = args
        .as_array()
        .ok_or_else(|| Cql2Error::InvalidArguments(op.to_string()))?;
    any_of(list, properties)
}

fn all_of(list: &[Value], properties: &Map<String, Value>) -> Result<bool, Cql2Error> {
    for q in list {
        if !evaluate(q, properties)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_of(list: &[Value], properties: &Map<String, Value>) -> Result<bool, Cql2Error> {
    for q in list {
        if evaluate(q, properties)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn operand(arg: &Value, properties: &Map<String, Value>) -> Value {
    if let Value::Object(obj) = arg {
        if let Some(Value::String(name)) = obj.get("property") {
            return properties.get(name).cloned().unwrap_or(Value::Null);
        }
    }
    arg.clone()
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// SQL LIKE: `%` matches any run, `_` one character.
fn like(s: &str, pattern: &str) -> bool {
    let s: Vec<char> = s.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    let (mut si, mut pi) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while si < s.len() {
        if pi < p.len() && (p[pi] == '_' || p[pi] == s[si]) {
            si += 1;
            pi += 1;
        } else if pi < p.len() && p[pi] == '%' {
            star = Some((pi, si));
            pi += 1;
        } else if let Some((sp, ss)) = star {
            pi = sp + 1;
            si = ss + 1;
            star = Some((sp, ss + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '%')
}
