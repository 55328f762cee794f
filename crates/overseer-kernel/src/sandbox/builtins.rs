//! Pure builtin functions available to every action

use super::error::SandboxError;
use super::value::Value;
use std::cmp::Ordering;

/// Largest list `range` will materialize
const MAX_RANGE_LEN: i64 = 100_000;

/// Largest string (in bytes) or list any operation may produce
pub(crate) const MAX_VALUE_LEN: usize = 100_000;

/// Refuse a result that would exceed [`MAX_VALUE_LEN`]
pub(crate) fn ensure_size(what: &str, len: usize) -> Result<(), SandboxError> {
    if len > MAX_VALUE_LEN {
        return Err(SandboxError::runtime(format!(
            "{what} of length {len} exceeds the limit of {MAX_VALUE_LEN}"
        )));
    }
    Ok(())
}

/// Names resolved before capabilities
pub(crate) const BUILTINS: &[&str] = &[
    "abs", "all", "any", "bool", "enumerate", "float", "int", "keys", "len", "max", "min", "range",
    "sorted", "str", "sum", "zip",
];

pub(crate) fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), SandboxError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{min}..={max}")
        };
        return Err(SandboxError::Arity {
            name: name.to_string(),
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

pub(crate) fn iterate(name: &str, value: &Value) -> Result<Vec<Value>, SandboxError> {
    match value {
        Value::List(items) => Ok(items.clone()),
        Value::Map(map) => Ok(map.keys().map(|k| Value::Str(k.clone())).collect()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        other => Err(SandboxError::type_error(format!(
            "{name}() cannot iterate over {}",
            other.type_name()
        ))),
    }
}

fn int_arg(name: &str, value: &Value) -> Result<i64, SandboxError> {
    match value {
        Value::Int(i) => Ok(*i),
        other => Err(SandboxError::type_error(format!(
            "{name}() expects int, got {}",
            other.type_name()
        ))),
    }
}

fn extremum(name: &str, args: Vec<Value>, want: Ordering) -> Result<Value, SandboxError> {
    let items = if args.len() == 1 {
        iterate(name, &args[0])?
    } else {
        args
    };
    let mut iter = items.into_iter();
    let mut best = iter
        .next()
        .ok_or_else(|| SandboxError::runtime(format!("{name}() of empty sequence")))?;
    for item in iter {
        if item.compare(&best)? == want {
            best = item;
        }
    }
    Ok(best)
}

/// Call a builtin by name
pub(crate) fn call(name: &str, args: Vec<Value>) -> Result<Value, SandboxError> {
    match name {
        "len" => {
            arity(name, &args, 1, 1)?;
            let n = match &args[0] {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.len(),
                Value::Map(map) => map.len(),
                other => {
                    return Err(SandboxError::type_error(format!(
                        "len() of {}",
                        other.type_name()
                    )))
                }
            };
            Ok(Value::Int(i64::try_from(n).unwrap_or(i64::MAX)))
        }
        "range" => {
            let (start, stop, step) = match args.as_slice() {
                [stop] => (0, int_arg(name, stop)?, 1),
                [start, stop] => (int_arg(name, start)?, int_arg(name, stop)?, 1),
                [start, stop, step] => (int_arg(name, start)?, int_arg(name, stop)?, int_arg(name, step)?),
                _ => return arity(name, &args, 1, 3).map(|()| Value::Null),
            };
            if step == 0 {
                return Err(SandboxError::runtime("range() step must not be zero"));
            }
            let span = if step > 0 { stop.saturating_sub(start) } else { start.saturating_sub(stop) };
            if span / step.saturating_abs() > MAX_RANGE_LEN {
                return Err(SandboxError::runtime(format!("range() longer than {MAX_RANGE_LEN}")));
            }
            let mut out = Vec::new();
            let mut i = start;
            while (step > 0 && i < stop) || (step < 0 && i > stop) {
                out.push(Value::Int(i));
                match i.checked_add(step) {
                    Some(next) => i = next,
                    None => break,
                }
            }
            Ok(Value::List(out))
        }
        "min" => {
            arity(name, &args, 1, usize::MAX)?;
            extremum(name, args, Ordering::Less)
        }
        "max" => {
            arity(name, &args, 1, usize::MAX)?;
            extremum(name, args, Ordering::Greater)
        }
        "sorted" => {
            arity(name, &args, 1, 1)?;
            let mut items = iterate(name, &args[0])?;
            let mut failure = None;
            items.sort_by(|a, b| {
                a.compare(b).unwrap_or_else(|e| {
                    failure.get_or_insert(e);
                    Ordering::Equal
                })
            });
            match failure {
                Some(e) => Err(e),
                None => Ok(Value::List(items)),
            }
        }
        "sum" => {
            arity(name, &args, 1, 1)?;
            let mut int_total: i64 = 0;
            let mut float_total: Option<f64> = None;
            for item in iterate(name, &args[0])? {
                match item {
                    Value::Int(i) => {
                        int_total = int_total
                            .checked_add(i)
                            .ok_or_else(|| SandboxError::runtime("integer overflow in sum()"))?;
                    }
                    Value::Float(f) => *float_total.get_or_insert(0.0) += f,
                    other => {
                        return Err(SandboxError::type_error(format!(
                            "sum() of {}",
                            other.type_name()
                        )))
                    }
                }
            }
            Ok(match float_total {
                Some(f) => Value::Float(f + Value::Int(int_total).as_f64().unwrap_or(0.0)),
                None => Value::Int(int_total),
            })
        }
        "enumerate" => {
            arity(name, &args, 1, 1)?;
            let items = iterate(name, &args[0])?;
            Ok(Value::List(
                (0_i64..)
                    .zip(items)
                    .map(|(i, v)| Value::List(vec![Value::Int(i), v]))
                    .collect(),
            ))
        }
        "zip" => {
            arity(name, &args, 2, 2)?;
            let left = iterate(name, &args[0])?;
            let right = iterate(name, &args[1])?;
            Ok(Value::List(
                left.into_iter()
                    .zip(right)
                    .map(|(a, b)| Value::List(vec![a, b]))
                    .collect(),
            ))
        }
        "any" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(iterate(name, &args[0])?.iter().any(Value::truthy)))
        }
        "all" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(iterate(name, &args[0])?.iter().all(Value::truthy)))
        }
        "abs" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Int(i) => i
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| SandboxError::runtime("integer overflow in abs()")),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(SandboxError::type_error(format!("abs() of {}", other.type_name()))),
            }
        }
        "int" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(*i)),
                #[allow(clippy::cast_possible_truncation)]
                Value::Float(f) if f.is_finite() => Ok(Value::Int(f.trunc() as i64)),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Str(s) => s
                    .trim()
                    .parse()
                    .map(Value::Int)
                    .map_err(|_| SandboxError::runtime(format!("invalid int literal '{s}'"))),
                other => Err(SandboxError::type_error(format!("int() of {}", other.type_name()))),
            }
        }
        "float" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                v @ (Value::Int(_) | Value::Float(_)) => Ok(Value::Float(v.as_f64().unwrap_or(0.0))),
                Value::Str(s) => s
                    .trim()
                    .parse()
                    .map(Value::Float)
                    .map_err(|_| SandboxError::runtime(format!("invalid float literal '{s}'"))),
                other => Err(SandboxError::type_error(format!("float() of {}", other.type_name()))),
            }
        }
        "str" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Str(args[0].render()))
        }
        "bool" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(args[0].truthy()))
        }
        "keys" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Map(map) => Ok(Value::List(map.keys().map(|k| Value::Str(k.clone())).collect())),
                other => Err(SandboxError::type_error(format!("keys() of {}", other.type_name()))),
            }
        }
        other => Err(SandboxError::UnknownName(other.to_string())),
    }
}

fn str_arg<'a>(name: &str, args: &'a [Value], idx: usize) -> Result<&'a str, SandboxError> {
    match args.get(idx) {
        Some(Value::Str(s)) => Ok(s),
        Some(other) => Err(SandboxError::type_error(format!(
            "{name}() expects string, got {}",
            other.type_name()
        ))),
        None => Err(SandboxError::Arity {
            name: name.to_string(),
            expected: (idx + 1).to_string(),
            got: args.len(),
        }),
    }
}

/// Call a method on a plain value (strings, lists and maps)
pub(crate) fn call_method(receiver: &Value, method: &str, args: &[Value]) -> Result<Value, SandboxError> {
    match (receiver, method) {
        (Value::Str(s), "lower") => Ok(Value::Str(s.to_lowercase())),
        (Value::Str(s), "upper") => Ok(Value::Str(s.to_uppercase())),
        (Value::Str(s), "strip") => Ok(Value::Str(s.trim().to_string())),
        (Value::Str(s), "startswith") => Ok(Value::Bool(s.starts_with(str_arg(method, args, 0)?))),
        (Value::Str(s), "endswith") => Ok(Value::Bool(s.ends_with(str_arg(method, args, 0)?))),
        (Value::Str(s), "contains") => Ok(Value::Bool(s.contains(str_arg(method, args, 0)?))),
        (Value::Str(s), "split") => {
            let parts: Vec<Value> = match args.first() {
                None => s.split_whitespace().map(Value::from).collect(),
                Some(_) => s.split(str_arg(method, args, 0)?).map(Value::from).collect(),
            };
            Ok(Value::List(parts))
        }
        (Value::Str(sep), "join") => match args.first() {
            Some(Value::List(items)) => {
                let parts: Vec<String> = items.iter().map(Value::render).collect();
                let total = parts.iter().map(String::len).sum::<usize>()
                    + sep.len().saturating_mul(parts.len().saturating_sub(1));
                ensure_size("join() result", total)?;
                Ok(Value::Str(parts.join(sep)))
            }
            _ => Err(SandboxError::type_error("join() expects a list")),
        },
        (Value::List(items), "contains") => Ok(Value::Bool(
            args.first().is_some_and(|needle| items.contains(needle)),
        )),
        (Value::Map(map), "get") => {
            let key = str_arg(method, args, 0)?;
            Ok(map
                .get(key)
                .cloned()
                .unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::Null)))
        }
        (Value::Map(map), "contains") => Ok(Value::Bool(map.contains_key(str_arg(method, args, 0)?))),
        (other, _) => Err(SandboxError::type_error(format!(
            "{} has no method '{method}'",
            other.type_name()
        ))),
    }
}
