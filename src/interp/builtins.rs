//! Builtin functions and the importable standard modules.

use std::cell::RefCell;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::rc::Rc;

use serde::Serialize;
use serde_json::ser::{Formatter, PrettyFormatter};

use super::ast::BinOp;
use super::error::{type_error, value_error, ErrorKind, EvalError, EvalResult};
use super::eval::{binop, Machine};
use super::value::{Dict, FileHandle, Module, Stream, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathFn {
    Sqrt,
    Floor,
    Ceil,
    Pow,
    Log,
    Exp,
    Sin,
    Cos,
    Fabs,
}

impl MathFn {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sqrt" => MathFn::Sqrt,
            "floor" => MathFn::Floor,
            "ceil" => MathFn::Ceil,
            "pow" => MathFn::Pow,
            "log" => MathFn::Log,
            "exp" => MathFn::Exp,
            "sin" => MathFn::Sin,
            "cos" => MathFn::Cos,
            "fabs" => MathFn::Fabs,
            _ => return None,
        })
    }

    fn name(&self) -> &'static str {
        match self {
            MathFn::Sqrt => "sqrt",
            MathFn::Floor => "floor",
            MathFn::Ceil => "ceil",
            MathFn::Pow => "pow",
            MathFn::Log => "log",
            MathFn::Exp => "exp",
            MathFn::Sin => "sin",
            MathFn::Cos => "cos",
            MathFn::Fabs => "fabs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Print,
    Len,
    Range,
    Str,
    Int,
    Float,
    Bool,
    List,
    Dict,
    Tuple,
    Abs,
    Min,
    Max,
    Sum,
    Sorted,
    Reversed,
    Enumerate,
    Zip,
    Round,
    Repr,
    Type,
    Any,
    All,
    Open,
    /// `ValueError(...)` and friends.
    Exception(ErrorKind),
    Math(MathFn),
    JsonDumps,
    JsonLoads,
    OsGetcwd,
    OsListdir,
}

impl Builtin {
    /// Resolves a bare name to a builtin. Module functions are only
    /// reachable through their module.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "print" => Builtin::Print,
            "len" => Builtin::Len,
            "range" => Builtin::Range,
            "str" => Builtin::Str,
            "int" => Builtin::Int,
            "float" => Builtin::Float,
            "bool" => Builtin::Bool,
            "list" => Builtin::List,
            "dict" => Builtin::Dict,
            "tuple" => Builtin::Tuple,
            "abs" => Builtin::Abs,
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            "sum" => Builtin::Sum,
            "sorted" => Builtin::Sorted,
            "reversed" => Builtin::Reversed,
            "enumerate" => Builtin::Enumerate,
            "zip" => Builtin::Zip,
            "round" => Builtin::Round,
            "repr" => Builtin::Repr,
            "type" => Builtin::Type,
            "any" => Builtin::Any,
            "all" => Builtin::All,
            "open" => Builtin::Open,
            other => return ErrorKind::from_constructor(other).map(Builtin::Exception),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Print => "print",
            Builtin::Len => "len",
            Builtin::Range => "range",
            Builtin::Str => "str",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::Bool => "bool",
            Builtin::List => "list",
            Builtin::Dict => "dict",
            Builtin::Tuple => "tuple",
            Builtin::Abs => "abs",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Sum => "sum",
            Builtin::Sorted => "sorted",
            Builtin::Reversed => "reversed",
            Builtin::Enumerate => "enumerate",
            Builtin::Zip => "zip",
            Builtin::Round => "round",
            Builtin::Repr => "repr",
            Builtin::Type => "type",
            Builtin::Any => "any",
            Builtin::All => "all",
            Builtin::Open => "open",
            Builtin::Exception(kind) => kind.name(),
            Builtin::Math(f) => f.name(),
            Builtin::JsonDumps => "dumps",
            Builtin::JsonLoads => "loads",
            Builtin::OsGetcwd => "getcwd",
            Builtin::OsListdir => "listdir",
        }
    }
}

/// Looks up `module.name`.
pub fn module_attr(module: Module, name: &str) -> EvalResult<Value> {
    let value = match (module, name) {
        (Module::Math, "pi") => Some(Value::Float(std::f64::consts::PI)),
        (Module::Math, "e") => Some(Value::Float(std::f64::consts::E)),
        (Module::Math, "tau") => Some(Value::Float(std::f64::consts::TAU)),
        (Module::Math, "inf") => Some(Value::Float(f64::INFINITY)),
        (Module::Math, "nan") => Some(Value::Float(f64::NAN)),
        (Module::Math, other) => MathFn::from_name(other).map(|f| Value::Builtin(Builtin::Math(f))),
        (Module::Sys, "stdout") => Some(Value::Stream(Stream::Stdout)),
        (Module::Sys, "stderr") => Some(Value::Stream(Stream::Stderr)),
        (Module::Sys, "maxsize") => Some(Value::Int(i64::MAX)),
        (Module::Json, "dumps") => Some(Value::Builtin(Builtin::JsonDumps)),
        (Module::Json, "loads") => Some(Value::Builtin(Builtin::JsonLoads)),
        (Module::Os, "getcwd") => Some(Value::Builtin(Builtin::OsGetcwd)),
        (Module::Os, "listdir") => Some(Value::Builtin(Builtin::OsListdir)),
        (Module::Os, "sep") => Some(Value::from(std::path::MAIN_SEPARATOR.to_string())),
        _ => None,
    };
    value.ok_or_else(|| {
        EvalError::new(
            ErrorKind::AttributeError,
            format!("module '{}' has no attribute '{name}'", module.name()),
        )
    })
}

// ── Argument helpers ────────────────────────────────────

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> EvalResult<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{min}")
        } else {
            format!("{min} to {max}")
        };
        return Err(type_error(format!(
            "{name}() takes {expected} arguments ({} given)",
            args.len()
        )));
    }
    Ok(())
}

fn take_kwarg(kwargs: &mut Vec<(String, Value)>, key: &str) -> Option<Value> {
    let index = kwargs.iter().position(|(k, _)| k == key)?;
    Some(kwargs.remove(index).1)
}

fn no_kwargs(name: &str, kwargs: &[(String, Value)]) -> EvalResult<()> {
    match kwargs.first() {
        Some((key, _)) => Err(type_error(format!(
            "{name}() got an unexpected keyword argument '{key}'"
        ))),
        None => Ok(()),
    }
}

fn int_arg(name: &str, value: &Value) -> EvalResult<i64> {
    value.as_int().ok_or_else(|| {
        type_error(format!(
            "{name}() expected an integer, got '{}'",
            value.type_name()
        ))
    })
}

fn float_arg(name: &str, value: &Value) -> EvalResult<f64> {
    value.as_float().ok_or_else(|| {
        type_error(format!(
            "must be real number, not {} (in {name}())",
            value.type_name()
        ))
    })
}

pub(crate) fn os_error(err: std::io::Error, path: &str) -> EvalError {
    EvalError::new(ErrorKind::OSError, format!("{err}: '{path}'"))
}

// ── Dispatch ────────────────────────────────────────────

pub(crate) fn call(
    m: &mut Machine<'_>,
    builtin: Builtin,
    mut args: Vec<Value>,
    mut kwargs: Vec<(String, Value)>,
) -> EvalResult<Value> {
    let name = builtin.name();
    match builtin {
        Builtin::Print => {
            let sep = take_kwarg(&mut kwargs, "sep").map(|v| v.to_str());
            let end = take_kwarg(&mut kwargs, "end").map(|v| v.to_str());
            let file = take_kwarg(&mut kwargs, "file");
            no_kwargs(name, &kwargs)?;
            let mut text = args
                .iter()
                .map(Value::to_str)
                .collect::<Vec<_>>()
                .join(sep.as_deref().unwrap_or(" "));
            text.push_str(end.as_deref().unwrap_or("\n"));
            match file {
                None | Some(Value::None) | Some(Value::Stream(Stream::Stdout)) => {
                    m.ctx.output.write(Stream::Stdout, &text)
                }
                Some(Value::Stream(Stream::Stderr)) => m.ctx.output.write(Stream::Stderr, &text),
                Some(Value::File(handle)) => write_handle(&mut handle.borrow_mut(), &text)?,
                Some(other) => {
                    return Err(type_error(format!(
                        "print() file must be a stream, not '{}'",
                        other.type_name()
                    )))
                }
            }
            Ok(Value::None)
        }
        Builtin::Len => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            Ok(Value::Int(args[0].len()? as i64))
        }
        Builtin::Range => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 3)?;
            let ints = args
                .iter()
                .map(|v| int_arg(name, v))
                .collect::<EvalResult<Vec<_>>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => unreachable!("arity checked"),
            };
            if step == 0 {
                return Err(value_error("range() arg 3 must not be zero"));
            }
            Ok(Value::Range { start, stop, step })
        }
        Builtin::Str => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            Ok(Value::from(args.first().map(Value::to_str).unwrap_or_default()))
        }
        Builtin::Int => {
            let base = take_kwarg(&mut kwargs, "base");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 2)?;
            let base = match args.get(1).or(base.as_ref()) {
                Some(b) => Some(int_arg(name, b)?),
                None => None,
            };
            match args.first() {
                None => Ok(Value::Int(0)),
                Some(v) => to_int(v, base),
            }
        }
        Builtin::Float => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Float(0.0)),
                Some(v) => to_float(v),
            }
        }
        Builtin::Bool => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
        }
        Builtin::List => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::list(Vec::new())),
                Some(v) => Ok(Value::list(v.collect()?)),
            }
        }
        Builtin::Tuple => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::tuple(Vec::new())),
                Some(v) => Ok(Value::tuple(v.collect()?)),
            }
        }
        Builtin::Dict => {
            arity(name, &args, 0, 1)?;
            let mut dict = Dict::new();
            if let Some(source) = args.first() {
                match source {
                    Value::Dict(d) => dict = d.borrow().clone(),
                    other => {
                        for pair in other.iterate()? {
                            let pair = pair.collect()?;
                            let [k, v]: [Value; 2] = pair.try_into().map_err(|_| {
                                value_error("dictionary update sequence element has wrong length")
                            })?;
                            dict.insert(k, v)?;
                        }
                    }
                }
            }
            for (k, v) in kwargs {
                dict.insert(Value::from(k), v)?;
            }
            Ok(Value::dict(dict))
        }
        Builtin::Abs => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Float(f) => Ok(Value::Float(f.abs())),
                v => match v.as_int() {
                    Some(i) => i.checked_abs().map(Value::Int).ok_or_else(|| {
                        EvalError::new(ErrorKind::OverflowError, "integer overflow")
                    }),
                    None => Err(type_error(format!(
                        "bad operand type for abs(): '{}'",
                        v.type_name()
                    ))),
                },
            }
        }
        Builtin::Min | Builtin::Max => {
            let key = take_kwarg(&mut kwargs, "key");
            let default = take_kwarg(&mut kwargs, "default");
            no_kwargs(name, &kwargs)?;
            let items = match args.len() {
                0 => return Err(type_error(format!("{name} expected at least 1 argument, got 0"))),
                1 => args[0].collect()?,
                _ => args,
            };
            let want = if builtin == Builtin::Max {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Less
            };
            let mut best: Option<(Value, Value)> = None;
            for item in items {
                let k = apply_key(m, key.as_ref(), &item)?;
                let replace = match &best {
                    None => true,
                    Some((best_key, _)) => k.py_cmp(best_key)? == want,
                };
                if replace {
                    best = Some((k, item));
                }
            }
            match (best, default) {
                (Some((_, item)), _) => Ok(item),
                (None, Some(default)) => Ok(default),
                (None, None) => Err(value_error(format!("{name}() arg is an empty sequence"))),
            }
        }
        Builtin::Sum => {
            let start = take_kwarg(&mut kwargs, "start");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 2)?;
            let mut total = args.get(1).cloned().or(start).unwrap_or(Value::Int(0));
            if matches!(total, Value::Str(_)) {
                return Err(type_error("sum() can't sum strings [use ''.join(seq) instead]"));
            }
            for item in args[0].iterate()? {
                total = binop(BinOp::Add, &total, &item)?;
            }
            Ok(total)
        }
        Builtin::Sorted => {
            let key = take_kwarg(&mut kwargs, "key");
            let reverse = take_kwarg(&mut kwargs, "reverse").is_some_and(|v| v.truthy());
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            let items = args[0].collect()?;
            Ok(Value::list(sort_values(m, items, key.as_ref(), reverse)?))
        }
        Builtin::Reversed => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            let mut items = args[0].collect()?;
            items.reverse();
            Ok(Value::list(items))
        }
        Builtin::Enumerate => {
            let start = take_kwarg(&mut kwargs, "start");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 2)?;
            let start = match args.get(1).or(start.as_ref()) {
                Some(v) => int_arg(name, v)?,
                None => 0,
            };
            let items = args[0]
                .iterate()?
                .enumerate()
                .map(|(i, v)| Value::tuple(vec![Value::Int(start + i as i64), v]))
                .collect();
            Ok(Value::list(items))
        }
        Builtin::Zip => {
            no_kwargs(name, &kwargs)?;
            let columns = args
                .iter()
                .map(Value::collect)
                .collect::<EvalResult<Vec<_>>>()?;
            let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
            let items = (0..rows)
                .map(|i| Value::tuple(columns.iter().map(|c| c[i].clone()).collect()))
                .collect();
            Ok(Value::list(items))
        }
        Builtin::Round => {
            let ndigits = take_kwarg(&mut kwargs, "ndigits");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 2)?;
            let ndigits = match args.get(1).or(ndigits.as_ref()) {
                None | Some(Value::None) => None,
                Some(v) => Some(int_arg(name, v)?),
            };
            round(&args[0], ndigits)
        }
        Builtin::Repr => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            Ok(Value::from(args[0].repr()))
        }
        Builtin::Type => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            Ok(Value::from(format!("<class '{}'>", args[0].type_name())))
        }
        Builtin::Any | Builtin::All => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            let mut items = args[0].iterate()?;
            Ok(Value::Bool(if builtin == Builtin::Any {
                items.any(|v| v.truthy())
            } else {
                items.all(|v| v.truthy())
            }))
        }
        Builtin::Open => {
            let mode = take_kwarg(&mut kwargs, "mode");
            take_kwarg(&mut kwargs, "encoding");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 2)?;
            let path = args[0]
                .as_str()
                .ok_or_else(|| type_error("open() path must be a string"))?
                .to_string();
            let mode = args.get(1).or(mode.as_ref()).map(Value::to_str);
            open_file(m, &path, mode.as_deref().unwrap_or("r"))
        }
        Builtin::Exception(kind) => {
            no_kwargs(name, &kwargs)?;
            let message = match args.len() {
                0 => String::new(),
                1 => args[0].to_str(),
                _ => Value::tuple(args).repr(),
            };
            Ok(Value::Exception(kind, Rc::from(message)))
        }
        Builtin::Math(f) => {
            no_kwargs(name, &kwargs)?;
            math_call(f, &args)
        }
        Builtin::JsonDumps => {
            let indent = take_kwarg(&mut kwargs, "indent");
            take_kwarg(&mut kwargs, "sort_keys");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            let indent = match indent {
                None | Some(Value::None) => None,
                Some(v) => Some(int_arg(name, &v)?.max(0) as usize),
            };
            json_dumps(&args[0], indent).map(Value::from)
        }
        Builtin::JsonLoads => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            let text = args[0]
                .as_str()
                .ok_or_else(|| type_error("the JSON object must be str"))?;
            let json: serde_json::Value =
                serde_json::from_str(text).map_err(|e| value_error(e.to_string()))?;
            Value::from_json(&json)
        }
        Builtin::OsGetcwd => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 0)?;
            Ok(Value::from(m.ctx.working_dir().display().to_string()))
        }
        Builtin::OsListdir => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            let path = args.pop().map(|v| v.to_str()).unwrap_or_else(|| ".".into());
            let dir = m.ctx.resolve_path(&path);
            let mut names = std::fs::read_dir(&dir)
                .map_err(|e| os_error(e, &path))?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>();
            names.sort();
            Ok(Value::list(names.into_iter().map(Value::from).collect()))
        }
    }
}

fn apply_key(m: &mut Machine<'_>, key: Option<&Value>, item: &Value) -> EvalResult<Value> {
    match key {
        None | Some(Value::None) => Ok(item.clone()),
        Some(f) => m.call_value(f, vec![item.clone()], Vec::new()),
    }
}

/// Stable sort by (optional) key; the first comparison error wins.
pub(crate) fn sort_values(
    m: &mut Machine<'_>,
    items: Vec<Value>,
    key: Option<&Value>,
    reverse: bool,
) -> EvalResult<Vec<Value>> {
    let mut keyed = items
        .into_iter()
        .map(|item| Ok((apply_key(m, key, &item)?, item)))
        .collect::<EvalResult<Vec<_>>>()?;
    let mut failure = None;
    keyed.sort_by(|(a, _), (b, _)| {
        let ordering = match a.py_cmp(b) {
            Ok(o) => o,
            Err(e) => {
                failure.get_or_insert(e);
                std::cmp::Ordering::Equal
            }
        };
        if reverse {
            ordering.reverse()
        } else {
            ordering
        }
    });
    if let Some(err) = failure {
        return Err(err);
    }
    Ok(keyed.into_iter().map(|(_, item)| item).collect())
}

fn to_int(value: &Value, base: Option<i64>) -> EvalResult<Value> {
    match (value, base) {
        (Value::Str(s), base) => {
            let base = base.unwrap_or(10);
            if !(2..=36).contains(&base) {
                return Err(value_error("int() base must be >= 2 and <= 36"));
            }
            let trimmed = s.trim().replace('_', "");
            let (negative, digits) = match trimmed.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed.as_str())),
            };
            let digits = match base {
                16 => digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")).unwrap_or(digits),
                8 => digits.strip_prefix("0o").or_else(|| digits.strip_prefix("0O")).unwrap_or(digits),
                2 => digits.strip_prefix("0b").or_else(|| digits.strip_prefix("0B")).unwrap_or(digits),
                _ => digits,
            };
            let invalid = || {
                value_error(format!(
                    "invalid literal for int() with base {base}: {}",
                    value.repr()
                ))
            };
            if digits.is_empty() {
                return Err(invalid());
            }
            let magnitude = i64::from_str_radix(digits, base as u32).map_err(|e| {
                if matches!(
                    e.kind(),
                    std::num::IntErrorKind::PosOverflow | std::num::IntErrorKind::NegOverflow
                ) {
                    EvalError::new(ErrorKind::OverflowError, "int too large")
                } else {
                    invalid()
                }
            })?;
            Ok(Value::Int(if negative { -magnitude } else { magnitude }))
        }
        (_, Some(_)) => Err(type_error("int() can't convert non-string with explicit base")),
        (Value::Float(f), None) => {
            if !f.is_finite() {
                return Err(value_error(format!(
                    "cannot convert float {} to integer",
                    value.repr()
                )));
            }
            let truncated = f.trunc();
            if truncated.abs() >= 9.223_372_036_854_776e18 {
                return Err(EvalError::new(ErrorKind::OverflowError, "int too large"));
            }
            Ok(Value::Int(truncated as i64))
        }
        (v, None) => v.as_int().map(Value::Int).ok_or_else(|| {
            type_error(format!(
                "int() argument must be a string or a number, not '{}'",
                v.type_name()
            ))
        }),
    }
}

fn to_float(value: &Value) -> EvalResult<Value> {
    if let Value::Str(s) = value {
        let text = s.trim().to_ascii_lowercase();
        let parsed = match text.as_str() {
            "inf" | "+inf" | "infinity" => Some(f64::INFINITY),
            "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
            "nan" | "+nan" | "-nan" => Some(f64::NAN),
            other => other.replace('_', "").parse::<f64>().ok(),
        };
        return parsed.map(Value::Float).ok_or_else(|| {
            value_error(format!("could not convert string to float: {}", value.repr()))
        });
    }
    value.as_float().map(Value::Float).ok_or_else(|| {
        type_error(format!(
            "float() argument must be a string or a number, not '{}'",
            value.type_name()
        ))
    })
}

fn round(value: &Value, ndigits: Option<i64>) -> EvalResult<Value> {
    match (value, ndigits) {
        (Value::Float(f), None) => {
            if !f.is_finite() {
                return Err(EvalError::new(
                    ErrorKind::OverflowError,
                    "cannot convert float infinity to integer",
                ));
            }
            Ok(Value::Int(f.round_ties_even() as i64))
        }
        (Value::Float(f), Some(n)) => {
            let scale = 10f64.powi(n.clamp(-308, 308) as i32);
            Ok(Value::Float((f * scale).round_ties_even() / scale))
        }
        (v, _) => v
            .as_int()
            .map(Value::Int)
            .ok_or_else(|| type_error(format!("type {} doesn't define __round__", v.type_name()))),
    }
}

fn math_call(f: MathFn, args: &[Value]) -> EvalResult<Value> {
    let name = f.name();
    let domain = || value_error("math domain error");
    let range = || EvalError::new(ErrorKind::OverflowError, "math range error");
    let x = || -> EvalResult<f64> {
        arity(name, args, 1, 1)?;
        float_arg(name, &args[0])
    };
    let float = match f {
        MathFn::Sqrt => {
            let x = x()?;
            if x < 0.0 {
                return Err(domain());
            }
            x.sqrt()
        }
        MathFn::Floor | MathFn::Ceil => {
            arity(name, args, 1, 1)?;
            if let Some(i) = args[0].as_int() {
                return Ok(Value::Int(i));
            }
            let x = float_arg(name, &args[0])?;
            let rounded = if f == MathFn::Floor { x.floor() } else { x.ceil() };
            if !rounded.is_finite() || rounded.abs() >= 9.223_372_036_854_776e18 {
                return Err(EvalError::new(
                    ErrorKind::OverflowError,
                    "cannot convert float to integer",
                ));
            }
            return Ok(Value::Int(rounded as i64));
        }
        MathFn::Pow => {
            arity(name, args, 2, 2)?;
            let (a, b) = (float_arg(name, &args[0])?, float_arg(name, &args[1])?);
            let r = a.powf(b);
            if r.is_nan() && !a.is_nan() && !b.is_nan() {
                return Err(domain());
            }
            if r.is_infinite() && a.is_finite() && b.is_finite() {
                return Err(range());
            }
            r
        }
        MathFn::Log => {
            arity(name, args, 1, 2)?;
            let x = float_arg(name, &args[0])?;
            if x <= 0.0 {
                return Err(domain());
            }
            match args.get(1) {
                None => x.ln(),
                Some(base) => {
                    let base = float_arg(name, base)?;
                    if base <= 0.0 || base == 1.0 {
                        return Err(domain());
                    }
                    x.ln() / base.ln()
                }
            }
        }
        MathFn::Exp => {
            let r = x()?.exp();
            if r.is_infinite() {
                return Err(range());
            }
            r
        }
        MathFn::Sin => x()?.sin(),
        MathFn::Cos => x()?.cos(),
        MathFn::Fabs => x()?.abs(),
    };
    Ok(Value::Float(float))
}

fn open_file(m: &mut Machine<'_>, path: &str, mode: &str) -> EvalResult<Value> {
    let resolved = m.ctx.resolve_path(path);
    let mut options = OpenOptions::new();
    let writable = match mode.replace(['t', 'b'], "").as_str() {
        "r" => {
            options.read(true);
            false
        }
        "w" => {
            options.write(true).create(true).truncate(true);
            true
        }
        "a" => {
            options.append(true).create(true);
            true
        }
        "r+" => {
            options.read(true).write(true);
            true
        }
        _ => return Err(value_error(format!("invalid mode: '{mode}'"))),
    };
    let file = options.open(&resolved).map_err(|e| os_error(e, path))?;
    Ok(Value::File(Rc::new(RefCell::new(FileHandle {
        path: path.to_string(),
        writable,
        file: Some(file),
    }))))
}

// ── json.dumps ──────────────────────────────────────────

/// Compact formatter matching the conventional `", "` / `": "` spacing.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W: ?Sized + std::io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> std::io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + std::io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> std::io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + std::io::Write>(
        &mut self,
        writer: &mut W,
    ) -> std::io::Result<()> {
        writer.write_all(b": ")
    }
}

pub(crate) fn json_dumps(value: &Value, indent: Option<usize>) -> EvalResult<String> {
    let json = value.to_json();
    let mut out = Vec::new();
    let written = match indent {
        Some(width) => {
            let pad = " ".repeat(width);
            let mut ser =
                serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(pad.as_bytes()));
            json.serialize(&mut ser)
        }
        None => {
            let mut ser = serde_json::Serializer::with_formatter(&mut out, SpacedFormatter);
            json.serialize(&mut ser)
        }
    };
    written.map_err(|e| value_error(e.to_string()))?;
    String::from_utf8(out).map_err(|e| value_error(e.to_string()))
}

/// Writes text to an open file handle.
pub(crate) fn write_handle(handle: &mut FileHandle, text: &str) -> EvalResult<()> {
    if !handle.writable {
        return Err(EvalError::new(ErrorKind::OSError, "not writable"));
    }
    let path = handle.path.clone();
    let file = handle
        .file
        .as_mut()
        .ok_or_else(|| value_error("I/O operation on closed file."))?;
    file.write_all(text.as_bytes()).map_err(|e| os_error(e, &path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{EvalContext, Evaluator, Interpreter};

    fn eval_repr(code: &str) -> Result<String, EvalError> {
        let code = format!("{code}\n");
        std::thread::Builder::new()
            .stack_size(16 * 1024 * 1024)
            .spawn(move || -> Result<String, EvalError> {
                let mut ctx = EvalContext::new(std::env::temp_dir());
                Interpreter::default().evaluate(&code, &mut ctx)?;
                Ok(ctx.namespace.get("result").map(Value::repr).unwrap_or_default())
            })
            .unwrap()
            .join()
            .unwrap()
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Builtin::from_name("print"), Some(Builtin::Print));
        assert_eq!(
            Builtin::from_name("KeyError"),
            Some(Builtin::Exception(ErrorKind::KeyError))
        );
        assert_eq!(Builtin::from_name("sqrt"), None);
        assert_eq!(Builtin::from_name("eval"), None);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(eval_repr("result = int('  42 ')").unwrap(), "42");
        assert_eq!(eval_repr("result = int('ff', 16)").unwrap(), "255");
        assert_eq!(eval_repr("result = int(-3.9)").unwrap(), "-3");
        assert_eq!(eval_repr("result = float('2.5')").unwrap(), "2.5");
        assert_eq!(eval_repr("result = str(1.0)").unwrap(), "'1.0'");
        let err = eval_repr("result = int('abc')").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValueError);
        assert_eq!(err.message, "invalid literal for int() with base 10: 'abc'");
    }

    #[test]
    fn test_round_ties_to_even() {
        assert_eq!(eval_repr("result = round(2.5), round(3.5)").unwrap(), "(2, 4)");
        assert_eq!(eval_repr("result = round(1.23456, 3)").unwrap(), "1.235");
    }

    #[test]
    fn test_min_max_with_key() {
        assert_eq!(
            eval_repr("result = max(['aa', 'b', 'cccc'], key=len)").unwrap(),
            "'cccc'"
        );
        assert_eq!(eval_repr("result = min(3, 1, 2)").unwrap(), "1");
        let err = eval_repr("result = max([])").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValueError);
    }

    #[test]
    fn test_sorted_mixed_types_fails() {
        let err = eval_repr("result = sorted([1, 'a'])").unwrap_err();
        assert_eq!(err.kind, ErrorKind::TypeError);
    }

    #[test]
    fn test_enumerate_and_zip() {
        assert_eq!(
            eval_repr("result = list(enumerate('ab', 1))").unwrap(),
            "[(1, 'a'), (2, 'b')]"
        );
        assert_eq!(
            eval_repr("result = zip([1, 2, 3], 'xy')").unwrap(),
            "[(1, 'x'), (2, 'y')]"
        );
    }

    #[test]
    fn test_dict_constructor() {
        assert_eq!(
            eval_repr("result = dict([('a', 1)], b=2)").unwrap(),
            "{'a': 1, 'b': 2}"
        );
    }

    #[test]
    fn test_math_domain_error() {
        let err = eval_repr("import math\nmath.sqrt(-1)").unwrap_err();
        assert_eq!(err.to_string(), "ValueError: math domain error (line 2)");
        assert_eq!(eval_repr("import math\nresult = math.ceil(2.1)").unwrap(), "3");
        assert_eq!(eval_repr("import math\nresult = math.log(8, 2)").unwrap(), "3.0");
    }

    #[test]
    fn test_json_round_trip() {
        assert_eq!(
            eval_repr("import json\nresult = json.dumps({'a': [1, 2.5, None, True]})").unwrap(),
            r#"'{"a": [1, 2.5, null, true]}'"#
        );
        assert_eq!(
            eval_repr("import json\nresult = json.loads('{\"k\": [1, 2]}')['k']").unwrap(),
            "[1, 2]"
        );
        assert_eq!(
            eval_repr("import json\nresult = json.loads('nope')").unwrap_err().kind,
            ErrorKind::ValueError
        );
    }

    #[test]
    fn test_json_dumps_indent() {
        let out = json_dumps(&Value::list(vec![Value::Int(1)]), Some(2)).unwrap();
        assert_eq!(out, "[\n  1\n]");
    }

    #[test]
    fn test_unknown_module_attribute() {
        let err = module_attr(Module::Math, "tan2").unwrap_err();
        assert_eq!(err.kind, ErrorKind::AttributeError);
        assert_eq!(err.message, "module 'math' has no attribute 'tan2'");
    }

    #[test]
    fn test_exception_value() {
        assert_eq!(
            eval_repr("result = ValueError('x')").unwrap(),
            "ValueError('x')"
        );
    }

    #[test]
    fn test_open_missing_file() {
        let err = eval_repr("open('definitely-missing-file.txt')").unwrap_err();
        assert_eq!(err.kind, ErrorKind::OSError);
        assert!(err.message.contains("definitely-missing-file.txt"));
    }
}
