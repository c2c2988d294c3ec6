//! Methods on builtin types, plus the string formatting mini-languages
//! (`format()` specs and `%` interpolation).

use std::io::Read as _;

use super::builtins::{os_error, sort_values, write_handle};
use super::error::{type_error, value_error, ErrorKind, EvalError, EvalResult};
use super::eval::Machine;
use super::value::{index_of, key_error, format_float, Dict, Stream, Value};

const STR_METHODS: &[&str] = &[
    "upper",
    "lower",
    "strip",
    "lstrip",
    "rstrip",
    "split",
    "splitlines",
    "join",
    "replace",
    "startswith",
    "endswith",
    "find",
    "count",
    "format",
    "isdigit",
    "isalpha",
];

const LIST_METHODS: &[&str] = &[
    "append", "extend", "pop", "insert", "remove", "index", "count", "sort", "reverse", "copy",
    "clear",
];

const DICT_METHODS: &[&str] = &[
    "keys",
    "values",
    "items",
    "get",
    "pop",
    "update",
    "setdefault",
    "copy",
    "clear",
];

const FILE_METHODS: &[&str] = &["read", "write", "readlines", "close"];

const STREAM_METHODS: &[&str] = &["write", "flush"];

pub(crate) fn has_method(value: &Value, name: &str) -> bool {
    let table = match value {
        Value::Str(_) => STR_METHODS,
        Value::List(_) => LIST_METHODS,
        Value::Dict(_) => DICT_METHODS,
        Value::File(_) => FILE_METHODS,
        Value::Stream(_) => STREAM_METHODS,
        _ => return false,
    };
    table.contains(&name)
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> EvalResult<()> {
    if args.len() < min || args.len() > max {
        return Err(type_error(format!(
            "{name}() takes {} arguments ({} given)",
            if min == max {
                min.to_string()
            } else {
                format!("{min} to {max}")
            },
            args.len()
        )));
    }
    Ok(())
}

fn str_arg<'a>(name: &str, value: &'a Value) -> EvalResult<&'a str> {
    value.as_str().ok_or_else(|| {
        type_error(format!(
            "{name}() argument must be str, not {}",
            value.type_name()
        ))
    })
}

pub(crate) fn call_method(
    m: &mut Machine<'_>,
    receiver: &Value,
    name: &str,
    args: Vec<Value>,
    mut kwargs: Vec<(String, Value)>,
) -> EvalResult<Value> {
    // `sort(key=..., reverse=...)` and `str.format(name=...)` are the only
    // methods taking keyword arguments.
    let accepts_kwargs = matches!(
        (receiver, name),
        (Value::List(_), "sort") | (Value::Str(_), "format")
    );
    if !accepts_kwargs {
        if let Some((key, _)) = kwargs.first() {
            return Err(type_error(format!(
                "{name}() got an unexpected keyword argument '{key}'"
            )));
        }
    }

    match receiver {
        Value::Str(s) => str_method(s, name, &args, &kwargs),
        Value::List(items) => {
            if name == "sort" {
                arity(name, &args, 0, 0)?;
                let key = take(&mut kwargs, "key");
                let reverse = take(&mut kwargs, "reverse").is_some_and(|v| v.truthy());
                if let Some((extra, _)) = kwargs.first() {
                    return Err(type_error(format!(
                        "sort() got an unexpected keyword argument '{extra}'"
                    )));
                }
                let snapshot = items.borrow().to_vec();
                let sorted = sort_values(m, snapshot, key.as_ref(), reverse)?;
                **items.borrow_mut() = sorted;
                return Ok(Value::None);
            }
            list_method(&mut items.borrow_mut(), name, args)
        }
        Value::Dict(d) => dict_method(&mut d.borrow_mut(), name, args),
        Value::File(handle) => {
            let mut handle = handle.borrow_mut();
            match name {
                "read" | "readlines" => {
                    arity(name, &args, 0, 0)?;
                    let path = handle.path.clone();
                    let file = handle
                        .file
                        .as_mut()
                        .ok_or_else(|| value_error("I/O operation on closed file."))?;
                    let mut text = String::new();
                    file.read_to_string(&mut text)
                        .map_err(|e| os_error(e, &path))?;
                    if name == "read" {
                        Ok(Value::from(text))
                    } else {
                        Ok(Value::list(
                            text.split_inclusive('\n').map(Value::from).collect(),
                        ))
                    }
                }
                "write" => {
                    arity(name, &args, 1, 1)?;
                    let text = str_arg(name, &args[0])?;
                    write_handle(&mut handle, text)?;
                    Ok(Value::Int(text.chars().count() as i64))
                }
                _ => {
                    handle.file = None;
                    Ok(Value::None)
                }
            }
        }
        Value::Stream(stream) => match name {
            "write" => {
                arity(name, &args, 1, 1)?;
                let text = str_arg(name, &args[0])?;
                m.ctx.output.write(*stream, text);
                Ok(Value::Int(text.chars().count() as i64))
            }
            _ => Ok(Value::None),
        },
        other => Err(EvalError::new(
            ErrorKind::AttributeError,
            format!("'{}' object has no attribute '{name}'", other.type_name()),
        )),
    }
}

fn take(kwargs: &mut Vec<(String, Value)>, key: &str) -> Option<Value> {
    let index = kwargs.iter().position(|(k, _)| k == key)?;
    Some(kwargs.remove(index).1)
}

// ── str ─────────────────────────────────────────────────

fn char_index(s: &str, byte: usize) -> i64 {
    s[..byte].chars().count() as i64
}

fn strip_with<'a>(s: &'a str, chars: Option<&Value>, left: bool, right: bool) -> EvalResult<&'a str> {
    let set: Option<Vec<char>> = match chars {
        None | Some(Value::None) => None,
        Some(v) => Some(str_arg("strip", v)?.chars().collect()),
    };
    let matches = |c: char| match &set {
        Some(set) => set.contains(&c),
        None => c.is_whitespace(),
    };
    let mut out = s;
    if left {
        out = out.trim_start_matches(matches);
    }
    if right {
        out = out.trim_end_matches(matches);
    }
    Ok(out)
}

fn split(s: &str, sep: Option<&str>, maxsplit: i64) -> EvalResult<Vec<Value>> {
    let limit = if maxsplit < 0 {
        usize::MAX
    } else {
        maxsplit as usize
    };
    let parts: Vec<String> = match sep {
        Some("") => return Err(value_error("empty separator")),
        Some(sep) => s
            .splitn(limit.saturating_add(1), sep)
            .map(String::from)
            .collect(),
        None => {
            let mut parts = Vec::new();
            let mut rest = s.trim_start();
            while !rest.is_empty() {
                if parts.len() == limit {
                    parts.push(rest.trim_end().to_string());
                    break;
                }
                let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                parts.push(rest[..end].to_string());
                rest = rest[end..].trim_start();
            }
            parts
        }
    };
    Ok(parts.into_iter().map(Value::from).collect())
}

fn affix_matches(name: &str, arg: &Value, test: impl Fn(&str) -> bool) -> EvalResult<bool> {
    match arg {
        Value::Tuple(options) => {
            for option in options.iter() {
                if test(str_arg(name, option)?) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Ok(test(str_arg(name, other)?)),
    }
}

fn str_method(
    s: &str,
    name: &str,
    args: &[Value],
    kwargs: &[(String, Value)],
) -> EvalResult<Value> {
    match name {
        "upper" => Ok(Value::from(s.to_uppercase())),
        "lower" => Ok(Value::from(s.to_lowercase())),
        "strip" | "lstrip" | "rstrip" => {
            arity(name, args, 0, 1)?;
            let left = name != "rstrip";
            let right = name != "lstrip";
            Ok(Value::from(strip_with(s, args.first(), left, right)?))
        }
        "split" => {
            arity(name, args, 0, 2)?;
            let sep = match args.first() {
                None | Some(Value::None) => None,
                Some(v) => Some(str_arg(name, v)?),
            };
            let maxsplit = args.get(1).and_then(Value::as_int).unwrap_or(-1);
            Ok(Value::list(split(s, sep, maxsplit)?))
        }
        "splitlines" => Ok(Value::list(s.lines().map(Value::from).collect())),
        "join" => {
            arity(name, args, 1, 1)?;
            let mut parts = Vec::new();
            for (i, item) in args[0].iterate()?.enumerate() {
                match item {
                    Value::Str(text) => parts.push(text),
                    other => {
                        return Err(type_error(format!(
                            "sequence item {i}: expected str instance, {} found",
                            other.type_name()
                        )))
                    }
                }
            }
            Ok(Value::from(parts.iter().map(|p| p.as_ref()).collect::<Vec<_>>().join(s)))
        }
        "replace" => {
            arity(name, args, 2, 3)?;
            let old = str_arg(name, &args[0])?;
            let new = str_arg(name, &args[1])?;
            match args.get(2).and_then(Value::as_int) {
                Some(count) if count >= 0 => Ok(Value::from(s.replacen(old, new, count as usize))),
                _ => Ok(Value::from(s.replace(old, new))),
            }
        }
        "startswith" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Bool(affix_matches(name, &args[0], |p| s.starts_with(p))?))
        }
        "endswith" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Bool(affix_matches(name, &args[0], |p| s.ends_with(p))?))
        }
        "find" => {
            arity(name, args, 1, 1)?;
            let needle = str_arg(name, &args[0])?;
            Ok(Value::Int(s.find(needle).map(|b| char_index(s, b)).unwrap_or(-1)))
        }
        "count" => {
            arity(name, args, 1, 1)?;
            let needle = str_arg(name, &args[0])?;
            let count = if needle.is_empty() {
                s.chars().count() + 1
            } else {
                s.matches(needle).count()
            };
            Ok(Value::Int(count as i64))
        }
        "format" => str_format(s, args, kwargs).map(Value::from),
        "isdigit" => Ok(Value::Bool(
            !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
        )),
        "isalpha" => Ok(Value::Bool(
            !s.is_empty() && s.chars().all(char::is_alphabetic),
        )),
        _ => Err(no_attribute("str", name)),
    }
}

fn no_attribute(type_name: &str, name: &str) -> EvalError {
    EvalError::new(
        ErrorKind::AttributeError,
        format!("'{type_name}' object has no attribute '{name}'"),
    )
}

/// `"{} {name:>5}".format(...)`
fn str_format(template: &str, args: &[Value], kwargs: &[(String, Value)]) -> EvalResult<String> {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    let mut auto_index = 0;
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => field.push(ch),
                        None => return Err(value_error("expected '}' before end of string")),
                    }
                }
                let (key, spec) = field.split_once(':').unwrap_or((field.as_str(), ""));
                let value = if key.is_empty() {
                    let value = args.get(auto_index);
                    auto_index += 1;
                    value
                } else if let Ok(index) = key.parse::<usize>() {
                    args.get(index)
                } else {
                    kwargs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
                };
                let value = value.ok_or_else(|| {
                    if key.is_empty() || key.parse::<usize>().is_ok() {
                        EvalError::new(
                            ErrorKind::IndexError,
                            "Replacement index out of range for positional args tuple",
                        )
                    } else {
                        key_error(&Value::from(key))
                    }
                })?;
                out.push_str(&format_value(value, spec)?);
            }
            '}' => return Err(value_error("Single '}' encountered in format string")),
            other => out.push(other),
        }
    }
    Ok(out)
}

// ── list / dict ─────────────────────────────────────────

fn list_method(items: &mut Vec<Value>, name: &str, args: Vec<Value>) -> EvalResult<Value> {
    match name {
        "append" => {
            arity(name, &args, 1, 1)?;
            items.extend(args);
            Ok(Value::None)
        }
        "extend" => {
            arity(name, &args, 1, 1)?;
            let extra = args[0].collect()?;
            items.extend(extra);
            Ok(Value::None)
        }
        "pop" => {
            arity(name, &args, 0, 1)?;
            if items.is_empty() {
                return Err(EvalError::new(ErrorKind::IndexError, "pop from empty list"));
            }
            let len = items.len() as i64;
            let index = args.first().and_then(Value::as_int).unwrap_or(-1);
            let resolved = if index < 0 { index + len } else { index };
            if resolved < 0 || resolved >= len {
                return Err(EvalError::new(ErrorKind::IndexError, "pop index out of range"));
            }
            Ok(items.remove(resolved as usize))
        }
        "insert" => {
            arity(name, &args, 2, 2)?;
            let len = items.len() as i64;
            let index = args[0]
                .as_int()
                .ok_or_else(|| type_error("list indices must be integers"))?;
            let resolved = if index < 0 { index + len } else { index }.clamp(0, len);
            let mut args = args;
            let value = args.pop().unwrap_or(Value::None);
            items.insert(resolved as usize, value);
            Ok(Value::None)
        }
        "remove" | "index" => {
            arity(name, &args, 1, 1)?;
            let position = index_of(items, &args[0])?;
            match (name, position) {
                ("remove", Some(i)) => {
                    items.remove(i);
                    Ok(Value::None)
                }
                ("remove", None) => Err(value_error("list.remove(x): x not in list")),
                (_, Some(i)) => Ok(Value::Int(i as i64)),
                (_, None) => Err(value_error(format!("{} is not in list", args[0].repr()))),
            }
        }
        "count" => {
            arity(name, &args, 1, 1)?;
            let mut count = 0;
            for item in items.iter() {
                if item.py_eq(&args[0])? {
                    count += 1;
                }
            }
            Ok(Value::Int(count))
        }
        "reverse" => {
            items.reverse();
            Ok(Value::None)
        }
        "copy" => Ok(Value::list(items.clone())),
        "clear" => {
            items.clear();
            Ok(Value::None)
        }
        _ => Err(no_attribute("list", name)),
    }
}

fn dict_method(dict: &mut Dict, name: &str, args: Vec<Value>) -> EvalResult<Value> {
    match name {
        "keys" => Ok(Value::list(dict.keys())),
        "values" => Ok(Value::list(dict.values())),
        "items" => Ok(Value::list(
            dict.entries()
                .iter()
                .map(|(k, v)| Value::tuple(vec![k.clone(), v.clone()]))
                .collect(),
        )),
        "get" => {
            arity(name, &args, 1, 2)?;
            Ok(dict
                .get(&args[0])?
                .cloned()
                .unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
        }
        "pop" => {
            arity(name, &args, 1, 2)?;
            match (dict.remove(&args[0])?, args.get(1)) {
                (Some(v), _) => Ok(v),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(key_error(&args[0])),
            }
        }
        "update" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Dict(other) => {
                    let entries = other.borrow().entries().to_vec();
                    for (k, v) in entries {
                        dict.insert(k, v)?;
                    }
                }
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
            Ok(Value::None)
        }
        "setdefault" => {
            arity(name, &args, 1, 2)?;
            if let Some(existing) = dict.get(&args[0])? {
                return Ok(existing.clone());
            }
            let default = args.get(1).cloned().unwrap_or(Value::None);
            dict.insert(args[0].clone(), default.clone())?;
            Ok(default)
        }
        "copy" => Ok(Value::dict(dict.clone())),
        "clear" => {
            *dict = Dict::new();
            Ok(Value::None)
        }
        _ => Err(no_attribute("dict", name)),
    }
}

// ── Format specs ────────────────────────────────────────

#[derive(Debug, Default)]
struct Spec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    zero: bool,
    width: usize,
    grouping: bool,
    precision: Option<usize>,
    kind: Option<char>,
}

fn parse_spec(spec: &str) -> EvalResult<Spec> {
    let invalid = || value_error(format!("Invalid format specifier '{spec}'"));
    let chars: Vec<char> = spec.chars().collect();
    let mut out = Spec::default();
    let mut i = 0;
    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');

    if chars.len() >= 2 && is_align(chars[1]) {
        out.fill = Some(chars[0]);
        out.align = Some(chars[1]);
        i = 2;
    } else if chars.first().copied().is_some_and(is_align) {
        out.align = Some(chars[0]);
        i = 1;
    }
    if let Some(&c) = chars.get(i) {
        if matches!(c, '+' | '-' | ' ') {
            out.sign = Some(c);
            i += 1;
        }
    }
    if chars.get(i) == Some(&'0') {
        out.zero = true;
        i += 1;
    }
    let start = i;
    while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
        i += 1;
    }
    if i > start {
        let digits: String = chars[start..i].iter().collect();
        out.width = digits.parse().map_err(|_| invalid())?;
    }
    if chars.get(i) == Some(&',') {
        out.grouping = true;
        i += 1;
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        let start = i;
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        if i == start {
            return Err(invalid());
        }
        let digits: String = chars[start..i].iter().collect();
        out.precision = Some(digits.parse().map_err(|_| invalid())?);
    }
    if let Some(&c) = chars.get(i) {
        out.kind = Some(c);
        i += 1;
    }
    if i != chars.len() {
        return Err(invalid());
    }
    Ok(out)
}

fn group_thousands(digits: &str) -> String {
    let (int_part, rest) = match digits.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => digits.split_at(pos),
        None => (digits, ""),
    };
    let mut grouped = String::new();
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped.push_str(rest);
    grouped
}

fn exponent_form(x: f64, precision: usize) -> String {
    let raw = format!("{x:.precision$e}");
    let (mantissa, exponent) = raw.split_once('e').unwrap_or((&raw, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{mantissa}e{sign}{:02}", exponent.abs())
}

/// Applies a format spec (`>10`, `.2f`, `,d`, `08.3f`, ...) to a value.
pub(crate) fn format_value(value: &Value, spec: &str) -> EvalResult<String> {
    if spec.is_empty() {
        return Ok(value.to_str());
    }
    let spec = parse_spec(spec)?;
    let unknown = |code: char| {
        value_error(format!(
            "Unknown format code '{code}' for object of type '{}'",
            value.type_name()
        ))
    };

    let numeric = matches!(value, Value::Int(_) | Value::Float(_) | Value::Bool(_));
    let (negative, body) = match (spec.kind, value) {
        (None | Some('s'), Value::Str(s)) => {
            let text = match spec.precision {
                Some(p) => s.chars().take(p).collect(),
                None => s.to_string(),
            };
            (false, text)
        }
        (Some(code), Value::Str(_)) => return Err(unknown(code)),
        (Some('d'), v) => match v {
            Value::Float(_) => return Err(unknown('d')),
            v => {
                let i = v.as_int().ok_or_else(|| unknown('d'))?;
                (i < 0, i.unsigned_abs().to_string())
            }
        },
        (Some(code @ ('x' | 'X' | 'o' | 'b')), v) => {
            let i = match v {
                Value::Float(_) => return Err(unknown(code)),
                v => v.as_int().ok_or_else(|| unknown(code))?,
            };
            let abs = i.unsigned_abs();
            let text = match code {
                'x' => format!("{abs:x}"),
                'X' => format!("{abs:X}"),
                'o' => format!("{abs:o}"),
                _ => format!("{abs:b}"),
            };
            (i < 0, text)
        }
        (Some(code @ ('f' | 'F' | '%' | 'e' | 'E')), v) => {
            let x = v.as_float().ok_or_else(|| unknown(code))?;
            let precision = spec.precision.unwrap_or(6);
            let text = match code {
                '%' => format!("{:.precision$}%", (x * 100.0).abs()),
                'e' => exponent_form(x.abs(), precision),
                'E' => exponent_form(x.abs(), precision).to_uppercase(),
                _ => format!("{:.precision$}", x.abs()),
            };
            (x.is_sign_negative() && x != 0.0, text)
        }
        (None | Some('g'), v) if numeric => match (v, spec.precision) {
            (Value::Float(f), Some(p)) => (f.is_sign_negative(), format!("{:.p$}", f.abs())),
            (Value::Float(f), None) => (f.is_sign_negative(), format_float(f.abs())),
            (v, _) => {
                let i = v.as_int().unwrap_or(0);
                (i < 0, i.unsigned_abs().to_string())
            }
        },
        (None, v) => (false, v.to_str()),
        (Some(code), _) => return Err(unknown(code)),
    };

    let body = if spec.grouping { group_thousands(&body) } else { body };
    let sign = match (negative, spec.sign) {
        (true, _) => "-",
        (false, Some('+')) if numeric => "+",
        (false, Some(' ')) if numeric => " ",
        _ => "",
    };

    let (fill, align) = match (spec.fill, spec.align, spec.zero) {
        (fill, Some(align), _) => (fill.unwrap_or(' '), align),
        (_, None, true) if numeric => ('0', '='),
        (_, None, _) if numeric => (' ', '>'),
        _ => (' ', '<'),
    };

    let len = sign.chars().count() + body.chars().count();
    let pad = spec.width.saturating_sub(len);
    let padding = |n: usize| fill.to_string().repeat(n);
    Ok(match align {
        '>' => format!("{}{sign}{body}", padding(pad)),
        '^' => format!("{}{sign}{body}{}", padding(pad / 2), padding(pad - pad / 2)),
        '=' => format!("{sign}{}{body}", padding(pad)),
        _ => format!("{sign}{body}{}", padding(pad)),
    })
}

/// `"%s has %d items" % (name, n)`
pub(crate) fn percent_format(template: &str, args: &Value) -> EvalResult<String> {
    let values: Vec<Value> = match args {
        Value::Tuple(items) => items.to_vec(),
        other => vec![other.clone()],
    };
    let mut values = values.into_iter();
    let mut out = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        // flags, width and precision map straight onto a format spec
        let mut align = None;
        let mut sign = None;
        let mut zero = false;
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => align = Some('<'),
                '+' | ' ' => sign = Some(flag),
                '0' => zero = true,
                _ => break,
            }
            chars.next();
        }
        let mut width = String::new();
        while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            width.push(d);
            chars.next();
        }
        let mut precision = String::new();
        if chars.peek() == Some(&'.') {
            chars.next();
            precision.push('.');
            while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                precision.push(d);
                chars.next();
            }
        }
        let code = chars
            .next()
            .ok_or_else(|| value_error("incomplete format"))?;
        let value = values
            .next()
            .ok_or_else(|| type_error("not enough arguments for format string"))?;

        let (value, kind) = match code {
            's' => (Value::from(value.to_str()), "s"),
            'r' => (Value::from(value.repr()), "s"),
            'd' | 'i' => {
                let i = match &value {
                    Value::Float(f) => *f as i64,
                    v => v.as_int().ok_or_else(|| {
                        type_error(format!(
                            "%{code} format: a real number is required, not {}",
                            v.type_name()
                        ))
                    })?,
                };
                (Value::Int(i), "d")
            }
            'f' | 'F' => (value, "f"),
            'e' => (value, "e"),
            'x' => (value, "x"),
            other => {
                return Err(value_error(format!(
                    "unsupported format character '{other}'"
                )))
            }
        };
        let mut spec = String::new();
        if let Some(a) = align {
            spec.push(a);
        }
        if let Some(s) = sign {
            spec.push(s);
        }
        if zero && align.is_none() {
            spec.push('0');
        }
        spec.push_str(&width);
        spec.push_str(&precision);
        spec.push_str(kind);
        out.push_str(&format_value(&value, &spec)?);
    }

    if values.next().is_some() {
        return Err(type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{EvalContext, Evaluator, Interpreter};

    fn eval_repr(code: &str) -> Result<String, EvalError> {
        let code = code.to_string();
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
    fn test_format_specs() {
        assert_eq!(format_value(&Value::Float(3.14159), ".2f").unwrap(), "3.14");
        assert_eq!(format_value(&Value::Int(42), ">5").unwrap(), "   42");
        assert_eq!(format_value(&Value::from("ab"), "*^6").unwrap(), "**ab**");
        assert_eq!(format_value(&Value::Int(1234567), ",").unwrap(), "1,234,567");
        assert_eq!(format_value(&Value::Int(-5), "04d").unwrap(), "-005");
        assert_eq!(format_value(&Value::Float(0.256), ".1%").unwrap(), "25.6%");
        assert_eq!(format_value(&Value::Int(255), "x").unwrap(), "ff");
        assert_eq!(format_value(&Value::Float(12345.678), "e").unwrap(), "1.234568e+04");
        assert_eq!(format_value(&Value::from("left"), "<6").unwrap(), "left  ");
    }

    #[test]
    fn test_format_spec_type_mismatch() {
        let err = format_value(&Value::from("x"), "d").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValueError);
        assert!(format_value(&Value::Int(1), "5q5").is_err());
    }

    #[test]
    fn test_percent_format() {
        let args = Value::tuple(vec![Value::from("apples"), Value::Int(3), Value::Float(1.5)]);
        assert_eq!(
            percent_format("%s: %d @ %.2f (100%%)", &args).unwrap(),
            "apples: 3 @ 1.50 (100%)"
        );
        assert_eq!(percent_format("[%-4s]", &Value::from("a")).unwrap(), "[a   ]");
        assert_eq!(percent_format("%05.1f", &Value::Float(2.26)).unwrap(), "002.3");
        assert!(percent_format("%s %s", &Value::from("one")).is_err());
        assert!(percent_format("%s", &args).is_err());
    }

    #[test]
    fn test_str_methods() {
        assert_eq!(eval_repr("result = '  hi  '.strip()").unwrap(), "'hi'");
        assert_eq!(eval_repr("result = 'xxhixx'.strip('x')").unwrap(), "'hi'");
        assert_eq!(eval_repr("result = 'a,b,,c'.split(',')").unwrap(), "['a', 'b', '', 'c']");
        assert_eq!(eval_repr("result = ' a  b c '.split()").unwrap(), "['a', 'b', 'c']");
        assert_eq!(eval_repr("result = 'a b c'.split(None, 1)").unwrap(), "['a', 'b c']");
        assert_eq!(eval_repr("result = '-'.join(['x', 'y'])").unwrap(), "'x-y'");
        assert_eq!(eval_repr("result = 'héllo'.find('l')").unwrap(), "2");
        assert_eq!(eval_repr("result = 'abc'.startswith(('x', 'a'))").unwrap(), "True");
        assert_eq!(
            eval_repr("result = '{} + {b} = {0}'.format(1, b=2)").unwrap(),
            "'1 + 2 = 1'"
        );
        assert_eq!(eval_repr("result = 'Shout'.upper()").unwrap(), "'SHOUT'");
    }

    #[test]
    fn test_join_rejects_non_strings() {
        let err = eval_repr("','.join([1, 2])").unwrap_err();
        assert_eq!(err.kind, ErrorKind::TypeError);
        assert!(err.message.contains("sequence item 0"));
    }

    #[test]
    fn test_list_methods() {
        let code = "\
xs = [3, 1, 2]
xs.append(5)
xs.insert(0, 9)
xs.remove(1)
last = xs.pop()
xs.sort()
result = (xs, last, xs.index(3), xs.count(2))
";
        assert_eq!(eval_repr(code).unwrap(), "([2, 3, 9], 5, 1, 1)");
        assert_eq!(
            eval_repr("xs = []\nxs.pop()").unwrap_err().kind,
            ErrorKind::IndexError
        );
    }

    #[test]
    fn test_sort_with_key() {
        let code = "words = ['ccc', 'a', 'bb']\nwords.sort(key=len, reverse=True)\nresult = words";
        assert_eq!(eval_repr(code).unwrap(), "['ccc', 'bb', 'a']");
    }

    #[test]
    fn test_dict_methods() {
        let code = "\
d = {'a': 1}
d.update({'b': 2})
d.setdefault('c', 3)
gone = d.pop('a')
result = (d.get('b'), d.get('zz', 0), gone, list(d.keys()))
";
        assert_eq!(eval_repr(code).unwrap(), "(2, 0, 1, ['b', 'c'])");
    }

    #[test]
    fn test_unknown_method() {
        let err = eval_repr("[].push(1)").unwrap_err();
        assert_eq!(err.kind, ErrorKind::AttributeError);
        assert_eq!(err.message, "'list' object has no attribute 'push'");
    }

    #[test]
    fn test_stream_write() {
        let (stdout, stderr) = std::thread::spawn(|| {
            let mut ctx = EvalContext::new(".");
            Interpreter::default()
                .evaluate("import sys\nsys.stderr.write('warn\\n')", &mut ctx)
                .unwrap();
            ctx.output.into_parts()
        })
        .join()
        .unwrap();
        assert_eq!(stdout, "");
        assert_eq!(stderr, "warn\n");
    }

    #[test]
    fn test_stream_kind_is_exposed() {
        assert!(has_method(&Value::Stream(Stream::Stdout), "write"));
        assert!(!has_method(&Value::Int(1), "write"));
    }
}
