//! Runtime values of the snippet language.
//!
//! Containers are reference-counted with interior mutability so that
//! aliasing behaves the way snippet authors expect (`b = a; b.append(1)`
//! is visible through `a`). Values never leave the thread that evaluates
//! the snippet; the engine converts the result to text/JSON before the
//! evaluation context is dropped.
//!
//! Values can nest arbitrarily deep (`x = [x]` in a loop) and can contain
//! themselves, so nothing here walks a value with unbounded recursion:
//! dropping releases nested containers from a worklist, and comparison,
//! `repr` and JSON conversion stop at [`MAX_VALUE_DEPTH`]. Lists and dicts
//! created under a [`ContainerScope`] are emptied when the scope ends,
//! which frees reference cycles the snippet built.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::fmt::{self, Write as _};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::rc::{Rc, Weak};

use serde_json::Value as Json;

use super::ast::{Param, Stmt};
use super::builtins::Builtin;
use super::error::{type_error, ErrorKind, EvalError, EvalResult};

/// Nesting depth at which comparison raises `RecursionError` and
/// `repr`/JSON conversion print `...` instead of descending further.
pub const MAX_VALUE_DEPTH: usize = 1000;

/// Arena size below which dead entries are not pruned.
const PRUNE_FLOOR: usize = 1024;

/// A user-defined function (`def`).
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    /// Defaults evaluated once, when the `def` statement runs.
    pub defaults: Vec<Option<Value>>,
    pub body: Rc<Vec<Stmt>>,
}

impl Drop for Function {
    fn drop(&mut self) {
        if !self.defaults.is_empty() {
            release(self.defaults.drain(..).flatten().collect());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Module {
    Math,
    Sys,
    Json,
    Os,
}

impl Module {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "math" => Some(Module::Math),
            "sys" => Some(Module::Sys),
            "json" => Some(Module::Json),
            "os" => Some(Module::Os),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Module::Math => "math",
            Module::Sys => "sys",
            Module::Json => "json",
            Module::Os => "os",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// An open file handle created by `open()`.
#[derive(Debug)]
pub struct FileHandle {
    pub path: String,
    pub writable: bool,
    /// `None` once closed.
    pub file: Option<std::fs::File>,
}

/// Items of a list or tuple.
///
/// Derefs to `Vec<Value>`; the wrapper exists so that dropping a deeply
/// nested list goes through [`release`] instead of recursing.
#[derive(Default, Clone)]
pub struct Seq(Vec<Value>);

impl Deref for Seq {
    type Target = Vec<Value>;

    fn deref(&self) -> &Vec<Value> {
        &self.0
    }
}

impl DerefMut for Seq {
    fn deref_mut(&mut self) -> &mut Vec<Value> {
        &mut self.0
    }
}

impl Drop for Seq {
    fn drop(&mut self) {
        if !self.0.is_empty() {
            release(std::mem::take(&mut self.0));
        }
    }
}

// A list may contain itself, so only the length is shown.
impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seq").field("len", &self.0.len()).finish()
    }
}

/// Drops `values` without recursing into nested containers.
///
/// Containers owned only by the worklist are opened and their items
/// appended to it, so each one is dropped empty. Shared containers are
/// just released; whoever drops the last reference handles them.
fn release(values: Vec<Value>) {
    let mut pending = values;
    while let Some(value) = pending.pop() {
        match value {
            Value::List(list) => {
                if let Ok(cell) = Rc::try_unwrap(list) {
                    pending.append(&mut cell.into_inner().0);
                }
            }
            Value::Tuple(items) => {
                if let Ok(mut items) = Rc::try_unwrap(items) {
                    pending.append(&mut items.0);
                }
            }
            Value::Dict(dict) => {
                if let Ok(cell) = Rc::try_unwrap(dict) {
                    let mut dict = cell.into_inner();
                    for (key, value) in dict.entries.drain(..) {
                        pending.push(key);
                        pending.push(value);
                    }
                }
            }
            Value::Function(function) => {
                if let Ok(mut function) = Rc::try_unwrap(function) {
                    pending.extend(function.defaults.drain(..).flatten());
                }
            }
            Value::Method(receiver, _) => pending.push(*receiver),
            _ => {}
        }
    }
}

/// Insertion-ordered mapping with snippet-level key equality.
#[derive(Default, Clone)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
}

impl Drop for Dict {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            release(
                self.entries
                    .drain(..)
                    .flat_map(|(key, value)| [key, value])
                    .collect(),
            );
        }
    }
}

impl fmt::Debug for Dict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dict").field("len", &self.entries.len()).finish()
    }
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Key comparison can fail on keys nested past [`MAX_VALUE_DEPTH`].
    fn position(&self, key: &Value) -> EvalResult<Option<usize>> {
        for (index, (k, _)) in self.entries.iter().enumerate() {
            if k.py_eq(key)? {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    pub fn get(&self, key: &Value) -> EvalResult<Option<&Value>> {
        Ok(self.position(key)?.map(|index| &self.entries[index].1))
    }

    pub fn insert(&mut self, key: Value, value: Value) -> EvalResult<()> {
        key.check_hashable()?;
        match self.position(&key)? {
            Some(index) => self.entries[index].1 = value,
            None => self.entries.push((key, value)),
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &Value) -> EvalResult<Option<Value>> {
        Ok(self
            .position(key)?
            .map(|index| self.entries.remove(index).1))
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Seq>>),
    Tuple(Rc<Seq>),
    Dict(Rc<RefCell<Dict>>),
    Range { start: i64, stop: i64, step: i64 },
    Function(Rc<Function>),
    Builtin(Builtin),
    /// A method looked up on a receiver, e.g. `"a,b".split`.
    Method(Box<Value>, Rc<str>),
    Module(Module),
    Stream(Stream),
    File(Rc<RefCell<FileHandle>>),
    Exception(ErrorKind, Rc<str>),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        let list = Rc::new(RefCell::new(Seq(items)));
        track(|| Tracked::List(Rc::downgrade(&list)));
        Value::List(list)
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(Seq(items)))
    }

    pub fn dict(dict: Dict) -> Self {
        let dict = Rc::new(RefCell::new(dict));
        track(|| Tracked::Dict(Rc::downgrade(&dict)));
        Value::Dict(dict)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Range { .. } => "range",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Method(..) => "method",
            Value::Module(_) => "module",
            Value::Stream(_) => "TextIOWrapper",
            Value::File(_) => "TextIOWrapper",
            Value::Exception(kind, _) => kind.name(),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::Dict(d) => d.borrow().len() > 0,
            Value::Range { start, stop, step } => range_len(*start, *stop, *step) > 0,
            _ => true,
        }
    }

    /// Numeric view used by arithmetic; `bool` counts as an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(*b as i64 as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_) | Value::Bool(_))
    }

    pub fn check_hashable(&self) -> EvalResult<()> {
        let mut pending = vec![self];
        while let Some(value) = pending.pop() {
            match value {
                Value::None | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_) => {}
                Value::Tuple(items) => pending.extend(items.iter()),
                other => {
                    return Err(type_error(format!(
                        "unhashable type: '{}'",
                        other.type_name()
                    )))
                }
            }
        }
        Ok(())
    }

    /// `==` semantics: numbers compare across int/float/bool, containers
    /// compare structurally, everything else by identity.
    ///
    /// Fails with `RecursionError` when containers nest deeper than
    /// [`MAX_VALUE_DEPTH`], which is what comparing two distinct
    /// self-containing lists amounts to.
    pub fn py_eq(&self, other: &Value) -> EvalResult<bool> {
        self.eq_at(other, 0)
    }

    fn eq_at(&self, other: &Value, depth: usize) -> EvalResult<bool> {
        Ok(match (self, other) {
            (Value::None, Value::None) => true,
            (a, b) if a.is_number() && b.is_number() => match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => x == y,
                _ => a.as_float() == b.as_float(),
            },
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                Rc::ptr_eq(a, b) || seq_eq(&a.borrow(), &b.borrow(), descend(depth)?)?
            }
            (Value::Tuple(a), Value::Tuple(b)) => {
                Rc::ptr_eq(a, b) || seq_eq(a, b, descend(depth)?)?
            }
            (Value::Dict(a), Value::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return Ok(true);
                }
                let depth = descend(depth)?;
                let (a, b) = (a.borrow(), b.borrow());
                if a.len() != b.len() {
                    return Ok(false);
                }
                for (k, v) in a.entries() {
                    match b.get(k)? {
                        Some(w) if v.eq_at(w, depth)? => {}
                        _ => return Ok(false),
                    }
                }
                true
            }
            (
                Value::Range { start, stop, step },
                Value::Range {
                    start: s2,
                    stop: e2,
                    step: st2,
                },
            ) => start == s2 && stop == e2 && step == st2,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Module(a), Value::Module(b)) => a == b,
            (Value::Stream(a), Value::Stream(b)) => a == b,
            (Value::File(a), Value::File(b)) => Rc::ptr_eq(a, b),
            (Value::Exception(k1, m1), Value::Exception(k2, m2)) => k1 == k2 && m1 == m2,
            _ => false,
        })
    }

    /// `is` semantics: identity for containers, equality for immutables.
    pub fn py_is(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (a, b) => !a.is_number() && !b.is_number() && matches!(a.py_eq(b), Ok(true)),
        }
    }

    /// Ordering for `<`, `sorted`, `min`, `max`.
    pub fn py_cmp(&self, other: &Value) -> EvalResult<Ordering> {
        self.cmp_at(other, 0)
    }

    fn cmp_at(&self, other: &Value, depth: usize) -> EvalResult<Ordering> {
        match (self, other) {
            (a, b) if a.is_number() && b.is_number() => match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => Ok(x.cmp(&y)),
                _ => {
                    let (x, y) = (a.as_float().unwrap_or(0.0), b.as_float().unwrap_or(0.0));
                    Ok(x.partial_cmp(&y).unwrap_or(Ordering::Equal))
                }
            },
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::List(a), Value::List(b)) => seq_cmp(&a.borrow(), &b.borrow(), descend(depth)?),
            (Value::Tuple(a), Value::Tuple(b)) => seq_cmp(a, b, descend(depth)?),
            (a, b) => Err(type_error(format!(
                "'<' not supported between instances of '{}' and '{}'",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    /// Text form used by `print()` and `str()`.
    pub fn to_str(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            Value::Exception(_, msg) => msg.to_string(),
            other => other.repr(),
        }
    }

    /// Text form used by `repr()` and inside containers.
    pub fn repr(&self) -> String {
        self.repr_in(&mut Vec::new())
    }

    /// `active` holds the containers currently being printed, so a list
    /// that contains itself renders as `[...]` instead of recursing.
    /// Its length is also the nesting depth.
    fn repr_in(&self, active: &mut Vec<usize>) -> String {
        if active.len() >= MAX_VALUE_DEPTH && is_container(self) {
            return "...".to_string();
        }
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => quote_str(s),
            Value::List(items) => {
                let id = Rc::as_ptr(items) as *const () as usize;
                if active.contains(&id) {
                    return "[...]".to_string();
                }
                active.push(id);
                let body = join_repr(&items.borrow(), active);
                active.pop();
                format!("[{body}]")
            }
            Value::Tuple(items) => {
                active.push(Rc::as_ptr(items) as *const () as usize);
                let body = if items.len() == 1 {
                    format!("{},", items[0].repr_in(active))
                } else {
                    join_repr(items, active)
                };
                active.pop();
                format!("({body})")
            }
            Value::Dict(d) => {
                let id = Rc::as_ptr(d) as *const () as usize;
                if active.contains(&id) {
                    return "{...}".to_string();
                }
                active.push(id);
                let body = d
                    .borrow()
                    .entries()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr_in(active), v.repr_in(active)))
                    .collect::<Vec<_>>()
                    .join(", ");
                active.pop();
                format!("{{{body}}}")
            }
            Value::Range { start, stop, step } if *step == 1 => format!("range({start}, {stop})"),
            Value::Range { start, stop, step } => format!("range({start}, {stop}, {step})"),
            Value::Function(f) => format!("<function {}>", f.name),
            Value::Builtin(b) => format!("<built-in function {}>", b.name()),
            Value::Method(recv, name) => {
                format!("<method '{name}' of '{}' object>", recv.type_name())
            }
            Value::Module(m) => format!("<module '{}'>", m.name()),
            Value::Stream(Stream::Stdout) => "<stdout>".to_string(),
            Value::Stream(Stream::Stderr) => "<stderr>".to_string(),
            Value::File(fh) => format!("<file '{}'>", fh.borrow().path),
            Value::Exception(kind, msg) => format!("{}({})", kind.name(), quote_str(msg)),
        }
    }

    /// JSON form of a result value. Self-containing containers fall back
    /// to their text form, and nesting past [`MAX_VALUE_DEPTH`] to `"..."`.
    pub fn to_json(&self) -> Json {
        self.json_in(&mut Vec::new())
    }

    fn json_in(&self, active: &mut Vec<usize>) -> Json {
        if active.len() >= MAX_VALUE_DEPTH && is_container(self) {
            return Json::String("...".to_string());
        }
        match self {
            Value::None => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or_else(|| Json::String(format_float(*f))),
            Value::Str(s) => Json::String(s.to_string()),
            Value::List(items) => {
                let id = Rc::as_ptr(items) as *const () as usize;
                if active.contains(&id) {
                    return Json::String("[...]".to_string());
                }
                active.push(id);
                let json = items.borrow().iter().map(|v| v.json_in(active)).collect();
                active.pop();
                Json::Array(json)
            }
            Value::Tuple(items) => {
                active.push(Rc::as_ptr(items) as *const () as usize);
                let json = items.iter().map(|v| v.json_in(active)).collect();
                active.pop();
                Json::Array(json)
            }
            Value::Dict(d) => {
                let id = Rc::as_ptr(d) as *const () as usize;
                if active.contains(&id) {
                    return Json::String("{...}".to_string());
                }
                active.push(id);
                let map = d
                    .borrow()
                    .entries()
                    .iter()
                    .map(|(k, v)| (k.to_str(), v.json_in(active)))
                    .collect::<serde_json::Map<_, _>>();
                active.pop();
                Json::Object(map)
            }
            other => Json::String(other.to_str()),
        }
    }

    pub fn from_json(json: &Json) -> EvalResult<Value> {
        Ok(match json {
            Json::Null => Value::None,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::from(s.as_str()),
            Json::Array(items) => Value::list(
                items
                    .iter()
                    .map(Value::from_json)
                    .collect::<EvalResult<_>>()?,
            ),
            Json::Object(map) => {
                let mut dict = Dict::new();
                for (k, v) in map {
                    dict.insert(Value::from(k.as_str()), Value::from_json(v)?)?;
                }
                Value::dict(dict)
            }
        })
    }

    /// Snapshot iteration over any iterable value.
    pub fn iterate(&self) -> EvalResult<ValueIter> {
        let items = match self {
            Value::List(items) => items.borrow().to_vec(),
            Value::Tuple(items) => items.to_vec(),
            Value::Str(s) => s.chars().map(|c| Value::from(c.to_string())).collect(),
            Value::Dict(d) => d.borrow().keys(),
            Value::Range { start, stop, step } => {
                return Ok(ValueIter::Range {
                    next: *start,
                    stop: *stop,
                    step: *step,
                })
            }
            other => {
                return Err(type_error(format!(
                    "'{}' object is not iterable",
                    other.type_name()
                )))
            }
        };
        Ok(ValueIter::Items(items.into_iter()))
    }

    /// Materializes any iterable into a vector.
    pub fn collect(&self) -> EvalResult<Vec<Value>> {
        Ok(self.iterate()?.collect())
    }

    pub fn len(&self) -> EvalResult<usize> {
        match self {
            Value::Str(s) => Ok(s.chars().count()),
            Value::List(items) => Ok(items.borrow().len()),
            Value::Tuple(items) => Ok(items.len()),
            Value::Dict(d) => Ok(d.borrow().len()),
            Value::Range { start, stop, step } => Ok(range_len(*start, *stop, *step)),
            other => Err(type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            ))),
        }
    }
}

/// Iterator produced by [`Value::iterate`].
pub enum ValueIter {
    Items(std::vec::IntoIter<Value>),
    Range { next: i64, stop: i64, step: i64 },
}

impl Iterator for ValueIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            ValueIter::Items(items) => items.next(),
            ValueIter::Range { next, stop, step } => {
                let done = if *step > 0 { *next >= *stop } else { *next <= *stop };
                if done {
                    return None;
                }
                let current = *next;
                match next.checked_add(*step) {
                    Some(n) => *next = n,
                    None => *next = *stop,
                }
                Some(Value::Int(current))
            }
        }
    }
}

pub fn range_len(start: i64, stop: i64, step: i64) -> usize {
    let (start, stop, step) = (start as i128, stop as i128, step as i128);
    let span = if step > 0 { stop - start } else { start - stop };
    if span <= 0 {
        return 0;
    }
    let step = step.abs();
    ((span + step - 1) / step) as usize
}

/// Position of the first item equal to `needle`.
pub fn index_of(items: &[Value], needle: &Value) -> EvalResult<Option<usize>> {
    for (index, item) in items.iter().enumerate() {
        if item.py_eq(needle)? {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

fn is_container(value: &Value) -> bool {
    matches!(value, Value::List(_) | Value::Tuple(_) | Value::Dict(_))
}

/// Next nesting level for comparison, or `RecursionError` past the limit.
fn descend(depth: usize) -> EvalResult<usize> {
    if depth >= MAX_VALUE_DEPTH {
        return Err(EvalError::new(
            ErrorKind::RecursionError,
            "maximum recursion depth exceeded in comparison",
        ));
    }
    Ok(depth + 1)
}

fn seq_eq(a: &[Value], b: &[Value], depth: usize) -> EvalResult<bool> {
    if a.len() != b.len() {
        return Ok(false);
    }
    for (x, y) in a.iter().zip(b) {
        if !x.eq_at(y, depth)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn seq_cmp(a: &[Value], b: &[Value], depth: usize) -> EvalResult<Ordering> {
    for (x, y) in a.iter().zip(b) {
        if x.eq_at(y, depth)? {
            continue;
        }
        return x.cmp_at(y, depth);
    }
    Ok(a.len().cmp(&b.len()))
}

fn join_repr(items: &[Value], active: &mut Vec<usize>) -> String {
    items
        .iter()
        .map(|v| v.repr_in(active))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Formats a float the way snippet authors expect to see it printed:
/// integral values keep a trailing `.0`, very large and very small
/// magnitudes switch to exponent notation.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let abs = f.abs();
    if abs >= 1e16 || (abs != 0.0 && abs < 1e-4) {
        let raw = format!("{f:e}");
        let (mantissa, exponent) = raw.split_once('e').unwrap_or((&raw, "0"));
        let exponent: i32 = exponent.parse().unwrap_or(0);
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!("{mantissa}e{sign}{:02}", exponent.abs());
    }
    let mut s = format!("{f}");
    if !s.contains('.') {
        s.push_str(".0");
    }
    s
}

/// Single-quoted representation with escapes, preferring double quotes
/// when the text contains a single quote and no double quote.
pub fn quote_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

enum Tracked {
    List(Weak<RefCell<Seq>>),
    Dict(Weak<RefCell<Dict>>),
}

impl Tracked {
    fn is_live(&self) -> bool {
        match self {
            Tracked::List(list) => list.strong_count() > 0,
            Tracked::Dict(dict) => dict.strong_count() > 0,
        }
    }
}

struct Arena {
    id: u64,
    tracked: Vec<Tracked>,
    prune_at: usize,
}

impl Arena {
    fn push(&mut self, entry: Tracked) {
        if self.tracked.len() >= self.prune_at {
            self.tracked.retain(Tracked::is_live);
            self.prune_at = (self.tracked.len() * 2).max(PRUNE_FLOOR);
        }
        self.tracked.push(entry);
    }
}

thread_local! {
    static ARENAS: RefCell<Vec<Arena>> = const { RefCell::new(Vec::new()) };
    static NEXT_SCOPE: Cell<u64> = const { Cell::new(0) };
}

/// Records a new container in the innermost open scope, if any.
fn track(entry: impl FnOnce() -> Tracked) {
    let _ = ARENAS.try_with(|arenas| {
        if let Ok(mut arenas) = arenas.try_borrow_mut() {
            if let Some(arena) = arenas.last_mut() {
                arena.push(entry());
            }
        }
    });
}

/// Owns every list and dict created on this thread while it is alive.
///
/// On drop, containers that are still reachable are emptied. A
/// reference cycle always runs through at least one list or dict, so
/// this is what frees `a = []; a.append(a)` once the snippet is done.
/// Values created under the scope must not be used after it ends.
#[derive(Debug)]
pub struct ContainerScope {
    id: u64,
    _thread_bound: PhantomData<*const ()>,
}

impl ContainerScope {
    pub fn enter() -> Self {
        let id = NEXT_SCOPE.with(|next| {
            let id = next.get();
            next.set(id + 1);
            id
        });
        ARENAS.with(|arenas| {
            arenas.borrow_mut().push(Arena {
                id,
                tracked: Vec::new(),
                prune_at: PRUNE_FLOOR,
            })
        });
        Self {
            id,
            _thread_bound: PhantomData,
        }
    }
}

impl Drop for ContainerScope {
    fn drop(&mut self) {
        let tracked = ARENAS
            .try_with(|arenas| {
                let mut arenas = arenas.borrow_mut();
                let index = arenas.iter().position(|arena| arena.id == self.id)?;
                Some(arenas.remove(index).tracked)
            })
            .ok()
            .flatten()
            .unwrap_or_default();

        let mut pending = Vec::new();
        for entry in tracked {
            match entry {
                Tracked::List(list) => {
                    if let Some(list) = list.upgrade() {
                        if let Ok(mut items) = list.try_borrow_mut() {
                            pending.append(&mut items.0);
                        }
                    }
                }
                Tracked::Dict(dict) => {
                    if let Some(dict) = dict.upgrade() {
                        if let Ok(mut dict) = dict.try_borrow_mut() {
                            for (key, value) in dict.entries.drain(..) {
                                pending.push(key);
                                pending.push(value);
                            }
                        }
                    }
                }
            }
        }
        release(pending);
    }
}

/// Raises a `KeyError` carrying the key's representation.
pub fn key_error(key: &Value) -> EvalError {
    EvalError::new(ErrorKind::KeyError, key.repr())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_formatting() {
        assert_eq!(format_float(2.0), "2.0");
        assert_eq!(format_float(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_float(9.539392014169456), "9.539392014169456");
        assert_eq!(format_float(1e20), "1e+20");
        assert_eq!(format_float(1.5e-7), "1.5e-07");
        assert_eq!(format_float(-0.5), "-0.5");
        assert_eq!(format_float(f64::INFINITY), "inf");
    }

    #[test]
    fn test_repr_of_containers() {
        let list = Value::list(vec![Value::Int(1), Value::from("a"), Value::None]);
        assert_eq!(list.repr(), "[1, 'a', None]");
        assert_eq!(Value::tuple(vec![Value::Int(1)]).repr(), "(1,)");

        let mut d = Dict::new();
        d.insert(Value::from("k"), Value::Bool(true)).unwrap();
        assert_eq!(Value::dict(d).repr(), "{'k': True}");
    }

    #[test]
    fn test_str_vs_repr() {
        let s = Value::from("it's");
        assert_eq!(s.to_str(), "it's");
        assert_eq!(s.repr(), "\"it's\"");
        assert_eq!(Value::from("a\nb").repr(), "'a\\nb'");
    }

    #[test]
    fn test_numeric_equality_across_types() {
        assert!(Value::Int(1).py_eq(&Value::Float(1.0)).unwrap());
        assert!(Value::Bool(true).py_eq(&Value::Int(1)).unwrap());
        assert!(!Value::Int(1).py_eq(&Value::from("1")).unwrap());
    }

    #[test]
    fn test_list_aliasing_shares_storage() {
        let a = Value::list(vec![]);
        let b = a.clone();
        if let Value::List(items) = &b {
            items.borrow_mut().push(Value::Int(7));
        }
        assert_eq!(a.len().unwrap(), 1);
        assert!(a.py_is(&b));
    }

    #[test]
    fn test_dict_replaces_existing_key() {
        let mut d = Dict::new();
        d.insert(Value::Int(1), Value::from("a")).unwrap();
        d.insert(Value::Float(1.0), Value::from("b")).unwrap();
        assert_eq!(d.len(), 1);
        assert_eq!(d.get(&Value::Int(1)).unwrap().unwrap().to_str(), "b");
    }

    #[test]
    fn test_unhashable_key() {
        let mut d = Dict::new();
        let err = d.insert(Value::list(vec![]), Value::None).unwrap_err();
        assert!(err.message.contains("unhashable type: 'list'"));
    }

    #[test]
    fn test_ordering() {
        assert_eq!(
            Value::Int(1).py_cmp(&Value::Float(1.5)).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            Value::from("b").py_cmp(&Value::from("a")).unwrap(),
            Ordering::Greater
        );
        assert!(Value::Int(1).py_cmp(&Value::from("a")).is_err());
    }

    #[test]
    fn test_json_conversion() {
        let mut d = Dict::new();
        d.insert(Value::from("n"), Value::Int(4)).unwrap();
        d.insert(Value::from("xs"), Value::list(vec![Value::Float(0.5)]))
            .unwrap();
        let json = Value::dict(d).to_json();
        assert_eq!(json, serde_json::json!({"n": 4, "xs": [0.5]}));

        let back = Value::from_json(&serde_json::json!([1, "two", null])).unwrap();
        assert_eq!(back.repr(), "[1, 'two', None]");
    }

    #[test]
    fn test_self_referencing_list() {
        let list = Value::list(vec![Value::Int(1)]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        assert_eq!(list.repr(), "[1, [...]]");
        assert_eq!(list.to_json(), serde_json::json!([1, "[...]"]));
        // break the cycle so the test does not leak
        if let Value::List(items) = &list {
            items.borrow_mut().clear();
        }
    }

    fn self_containing() -> Value {
        let list = Value::list(vec![]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        list
    }

    /// Runs `f` on a stack as large as the one evaluations get.
    fn on_eval_stack<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
        std::thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(f)
            .unwrap()
            .join()
            .unwrap()
    }

    fn nested(depth: usize) -> Value {
        let mut value = Value::list(vec![]);
        for _ in 0..depth {
            value = Value::list(vec![value]);
        }
        value
    }

    #[test]
    fn test_comparing_cycles_is_a_recursion_error() {
        on_eval_stack(|| {
            let _scope = ContainerScope::enter();
            let (a, b) = (self_containing(), self_containing());
            assert!(a.py_eq(&a).unwrap());
            let err = a.py_eq(&b).unwrap_err();
            assert_eq!(err.kind, ErrorKind::RecursionError);
            assert_eq!(err.message, "maximum recursion depth exceeded in comparison");
            assert_eq!(a.py_cmp(&b).unwrap_err().kind, ErrorKind::RecursionError);
        });
    }

    #[test]
    fn test_deep_nesting_is_bounded() {
        on_eval_stack(|| {
            let deep = nested(MAX_VALUE_DEPTH + 10);
            assert_eq!(
                deep.py_eq(&nested(MAX_VALUE_DEPTH + 10)).unwrap_err().kind,
                ErrorKind::RecursionError
            );
            assert!(!deep.py_eq(&nested(3)).unwrap());
            assert!(nested(50).py_eq(&nested(50)).unwrap());

            let text = deep.repr();
            assert!(text.starts_with("[[["));
            assert!(text.contains("[...]"));

            let mut json = &deep.to_json();
            let mut levels = 0;
            while let Json::Array(items) = json {
                json = &items[0];
                levels += 1;
            }
            assert_eq!(levels, MAX_VALUE_DEPTH);
            assert_eq!(json, &Json::String("...".into()));
        });
    }

    #[test]
    fn test_dropping_deep_nesting_does_not_recurse() {
        let mut value = Value::list(vec![]);
        for i in 0..1_000_000 {
            value = if i % 3 == 0 {
                Value::tuple(vec![value])
            } else {
                let mut d = Dict::new();
                d.insert(Value::Int(0), value).unwrap();
                Value::dict(d)
            };
        }
        drop(value);
    }

    #[test]
    fn test_deep_tuple_key_is_hashable() {
        let mut key = Value::tuple(vec![]);
        for _ in 0..1_000_000 {
            key = Value::tuple(vec![key]);
        }
        assert!(key.check_hashable().is_ok());
        let with_list = Value::tuple(vec![key, Value::list(vec![])]);
        assert!(with_list.check_hashable().is_err());
    }

    #[test]
    fn test_scope_frees_cycles() {
        let scope = ContainerScope::enter();
        let list = self_containing();
        let weak = match &list {
            Value::List(items) => Rc::downgrade(items),
            _ => unreachable!(),
        };
        let mut d = Dict::new();
        d.insert(Value::from("self"), list.clone()).unwrap();
        let dict = Value::dict(d);
        if let Value::List(items) = &list {
            items.borrow_mut().push(dict);
        }
        drop(list);
        assert_eq!(weak.strong_count(), 2);

        drop(scope);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_scopes_track_their_own_containers() {
        let outer = ContainerScope::enter();
        let kept = self_containing();
        let inner = ContainerScope::enter();
        let inner_list = self_containing();
        let weak = match &inner_list {
            Value::List(items) => Rc::downgrade(items),
            _ => unreachable!(),
        };
        drop(inner_list);
        drop(inner);
        assert!(weak.upgrade().is_none());
        assert_eq!(kept.len().unwrap(), 1);
        drop(outer);
        assert_eq!(kept.len().unwrap(), 0);
    }

    #[test]
    fn test_nan_json_falls_back_to_text() {
        assert_eq!(Value::Float(f64::NAN).to_json(), Json::String("nan".into()));
    }

    #[test]
    fn test_range_iteration() {
        let r = Value::Range {
            start: 10,
            stop: 0,
            step: -3,
        };
        let items: Vec<i64> = r.iterate().unwrap().filter_map(|v| v.as_int()).collect();
        assert_eq!(items, vec![10, 7, 4, 1]);
        assert_eq!(r.len().unwrap(), 4);
        assert_eq!(range_len(0, 5, 1), 5);
        assert_eq!(range_len(5, 0, 1), 0);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::None.truthy());
        assert!(!Value::from("").truthy());
        assert!(Value::from("x").truthy());
        assert!(!Value::list(vec![]).truthy());
        assert!(!Value::Float(0.0).truthy());
    }
}
