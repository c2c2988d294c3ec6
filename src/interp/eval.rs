//! Tree-walking evaluator.

use std::collections::HashMap;
use std::rc::Rc;

use super::ast::{BinOp, CmpOp, Expr, FPiece, Literal, Stmt, StmtKind, Subscript, Target, UnaryOp};
use super::builtins::{self, Builtin};
use super::error::{type_error, value_error, ErrorKind, EvalError, EvalResult};
use super::methods;
use super::parser::parse;
use super::value::{index_of, key_error, Dict, Function, Module, Value};
use super::{EvalContext, Evaluator};

/// Default limit on nested function calls.
pub const MAX_CALL_DEPTH: usize = 200;

/// Largest string or list a single repetition/concatenation may build.
pub const MAX_SEQUENCE_LEN: usize = 1 << 28;

/// The built-in snippet language runtime.
#[derive(Debug, Clone)]
pub struct Interpreter {
    max_call_depth: usize,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self {
            max_call_depth: MAX_CALL_DEPTH,
        }
    }
}

impl Interpreter {
    pub fn with_max_call_depth(max_call_depth: usize) -> Self {
        Self { max_call_depth }
    }
}

impl Evaluator for Interpreter {
    fn evaluate(&self, code: &str, ctx: &mut EvalContext) -> Result<(), EvalError> {
        let program = parse(code)?;
        let mut machine = Machine {
            ctx,
            frames: Vec::new(),
            max_call_depth: self.max_call_depth,
        };
        match machine.exec_block(&program)? {
            Flow::Normal => Ok(()),
            Flow::Return(_) => Err(EvalError::new(
                ErrorKind::SyntaxError,
                "'return' outside function",
            )),
            Flow::Break | Flow::Continue => Err(EvalError::new(
                ErrorKind::SyntaxError,
                "'break' or 'continue' outside loop",
            )),
        }
    }

    fn language(&self) -> &str {
        "python-subset"
    }
}

/// How control leaves a statement.
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Evaluation state for one run: the caller's context plus the stack of
/// function-local scopes.
pub(crate) struct Machine<'c> {
    pub(crate) ctx: &'c mut EvalContext,
    frames: Vec<HashMap<String, Value>>,
    max_call_depth: usize,
}

impl<'c> Machine<'c> {
    // ── Names ───────────────────────────────────────────

    fn lookup(&self, name: &str) -> EvalResult<Value> {
        if let Some(value) = self.frames.last().and_then(|f| f.get(name)) {
            return Ok(value.clone());
        }
        if let Some(value) = self.ctx.namespace.get(name) {
            return Ok(value.clone());
        }
        if let Some(builtin) = Builtin::from_name(name) {
            return Ok(Value::Builtin(builtin));
        }
        Err(EvalError::new(
            ErrorKind::NameError,
            format!("name '{name}' is not defined"),
        ))
    }

    fn bind(&mut self, name: &str, value: Value) {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.insert(name.to_string(), value);
            }
            None => self.ctx.namespace.set(name, value),
        }
    }

    // ── Statements ──────────────────────────────────────

    fn exec_block(&mut self, stmts: &[Stmt]) -> EvalResult<Flow> {
        for stmt in stmts {
            let flow = self.exec(stmt).map_err(|e| e.at_line(stmt.line))?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt) -> EvalResult<Flow> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::Assign(targets, value) => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
            }
            StmtKind::AugAssign(target, op, value) => self.aug_assign(target, *op, value)?,
            StmtKind::If { branches, orelse } => {
                for (cond, body) in branches {
                    if self.eval(cond)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                return self.exec_block(orelse);
            }
            StmtKind::While { cond, body } => {
                while self.eval(cond)?.truthy() {
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::For { target, iter, body } => {
                let items = self.eval(iter)?.iterate()?;
                for item in items {
                    self.assign(target, item)?;
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::Def { name, params, body } => {
                let defaults = params
                    .iter()
                    .map(|p| p.default.as_ref().map(|d| self.eval(d)).transpose())
                    .collect::<EvalResult<Vec<_>>>()?;
                let function = Function {
                    name: name.clone(),
                    params: params.clone(),
                    defaults,
                    body: Rc::new(body.clone()),
                };
                self.bind(name, Value::Function(Rc::new(function)));
            }
            StmtKind::With { expr, name, body } => {
                let resource = self.eval(expr)?;
                if let Some(name) = name {
                    self.bind(name, resource.clone());
                }
                let flow = self.exec_block(body);
                if let Value::File(handle) = &resource {
                    handle.borrow_mut().file = None;
                }
                return flow;
            }
            StmtKind::Return(value) => {
                if self.frames.is_empty() {
                    return Err(EvalError::new(
                        ErrorKind::SyntaxError,
                        "'return' outside function",
                    ));
                }
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Import(modules) => {
                for (module, binding) in modules {
                    let module = Module::from_name(module).ok_or_else(|| {
                        EvalError::new(
                            ErrorKind::ImportError,
                            format!("No module named '{module}'"),
                        )
                    })?;
                    self.bind(binding, Value::Module(module));
                }
            }
            StmtKind::ImportFrom { module, names } => {
                let m = Module::from_name(module).ok_or_else(|| {
                    EvalError::new(ErrorKind::ImportError, format!("No module named '{module}'"))
                })?;
                for (name, binding) in names {
                    let value = builtins::module_attr(m, name).map_err(|_| {
                        EvalError::new(
                            ErrorKind::ImportError,
                            format!("cannot import name '{name}' from '{module}'"),
                        )
                    })?;
                    self.bind(binding, value);
                }
            }
            StmtKind::Raise(value) => {
                let Some(expr) = value else {
                    return Err(EvalError::new(
                        ErrorKind::RuntimeError,
                        "No active exception to reraise",
                    ));
                };
                return Err(match self.eval(expr)? {
                    Value::Exception(kind, message) => EvalError::new(kind, message.to_string()),
                    Value::Builtin(Builtin::Exception(kind)) => EvalError::new(kind, ""),
                    other => type_error(format!(
                        "exceptions must derive from BaseException, not '{}'",
                        other.type_name()
                    )),
                });
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass => {}
        }
        Ok(Flow::Normal)
    }

    fn assign(&mut self, target: &Target, value: Value) -> EvalResult<()> {
        match target {
            Target::Name(name) => {
                self.bind(name, value);
                Ok(())
            }
            Target::Subscript(obj, index) => {
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                set_item(&obj, index, value)
            }
            Target::Tuple(targets) => {
                let items = value.collect()?;
                if items.len() < targets.len() {
                    return Err(value_error(format!(
                        "not enough values to unpack (expected {}, got {})",
                        targets.len(),
                        items.len()
                    )));
                }
                if items.len() > targets.len() {
                    return Err(value_error(format!(
                        "too many values to unpack (expected {})",
                        targets.len()
                    )));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item)?;
                }
                Ok(())
            }
        }
    }

    fn aug_assign(&mut self, target: &Target, op: BinOp, value: &Expr) -> EvalResult<()> {
        match target {
            Target::Name(name) => {
                let current = self.lookup(name)?;
                let rhs = self.eval(value)?;
                let updated = inplace_binop(op, current, rhs)?;
                self.bind(name, updated);
                Ok(())
            }
            Target::Subscript(obj, index) => {
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                let current = get_item(&obj, &index)?;
                let rhs = self.eval(value)?;
                let updated = inplace_binop(op, current, rhs)?;
                set_item(&obj, index, updated)
            }
            Target::Tuple(_) => Err(EvalError::new(
                ErrorKind::SyntaxError,
                "illegal expression for augmented assignment",
            )),
        }
    }

    // ── Expressions ─────────────────────────────────────

    pub(crate) fn eval(&mut self, expr: &Expr) -> EvalResult<Value> {
        match expr {
            Expr::Literal(lit) => Ok(match lit {
                Literal::None => Value::None,
                Literal::Bool(b) => Value::Bool(*b),
                Literal::Int(i) => Value::Int(*i),
                Literal::Float(f) => Value::Float(*f),
                Literal::Str(s) => Value::from(s.as_str()),
            }),
            Expr::FString(pieces) => {
                let mut out = String::new();
                for piece in pieces {
                    match piece {
                        FPiece::Lit(s) => out.push_str(s),
                        FPiece::Expr {
                            expr,
                            conversion,
                            spec,
                        } => {
                            let value = self.eval(expr)?;
                            let value = match conversion {
                                Some('r') => Value::from(value.repr()),
                                _ => value,
                            };
                            out.push_str(&methods::format_value(
                                &value,
                                spec.as_deref().unwrap_or(""),
                            )?);
                        }
                    }
                }
                Ok(Value::from(out))
            }
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => Ok(Value::list(self.eval_all(items)?)),
            Expr::Tuple(items) => Ok(Value::tuple(self.eval_all(items)?)),
            Expr::Dict(entries) => {
                let mut dict = Dict::new();
                for (k, v) in entries {
                    let key = self.eval(k)?;
                    let value = self.eval(v)?;
                    dict.insert(key, value)?;
                }
                Ok(Value::dict(dict))
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                unary(*op, value)
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binop(*op, &left, &right)
            }
            Expr::Compare(first, chain) => {
                let mut left = self.eval(first)?;
                for (op, expr) in chain {
                    let right = self.eval(expr)?;
                    if !compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::And(left, right) => {
                let left = self.eval(left)?;
                if !left.truthy() {
                    return Ok(left);
                }
                self.eval(right)
            }
            Expr::Or(left, right) => {
                let left = self.eval(left)?;
                if left.truthy() {
                    return Ok(left);
                }
                self.eval(right)
            }
            Expr::IfElse { cond, then, orelse } => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)
                } else {
                    self.eval(orelse)
                }
            }
            Expr::ListComp {
                elt,
                target,
                iter,
                cond,
            } => {
                let items = self.eval(iter)?.iterate()?;
                let mut out = Vec::new();
                for item in items {
                    self.assign(target, item)?;
                    if let Some(cond) = cond {
                        if !self.eval(cond)?.truthy() {
                            continue;
                        }
                    }
                    out.push(self.eval(elt)?);
                }
                Ok(Value::list(out))
            }
            Expr::Call { func, args, kwargs } => {
                let func = self.eval(func)?;
                let args = self.eval_all(args)?;
                let mut kw = Vec::with_capacity(kwargs.len());
                for (name, expr) in kwargs {
                    kw.push((name.clone(), self.eval(expr)?));
                }
                self.call_value(&func, args, kw)
            }
            Expr::Subscript(obj, Subscript::Index(index)) => {
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                get_item(&obj, &index)
            }
            Expr::Subscript(obj, Subscript::Slice(lower, upper)) => {
                let obj = self.eval(obj)?;
                let lower = self.eval_bound(lower.as_deref())?;
                let upper = self.eval_bound(upper.as_deref())?;
                slice(&obj, lower, upper)
            }
            Expr::Attribute(obj, name) => {
                let obj = self.eval(obj)?;
                get_attr(obj, name)
            }
        }
    }

    fn eval_all(&mut self, exprs: &[Expr]) -> EvalResult<Vec<Value>> {
        exprs.iter().map(|e| self.eval(e)).collect()
    }

    fn eval_bound(&mut self, expr: Option<&Expr>) -> EvalResult<Option<i64>> {
        let Some(expr) = expr else { return Ok(None) };
        match self.eval(expr)? {
            Value::None => Ok(None),
            v => v.as_int().map(Some).ok_or_else(|| {
                type_error("slice indices must be integers or None")
            }),
        }
    }

    // ── Calls ───────────────────────────────────────────

    pub(crate) fn call_value(
        &mut self,
        func: &Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> EvalResult<Value> {
        match func {
            Value::Builtin(b) => builtins::call(self, *b, args, kwargs),
            Value::Function(f) => self.call_function(f, args, kwargs),
            Value::Method(recv, name) => methods::call_method(self, recv, name, args, kwargs),
            other => Err(type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_function(
        &mut self,
        func: &Function,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> EvalResult<Value> {
        if self.frames.len() >= self.max_call_depth {
            return Err(EvalError::new(
                ErrorKind::RecursionError,
                "maximum recursion depth exceeded",
            ));
        }

        let name = &func.name;
        if args.len() > func.params.len() {
            return Err(type_error(format!(
                "{name}() takes {} positional arguments but {} were given",
                func.params.len(),
                args.len()
            )));
        }
        let mut kwargs: HashMap<String, Value> = kwargs.into_iter().collect();
        let mut frame = HashMap::with_capacity(func.params.len());
        let mut args = args.into_iter();
        for (param, default) in func.params.iter().zip(&func.defaults) {
            let value = match args.next() {
                Some(v) => {
                    if kwargs.contains_key(&param.name) {
                        return Err(type_error(format!(
                            "{name}() got multiple values for argument '{}'",
                            param.name
                        )));
                    }
                    v
                }
                None => match kwargs.remove(&param.name).or_else(|| default.clone()) {
                    Some(v) => v,
                    None => {
                        return Err(type_error(format!(
                            "{name}() missing required argument: '{}'",
                            param.name
                        )))
                    }
                },
            };
            frame.insert(param.name.clone(), value);
        }
        if let Some(extra) = kwargs.keys().next() {
            return Err(type_error(format!(
                "{name}() got an unexpected keyword argument '{extra}'"
            )));
        }

        self.frames.push(frame);
        let body = Rc::clone(&func.body);
        let flow = self.exec_block(&body);
        self.frames.pop();

        match flow? {
            Flow::Return(v) => Ok(v),
            Flow::Normal => Ok(Value::None),
            Flow::Break | Flow::Continue => Err(EvalError::new(
                ErrorKind::SyntaxError,
                "'break' or 'continue' outside loop",
            )),
        }
    }
}

// ── Operators ───────────────────────────────────────────

fn overflow() -> EvalError {
    EvalError::new(ErrorKind::OverflowError, "integer overflow")
}

fn unary(op: UnaryOp, value: Value) -> EvalResult<Value> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
        UnaryOp::Neg => match value {
            Value::Float(f) => Ok(Value::Float(-f)),
            v => match v.as_int() {
                Some(i) => i.checked_neg().map(Value::Int).ok_or_else(overflow),
                None => Err(type_error(format!(
                    "bad operand type for unary -: '{}'",
                    v.type_name()
                ))),
            },
        },
        UnaryOp::Pos => match value {
            Value::Float(f) => Ok(Value::Float(f)),
            v => match v.as_int() {
                Some(i) => Ok(Value::Int(i)),
                None => Err(type_error(format!(
                    "bad operand type for unary +: '{}'",
                    v.type_name()
                ))),
            },
        },
    }
}

/// `+=` extends lists in place so aliases observe the change.
fn inplace_binop(op: BinOp, current: Value, rhs: Value) -> EvalResult<Value> {
    if let (BinOp::Add, Value::List(items)) = (op, &current) {
        let extra = rhs.collect()?;
        items.borrow_mut().extend(extra);
        return Ok(current);
    }
    binop(op, &current, &rhs)
}

pub(crate) fn binop(op: BinOp, left: &Value, right: &Value) -> EvalResult<Value> {
    let is_float = matches!(left, Value::Float(_)) || matches!(right, Value::Float(_));
    if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
        if !is_float {
            return int_binop(op, a, b);
        }
    }
    if let (Some(a), Some(b)) = (left.as_float(), right.as_float()) {
        return float_binop(op, a, b);
    }

    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            check_len(a.len() + b.len())?;
            Ok(Value::from(format!("{a}{b}")))
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().to_vec();
            items.extend(b.borrow().iter().cloned());
            Ok(Value::list(items))
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            let mut items = a.to_vec();
            items.extend(b.iter().cloned());
            Ok(Value::tuple(items))
        }
        (BinOp::Mul, seq, n) | (BinOp::Mul, n, seq)
            if n.as_int().is_some() && matches!(seq, Value::Str(_) | Value::List(_) | Value::Tuple(_)) =>
        {
            let count = n.as_int().unwrap_or(0).max(0) as usize;
            repeat(seq, count)
        }
        (BinOp::Mod, Value::Str(fmt), args) => methods::percent_format(fmt, args).map(Value::from),
        _ => Err(type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn check_len(len: usize) -> EvalResult<()> {
    if len > MAX_SEQUENCE_LEN {
        return Err(EvalError::new(
            ErrorKind::OverflowError,
            "resulting sequence is too long",
        ));
    }
    Ok(())
}

fn repeat(seq: &Value, count: usize) -> EvalResult<Value> {
    match seq {
        Value::Str(s) => {
            check_len(s.len().saturating_mul(count))?;
            Ok(Value::from(s.repeat(count)))
        }
        Value::List(items) => {
            let items = items.borrow();
            check_len(items.len().saturating_mul(count))?;
            Ok(Value::list(repeat_items(&items, count)))
        }
        Value::Tuple(items) => {
            check_len(items.len().saturating_mul(count))?;
            Ok(Value::tuple(repeat_items(items, count)))
        }
        other => Err(type_error(format!(
            "can't multiply sequence of type '{}'",
            other.type_name()
        ))),
    }
}

fn repeat_items(items: &[Value], count: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len() * count);
    for _ in 0..count {
        out.extend(items.iter().cloned());
    }
    out
}

fn int_binop(op: BinOp, a: i64, b: i64) -> EvalResult<Value> {
    let zero_div = || {
        EvalError::new(
            ErrorKind::ZeroDivisionError,
            "integer division or modulo by zero",
        )
    };
    let value = match op {
        BinOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinOp::Div => {
            if b == 0 {
                return Err(EvalError::new(ErrorKind::ZeroDivisionError, "division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(zero_div());
            }
            let q = a.checked_div(b).ok_or_else(overflow)?;
            if a % b != 0 && ((a < 0) != (b < 0)) {
                q - 1
            } else {
                q
            }
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(zero_div());
            }
            let r = a.checked_rem(b).ok_or_else(overflow)?;
            if r != 0 && ((r < 0) != (b < 0)) {
                r + b
            } else {
                r
            }
        }
        BinOp::Pow => {
            if b < 0 {
                return float_binop(op, a as f64, b as f64);
            }
            let exp = u32::try_from(b).map_err(|_| overflow())?;
            a.checked_pow(exp).ok_or_else(overflow)?
        }
    };
    Ok(Value::Int(value))
}

fn float_binop(op: BinOp, a: f64, b: f64) -> EvalResult<Value> {
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(EvalError::new(
                    ErrorKind::ZeroDivisionError,
                    "float division by zero",
                ));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(EvalError::new(
                    ErrorKind::ZeroDivisionError,
                    "float floor division by zero",
                ));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(EvalError::new(ErrorKind::ZeroDivisionError, "float modulo"));
            }
            a - b * (a / b).floor()
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(EvalError::new(
                    ErrorKind::ZeroDivisionError,
                    "0.0 cannot be raised to a negative power",
                ));
            }
            a.powf(b)
        }
    };
    Ok(Value::Float(value))
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> EvalResult<bool> {
    use std::cmp::Ordering::*;
    Ok(match op {
        CmpOp::Eq => left.py_eq(right)?,
        CmpOp::NotEq => !left.py_eq(right)?,
        CmpOp::Lt => left.py_cmp(right)? == Less,
        CmpOp::LtE => left.py_cmp(right)? != Greater,
        CmpOp::Gt => left.py_cmp(right)? == Greater,
        CmpOp::GtE => left.py_cmp(right)? != Less,
        CmpOp::In => contains(right, left)?,
        CmpOp::NotIn => !contains(right, left)?,
        CmpOp::Is => left.py_is(right),
        CmpOp::IsNot => !left.py_is(right),
    })
}

pub(crate) fn contains(container: &Value, item: &Value) -> EvalResult<bool> {
    match container {
        Value::Str(haystack) => match item {
            Value::Str(needle) => Ok(haystack.contains(needle.as_ref())),
            other => Err(type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) => Ok(index_of(&items.borrow(), item)?.is_some()),
        Value::Tuple(items) => Ok(index_of(items, item)?.is_some()),
        Value::Dict(d) => Ok(d.borrow().get(item)?.is_some()),
        Value::Range { start, stop, step } => Ok(match item.as_int() {
            Some(i) => {
                let in_bounds = if *step > 0 {
                    i >= *start && i < *stop
                } else {
                    i <= *start && i > *stop
                };
                in_bounds && (i - start) % step == 0
            }
            None => false,
        }),
        other => Err(type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

// ── Subscripts and attributes ───────────────────────────

fn normalize_index(index: &Value, len: usize, what: &str) -> EvalResult<usize> {
    let i = index.as_int().ok_or_else(|| {
        type_error(format!(
            "{what} indices must be integers or slices, not {}",
            index.type_name()
        ))
    })?;
    let len = len as i64;
    let resolved = if i < 0 { i + len } else { i };
    if resolved < 0 || resolved >= len {
        return Err(EvalError::new(
            ErrorKind::IndexError,
            format!("{what} index out of range"),
        ));
    }
    Ok(resolved as usize)
}

pub(crate) fn get_item(obj: &Value, index: &Value) -> EvalResult<Value> {
    match obj {
        Value::List(items) => {
            let items = items.borrow();
            let i = normalize_index(index, items.len(), "list")?;
            Ok(items[i].clone())
        }
        Value::Tuple(items) => {
            let i = normalize_index(index, items.len(), "tuple")?;
            Ok(items[i].clone())
        }
        Value::Str(s) => {
            let count = s.chars().count();
            let i = normalize_index(index, count, "string")?;
            Ok(Value::from(s.chars().nth(i).map(String::from).unwrap_or_default()))
        }
        Value::Dict(d) => d.borrow().get(index)?.cloned().ok_or_else(|| key_error(index)),
        Value::Range { start, step, .. } => {
            let i = normalize_index(index, obj.len()?, "range")?;
            Ok(Value::Int(start + step * i as i64))
        }
        other => Err(type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn set_item(obj: &Value, index: Value, value: Value) -> EvalResult<()> {
    match obj {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = normalize_index(&index, items.len(), "list assignment")?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(d) => d.borrow_mut().insert(index, value),
        other => Err(type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

fn slice_bounds(len: usize, lower: Option<i64>, upper: Option<i64>) -> (usize, usize) {
    let len = len as i64;
    let clamp = |v: i64| {
        let v = if v < 0 { v + len } else { v };
        v.clamp(0, len) as usize
    };
    let lo = lower.map(clamp).unwrap_or(0);
    let hi = upper.map(clamp).unwrap_or(len as usize);
    (lo, hi.max(lo))
}

fn slice(obj: &Value, lower: Option<i64>, upper: Option<i64>) -> EvalResult<Value> {
    match obj {
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (lo, hi) = slice_bounds(chars.len(), lower, upper);
            Ok(Value::from(chars[lo..hi].iter().collect::<String>()))
        }
        Value::List(items) => {
            let items = items.borrow();
            let (lo, hi) = slice_bounds(items.len(), lower, upper);
            Ok(Value::list(items[lo..hi].to_vec()))
        }
        Value::Tuple(items) => {
            let (lo, hi) = slice_bounds(items.len(), lower, upper);
            Ok(Value::tuple(items[lo..hi].to_vec()))
        }
        other => Err(type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn get_attr(obj: Value, name: &str) -> EvalResult<Value> {
    if let Value::Module(module) = obj {
        return builtins::module_attr(module, name);
    }
    if methods::has_method(&obj, name) {
        return Ok(Value::Method(Box::new(obj), Rc::from(name)));
    }
    Err(EvalError::new(
        ErrorKind::AttributeError,
        format!("'{}' object has no attribute '{name}'", obj.type_name()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs a snippet on a roomy stack and returns `(result, stdout, error)`.
    fn run(code: &str) -> (Option<Value>, String, Option<EvalError>) {
        let code = code.to_string();
        let (result, stdout, err) = std::thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(move || {
                let mut ctx = EvalContext::new(std::env::temp_dir());
                let err = Interpreter::default().evaluate(&code, &mut ctx).err();
                let result = ctx.namespace.get("result").map(|v| v.repr());
                (result, ctx.output.stdout().to_string(), err)
            })
            .unwrap()
            .join()
            .unwrap();
        // Values are Rc-based, so they are carried across as text and
        // reparsed as strings here.
        (result.map(Value::from), stdout, err)
    }

    fn result_of(code: &str) -> String {
        let (result, _, err) = run(code);
        assert!(err.is_none(), "unexpected error: {err:?}");
        result.expect("result was not set").to_str()
    }

    fn error_of(code: &str) -> EvalError {
        run(code).2.expect("expected an error")
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(result_of("result = 2 + 2"), "4");
        assert_eq!(result_of("result = 7 // 2, -7 // 2, 7 % -3, -7 % 3"), "(3, -4, -2, 2)");
        assert_eq!(result_of("result = 1 / 4"), "0.25");
        assert_eq!(result_of("result = 2 ** 10"), "1024");
        assert_eq!(result_of("result = 2 ** -1"), "0.5");
        assert_eq!(result_of("result = -2 ** 2"), "-4");
        assert_eq!(result_of("result = 10 - 2 * 3"), "4");
        assert_eq!(result_of("result = 1.5 * 2"), "3.0");
    }

    #[test]
    fn test_integer_overflow_is_an_error() {
        let err = error_of("x = 9223372036854775807 + 1");
        assert_eq!(err.kind, ErrorKind::OverflowError);
    }

    #[test]
    fn test_division_by_zero() {
        let err = error_of("x = 1 / 0");
        assert_eq!(err.kind, ErrorKind::ZeroDivisionError);
        assert_eq!(err.message, "division by zero");
        assert_eq!(err.line, Some(1));
    }

    #[test]
    fn test_strings() {
        assert_eq!(result_of("result = 'ab' * 3"), "'ababab'");
        assert_eq!(result_of("result = 'hello'[1:3]"), "'el'");
        assert_eq!(result_of("result = 'hello'[-1]"), "'o'");
        assert_eq!(result_of("result = 'ell' in 'hello'"), "True");
        assert_eq!(result_of("name = 'x'\nresult = f'{name}={1 + 1:.2f}'"), "'x=2.00'");
    }

    #[test]
    fn test_print_goes_to_capture() {
        let (_, stdout, err) = run("print('a', 1, sep='-')\nprint('b', end='')");
        assert!(err.is_none());
        assert_eq!(stdout, "a-1\nb");
    }

    #[test]
    fn test_print_to_stderr() {
        let code = "import sys\nprint('oops', file=sys.stderr)\nsys.stdout.write('ok')".to_string();
        let (stdout, stderr) = std::thread::spawn(move || {
            let mut ctx = EvalContext::new(".");
            Interpreter::default().evaluate(&code, &mut ctx).unwrap();
            ctx.output.into_parts()
        })
        .join()
        .unwrap();
        assert_eq!(stdout, "ok");
        assert_eq!(stderr, "oops\n");
    }

    #[test]
    fn test_control_flow() {
        let code = "\
total = 0
for i in range(10):
    if i % 2 == 0:
        continue
    if i > 7:
        break
    total += i
result = total
";
        assert_eq!(result_of(code), "16");
    }

    #[test]
    fn test_while_loop() {
        assert_eq!(result_of("n = 0\nwhile n < 5:\n    n += 1\nresult = n"), "5");
    }

    #[test]
    fn test_functions_and_recursion() {
        let code = "\
def fib(n):
    if n < 2:
        return n
    return fib(n - 1) + fib(n - 2)
result = fib(15)
";
        assert_eq!(result_of(code), "610");
    }

    #[test]
    fn test_function_defaults_and_kwargs() {
        let code = "\
def greet(name, greeting='Hello'):
    return f'{greeting}, {name}!'
result = [greet('Ada'), greet('Bob', greeting='Hi')]
";
        assert_eq!(result_of(code), "['Hello, Ada!', 'Hi, Bob!']");
    }

    #[test]
    fn test_function_locals_do_not_leak() {
        let err = error_of("def f():\n    inner = 1\nf()\nx = inner");
        assert_eq!(err.kind, ErrorKind::NameError);
        assert_eq!(err.line, Some(4));
    }

    #[test]
    fn test_missing_argument() {
        let err = error_of("def f(a, b):\n    return a\nf(1)");
        assert_eq!(err.kind, ErrorKind::TypeError);
        assert!(err.message.contains("missing required argument: 'b'"));
    }

    #[test]
    fn test_unbounded_recursion() {
        let err = error_of("def f(n):\n    return f(n + 1)\nf(0)");
        assert_eq!(err.kind, ErrorKind::RecursionError);
    }

    #[test]
    fn test_list_comprehension_and_builtins() {
        assert_eq!(
            result_of("result = [x * x for x in range(6) if x % 2 == 0]"),
            "[0, 4, 16]"
        );
        assert_eq!(
            result_of("result = [a + b for a, b in [(1, 2), (3, 4)]]"),
            "[3, 7]"
        );
        assert_eq!(result_of("result = sum([1, 2, 3]), max(4, 9, 2), len('abc')"), "(6, 9, 3)");
        assert_eq!(result_of("result = sorted([3, 1, 2], reverse=True)"), "[3, 2, 1]");
    }

    #[test]
    fn test_list_aliasing() {
        assert_eq!(result_of("a = [1]\nb = a\nb.append(2)\nb += [3]\nresult = a"), "[1, 2, 3]");
    }

    #[test]
    fn test_dicts() {
        let code = "\
d = {'a': 1}
d['b'] = 2
d['a'] += 10
result = [(k, v) for k, v in d.items()]
";
        assert_eq!(result_of(code), "[('a', 11), ('b', 2)]");
        let err = error_of("d = {}\nx = d['missing']");
        assert_eq!(err.kind, ErrorKind::KeyError);
        assert_eq!(err.message, "'missing'");
    }

    #[test]
    fn test_tuple_unpacking() {
        assert_eq!(result_of("a, b = 1, 2\na, b = b, a\nresult = (a, b)"), "(2, 1)");
        let err = error_of("a, b = [1, 2, 3]");
        assert_eq!(err.kind, ErrorKind::ValueError);
    }

    #[test]
    fn test_raise_custom_error() {
        let err = error_of("raise ValueError('bad input')");
        assert_eq!(err.to_string(), "ValueError: bad input");
        assert_eq!(err.line, Some(1));
    }

    #[test]
    fn test_raise_non_exception() {
        assert_eq!(error_of("raise 5").kind, ErrorKind::TypeError);
    }

    #[test]
    fn test_name_error() {
        let err = error_of("print(undefined_name)");
        assert_eq!(err.kind, ErrorKind::NameError);
        assert!(err.message.contains("undefined_name"));
    }

    #[test]
    fn test_import_math() {
        assert_eq!(result_of("import math\nresult = math.floor(math.sqrt(91))"), "9");
        assert_eq!(result_of("from math import pi\nresult = round(pi, 2)"), "3.14");
        assert_eq!(error_of("import socket").kind, ErrorKind::ImportError);
    }

    #[test]
    fn test_output_before_error_is_kept() {
        let (_, stdout, err) = run("print('before')\nx = 1 / 0\nprint('after')");
        assert_eq!(stdout, "before\n");
        assert_eq!(err.unwrap().kind, ErrorKind::ZeroDivisionError);
    }

    #[test]
    fn test_return_outside_function() {
        assert_eq!(error_of("return 1").kind, ErrorKind::SyntaxError);
    }

    #[test]
    fn test_conditional_expression_and_boolean_ops() {
        assert_eq!(result_of("x = 5\nresult = 'big' if x > 3 else 'small'"), "'big'");
        assert_eq!(result_of("result = 0 or 'fallback'"), "'fallback'");
        assert_eq!(result_of("result = 1 and 2"), "2");
        assert_eq!(result_of("result = not []"), "True");
    }

    #[test]
    fn test_chained_comparison() {
        assert_eq!(result_of("x = 5\nresult = 1 < x <= 5 < 6"), "True");
        assert_eq!(result_of("result = None is None"), "True");
    }

    #[test]
    fn test_huge_repetition_rejected() {
        assert_eq!(
            error_of("s = 'x' * 1000000000000").kind,
            ErrorKind::OverflowError
        );
    }

    #[test]
    fn test_with_open_writes_relative_to_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let read_back = std::thread::spawn(move || {
            let mut ctx = EvalContext::new(path);
            let code = "\
with open('note.txt', 'w') as f:
    f.write('hello')
with open('note.txt') as f:
    result = f.read()
";
            Interpreter::default().evaluate(code, &mut ctx).unwrap();
            ctx.namespace.get("result").unwrap().to_str()
        })
        .join()
        .unwrap();
        assert_eq!(read_back, "hello");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("note.txt")).unwrap(),
            "hello"
        );
    }
}
