//! Fuel-metered tree-walking evaluator.
//!
//! Every statement and expression step charges fuel; the wall-clock
//! deadline is checked on the fuel path so a runaway script stops on
//! whichever limit it hits first. Host functions are injected per run
//! through a `HostEnv` and resolved after builtins and user functions.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use thiserror::Error;

use crate::ast::{AssignTarget, BinOp, Expr, Program, Stmt, UnaryOp};
use crate::value::ScriptValue;

/// Kernel surface visible to a running script.
///
/// `call` handles any name `provides` reported; which names exist
/// depends on what the run is (service invoke, agent loop, contract
/// check) and on the artifact's capabilities.
pub trait HostEnv {
    fn provides(&self, name: &str) -> bool;
    fn call(&mut self, name: &str, args: &[ScriptValue]) -> Result<ScriptValue, String>;
}

/// Host with no kernel surface at all.
pub struct NoHost;

impl HostEnv for NoHost {
    fn provides(&self, _name: &str) -> bool {
        false
    }

    fn call(&mut self, name: &str, _args: &[ScriptValue]) -> Result<ScriptValue, String> {
        Err(format!("unknown function '{name}'"))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("execution timed out")]
    Timeout,
    #[error("fuel exhausted")]
    FuelExhausted,
    #[error("{0}")]
    Runtime(String),
}

fn rt(message: impl Into<String>) -> EvalError {
    EvalError::Runtime(message.into())
}

enum Flow {
    Normal(ScriptValue),
    Break,
    Continue,
    Return(ScriptValue),
}

const HOST_CALL_FUEL: u64 = 16;
const DEADLINE_CHECK_MASK: u64 = 0x3ff;

pub struct Interpreter<'a> {
    program: &'a Program,
    host: &'a mut dyn HostEnv,
    scopes: Vec<HashMap<String, ScriptValue>>,
    deadline: Instant,
    max_fuel: u64,
    pub fuel_used: u64,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        program: &'a Program,
        host: &'a mut dyn HostEnv,
        deadline: Instant,
        max_fuel: u64,
    ) -> Self {
        Self {
            program,
            host,
            scopes: vec![HashMap::new()],
            deadline,
            max_fuel,
            fuel_used: 0,
        }
    }

    fn charge(&mut self, amount: u64) -> Result<(), EvalError> {
        let before = self.fuel_used;
        self.fuel_used += amount;
        if self.fuel_used > self.max_fuel {
            return Err(EvalError::FuelExhausted);
        }
        if before & DEADLINE_CHECK_MASK > self.fuel_used & DEADLINE_CHECK_MASK
            || amount > DEADLINE_CHECK_MASK
        {
            if Instant::now() >= self.deadline {
                return Err(EvalError::Timeout);
            }
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<&ScriptValue> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn set_existing(&mut self, name: &str, value: ScriptValue) -> bool {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(slot) = scope.get_mut(name) {
                *slot = value;
                return true;
            }
        }
        false
    }

    fn declare(&mut self, name: &str, value: ScriptValue) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }

    /// Run the top-level statements (definitions, constants).
    pub fn run_top_level(&mut self) -> Result<(), EvalError> {
        let stmts = self.program.top_level.clone();
        for stmt in &stmts {
            match self.exec_stmt(stmt)? {
                Flow::Normal(_) => {}
                _ => return Err(rt("break/continue/return outside a function")),
            }
        }
        Ok(())
    }

    /// Call a defined function with positional args; missing params
    /// become null, extras are dropped.
    pub fn call_function(
        &mut self,
        name: &str,
        args: Vec<ScriptValue>,
    ) -> Result<ScriptValue, EvalError> {
        let def = self
            .program
            .functions
            .get(name)
            .ok_or_else(|| rt(format!("entry point '{name}' not found")))?
            .clone();
        if self.scopes.len() > 64 {
            return Err(rt("call stack too deep"));
        }
        let mut frame = HashMap::new();
        for (idx, param) in def.params.iter().enumerate() {
            frame.insert(
                param.clone(),
                args.get(idx).cloned().unwrap_or(ScriptValue::Null),
            );
        }
        self.scopes.push(frame);
        let mut result = ScriptValue::Null;
        let mut error = None;
        for stmt in &def.body {
            match self.exec_stmt(stmt) {
                Ok(Flow::Normal(_)) => {}
                Ok(Flow::Return(value)) => {
                    result = value;
                    break;
                }
                Ok(Flow::Break) | Ok(Flow::Continue) => {
                    error = Some(rt("break/continue outside a loop"));
                    break;
                }
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }
        self.scopes.pop();
        match error {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<Flow, EvalError> {
        for stmt in stmts {
            match self.exec_stmt(stmt)? {
                Flow::Normal(_) => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal(ScriptValue::Null))
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow, EvalError> {
        self.charge(1)?;
        match stmt {
            Stmt::Let(name, expr) => {
                let value = self.eval(expr)?;
                self.declare(name, value);
                Ok(Flow::Normal(ScriptValue::Null))
            }
            Stmt::Assign(target, expr) => {
                let value = self.eval(expr)?;
                match target {
                    AssignTarget::Name(name) => {
                        if !self.set_existing(name, value) {
                            return Err(rt(format!("undefined variable '{name}'")));
                        }
                    }
                    AssignTarget::Index(container, key) => {
                        let key = self.eval(key)?;
                        self.assign_index(container, key, value)?;
                    }
                }
                Ok(Flow::Normal(ScriptValue::Null))
            }
            Stmt::If(arms, else_body) => {
                for (cond, body) in arms {
                    if self.eval(cond)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                if let Some(body) = else_body {
                    return self.exec_block(body);
                }
                Ok(Flow::Normal(ScriptValue::Null))
            }
            Stmt::While(cond, body) => {
                while self.eval(cond)?.truthy() {
                    self.charge(1)?;
                    match self.exec_block(body)? {
                        Flow::Normal(_) => {}
                        Flow::Break => break,
                        Flow::Continue => continue,
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal(ScriptValue::Null))
            }
            Stmt::For(var, iterable, body) => {
                let items = match self.eval(iterable)? {
                    ScriptValue::List(items) => items,
                    ScriptValue::Map(entries) => {
                        entries.into_keys().map(ScriptValue::Str).collect()
                    }
                    ScriptValue::Str(s) => {
                        s.chars().map(|c| ScriptValue::Str(c.to_string())).collect()
                    }
                    other => {
                        return Err(rt(format!("cannot iterate over {}", other.type_name())))
                    }
                };
                for item in items {
                    self.charge(1)?;
                    self.declare(var, item);
                    match self.exec_block(body)? {
                        Flow::Normal(_) => {}
                        Flow::Break => break,
                        Flow::Continue => continue,
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal(ScriptValue::Null))
            }
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(expr)?,
                    None => ScriptValue::Null,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Expr(expr) => {
                let value = self.eval(expr)?;
                Ok(Flow::Normal(value))
            }
        }
    }

    /// Mutate through a chain of index expressions rooted at a
    /// variable. Keys are evaluated before navigation starts.
    fn assign_index(
        &mut self,
        container: &Expr,
        final_key: ScriptValue,
        value: ScriptValue,
    ) -> Result<(), EvalError> {
        let mut keys = Vec::new();
        let mut current = container;
        let root = loop {
            match current {
                Expr::Var(name) => break name.clone(),
                Expr::Index(inner, key) => {
                    keys.push(self.eval(key)?);
                    current = inner;
                }
                _ => return Err(rt("invalid assignment target")),
            }
        };
        keys.reverse();
        keys.push(final_key);

        let mut slot: &mut ScriptValue = 'found: {
            for scope in self.scopes.iter_mut().rev() {
                if let Some(slot) = scope.get_mut(&root) {
                    break 'found slot;
                }
            }
            return Err(rt(format!("undefined variable '{root}'")));
        };

        let last = keys.len() - 1;
        for (depth, key) in keys.into_iter().enumerate() {
            let is_last = depth == last;
            match (slot, key) {
                (ScriptValue::Map(entries), ScriptValue::Str(key)) => {
                    if is_last {
                        entries.insert(key, value);
                        return Ok(());
                    }
                    slot = entries
                        .get_mut(&key)
                        .ok_or_else(|| rt(format!("key '{key}' not found")))?;
                }
                (ScriptValue::List(items), ScriptValue::Int(idx)) => {
                    let len = items.len() as i64;
                    let idx = if idx < 0 { idx + len } else { idx };
                    if idx < 0 || idx >= len {
                        return Err(rt("list index out of range"));
                    }
                    let idx = idx as usize;
                    if is_last {
                        items[idx] = value;
                        return Ok(());
                    }
                    slot = &mut items[idx];
                }
                (other, key) => {
                    return Err(rt(format!(
                        "cannot index {} with {}",
                        other.type_name(),
                        key.type_name()
                    )))
                }
            }
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> Result<ScriptValue, EvalError> {
        self.charge(1)?;
        match expr {
            Expr::Null => Ok(ScriptValue::Null),
            Expr::Bool(b) => Ok(ScriptValue::Bool(*b)),
            Expr::Int(v) => Ok(ScriptValue::Int(*v)),
            Expr::Float(v) => Ok(ScriptValue::Float(*v)),
            Expr::Str(s) => Ok(ScriptValue::Str(s.clone())),
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                Ok(ScriptValue::List(out))
            }
            Expr::Map(entries) => {
                let mut out = BTreeMap::new();
                for (key, value) in entries {
                    let key = match self.eval(key)? {
                        ScriptValue::Str(s) => s,
                        other => other.to_string(),
                    };
                    out.insert(key, self.eval(value)?);
                }
                Ok(ScriptValue::Map(out))
            }
            Expr::Var(name) => self
                .lookup(name)
                .cloned()
                .ok_or_else(|| rt(format!("undefined variable '{name}'"))),
            Expr::Unary(op, inner) => {
                let value = self.eval(inner)?;
                match op {
                    UnaryOp::Not => Ok(ScriptValue::Bool(!value.truthy())),
                    UnaryOp::Neg => match value {
                        ScriptValue::Int(v) => Ok(ScriptValue::Int(-v)),
                        ScriptValue::Float(v) => Ok(ScriptValue::Float(-v)),
                        other => Err(rt(format!("cannot negate {}", other.type_name()))),
                    },
                }
            }
            Expr::Binary(op, left, right) => self.eval_binary(*op, left, right),
            Expr::Index(container, key) => {
                let container = self.eval(container)?;
                let key = self.eval(key)?;
                index_value(&container, &key)
            }
            Expr::Call(name, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                self.call(name, values)
            }
        }
    }

    fn eval_binary(
        &mut self,
        op: BinOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<ScriptValue, EvalError> {
        if op == BinOp::And {
            let left = self.eval(left)?;
            if !left.truthy() {
                return Ok(left);
            }
            return self.eval(right);
        }
        if op == BinOp::Or {
            let left = self.eval(left)?;
            if left.truthy() {
                return Ok(left);
            }
            return self.eval(right);
        }

        let left = self.eval(left)?;
        let right = self.eval(right)?;
        binary_op(op, left, right)
    }

    fn call(&mut self, name: &str, args: Vec<ScriptValue>) -> Result<ScriptValue, EvalError> {
        if let Some(result) = self.builtin(name, &args)? {
            return Ok(result);
        }
        if self.program.defines(name) {
            return self.call_function(name, args);
        }
        if self.host.provides(name) {
            self.charge(HOST_CALL_FUEL)?;
            return self.host.call(name, &args).map_err(rt);
        }
        Err(rt(format!("unknown function '{name}'")))
    }

    /// Pure builtins. Returns Ok(None) when the name is not a builtin.
    fn builtin(
        &mut self,
        name: &str,
        args: &[ScriptValue],
    ) -> Result<Option<ScriptValue>, EvalError> {
        let arg = |idx: usize| args.get(idx).cloned().unwrap_or(ScriptValue::Null);
        let result = match name {
            "len" => match arg(0) {
                ScriptValue::Str(s) => ScriptValue::Int(s.chars().count() as i64),
                ScriptValue::List(items) => ScriptValue::Int(items.len() as i64),
                ScriptValue::Map(entries) => ScriptValue::Int(entries.len() as i64),
                other => return Err(rt(format!("len() of {}", other.type_name()))),
            },
            "str" => ScriptValue::Str(arg(0).to_string()),
            "to_int" => match arg(0) {
                ScriptValue::Int(v) => ScriptValue::Int(v),
                ScriptValue::Float(v) => ScriptValue::Int(v as i64),
                ScriptValue::Bool(b) => ScriptValue::Int(b as i64),
                ScriptValue::Str(s) => match s.trim().parse::<i64>() {
                    Ok(v) => ScriptValue::Int(v),
                    Err(_) => ScriptValue::Null,
                },
                _ => ScriptValue::Null,
            },
            "type_of" => ScriptValue::Str(arg(0).type_name().to_string()),
            "range" => {
                let n = arg(0).as_int().ok_or_else(|| rt("range() needs an int"))?;
                let n = n.clamp(0, 1_000_000);
                self.charge(n as u64)?;
                ScriptValue::List((0..n).map(ScriptValue::Int).collect())
            }
            "push" => match arg(0) {
                ScriptValue::List(mut items) => {
                    items.push(arg(1));
                    ScriptValue::List(items)
                }
                other => return Err(rt(format!("push() on {}", other.type_name()))),
            },
            "keys" => match arg(0) {
                ScriptValue::Map(entries) => {
                    ScriptValue::List(entries.into_keys().map(ScriptValue::Str).collect())
                }
                other => return Err(rt(format!("keys() of {}", other.type_name()))),
            },
            "has" => match (arg(0), arg(1)) {
                (ScriptValue::Map(entries), ScriptValue::Str(key)) => {
                    ScriptValue::Bool(entries.contains_key(&key))
                }
                (ScriptValue::List(items), needle) => {
                    ScriptValue::Bool(items.contains(&needle))
                }
                _ => ScriptValue::Bool(false),
            },
            "contains" => match (arg(0), arg(1)) {
                (ScriptValue::Str(haystack), ScriptValue::Str(needle)) => {
                    ScriptValue::Bool(haystack.contains(&needle))
                }
                _ => ScriptValue::Bool(false),
            },
            "starts_with" => match (arg(0), arg(1)) {
                (ScriptValue::Str(s), ScriptValue::Str(prefix)) => {
                    ScriptValue::Bool(s.starts_with(&prefix))
                }
                _ => ScriptValue::Bool(false),
            },
            "ends_with" => match (arg(0), arg(1)) {
                (ScriptValue::Str(s), ScriptValue::Str(suffix)) => {
                    ScriptValue::Bool(s.ends_with(&suffix))
                }
                _ => ScriptValue::Bool(false),
            },
            "find" => match (arg(0), arg(1)) {
                (ScriptValue::Str(haystack), ScriptValue::Str(needle)) => {
                    match haystack.find(&needle) {
                        Some(byte_idx) => {
                            ScriptValue::Int(haystack[..byte_idx].chars().count() as i64)
                        }
                        None => ScriptValue::Int(-1),
                    }
                }
                _ => ScriptValue::Int(-1),
            },
            "rfind" => match (arg(0), arg(1)) {
                (ScriptValue::Str(haystack), ScriptValue::Str(needle)) => {
                    match haystack.rfind(&needle) {
                        Some(byte_idx) => {
                            ScriptValue::Int(haystack[..byte_idx].chars().count() as i64)
                        }
                        None => ScriptValue::Int(-1),
                    }
                }
                _ => ScriptValue::Int(-1),
            },
            "count" => match (arg(0), arg(1)) {
                (ScriptValue::Str(haystack), ScriptValue::Str(needle)) if !needle.is_empty() => {
                    ScriptValue::Int(haystack.matches(&needle).count() as i64)
                }
                _ => ScriptValue::Int(0),
            },
            "slice" => {
                let (start, end) = (
                    arg(1).as_int().unwrap_or(0),
                    arg(2).as_int().unwrap_or(i64::MAX),
                );
                match arg(0) {
                    ScriptValue::Str(s) => {
                        let chars: Vec<char> = s.chars().collect();
                        let (a, b) = slice_bounds(chars.len(), start, end);
                        ScriptValue::Str(chars[a..b].iter().collect())
                    }
                    ScriptValue::List(items) => {
                        let (a, b) = slice_bounds(items.len(), start, end);
                        ScriptValue::List(items[a..b].to_vec())
                    }
                    other => return Err(rt(format!("slice() of {}", other.type_name()))),
                }
            }
            "min" => pick(args, |a, b| a < b)?,
            "max" => pick(args, |a, b| a > b)?,
            "json_parse" => match arg(0) {
                ScriptValue::Str(s) => match serde_json::from_str::<serde_json::Value>(&s) {
                    Ok(json) => ScriptValue::from_json(&json),
                    Err(_) => ScriptValue::Null,
                },
                _ => ScriptValue::Null,
            },
            "json_dump" => ScriptValue::Str(arg(0).to_json().to_string()),
            _ => return Ok(None),
        };
        Ok(Some(result))
    }
}

fn slice_bounds(len: usize, start: i64, end: i64) -> (usize, usize) {
    let len = len as i64;
    let norm = |v: i64| if v < 0 { v + len } else { v }.clamp(0, len) as usize;
    let a = norm(start);
    let b = norm(end.min(len));
    (a, a.max(b))
}

fn pick(
    args: &[ScriptValue],
    better: fn(f64, f64) -> bool,
) -> Result<ScriptValue, EvalError> {
    let mut best: Option<ScriptValue> = None;
    for arg in args {
        let candidate = arg
            .as_f64()
            .ok_or_else(|| rt(format!("min/max of {}", arg.type_name())))?;
        let replace = match &best {
            Some(current) => current.as_f64().map(|c| better(candidate, c)).unwrap_or(true),
            None => true,
        };
        if replace {
            best = Some(arg.clone());
        }
    }
    best.ok_or_else(|| rt("min/max of no arguments"))
}

fn index_value(container: &ScriptValue, key: &ScriptValue) -> Result<ScriptValue, EvalError> {
    match (container, key) {
        (ScriptValue::Map(entries), ScriptValue::Str(key)) => {
            Ok(entries.get(key).cloned().unwrap_or(ScriptValue::Null))
        }
        (ScriptValue::List(items), ScriptValue::Int(idx)) => {
            let len = items.len() as i64;
            let idx = if *idx < 0 { idx + len } else { *idx };
            if idx < 0 || idx >= len {
                return Err(rt("list index out of range"));
            }
            Ok(items[idx as usize].clone())
        }
        (ScriptValue::Str(s), ScriptValue::Int(idx)) => {
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len() as i64;
            let idx = if *idx < 0 { idx + len } else { *idx };
            if idx < 0 || idx >= len {
                return Err(rt("string index out of range"));
            }
            Ok(ScriptValue::Str(chars[idx as usize].to_string()))
        }
        (ScriptValue::Null, _) => Ok(ScriptValue::Null),
        (container, key) => Err(rt(format!(
            "cannot index {} with {}",
            container.type_name(),
            key.type_name()
        ))),
    }
}

fn binary_op(op: BinOp, left: ScriptValue, right: ScriptValue) -> Result<ScriptValue, EvalError> {
    use ScriptValue::*;
    match op {
        BinOp::Add => match (left, right) {
            (Int(a), Int(b)) => Ok(Int(a.wrapping_add(b))),
            (Str(a), Str(b)) => Ok(Str(a + &b)),
            (List(mut a), List(b)) => {
                a.extend(b);
                Ok(List(a))
            }
            (a, b) => numeric(a, b, |a, b| a + b),
        },
        BinOp::Sub => match (left, right) {
            (Int(a), Int(b)) => Ok(Int(a.wrapping_sub(b))),
            (a, b) => numeric(a, b, |a, b| a - b),
        },
        BinOp::Mul => match (left, right) {
            (Int(a), Int(b)) => Ok(Int(a.wrapping_mul(b))),
            (a, b) => numeric(a, b, |a, b| a * b),
        },
        BinOp::Div => match (left, right) {
            (Int(_), Int(0)) => Err(rt("division by zero")),
            (Int(a), Int(b)) => Ok(Int(a.wrapping_div(b))),
            (a, b) => numeric(a, b, |a, b| a / b),
        },
        BinOp::Rem => match (left, right) {
            (Int(_), Int(0)) => Err(rt("modulo by zero")),
            (Int(a), Int(b)) => Ok(Int(a.rem_euclid(b))),
            (a, b) => numeric(a, b, |a, b| a % b),
        },
        BinOp::Eq => Ok(Bool(values_equal(&left, &right))),
        BinOp::NotEq => Ok(Bool(!values_equal(&left, &right))),
        BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq => {
            let ordering = match (&left, &right) {
                (Str(a), Str(b)) => a.partial_cmp(b),
                (a, b) => match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
            };
            let Some(ordering) = ordering else {
                return Err(rt(format!(
                    "cannot compare {} with {}",
                    left.type_name(),
                    right.type_name()
                )));
            };
            Ok(Bool(match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::LtEq => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinOp::And | BinOp::Or => Err(rt("short-circuit op in binary_op")),
    }
}

fn numeric(
    a: ScriptValue,
    b: ScriptValue,
    f: fn(f64, f64) -> f64,
) -> Result<ScriptValue, EvalError> {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok(ScriptValue::Float(f(a, b))),
        _ => Err(rt(format!(
            "invalid operands: {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn values_equal(a: &ScriptValue, b: &ScriptValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}
