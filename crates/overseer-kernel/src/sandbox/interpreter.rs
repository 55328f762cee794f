//! Async tree-walking evaluator
//!
//! Every statement and expression consumes one step from a fixed budget.
//! Calls into user functions are bounded by a depth limit. Name lookup for
//! calls goes user functions, then builtins, then the global capability map.
//! Calls run eagerly; `await` yields the already computed value.

use super::ast::{BinaryOp, Expr, FunctionDef, Literal, Program, Stmt, UnaryOp};
use super::builtins;
use super::capability::{CapabilityError, CapabilityMap};
use super::error::SandboxError;
use super::value::Value;
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

type Env = HashMap<String, Value>;

enum Flow {
    Normal,
    Return(Value),
}

pub(crate) struct Interpreter<'p> {
    program: &'p Program,
    globals: Option<&'p CapabilityMap>,
    steps: AtomicU64,
    budget: u64,
    max_depth: usize,
}

impl<'p> Interpreter<'p> {
    pub(crate) fn new(
        program: &'p Program,
        globals: Option<&'p CapabilityMap>,
        budget: u64,
        max_depth: usize,
    ) -> Self {
        Self {
            program,
            globals,
            steps: AtomicU64::new(0),
            budget,
            max_depth,
        }
    }

    /// Steps consumed so far
    pub(crate) fn steps_used(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    fn tick(&self) -> Result<(), SandboxError> {
        let used = self.steps.fetch_add(1, Ordering::Relaxed) + 1;
        if used > self.budget {
            return Err(SandboxError::StepBudgetExhausted(self.budget));
        }
        Ok(())
    }

    /// Invoke a function with evaluated arguments
    pub(crate) fn call_function<'a>(
        &'a self,
        def: &'a FunctionDef,
        args: Vec<Value>,
        depth: usize,
    ) -> BoxFuture<'a, Result<Value, SandboxError>> {
        async move {
            if depth >= self.max_depth {
                return Err(SandboxError::RecursionLimit(self.max_depth));
            }
            if args.len() != def.params.len() {
                return Err(SandboxError::Arity {
                    name: def.name.clone(),
                    expected: def.params.len().to_string(),
                    got: args.len(),
                });
            }
            let mut env: Env = def.params.iter().cloned().zip(args).collect();
            match self.exec_block(&def.body, &mut env, depth + 1).await? {
                Flow::Return(value) => Ok(value),
                Flow::Normal => Ok(Value::Null),
            }
        }
        .boxed()
    }

    fn exec_block<'a>(
        &'a self,
        stmts: &'a [Stmt],
        env: &'a mut Env,
        depth: usize,
    ) -> BoxFuture<'a, Result<Flow, SandboxError>> {
        async move {
            for stmt in stmts {
                if let Flow::Return(value) = self.exec_stmt(stmt, env, depth).await? {
                    return Ok(Flow::Return(value));
                }
            }
            Ok(Flow::Normal)
        }
        .boxed()
    }

    fn exec_stmt<'a>(
        &'a self,
        stmt: &'a Stmt,
        env: &'a mut Env,
        depth: usize,
    ) -> BoxFuture<'a, Result<Flow, SandboxError>> {
        async move {
            self.tick()?;
            match stmt {
                Stmt::Let(name, expr) => {
                    let value = self.eval(expr, env, depth).await?;
                    env.insert(name.clone(), value);
                }
                Stmt::Assign(name, expr) => {
                    let value = self.eval(expr, env, depth).await?;
                    match env.get_mut(name) {
                        Some(slot) => *slot = value,
                        None => return Err(SandboxError::UnknownName(name.clone())),
                    }
                }
                Stmt::Expr(expr) => {
                    self.eval(expr, env, depth).await?;
                }
                Stmt::If {
                    cond,
                    then_branch,
                    else_branch,
                } => {
                    if self.eval(cond, env, depth).await?.truthy() {
                        return self.exec_block(then_branch, env, depth).await;
                    }
                    if let Some(branch) = else_branch {
                        return self.exec_block(branch, env, depth).await;
                    }
                }
                Stmt::For {
                    var,
                    iterable,
                    body,
                } => {
                    let items = builtins::iterate("for", &self.eval(iterable, env, depth).await?)?;
                    for item in items {
                        env.insert(var.clone(), item);
                        if let Flow::Return(value) = self.exec_block(body, env, depth).await? {
                            return Ok(Flow::Return(value));
                        }
                    }
                }
                Stmt::Return(expr) => {
                    let value = match expr {
                        Some(expr) => self.eval(expr, env, depth).await?,
                        None => Value::Null,
                    };
                    return Ok(Flow::Return(value));
                }
            }
            Ok(Flow::Normal)
        }
        .boxed()
    }

    fn eval_all<'a>(
        &'a self,
        exprs: &'a [Expr],
        env: &'a mut Env,
        depth: usize,
    ) -> BoxFuture<'a, Result<Vec<Value>, SandboxError>> {
        async move {
            let mut out = Vec::with_capacity(exprs.len());
            for expr in exprs {
                out.push(self.eval(expr, env, depth).await?);
            }
            Ok(out)
        }
        .boxed()
    }

    fn eval<'a>(
        &'a self,
        expr: &'a Expr,
        env: &'a mut Env,
        depth: usize,
    ) -> BoxFuture<'a, Result<Value, SandboxError>> {
        async move {
            self.tick()?;
            match expr {
                Expr::Literal(lit) => Ok(match lit {
                    Literal::Null => Value::Null,
                    Literal::Bool(b) => Value::Bool(*b),
                    Literal::Int(i) => Value::Int(*i),
                    Literal::Float(f) => Value::Float(*f),
                    Literal::Str(s) => Value::Str(s.clone()),
                }),
                Expr::Ident(name) => env
                    .get(name)
                    .cloned()
                    .ok_or_else(|| SandboxError::UnknownName(name.clone())),
                Expr::List(items) => Ok(Value::List(self.eval_all(items, env, depth).await?)),
                Expr::Map(entries) => {
                    let mut map = std::collections::BTreeMap::new();
                    for (key, value) in entries {
                        let value = self.eval(value, env, depth).await?;
                        map.insert(key.clone(), value);
                    }
                    Ok(Value::Map(map))
                }
                Expr::Unary(op, inner) => {
                    let value = self.eval(inner, env, depth).await?;
                    unary(*op, &value)
                }
                Expr::Binary(BinaryOp::And, lhs, rhs) => {
                    let left = self.eval(lhs, env, depth).await?;
                    if left.truthy() {
                        self.eval(rhs, env, depth).await
                    } else {
                        Ok(left)
                    }
                }
                Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                    let left = self.eval(lhs, env, depth).await?;
                    if left.truthy() {
                        Ok(left)
                    } else {
                        self.eval(rhs, env, depth).await
                    }
                }
                Expr::Binary(op, lhs, rhs) => {
                    let left = self.eval(lhs, env, depth).await?;
                    let right = self.eval(rhs, env, depth).await?;
                    binary(*op, &left, &right)
                }
                Expr::Call { callee, args } => {
                    let args = self.eval_all(args, env, depth).await?;
                    self.call_named(callee, args, depth).await
                }
                Expr::MethodCall {
                    receiver,
                    method,
                    args,
                } => {
                    let receiver = self.eval(receiver, env, depth).await?;
                    let args = self.eval_all(args, env, depth).await?;
                    match receiver {
                        Value::Namespace(ns) => invoke(&ns, method, args).await,
                        other => builtins::call_method(&other, method, &args),
                    }
                }
                Expr::Index(target, index) => {
                    let target = self.eval(target, env, depth).await?;
                    let index = self.eval(index, env, depth).await?;
                    index_value(&target, &index)
                }
                Expr::Field(target, field) => match self.eval(target, env, depth).await? {
                    Value::Map(map) => map
                        .get(field)
                        .cloned()
                        .ok_or_else(|| SandboxError::runtime(format!("map has no key '{field}'"))),
                    other => Err(SandboxError::type_error(format!(
                        "{} has no field '{field}'",
                        other.type_name()
                    ))),
                },
                Expr::Await(inner) => self.eval(inner, env, depth).await,
            }
        }
        .boxed()
    }

    fn call_named<'a>(
        &'a self,
        name: &'a str,
        args: Vec<Value>,
        depth: usize,
    ) -> BoxFuture<'a, Result<Value, SandboxError>> {
        async move {
            if let Some(def) = self.program.function(name) {
                return self.call_function(def, args, depth).await;
            }
            if builtins::is_builtin(name) {
                return builtins::call(name, args);
            }
            match self.globals {
                Some(globals) if globals.contains(name) => invoke(globals, name, args).await,
                _ => Err(SandboxError::UnknownName(name.to_string())),
            }
        }
        .boxed()
    }
}

async fn invoke(map: &CapabilityMap, name: &str, args: Vec<Value>) -> Result<Value, SandboxError> {
    let capability = map
        .get(name)
        .ok_or_else(|| SandboxError::UnknownName(name.to_string()))?;
    let json_args = args.iter().map(Value::to_json).collect();
    debug!(capability = %name, "Invoking capability");
    match capability.call(json_args).await {
        Ok(result) => Ok(Value::from_json(result)),
        Err(CapabilityError::ProtectedResource(id)) => Err(SandboxError::ProtectedResourceViolation(id)),
        Err(e) => Err(SandboxError::Capability {
            name: name.to_string(),
            message: e.to_string(),
        }),
    }
}

fn unary(op: UnaryOp, value: &Value) -> Result<Value, SandboxError> {
    match (op, value) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy())),
        (UnaryOp::Neg, Value::Int(i)) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| SandboxError::runtime("integer overflow")),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, other) => Err(SandboxError::type_error(format!(
            "cannot negate {}",
            other.type_name()
        ))),
    }
}

fn int_op(op: BinaryOp, a: i64, b: i64) -> Result<Value, SandboxError> {
    let overflow = || SandboxError::runtime("integer overflow");
    match op {
        BinaryOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
        BinaryOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
        BinaryOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
        BinaryOp::Div | BinaryOp::Rem if b == 0 => Err(SandboxError::runtime("division by zero")),
        BinaryOp::Div => a.checked_div(b).map(Value::Int).ok_or_else(overflow),
        BinaryOp::Rem => a.checked_rem(b).map(Value::Int).ok_or_else(overflow),
        _ => Err(SandboxError::runtime(format!("unsupported integer operator {op:?}"))),
    }
}

fn float_op(op: BinaryOp, a: f64, b: f64) -> Result<Value, SandboxError> {
    match op {
        BinaryOp::Add => Ok(Value::Float(a + b)),
        BinaryOp::Sub => Ok(Value::Float(a - b)),
        BinaryOp::Mul => Ok(Value::Float(a * b)),
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => Err(SandboxError::runtime("division by zero")),
        BinaryOp::Div => Ok(Value::Float(a / b)),
        BinaryOp::Rem => Ok(Value::Float(a % b)),
        _ => Err(SandboxError::runtime(format!("unsupported float operator {op:?}"))),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, SandboxError> {
    use std::cmp::Ordering as Cmp;
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(left == right)),
        BinaryOp::Ne => return Ok(Value::Bool(left != right)),
        BinaryOp::Lt => return Ok(Value::Bool(left.compare(right)? == Cmp::Less)),
        BinaryOp::Le => return Ok(Value::Bool(left.compare(right)? != Cmp::Greater)),
        BinaryOp::Gt => return Ok(Value::Bool(left.compare(right)? == Cmp::Greater)),
        BinaryOp::Ge => return Ok(Value::Bool(left.compare(right)? != Cmp::Less)),
        _ => {}
    }
    match (op, left, right) {
        (_, Value::Int(a), Value::Int(b)) => int_op(op, *a, *b),
        (_, Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => float_op(
            op,
            left.as_f64().unwrap_or(0.0),
            right.as_f64().unwrap_or(0.0),
        ),
        (BinaryOp::Add, Value::Str(a), Value::Str(b)) => {
            builtins::ensure_size("string", a.len() + b.len())?;
            Ok(Value::Str(format!("{a}{b}")))
        }
        (BinaryOp::Add, Value::List(a), Value::List(b)) => {
            builtins::ensure_size("list", a.len() + b.len())?;
            Ok(Value::List(a.iter().chain(b).cloned().collect()))
        }
        _ => Err(SandboxError::type_error(format!(
            "unsupported operand types for {op:?}: {} and {}",
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn index_value(target: &Value, index: &Value) -> Result<Value, SandboxError> {
    let position = |len: usize, i: i64| -> Result<usize, SandboxError> {
        let len_i = i64::try_from(len).unwrap_or(i64::MAX);
        let resolved = if i < 0 { len_i + i } else { i };
        usize::try_from(resolved)
            .ok()
            .filter(|&p| p < len)
            .ok_or_else(|| SandboxError::runtime(format!("index {i} out of range")))
    };
    match (target, index) {
        (Value::List(items), Value::Int(i)) => Ok(items[position(items.len(), *i)?].clone()),
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::Str(chars[position(chars.len(), *i)?].to_string()))
        }
        (Value::Map(map), Value::Str(key)) => map
            .get(key)
            .cloned()
            .ok_or_else(|| SandboxError::runtime(format!("map has no key '{key}'"))),
        (t, i) => Err(SandboxError::type_error(format!(
            "cannot index {} with {}",
            t.type_name(),
            i.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::parser::parse;

    async fn run(source: &str, globals: Option<&CapabilityMap>) -> Result<Value, SandboxError> {
        let program = parse(source).unwrap();
        let interp = Interpreter::new(&program, globals, 10_000, 64);
        let def = program.function("main").unwrap();
        interp.call_function(def, vec![], 0).await
    }

    #[tokio::test]
    async fn evaluates_loops_and_arithmetic() {
        let value = run(
            "fn main() { let total = 0; for i in range(5) { if i % 2 == 0 { total = total + i; } } return total; }",
            None,
        )
        .await
        .unwrap();
        assert_eq!(value, Value::Int(6));
    }

    #[tokio::test]
    async fn user_functions_shadow_capabilities() {
        let caps = CapabilityMap::new().with_fn("greet", |_| async { Ok(serde_json::json!("capability")) });
        let value = run("fn greet() { return \"local\"; } fn main() { return greet(); }", Some(&caps))
            .await
            .unwrap();
        assert_eq!(value, Value::from("local"));
    }

    #[tokio::test]
    async fn infinite_loop_exhausts_budget() {
        let err = run("fn main() { for i in range(100000) { let x = i; } }", None)
            .await
            .unwrap_err();
        assert_eq!(err, SandboxError::StepBudgetExhausted(10_000));
    }

    #[tokio::test]
    async fn unbounded_recursion_hits_depth_limit() {
        let err = run("fn spin(n) { return spin(n); } fn main() { return spin(1); }", None)
            .await
            .unwrap_err();
        assert_eq!(err, SandboxError::RecursionLimit(64));
    }

    #[tokio::test]
    async fn protected_resource_error_is_mapped() {
        let caps = CapabilityMap::new().with_fn("delete_channel", |_| async {
            Err(CapabilityError::ProtectedResource("42".into()))
        });
        let err = run("fn main() { delete_channel(42); }", Some(&caps)).await.unwrap_err();
        assert_eq!(err, SandboxError::ProtectedResourceViolation("42".into()));
    }

    #[tokio::test]
    async fn capability_failure_carries_name() {
        let caps = CapabilityMap::new().with_fn("send", |_| async { Err(CapabilityError::Failed("boom".into())) });
        let err = run("fn main() { await send(1); }", Some(&caps)).await.unwrap_err();
        assert!(matches!(err, SandboxError::Capability { ref name, .. } if name == "send"));
    }

    #[tokio::test]
    async fn short_circuit_skips_right_side() {
        let value = run("fn main() { return false && missing(); }", None).await.unwrap();
        assert_eq!(value, Value::Bool(false));
    }

    #[tokio::test]
    async fn doubling_a_list_stops_at_size_limit() {
        let err = run(
            "fn main() { let a = [1]; for i in range(30) { a = a + a; } return len(a); }",
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SandboxError::Runtime(ref m) if m.contains("exceeds the limit")));

        let err = run(
            "fn main() { let s = \"ab\"; for i in range(30) { s = s + s; } return s; }",
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SandboxError::Runtime(ref m) if m.contains("exceeds the limit")));
    }

    #[tokio::test]
    async fn negative_indexing_and_division_by_zero() {
        assert_eq!(run("fn main() { return [1, 2, 3][-1]; }", None).await.unwrap(), Value::Int(3));
        assert!(matches!(
            run("fn main() { return 1 / 0; }", None).await,
            Err(SandboxError::Runtime(_))
        ));
    }
}
