//! The layout expression language.
//!
//! Expressions are JSON: either a literal (`null`, bool, number, string) or
//! a call `["functionName", arg1, arg2, ...]` whose arguments are themselves
//! expressions. They are compiled once into [`Expr`] and evaluated against
//! an [`ExprContext`] supplied per node.
//!
//! Evaluation never panics. Callers that resolve node properties go through
//! [`resolve_property`], which fails closed to a typed default and reports
//! the failure once through [`Diagnostics`].

use crate::diagnostics::Diagnostics;
use crate::id::NodeId;
use serde_json::{Number, Value};
use std::fmt;
use thiserror::Error;

/// More decimals than `f64` can carry are not rendered.
const MAX_ROUND_DECIMALS: f64 = 15.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("Function '{func}' expects {expected} argument(s), got {got}")]
    Arity {
        func: &'static str,
        expected: String,
        got: usize,
    },

    #[error("Objects are not valid expressions: {0}")]
    NotAnExpression(String),

    #[error("Expected a function name as the first array element, got {0}")]
    MissingFunctionName(String),

    #[error("Expected {expected}, got {got}")]
    TypeMismatch { expected: &'static str, got: String },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Unknown instance context key '{0}'")]
    UnknownInstanceKey(String),

    #[error("Function '{0}' needs a literal component id")]
    DynamicComponentRef(&'static str),
}

// ─── AST ─────────────────────────────────────────────────────────────────

/// Built-in functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Func {
    Equals,
    NotEquals,
    Not,
    And,
    Or,
    If,
    GreaterThan,
    GreaterThanEq,
    LessThan,
    LessThanEq,
    Plus,
    Minus,
    Multiply,
    Divide,
    Concat,
    Round,
    Default,
    LowerCase,
    UpperCase,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    StringLength,
    CommaContains,
    DataModel,
    Component,
    IsHidden,
    InstanceContext,
    FrontendSettings,
    Language,
    Text,
}

impl Func {
    const ALL: [Func; 32] = [
        Func::Equals,
        Func::NotEquals,
        Func::Not,
        Func::And,
        Func::Or,
        Func::If,
        Func::GreaterThan,
        Func::GreaterThanEq,
        Func::LessThan,
        Func::LessThanEq,
        Func::Plus,
        Func::Minus,
        Func::Multiply,
        Func::Divide,
        Func::Concat,
        Func::Round,
        Func::Default,
        Func::LowerCase,
        Func::UpperCase,
        Func::Contains,
        Func::NotContains,
        Func::StartsWith,
        Func::EndsWith,
        Func::StringLength,
        Func::CommaContains,
        Func::DataModel,
        Func::Component,
        Func::IsHidden,
        Func::InstanceContext,
        Func::FrontendSettings,
        Func::Language,
        Func::Text,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Func::Equals => "equals",
            Func::NotEquals => "notEquals",
            Func::Not => "not",
            Func::And => "and",
            Func::Or => "or",
            Func::If => "if",
            Func::GreaterThan => "greaterThan",
            Func::GreaterThanEq => "greaterThanEq",
            Func::LessThan => "lessThan",
            Func::LessThanEq => "lessThanEq",
            Func::Plus => "plus",
            Func::Minus => "minus",
            Func::Multiply => "multiply",
            Func::Divide => "divide",
            Func::Concat => "concat",
            Func::Round => "round",
            Func::Default => "default",
            Func::LowerCase => "lowerCase",
            Func::UpperCase => "upperCase",
            Func::Contains => "contains",
            Func::NotContains => "notContains",
            Func::StartsWith => "startsWith",
            Func::EndsWith => "endsWith",
            Func::StringLength => "stringLength",
            Func::CommaContains => "commaContains",
            Func::DataModel => "dataModel",
            Func::Component => "component",
            Func::IsHidden => "isHidden",
            Func::InstanceContext => "instanceContext",
            Func::FrontendSettings => "frontendSettings",
            Func::Language => "language",
            Func::Text => "text",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    /// Accepted argument counts: (min, max). `None` means unbounded.
    fn arity(self) -> (usize, Option<usize>) {
        match self {
            Func::Language => (0, Some(0)),
            Func::Not
            | Func::LowerCase
            | Func::UpperCase
            | Func::StringLength
            | Func::DataModel
            | Func::Component
            | Func::IsHidden
            | Func::InstanceContext
            | Func::FrontendSettings
            | Func::Text => (1, Some(1)),
            Func::Equals
            | Func::NotEquals
            | Func::GreaterThan
            | Func::GreaterThanEq
            | Func::LessThan
            | Func::LessThanEq
            | Func::Minus
            | Func::Divide
            | Func::Contains
            | Func::NotContains
            | Func::StartsWith
            | Func::EndsWith
            | Func::CommaContains => (2, Some(2)),
            Func::Round => (1, Some(2)),
            Func::If => (2, Some(4)),
            Func::And | Func::Or | Func::Plus | Func::Multiply | Func::Default => (1, None),
            Func::Concat => (0, None),
        }
    }
}

impl fmt::Display for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A compiled expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Call { func: Func, args: Vec<Expr> },
}

impl Expr {
    /// Compile a JSON expression.
    ///
    /// # Errors
    /// - Unknown function name or wrong argument count
    /// - An object where an expression was expected
    /// - `component`/`isHidden` with a non-literal id
    pub fn compile(raw: &Value) -> Result<Self, ExprError> {
        match raw {
            Value::Array(items) => {
                let (head, rest) = items
                    .split_first()
                    .ok_or_else(|| ExprError::MissingFunctionName("[]".into()))?;
                let name = head
                    .as_str()
                    .ok_or_else(|| ExprError::MissingFunctionName(head.to_string()))?;
                let func = Func::from_name(name)
                    .ok_or_else(|| ExprError::UnknownFunction(name.to_string()))?;

                let (min, max) = func.arity();
                if rest.len() < min || max.is_some_and(|m| rest.len() > m) {
                    let expected = match max {
                        Some(m) if m == min => format!("{min}"),
                        Some(m) => format!("{min}..={m}"),
                        None => format!("at least {min}"),
                    };
                    return Err(ExprError::Arity {
                        func: func.name(),
                        expected,
                        got: rest.len(),
                    });
                }
                if func == Func::If && rest.len() == 4 && rest[2] != Value::from("else") {
                    return Err(ExprError::Arity {
                        func: func.name(),
                        expected: "2, or 4 with \"else\" as the third".into(),
                        got: rest.len(),
                    });
                }
                if func == Func::If && rest.len() == 3 {
                    return Err(ExprError::Arity {
                        func: func.name(),
                        expected: "2 or 4".into(),
                        got: 3,
                    });
                }
                if matches!(func, Func::Component | Func::IsHidden) && !rest[0].is_string() {
                    return Err(ExprError::DynamicComponentRef(func.name()));
                }

                let args = rest.iter().map(Expr::compile).collect::<Result<_, _>>()?;
                Ok(Expr::Call { func, args })
            }
            Value::Object(_) => Err(ExprError::NotAnExpression(raw.to_string())),
            literal => Ok(Expr::Literal(literal.clone())),
        }
    }

    /// Component ids referenced via `component` or `isHidden`.
    pub fn component_refs(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_component_refs(&mut out);
        out
    }

    fn collect_component_refs(&self, out: &mut Vec<NodeId>) {
        if let Expr::Call { func, args } = self {
            if matches!(func, Func::Component | Func::IsHidden)
                && let Some(Expr::Literal(Value::String(id))) = args.first()
            {
                out.push(NodeId::intern(id));
            }
            for arg in args {
                arg.collect_component_refs(out);
            }
        }
    }
}

// ─── Context ─────────────────────────────────────────────────────────────

/// Everything an expression can read. Implemented per node by the
/// hierarchy generator (row-aware) and by the rule runner (data only).
pub trait ExprContext {
    /// Value at a layout data-model path, already interpreted in the
    /// caller's row context.
    fn data_model(&self, path: &str) -> Option<Value>;

    /// Bound value of the closest node with base id `id`, or `None` if
    /// that node is hidden or does not exist.
    fn component(&self, id: NodeId) -> Option<Value>;

    /// Whether the closest node with base id `id` is hidden.
    fn is_hidden(&self, id: NodeId) -> Option<bool>;

    fn instance_context(&self, key: &str) -> Option<String>;

    fn frontend_setting(&self, key: &str) -> Option<Value>;

    fn language(&self) -> String;

    fn text(&self, key: &str) -> Option<String>;
}

/// Result type a property expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprType {
    Boolean,
    String,
    Number,
    Any,
}

// ─── Evaluation ──────────────────────────────────────────────────────────

/// Evaluate a compiled expression.
pub fn evaluate(expr: &Expr, ctx: &dyn ExprContext) -> Result<Value, ExprError> {
    let (func, args) = match expr {
        Expr::Literal(v) => return Ok(v.clone()),
        Expr::Call { func, args } => (*func, args.as_slice()),
    };

    match func {
        Func::If => {
            let cond = as_bool(&evaluate(&args[0], ctx)?)?;
            if cond {
                evaluate(&args[1], ctx)
            } else if args.len() == 4 {
                evaluate(&args[3], ctx)
            } else {
                Ok(Value::Null)
            }
        }
        Func::And => short_circuit(args.iter().map(|a| evaluate(a, ctx)), false),
        Func::Or => short_circuit(args.iter().map(|a| evaluate(a, ctx)), true),
        Func::Default => first_non_null(args.iter().map(|a| evaluate(a, ctx))),
        _ => {
            let values = args
                .iter()
                .map(|a| evaluate(a, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            call_strict(func, &values, ctx)
        }
    }
}

/// `and` stops at the first `false`, `or` at the first `true`.
fn short_circuit(
    values: impl Iterator<Item = Result<Value, ExprError>>,
    stop_at: bool,
) -> Result<Value, ExprError> {
    for value in values {
        if as_bool(&value?)? == stop_at {
            return Ok(Value::Bool(stop_at));
        }
    }
    Ok(Value::Bool(!stop_at))
}

fn first_non_null(values: impl Iterator<Item = Result<Value, ExprError>>) -> Result<Value, ExprError> {
    for value in values {
        let value = value?;
        if !value.is_null() {
            return Ok(value);
        }
    }
    Ok(Value::Null)
}

/// Functions that evaluate all arguments up front. [`evaluate`] handles
/// the short-circuiting ones itself; given evaluated arguments they give
/// the same result here.
fn call_strict(func: Func, v: &[Value], ctx: &dyn ExprContext) -> Result<Value, ExprError> {
    let out = match func {
        Func::Equals => Value::Bool(as_string(&v[0])? == as_string(&v[1])?),
        Func::NotEquals => Value::Bool(as_string(&v[0])? != as_string(&v[1])?),
        Func::Not => Value::Bool(!as_bool(&v[0])?),
        Func::GreaterThan => compare(&v[0], &v[1], |a, b| a > b)?,
        Func::GreaterThanEq => compare(&v[0], &v[1], |a, b| a >= b)?,
        Func::LessThan => compare(&v[0], &v[1], |a, b| a < b)?,
        Func::LessThanEq => compare(&v[0], &v[1], |a, b| a <= b)?,
        Func::Plus => fold_numbers(v, |a, b| Ok(a + b))?,
        Func::Multiply => fold_numbers(v, |a, b| Ok(a * b))?,
        Func::Minus => fold_numbers(v, |a, b| Ok(a - b))?,
        Func::Divide => fold_numbers(v, |a, b| {
            if b == 0.0 {
                Err(ExprError::DivisionByZero)
            } else {
                Ok(a / b)
            }
        })?,
        Func::Concat => {
            let mut s = String::new();
            for value in v {
                s.push_str(&as_string(value)?.unwrap_or_default());
            }
            Value::String(s)
        }
        Func::Round => {
            let Some(n) = as_number(&v[0])? else {
                return Ok(Value::Null);
            };
            let decimals = match v.get(1) {
                Some(d) => as_number(d)?.unwrap_or(0.0).clamp(0.0, MAX_ROUND_DECIMALS) as usize,
                None => 0,
            };
            Value::String(format!("{:.*}", decimals, round_half_away(n, decimals)))
        }
        Func::LowerCase => map_string(&v[0], |s| s.to_lowercase())?,
        Func::UpperCase => map_string(&v[0], |s| s.to_uppercase())?,
        Func::Contains => string_test(&v[0], &v[1], |a, b| a.contains(b))?,
        Func::NotContains => {
            let contains = string_test(&v[0], &v[1], |a, b| a.contains(b))?;
            Value::Bool(!contains.as_bool().unwrap_or(false))
        }
        Func::StartsWith => string_test(&v[0], &v[1], |a, b| a.starts_with(b))?,
        Func::EndsWith => string_test(&v[0], &v[1], |a, b| a.ends_with(b))?,
        Func::StringLength => {
            let len = as_string(&v[0])?.map(|s| s.chars().count()).unwrap_or(0);
            Value::from(len)
        }
        Func::CommaContains => {
            let (Some(list), Some(item)) = (as_string(&v[0])?, as_string(&v[1])?) else {
                return Ok(Value::Bool(false));
            };
            Value::Bool(list.split(',').any(|part| part.trim() == item))
        }
        Func::DataModel => {
            let path = as_string(&v[0])?.unwrap_or_default();
            match ctx.data_model(&path) {
                Some(leaf @ (Value::String(_) | Value::Number(_) | Value::Bool(_))) => leaf,
                _ => Value::Null,
            }
        }
        Func::Component => {
            let id = as_string(&v[0])?.unwrap_or_default();
            ctx.component(NodeId::intern(&id)).unwrap_or(Value::Null)
        }
        Func::IsHidden => {
            let id = as_string(&v[0])?.unwrap_or_default();
            Value::Bool(ctx.is_hidden(NodeId::intern(&id)).unwrap_or(false))
        }
        Func::InstanceContext => {
            let key = as_string(&v[0])?.unwrap_or_default();
            const KEYS: [&str; 4] = [
                "instanceId",
                "appId",
                "instanceOwnerPartyId",
                "instanceOwnerPartyType",
            ];
            if !KEYS.contains(&key.as_str()) {
                return Err(ExprError::UnknownInstanceKey(key));
            }
            ctx.instance_context(&key)
                .map(Value::String)
                .unwrap_or(Value::Null)
        }
        Func::FrontendSettings => {
            let key = as_string(&v[0])?.unwrap_or_default();
            ctx.frontend_setting(&key).unwrap_or(Value::Null)
        }
        Func::Language => Value::String(ctx.language()),
        Func::Text => {
            let key = as_string(&v[0])?.unwrap_or_default();
            Value::String(ctx.text(&key).unwrap_or(key))
        }
        Func::If => {
            if as_bool(&v[0])? {
                v[1].clone()
            } else {
                v.get(3).cloned().unwrap_or(Value::Null)
            }
        }
        Func::And => short_circuit(v.iter().cloned().map(Ok), false)?,
        Func::Or => short_circuit(v.iter().cloned().map(Ok), true)?,
        Func::Default => first_non_null(v.iter().cloned().map(Ok))?,
    };
    Ok(out)
}

/// Evaluate and cast the result to `ty`.
pub fn evaluate_typed(
    expr: &Expr,
    ty: ExprType,
    ctx: &dyn ExprContext,
) -> Result<Value, ExprError> {
    let value = evaluate(expr, ctx)?;
    cast(&value, ty)
}

/// Cast a value to `ty` using the language's coercion rules.
/// `null` casts to `null` for every type.
pub fn cast(value: &Value, ty: ExprType) -> Result<Value, ExprError> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match ty {
        ExprType::Any => Ok(value.clone()),
        ExprType::Boolean => as_bool(value).map(Value::Bool),
        ExprType::String => Ok(as_string(value)?.map(Value::String).unwrap_or(Value::Null)),
        ExprType::Number => Ok(as_number(value)?.map(number).unwrap_or(Value::Null)),
    }
}

/// Resolve a property that may be a literal or an expression.
///
/// Fails closed: compile errors, evaluation errors and type mismatches all
/// yield `default`, and each distinct failure is reported once.
/// A `null` result also yields `default`.
pub fn resolve_property(
    raw: &Value,
    ty: ExprType,
    default: Value,
    ctx: &dyn ExprContext,
    diagnostics: &Diagnostics,
    location: &str,
) -> Value {
    let result = Expr::compile(raw).and_then(|expr| evaluate_typed(&expr, ty, ctx));
    match result {
        Ok(Value::Null) => default,
        Ok(v) => v,
        Err(e) => {
            diagnostics.error_once(format!(
                "Expression for {location} failed: {e} (expression: {raw}); using default {default}"
            ));
            default
        }
    }
}

// ─── Coercion helpers ────────────────────────────────────────────────────

fn describe(value: &Value) -> String {
    match value {
        Value::Array(_) => "an array".into(),
        Value::Object(_) => "an object".into(),
        other => format!("'{other}'"),
    }
}

/// Booleans, `"true"`/`"false"`, `"1"`/`"0"`, `1`/`0`; `null` is false.
fn as_bool(value: &Value) -> Result<bool, ExprError> {
    match value {
        Value::Null => Ok(false),
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" | "" => Ok(false),
            _ => Err(ExprError::TypeMismatch {
                expected: "a boolean",
                got: describe(value),
            }),
        },
        Value::Number(n) => match n.as_f64() {
            Some(x) if x == 1.0 => Ok(true),
            Some(x) if x == 0.0 => Ok(false),
            _ => Err(ExprError::TypeMismatch {
                expected: "a boolean",
                got: describe(value),
            }),
        },
        _ => Err(ExprError::TypeMismatch {
            expected: "a boolean",
            got: describe(value),
        }),
    }
}

fn as_string(value: &Value) -> Result<Option<String>, ExprError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        _ => Err(ExprError::TypeMismatch {
            expected: "a string",
            got: describe(value),
        }),
    }
}

fn as_number(value: &Value) -> Result<Option<f64>, ExprError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map(Some)
            .ok_or_else(|| ExprError::TypeMismatch {
                expected: "a number",
                got: describe(value),
            }),
        _ => Err(ExprError::TypeMismatch {
            expected: "a number",
            got: describe(value),
        }),
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn round_half_away(n: f64, decimals: usize) -> f64 {
    let factor = 10f64.powi(decimals.min(MAX_ROUND_DECIMALS as usize) as i32);
    (n * factor).round() / factor
}

/// Numeric comparison; `null` on either side compares false.
fn compare(a: &Value, b: &Value, op: impl Fn(f64, f64) -> bool) -> Result<Value, ExprError> {
    match (as_number(a)?, as_number(b)?) {
        (Some(x), Some(y)) => Ok(Value::Bool(op(x, y))),
        _ => Ok(Value::Bool(false)),
    }
}

/// Left fold over numeric arguments; any `null` makes the result `null`.
fn fold_numbers(
    values: &[Value],
    op: impl Fn(f64, f64) -> Result<f64, ExprError>,
) -> Result<Value, ExprError> {
    let mut acc: Option<f64> = None;
    for value in values {
        let Some(n) = as_number(value)? else {
            return Ok(Value::Null);
        };
        acc = Some(match acc {
            None => n,
            Some(a) => op(a, n)?,
        });
    }
    Ok(acc.map(number).unwrap_or(Value::Null))
}

fn map_string(value: &Value, f: impl Fn(&str) -> String) -> Result<Value, ExprError> {
    Ok(as_string(value)?
        .map(|s| Value::String(f(&s)))
        .unwrap_or(Value::Null))
}

fn string_test(a: &Value, b: &Value, f: impl Fn(&str, &str) -> bool) -> Result<Value, ExprError> {
    match (as_string(a)?, as_string(b)?) {
        (Some(x), Some(y)) => Ok(Value::Bool(f(&x, &y))),
        _ => Ok(Value::Bool(false)),
    }
}
