// SPDX-License-Identifier: Apache-2.0
//! Pluggable expression evaluation.
//!
//! The runtime treats the expression language of edge `conditions` and node
//! `entry_effects`/`final_effects` as opaque: a [`ExprEval`] implementation
//! is supplied when the VM is built. Two implementations ship with the
//! crate:
//!
//! - [`NullEval`] — every condition passes, every effect is a no-op. Useful
//!   for structural tests and graphs authored without expressions.
//! - [`LiteralEval`] — a minimal literal grammar sufficient for fixtures and
//!   demos; not a scripting language.

use crate::errors::EvalError;
use crate::ns::Ns;
use crate::value::Value;

/// An opaque expression string authored on nodes and edges.
pub type Expr = String;

/// A namespace assignment produced by executing an effect expression.
///
/// Paths are relative to the anchor node; the update handler prefixes them
/// with `locals` before emitting `SET_ATTR` effects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NsAssign {
    /// Path segments relative to the anchor's locals.
    pub path: Vec<String>,
    /// Assigned value.
    pub value: Value,
}

/// Evaluator over a namespace for conditions and effect scripts.
pub trait ExprEval: core::fmt::Debug + Send + Sync {
    /// Evaluates a boolean condition against the namespace.
    fn eval_predicate(&self, expr: &str, ns: &Ns) -> Result<bool, EvalError>;

    /// Executes an effect script, returning the assignments it produced.
    fn exec_effect(&self, expr: &str, ns: &Ns) -> Result<Vec<NsAssign>, EvalError>;
}

/// Evaluator that accepts every condition and ignores every effect.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullEval;

impl ExprEval for NullEval {
    fn eval_predicate(&self, _expr: &str, _ns: &Ns) -> Result<bool, EvalError> {
        Ok(true)
    }

    fn exec_effect(&self, _expr: &str, _ns: &Ns) -> Result<Vec<NsAssign>, EvalError> {
        Ok(Vec::new())
    }
}

/// Minimal literal evaluator for fixtures.
///
/// Predicates: `true`, `false`, `name`, `has name`, `name == literal`,
/// `name != literal`. Effects: `name = literal` (dotted names address nested
/// maps). Literals: integers, `true`/`false`, `null`, and single- or
/// double-quoted strings.
#[derive(Clone, Copy, Debug, Default)]
pub struct LiteralEval;

impl LiteralEval {
    fn parse_literal(expr: &str, token: &str) -> Result<Value, EvalError> {
        let token = token.trim();
        if token == "null" {
            return Ok(Value::Null);
        }
        if token == "true" {
            return Ok(Value::Bool(true));
        }
        if token == "false" {
            return Ok(Value::Bool(false));
        }
        if let Ok(i) = token.parse::<i64>() {
            return Ok(Value::Int(i));
        }
        let quoted = (token.starts_with('\'') && token.ends_with('\'') && token.len() >= 2)
            || (token.starts_with('"') && token.ends_with('"') && token.len() >= 2);
        if quoted {
            return Ok(Value::Str(token[1..token.len() - 1].to_owned()));
        }
        Err(EvalError::new(expr, format!("bad literal {token:?}")))
    }

    fn split_path(name: &str) -> Vec<String> {
        name.split('.').map(str::to_owned).collect()
    }

    fn lookup<'a>(ns: &'a Ns, name: &str) -> Option<&'a Value> {
        let path = Self::split_path(name);
        let (head, rest) = path.split_first()?;
        let root = ns.get(head)?;
        if rest.is_empty() {
            Some(root)
        } else {
            root.get_path(rest)
        }
    }
}

impl ExprEval for LiteralEval {
    fn eval_predicate(&self, expr: &str, ns: &Ns) -> Result<bool, EvalError> {
        let text = expr.trim();
        if text.is_empty() {
            return Err(EvalError::new(expr, "empty condition"));
        }
        if text == "true" {
            return Ok(true);
        }
        if text == "false" {
            return Ok(false);
        }
        if let Some(name) = text.strip_prefix("has ") {
            return Ok(Self::lookup(ns, name.trim()).is_some());
        }
        if let Some((name, lit)) = text.split_once("==") {
            let want = Self::parse_literal(expr, lit)?;
            return Ok(Self::lookup(ns, name.trim()) == Some(&want));
        }
        if let Some((name, lit)) = text.split_once("!=") {
            let want = Self::parse_literal(expr, lit)?;
            return Ok(Self::lookup(ns, name.trim()) != Some(&want));
        }
        Ok(Self::lookup(ns, text).is_some_and(Value::is_truthy))
    }

    fn exec_effect(&self, expr: &str, ns: &Ns) -> Result<Vec<NsAssign>, EvalError> {
        let _ = ns;
        let text = expr.trim();
        let Some((name, lit)) = text.split_once('=') else {
            return Err(EvalError::new(expr, "expected `name = literal`"));
        };
        if name.trim().is_empty() {
            return Err(EvalError::new(expr, "missing assignment target"));
        }
        let value = Self::parse_literal(expr, lit)?;
        Ok(vec![NsAssign {
            path: Self::split_path(name.trim()),
            value,
        }])
    }
}
