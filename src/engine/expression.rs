// Expression evaluation for conditions, triggers, `when` clauses and templates

//! # Expression Evaluator
//!
//! Workflow documents embed small expressions:
//!
//! - trigger expressions and definition conditions (`object.status == "approved"`)
//! - action `when` clauses (`assignments.legal.approved >= 1`)
//! - `{{expr}}` tokens inside notification and webhook templates
//!
//! Expressions run on the [rhai](https://rhai.rs) engine in expression-only mode:
//! no statements, no assignments, no loops. Each evaluation is bounded three ways:
//!
//! - **Wall clock**: a deadline checked every `interrupt_check_frequency` operations,
//!   surfaced as [`WorkflowError::ExpressionTimeout`]
//! - **Cost**: a maximum operation count, surfaced as [`WorkflowError::ExpressionCostLimit`]
//! - **Size**: source length and nesting depth, rejected at compile time
//!
//! Compiled ASTs are cached by source text.
//!
//! ## Variables
//!
//! [`ExpressionVars`] is the scope. Trigger-time scopes carry `object`,
//! `changed_fields`, `changed_edges`, `added_ids`, `removed_ids`, `event_type`,
//! `user_id` and `proposed_changes`; action-time scopes add `assignments`,
//! `instance` and `initiator`.
//!
//! String literals use double quotes; single quotes are character literals.
//!
//! ## Rust Learning Notes:
//!
//! ### Thread-local State
//! The deadline lives in a `thread_local!` cell because evaluation is synchronous:
//! the progress callback runs on the same thread that set the deadline, so no
//! locking is needed.

use dashmap::DashMap;
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Scope, AST, INT};
use serde_json::{Map, Number, Value};
use std::cell::Cell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ExpressionConfig;
use crate::models::InstanceContext;
use crate::{Result, WorkflowError};

thread_local! {
    static DEADLINE: Cell<Option<Instant>> = Cell::new(None);
}

/// Clears the deadline when evaluation returns, including on early `?` exits
struct DeadlineGuard;

impl DeadlineGuard {
    fn arm(timeout: Duration) -> Self {
        DEADLINE.with(|d| d.set(Some(Instant::now() + timeout)));
        DeadlineGuard
    }
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        DEADLINE.with(|d| d.set(None));
    }
}

/// Named variables visible to an expression
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpressionVars {
    vars: Map<String, Value>,
}

impl ExpressionVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger-time scope built from the live object and the mutation context
    pub fn from_context(object: Value, context: &InstanceContext) -> Self {
        Self::new()
            .with("object", object)
            .with("event_type", Value::String(context.event_type.clone()))
            .with("changed_fields", Value::from(context.changed_fields.clone()))
            .with("changed_edges", Value::from(context.changed_edges.clone()))
            .with("added_ids", serde_json::to_value(&context.added_ids).unwrap_or(Value::Null))
            .with("removed_ids", serde_json::to_value(&context.removed_ids).unwrap_or(Value::Null))
            .with(
                "user_id",
                context.trigger_user_id.clone().map(Value::String).unwrap_or(Value::Null),
            )
            .with("proposed_changes", Value::Object(context.proposed_changes.clone()))
    }

    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.vars.insert(name.to_string(), value);
        self
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Merge another map of variables, later values winning
    pub fn extend(&mut self, other: &Map<String, Value>) {
        for (name, value) in other {
            self.vars.insert(name.clone(), value.clone());
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.vars
    }

    fn to_scope(&self) -> Scope<'static> {
        let mut scope = Scope::new();
        for (name, value) in &self.vars {
            scope.push_constant_dynamic(name.clone(), json_to_dynamic(value));
        }
        scope
    }
}

/// Sandboxed expression evaluator with an AST cache
pub struct ExpressionEvaluator {
    engine: Engine,
    config: ExpressionConfig,
    cache: DashMap<String, Arc<AST>>,
}

impl ExpressionEvaluator {
    pub fn new(config: ExpressionConfig) -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(config.cost_limit);
        engine.set_max_expr_depths(config.recursion_limit, config.recursion_limit);

        let frequency = config.interrupt_check_frequency.max(1);
        engine.on_progress(move |ops| {
            if ops % frequency != 0 {
                return None;
            }
            DEADLINE.with(|d| match d.get() {
                Some(deadline) if Instant::now() >= deadline => Some(Dynamic::from("deadline exceeded")),
                _ => None,
            })
        });

        engine.register_fn("has", |value: Dynamic| !value.is_unit());
        engine.register_fn("size", |items: &mut Array| items.len() as INT);
        engine.register_fn("size", |map: &mut rhai::Map| map.len() as INT);
        engine.register_fn("size", |text: ImmutableString| text.chars().count() as INT);

        Self {
            engine,
            config,
            cache: DashMap::new(),
        }
    }

    /// Compile (or fetch from cache) an expression
    pub fn compile(&self, expression: &str) -> Result<Arc<AST>> {
        if let Some(ast) = self.cache.get(expression) {
            return Ok(Arc::clone(&ast));
        }

        let source = expression.trim();
        if source.is_empty() {
            return Err(WorkflowError::ExpressionCompile("expression is empty".to_string()));
        }
        if source.len() > self.config.size_limit {
            return Err(WorkflowError::ExpressionCompile(format!(
                "expression length {} exceeds limit {}",
                source.len(),
                self.config.size_limit
            )));
        }

        let ast = self
            .engine
            .compile_expression(source)
            .map_err(|err| WorkflowError::ExpressionCompile(format!("{}: {}", source, err)))?;
        let ast = Arc::new(ast);
        self.cache.insert(expression.to_string(), Arc::clone(&ast));
        Ok(ast)
    }

    /// Check an expression compiles without evaluating it
    pub fn validate(&self, expression: &str) -> Result<()> {
        self.compile(expression).map(|_| ())
    }

    pub fn cached_expressions(&self) -> usize {
        self.cache.len()
    }

    fn eval_dynamic(&self, expression: &str, vars: &ExpressionVars) -> Result<Dynamic> {
        let ast = self.compile(expression)?;
        let mut scope = vars.to_scope();
        let _deadline = DeadlineGuard::arm(Duration::from_millis(self.config.timeout_ms));

        self.engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map_err(|err| self.map_eval_error(*err))
    }

    fn map_eval_error(&self, err: EvalAltResult) -> WorkflowError {
        match err {
            EvalAltResult::ErrorTerminated(_, _) => WorkflowError::ExpressionTimeout(self.config.timeout_ms),
            EvalAltResult::ErrorTooManyOperations(_) => WorkflowError::ExpressionCostLimit(self.config.cost_limit),
            other => WorkflowError::ExpressionEvaluation(other.to_string()),
        }
    }

    /// Evaluate to a JSON value
    pub fn evaluate_value(&self, expression: &str, vars: &ExpressionVars) -> Result<Value> {
        let result = self.eval_dynamic(expression, vars)?;
        Ok(dynamic_to_json(&result))
    }

    /// Evaluate an expression that must produce a boolean
    pub fn evaluate_bool(&self, expression: &str, vars: &ExpressionVars) -> Result<bool> {
        let result = self.eval_dynamic(expression, vars)?;
        result.as_bool().map_err(|actual| WorkflowError::ExpressionTypeMismatch {
            expected: "bool".to_string(),
            actual: actual.to_string(),
        })
    }

    /// Evaluate an expression that must produce a map
    pub fn evaluate_map(&self, expression: &str, vars: &ExpressionVars) -> Result<Map<String, Value>> {
        match self.evaluate_value(expression, vars)? {
            Value::Object(map) => Ok(map),
            other => Err(WorkflowError::ExpressionTypeMismatch {
                expected: "map".to_string(),
                actual: json_type_name(&other).to_string(),
            }),
        }
    }

    /// Render `{{expr}}` tokens inside a string
    ///
    /// A string that is exactly one token keeps the expression's type; anything
    /// else is rendered as text.
    pub fn render_template(&self, template: &str, vars: &ExpressionVars) -> Result<Value> {
        let trimmed = template.trim();
        if let Some(inner) = single_token(trimmed) {
            return self.evaluate_value(inner, vars);
        }
        self.render_text(template, vars).map(Value::String)
    }

    /// Render `{{expr}}` tokens into text
    pub fn render_text(&self, template: &str, vars: &ExpressionVars) -> Result<String> {
        let mut output = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(end) = rest[start + 2..].find("}}") else {
                break;
            };
            output.push_str(&rest[..start]);
            let expression = rest[start + 2..start + 2 + end].trim();
            let value = self.evaluate_value(expression, vars)?;
            output.push_str(&value_to_text(&value));
            rest = &rest[start + 2 + end + 2..];
        }
        output.push_str(rest);
        Ok(output)
    }

    /// Render every string inside a JSON document
    pub fn render_value(&self, value: &Value, vars: &ExpressionVars) -> Result<Value> {
        match value {
            Value::String(text) if text.contains("{{") => self.render_template(text, vars),
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item, vars))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut rendered = Map::new();
                for (key, item) in map {
                    rendered.insert(key.clone(), self.render_value(item, vars)?);
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new(ExpressionConfig::default())
    }
}

fn single_token(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        None
    } else {
        Some(inner.trim())
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

/// Convert JSON into a rhai value
pub fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i as INT)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::from(n.to_string())
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => {
            let array: Array = items.iter().map(json_to_dynamic).collect();
            Dynamic::from(array)
        }
        Value::Object(map) => {
            let mut out = rhai::Map::new();
            for (k, v) in map {
                out.insert(k.as_str().into(), json_to_dynamic(v));
            }
            Dynamic::from(out)
        }
    }
}

/// Convert a rhai value back into JSON
pub fn dynamic_to_json(value: &Dynamic) -> Value {
    if value.is_unit() {
        Value::Null
    } else if let Ok(b) = value.as_bool() {
        Value::Bool(b)
    } else if let Ok(i) = value.as_int() {
        Value::from(i)
    } else if let Ok(f) = value.as_float() {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    } else if let Ok(c) = value.as_char() {
        Value::String(c.to_string())
    } else if value.is_string() {
        Value::String(value.clone().into_string().unwrap_or_default())
    } else if value.is_array() {
        let items = value.clone().into_array().unwrap_or_default();
        Value::Array(items.iter().map(dynamic_to_json).collect())
    } else if value.is_map() {
        let map = value.clone().try_cast::<rhai::Map>().unwrap_or_default();
        Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                .collect(),
        )
    } else {
        Value::String(value.to_string())
    }
}
