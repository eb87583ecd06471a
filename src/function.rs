// Query functions: the composable evaluation tree. Every node exposes the
// same two capabilities, execution against a context and static reporting of
// the targets it reads.

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use thiserror::Error;

use crate::message::{MessageBatch, Part, PayloadError};
use crate::value::{TypeError, Value};

/// Local variables live for a single mapping invocation.
pub type Variables = HashMap<String, Value>;

/// Reusable sub-expressions addressable by name from within a mapping.
pub type NamedMaps = IndexMap<String, Box<dyn Function>>;

/// An error produced while executing a query function.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("value at path '{0}' not found")]
    NotFound(String),

    #[error("variable '{0}' undefined")]
    VariableUndefined(String),

    #[error("metadata value '{0}' not found")]
    MetadataNotFound(String),

    #[error("target message part does not exist")]
    PartMissing,

    #[error("unable to reference message as structured (with 'this'): {0}")]
    NoContext(#[source] PayloadError),

    #[error("message is empty")]
    MessageEmpty,

    #[error("parse as json: {0}")]
    JsonParse(String),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("bad argument {index}: {cause}")]
    BadArgument { index: usize, cause: TypeError },

    #[error("attempted to divide by zero")]
    DivideByZero,

    #[error("unrecognised function '{0}'")]
    UnrecognizedFunction(String),

    #[error("unrecognised method '{0}'")]
    UnrecognizedMethod(String),

    #[error("expected {expected} arguments, received {actual}")]
    WrongArity { expected: usize, actual: usize },

    #[error("execution cancelled")]
    Cancelled,

    #[error("{0}")]
    UserDefined(String),
}

impl From<PayloadError> for EvalError {
    fn from(e: PayloadError) -> Self {
        match e {
            PayloadError::Empty => EvalError::MessageEmpty,
            PayloadError::Json(msg) => EvalError::JsonParse(msg),
        }
    }
}

// ── Target paths ─────────────────────────────────────────────────────────────

/// The kind of location a target path refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Value,
    Metadata,
    Variable,
}

/// A static descriptor of a location a query reads or an assignment writes,
/// used for dependency analysis. An empty path refers to the root of its
/// kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TargetPath {
    pub kind: TargetKind,
    pub path: Vec<String>,
}

impl TargetPath {
    pub fn new(kind: TargetKind, path: Vec<String>) -> Self {
        TargetPath { kind, path }
    }

    pub fn value(path: Vec<String>) -> Self {
        TargetPath::new(TargetKind::Value, path)
    }

    pub fn metadata(path: Vec<String>) -> Self {
        TargetPath::new(TargetKind::Metadata, path)
    }

    pub fn variable(path: Vec<String>) -> Self {
        TargetPath::new(TargetKind::Variable, path)
    }
}

/// Context for static target analysis: named maps are resolved through it.
pub struct TargetsContext<'a> {
    pub maps: &'a NamedMaps,
}

// ── Evaluation context ───────────────────────────────────────────────────────

/// The state a query function executes against.
///
/// Functions only ever read from the context; variable and payload writes
/// happen in the executor between statements. `value` is the explicit
/// current-context binding used when a method or named map rebinds `this`;
/// when absent, `this` falls back to the indexed part's structured view.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub batch: &'a MessageBatch,
    pub index: usize,
    pub vars: &'a Variables,
    pub maps: &'a NamedMaps,
    pub value: Option<&'a Value>,
}

impl<'a> EvalContext<'a> {
    /// The current `this` binding.
    pub fn this(&self) -> Result<&'a Value, EvalError> {
        if let Some(v) = self.value {
            return Ok(v);
        }
        let part = self.part()?;
        part.structured().map_err(EvalError::NoContext)
    }

    /// The message part this context points at.
    pub fn part(&self) -> Result<&'a Part, EvalError> {
        self.batch.get(self.index).ok_or(EvalError::PartMissing)
    }

    /// A copy of this context with `this` rebound.
    pub fn with_value(&self, value: &'a Value) -> EvalContext<'a> {
        EvalContext {
            value: Some(value),
            ..*self
        }
    }
}

// ── The function capability set ──────────────────────────────────────────────

/// A query function: an immutable evaluation-tree node. Compiled trees are
/// shared freely across threads; all mutable state lives in the caller.
pub trait Function: Send + Sync + fmt::Debug {
    /// Evaluate the node against a context.
    fn exec(&self, ctx: &EvalContext<'_>) -> Result<Value, EvalError>;

    /// The set of locations this node reads, for dependency analysis.
    fn query_targets(&self, ctx: &TargetsContext<'_>) -> Vec<TargetPath>;

    /// The constant value of this node, when it has one. Lets combinators
    /// fold constant subtrees at build time.
    fn as_literal(&self) -> Option<&Value> {
        None
    }
}

// ── Literal ──────────────────────────────────────────────────────────────────

/// A fixed value.
#[derive(Debug, Clone)]
pub struct Literal {
    pub value: Value,
}

impl Literal {
    pub fn new(value: impl Into<Value>) -> Self {
        Literal {
            value: value.into(),
        }
    }

    pub fn boxed(value: impl Into<Value>) -> Box<dyn Function> {
        Box::new(Literal::new(value))
    }
}

impl Function for Literal {
    fn exec(&self, _: &EvalContext<'_>) -> Result<Value, EvalError> {
        Ok(self.value.clone())
    }

    fn query_targets(&self, _: &TargetsContext<'_>) -> Vec<TargetPath> {
        Vec::new()
    }

    fn as_literal(&self) -> Option<&Value> {
        Some(&self.value)
    }
}

// ── Field reference ──────────────────────────────────────────────────────────

/// A reference into the current `this` binding. An empty path yields the
/// whole binding.
#[derive(Debug, Clone)]
pub struct FieldFunction {
    path: Vec<String>,
}

impl FieldFunction {
    pub fn new(path: Vec<String>) -> Self {
        FieldFunction { path }
    }

    /// Build from a dotted path string; the empty string is the root.
    pub fn parse(path: &str) -> Self {
        FieldFunction {
            path: split_path(path),
        }
    }

    pub fn boxed(path: &str) -> Box<dyn Function> {
        Box::new(FieldFunction::parse(path))
    }
}

impl Function for FieldFunction {
    fn exec(&self, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
        let root = ctx.this()?;
        root.query_path(&self.path)
            .cloned()
            .ok_or_else(|| EvalError::NotFound(self.path.join(".")))
    }

    fn query_targets(&self, _: &TargetsContext<'_>) -> Vec<TargetPath> {
        vec![TargetPath::value(self.path.clone())]
    }
}

/// Split a dotted path into segments; empty input means the root.
pub fn split_path(path: &str) -> Vec<String> {
    if path.is_empty() {
        return Vec::new();
    }
    path.split('.').map(str::to_string).collect()
}

// ── Variable reference ───────────────────────────────────────────────────────

/// A reference to a mapping-local variable.
#[derive(Debug, Clone)]
pub struct VarFunction {
    name: String,
}

impl VarFunction {
    pub fn new(name: impl Into<String>) -> Self {
        VarFunction { name: name.into() }
    }

    pub fn boxed(name: impl Into<String>) -> Box<dyn Function> {
        Box::new(VarFunction::new(name))
    }
}

impl Function for VarFunction {
    fn exec(&self, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
        ctx.vars
            .get(&self.name)
            .cloned()
            .ok_or_else(|| EvalError::VariableUndefined(self.name.clone()))
    }

    fn query_targets(&self, _: &TargetsContext<'_>) -> Vec<TargetPath> {
        vec![TargetPath::variable(vec![self.name.clone()])]
    }
}

// ── Closures ─────────────────────────────────────────────────────────────────

type ExecFn = dyn Fn(&EvalContext<'_>) -> Result<Value, EvalError> + Send + Sync;

/// A native function paired with a precomputed target set. Registered named
/// functions that read fixed locations are built on this.
pub struct ClosureFunction {
    exec_fn: Box<ExecFn>,
    targets: Vec<TargetPath>,
}

impl ClosureFunction {
    pub fn new(
        exec_fn: impl Fn(&EvalContext<'_>) -> Result<Value, EvalError> + Send + Sync + 'static,
        targets: Vec<TargetPath>,
    ) -> Self {
        ClosureFunction {
            exec_fn: Box::new(exec_fn),
            targets,
        }
    }

    pub fn boxed(
        exec_fn: impl Fn(&EvalContext<'_>) -> Result<Value, EvalError> + Send + Sync + 'static,
        targets: Vec<TargetPath>,
    ) -> Box<dyn Function> {
        Box::new(ClosureFunction::new(exec_fn, targets))
    }
}

impl fmt::Debug for ClosureFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureFunction")
            .field("targets", &self.targets)
            .finish_non_exhaustive()
    }
}

impl Function for ClosureFunction {
    fn exec(&self, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
        (self.exec_fn)(ctx)
    }

    fn query_targets(&self, _: &TargetsContext<'_>) -> Vec<TargetPath> {
        self.targets.clone()
    }
}
