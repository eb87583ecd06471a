// Mapping execution: statements pair an assignment target with a query
// function, and the executor applies them in source order against a pending
// copy of a message part.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::trace;

use crate::function::{
    EvalContext, EvalError, Function, NamedMaps, TargetKind, TargetPath, TargetsContext,
    Variables,
};
use crate::message::{MessageBatch, Metadata, Part};
use crate::value::{Value, ValueType};

/// An error applying a query result to an assignment target.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssignError {
    #[error("unable to assign metadata in the current context")]
    MetaUnavailable,

    #[error("setting root meta object requires object value, received: {0}")]
    MetaRootType(ValueType),

    #[error("target message part does not exist")]
    PartMissing,
}

/// A mapping-level failure, attributed to the statement that raised it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MapError {
    #[error("failed to execute mapping query at line {line}: {cause}")]
    Query { line: u32, cause: EvalError },

    #[error("failed to assign query result at line {line}: {cause}")]
    Assign { line: u32, cause: AssignError },

    #[error("mapping execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Value(EvalError),
}

/// A cooperative cancellation flag the host may trip mid-mapping; execution
/// checks it between statements.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

// ── Assignments ──────────────────────────────────────────────────────────────

/// An assignment destination: the structured payload at a path, a metadata
/// key, or a mapping-local variable. `None` paths and keys address the root
/// of their kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    Json(Option<Vec<String>>),
    Meta(Option<String>),
    Var(String),
}

impl Assignment {
    /// The whole structured payload.
    pub fn json_root() -> Self {
        Assignment::Json(None)
    }

    /// A dotted path into the structured payload.
    pub fn json(path: &str) -> Self {
        Assignment::Json(Some(crate::function::split_path(path)))
    }

    /// The whole metadata object.
    pub fn meta_root() -> Self {
        Assignment::Meta(None)
    }

    /// A single metadata key.
    pub fn meta(key: impl Into<String>) -> Self {
        Assignment::Meta(Some(key.into()))
    }

    /// A mapping-local variable.
    pub fn var(name: impl Into<String>) -> Self {
        Assignment::Var(name.into())
    }

    /// The location this assignment writes, for static analysis.
    pub fn target(&self) -> TargetPath {
        match self {
            Assignment::Json(path) => TargetPath::value(path.clone().unwrap_or_default()),
            Assignment::Meta(key) => {
                TargetPath::metadata(key.clone().map(|k| vec![k]).unwrap_or_default())
            }
            Assignment::Var(name) => TargetPath::variable(vec![name.clone()]),
        }
    }

    fn apply(&self, value: Value, ctx: &mut AssignContext<'_>) -> Result<(), AssignError> {
        match self {
            Assignment::Json(None) => {
                match value {
                    Value::Nothing => {}
                    Value::Delete => *ctx.pending = Pending::Deleted,
                    v => *ctx.pending = Pending::Set(v),
                }
                Ok(())
            }
            Assignment::Json(Some(path)) => {
                if matches!(value, Value::Nothing) {
                    return Ok(());
                }
                let doc = ctx.pending_mut()?;
                if matches!(value, Value::Delete) {
                    doc.delete_path(path);
                } else {
                    doc.set_path(path, value);
                }
                Ok(())
            }
            Assignment::Meta(key) => {
                let meta = ctx.meta.as_deref_mut().ok_or(AssignError::MetaUnavailable)?;
                match key {
                    Some(k) => match value {
                        Value::Nothing => {}
                        Value::Delete => {
                            meta.shift_remove(k.as_str());
                        }
                        v => {
                            meta.insert(k.clone(), v.to_string());
                        }
                    },
                    None => match value {
                        Value::Nothing => {}
                        Value::Delete => meta.clear(),
                        Value::Object(map) => {
                            *meta = map
                                .into_iter()
                                .map(|(k, v)| (k, v.to_string()))
                                .collect();
                        }
                        other => return Err(AssignError::MetaRootType(other.value_type())),
                    },
                }
                Ok(())
            }
            Assignment::Var(name) => {
                match value {
                    Value::Nothing => {}
                    Value::Delete => {
                        ctx.vars.remove(name);
                    }
                    v => {
                        ctx.vars.insert(name.clone(), v);
                    }
                }
                Ok(())
            }
        }
    }
}

/// The payload under construction. It starts untouched: a mapping that never
/// writes the payload passes the original bytes through byte-identical.
#[derive(Debug, Clone, PartialEq)]
enum Pending {
    Unchanged,
    Set(Value),
    Deleted,
}

struct AssignContext<'a> {
    vars: &'a mut Variables,
    meta: Option<&'a mut Metadata>,
    pending: &'a mut Pending,
    /// The original structured payload, cloned in as the base document the
    /// first time a nested path is written.
    seed: Option<&'a Value>,
}

impl AssignContext<'_> {
    // The mutable document for nested writes. An untouched pending payload
    // is seeded from the original document; with no document to seed from
    // (part-less execution) the nested write has nowhere to land. A deleted
    // payload restarts from scratch, so later statements can resurrect it.
    fn pending_mut(&mut self) -> Result<&mut Value, AssignError> {
        if matches!(self.pending, Pending::Unchanged) {
            let base = self.seed.cloned().ok_or(AssignError::PartMissing)?;
            *self.pending = Pending::Set(base);
        } else if matches!(self.pending, Pending::Deleted) {
            *self.pending = Pending::Set(Value::Nothing);
        }
        match self.pending {
            Pending::Set(v) => Ok(v),
            _ => Err(AssignError::PartMissing),
        }
    }
}

// ── Statements ───────────────────────────────────────────────────────────────

/// One assignment-query pair, tagged with the source line it came from.
#[derive(Debug)]
pub struct Statement {
    pub line: u32,
    pub assignment: Assignment,
    pub query: Box<dyn Function>,
}

impl Statement {
    pub fn new(line: u32, assignment: Assignment, query: Box<dyn Function>) -> Self {
        Statement {
            line,
            assignment,
            query,
        }
    }
}

// ── Executor ─────────────────────────────────────────────────────────────────

static EMPTY_BATCH: Lazy<MessageBatch> = Lazy::new(MessageBatch::new);

/// A compiled mapping: an ordered list of statements plus the named maps
/// referenced from within queries. Immutable once built; safe to share
/// across threads.
#[derive(Debug, Default)]
pub struct Executor {
    statements: Vec<Statement>,
    maps: NamedMaps,
}

impl Executor {
    pub fn new(statements: Vec<Statement>) -> Self {
        Executor {
            statements,
            maps: NamedMaps::new(),
        }
    }

    pub fn with_maps(maps: NamedMaps, statements: Vec<Statement>) -> Self {
        Executor { statements, maps }
    }

    fn first_line(&self) -> u32 {
        self.statements.first().map(|s| s.line).unwrap_or_default()
    }

    /// Apply the mapping to one part of a batch, producing a transformed
    /// part, or `None` when the mapping deleted it.
    ///
    /// The input batch is never mutated: the target part's payload and
    /// metadata are deep-copied before any statement runs.
    pub fn map_part(&self, index: usize, batch: &MessageBatch) -> Result<Option<Part>, MapError> {
        self.map_part_inner(index, batch, None)
    }

    /// As [`Executor::map_part`], polling a cancellation token between
    /// statements.
    pub fn map_part_with_cancel(
        &self,
        index: usize,
        batch: &MessageBatch,
        cancel: &CancelToken,
    ) -> Result<Option<Part>, MapError> {
        self.map_part_inner(index, batch, Some(cancel))
    }

    fn map_part_inner(
        &self,
        index: usize,
        batch: &MessageBatch,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<Part>, MapError> {
        trace!(index, statements = self.statements.len(), "mapping part");

        let src = batch.get(index).ok_or(MapError::Query {
            line: self.first_line(),
            cause: EvalError::PartMissing,
        })?;
        let mut part = src.clone();
        if self.statements.is_empty() {
            return Ok(Some(part));
        }

        // The base document for nested writes is settled before any
        // statement runs, so structural problems surface on the first line.
        let original = src
            .structured()
            .map_err(|e| MapError::Query {
                line: self.first_line(),
                cause: EvalError::NoContext(e),
            })?
            .clone();

        let mut vars = Variables::new();
        let mut pending = Pending::Unchanged;

        for stmt in &self.statements {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(MapError::Cancelled);
                }
            }

            let res = {
                let ctx = EvalContext {
                    batch,
                    index,
                    vars: &vars,
                    maps: &self.maps,
                    value: None,
                };
                stmt.query.exec(&ctx).map_err(|cause| MapError::Query {
                    line: stmt.line,
                    cause,
                })?
            };

            let mut actx = AssignContext {
                vars: &mut vars,
                meta: Some(part.metadata_mut()),
                pending: &mut pending,
                seed: Some(&original),
            };
            stmt.assignment
                .apply(res, &mut actx)
                .map_err(|cause| MapError::Assign {
                    line: stmt.line,
                    cause,
                })?;
        }

        match pending {
            Pending::Unchanged => Ok(Some(part)),
            Pending::Deleted => Ok(None),
            Pending::Set(Value::String(s)) => {
                part.set_bytes(s.into_bytes());
                Ok(Some(part))
            }
            Pending::Set(Value::Bytes(b)) => {
                part.set_bytes(b);
                Ok(Some(part))
            }
            Pending::Set(v) => {
                part.set_structured(v);
                Ok(Some(part))
            }
        }
    }

    /// Execute the mapping for its root value against a part and coerce the
    /// result to a boolean, for check expressions. The part's structured
    /// view is only resolved if a statement asks for it.
    pub fn query_part(&self, index: usize, batch: &MessageBatch) -> Result<bool, MapError> {
        let root = self.run_statements(batch, index, None, None)?;
        root.get_bool()
            .map_err(|e| MapError::Value(EvalError::from(e)))
    }

    /// Execute the mapping against an ad-hoc value with no message part.
    /// Metadata assignments fail in this mode, and part-dependent functions
    /// report the missing part.
    pub fn exec(&self, value: Option<&Value>) -> Result<Value, MapError> {
        self.run_statements(&EMPTY_BATCH, 0, value, None)
    }

    /// As [`Executor::exec`], polling a cancellation token between
    /// statements.
    pub fn exec_with_cancel(
        &self,
        value: Option<&Value>,
        cancel: &CancelToken,
    ) -> Result<Value, MapError> {
        self.run_statements(&EMPTY_BATCH, 0, value, Some(cancel))
    }

    /// Execute against an ad-hoc value and render the result as a string.
    /// Failures yield an empty string.
    pub fn to_string(&self, value: Option<&Value>) -> String {
        self.exec(value).map(|v| v.to_string()).unwrap_or_default()
    }

    /// Execute against an ad-hoc value and render the result as bytes.
    /// Failures yield empty bytes.
    pub fn to_bytes(&self, value: Option<&Value>) -> Vec<u8> {
        self.exec(value).map(|v| v.to_bytes()).unwrap_or_default()
    }

    // The shared statement loop for the part-less execution modes: the
    // pending document starts empty and is returned as the root value.
    fn run_statements(
        &self,
        batch: &MessageBatch,
        index: usize,
        value: Option<&Value>,
        cancel: Option<&CancelToken>,
    ) -> Result<Value, MapError> {
        let mut vars = Variables::new();
        let mut pending = Pending::Unchanged;

        for stmt in &self.statements {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(MapError::Cancelled);
                }
            }

            let res = {
                let ctx = EvalContext {
                    batch,
                    index,
                    vars: &vars,
                    maps: &self.maps,
                    value,
                };
                stmt.query.exec(&ctx).map_err(|cause| MapError::Query {
                    line: stmt.line,
                    cause,
                })?
            };

            let mut actx = AssignContext {
                vars: &mut vars,
                meta: None,
                pending: &mut pending,
                seed: None,
            };
            stmt.assignment
                .apply(res, &mut actx)
                .map_err(|cause| MapError::Assign {
                    line: stmt.line,
                    cause,
                })?;
        }

        Ok(match pending {
            Pending::Unchanged => Value::Nothing,
            Pending::Deleted => Value::Delete,
            Pending::Set(v) => v,
        })
    }

    /// The locations this mapping writes, in statement order. Root targets
    /// carry an empty path.
    pub fn assignment_targets(&self) -> Vec<TargetPath> {
        self.statements
            .iter()
            .map(|s| s.assignment.target())
            .collect()
    }

    /// The externally observable locations this mapping reads: deduplicated,
    /// first occurrence first, with references to variables assigned by
    /// earlier statements omitted.
    pub fn query_targets(&self, ctx: &TargetsContext<'_>) -> Vec<TargetPath> {
        let mut out: Vec<TargetPath> = Vec::new();
        let mut assigned_vars: Vec<String> = Vec::new();

        for stmt in &self.statements {
            for target in stmt.query.query_targets(ctx) {
                if target.kind == TargetKind::Variable
                    && target
                        .path
                        .first()
                        .is_some_and(|name| assigned_vars.iter().any(|v| v == name))
                {
                    continue;
                }
                if !out.contains(&target) {
                    out.push(target);
                }
            }
            if let Assignment::Var(name) = &stmt.assignment {
                assigned_vars.push(name.clone());
            }
        }
        out
    }

    pub fn maps(&self) -> &NamedMaps {
        &self.maps
    }
}
