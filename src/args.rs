// ArgSpec: declarative validation of positional arguments for function and
// method authors.

use crate::function::EvalError;
use crate::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArgKind {
    Int64,
    Float64,
    Bool,
    String,
    Any,
}

/// A positional argument validator, built once per registered function or
/// method. `extract` checks arity, coerces each argument to its declared
/// type, and reports failures with the 0-based argument index.
#[derive(Clone, Debug, Default)]
pub struct ArgSpec {
    kinds: Vec<ArgKind>,
}

impl ArgSpec {
    pub fn new() -> Self {
        ArgSpec { kinds: Vec::new() }
    }

    pub fn int64(mut self) -> Self {
        self.kinds.push(ArgKind::Int64);
        self
    }

    pub fn float64(mut self) -> Self {
        self.kinds.push(ArgKind::Float64);
        self
    }

    pub fn bool(mut self) -> Self {
        self.kinds.push(ArgKind::Bool);
        self
    }

    pub fn string(mut self) -> Self {
        self.kinds.push(ArgKind::String);
        self
    }

    pub fn any(mut self) -> Self {
        self.kinds.push(ArgKind::Any);
        self
    }

    /// Validate a slice of arguments against the declared kinds, returning
    /// them coerced into their canonical representations.
    pub fn extract(&self, args: &[Value]) -> Result<Vec<Value>, EvalError> {
        if args.len() != self.kinds.len() {
            return Err(EvalError::WrongArity {
                expected: self.kinds.len(),
                actual: args.len(),
            });
        }

        let mut out = Vec::with_capacity(args.len());
        for (index, (kind, arg)) in self.kinds.iter().zip(args).enumerate() {
            let coerced = match kind {
                ArgKind::Int64 => arg.get_int().map(Value::Int),
                ArgKind::Float64 => arg.get_float().map(Value::Float),
                ArgKind::Bool => arg.get_bool().map(Value::Bool),
                ArgKind::String => arg.get_string().map(Value::String),
                ArgKind::Any => Ok(arg.clone()),
            }
            .map_err(|cause| EvalError::BadArgument { index, cause })?;
            out.push(coerced);
        }
        Ok(out)
    }
}
