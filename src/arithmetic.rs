// Arithmetic: folds a flat sequence of child functions and operators into a
// single function, resolving precedence in four passes.

use crate::function::{
    EvalContext, EvalError, Function, TargetPath, TargetsContext,
};
use crate::value::{TypeError, Value, ValueType};

/// An operator combining the results of two query functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithmeticOperator {
    Add,
    Sub,
    Div,
    Mul,
    Mod,
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    And,
    Or,
    Pipe,
}

impl ArithmeticOperator {
    fn is_product(self) -> bool {
        matches!(
            self,
            ArithmeticOperator::Mul | ArithmeticOperator::Div | ArithmeticOperator::Mod
        )
    }

    fn is_sum(self) -> bool {
        matches!(self, ArithmeticOperator::Add | ArithmeticOperator::Sub)
    }

    fn is_comparison(self) -> bool {
        matches!(
            self,
            ArithmeticOperator::Eq
                | ArithmeticOperator::Neq
                | ArithmeticOperator::Gt
                | ArithmeticOperator::Lt
                | ArithmeticOperator::Gte
                | ArithmeticOperator::Lte
        )
    }

    /// Operators whose operands are plain values, eligible for constant
    /// folding. Boolean and coalesce operators short-circuit instead.
    fn is_value_op(self) -> bool {
        self.is_product() || self.is_sum() || self.is_comparison()
    }
}

// ── Value-level operator application ─────────────────────────────────────────

// Integer ladder: if either side is a float both sides widen, otherwise the
// integer form applies.
fn number_degradation(
    left: &Value,
    right: &Value,
    int_op: impl Fn(i64, i64) -> Result<i64, EvalError>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    if matches!(left, Value::Float(_)) || matches!(right, Value::Float(_)) {
        let l = left.get_float()?;
        let r = right.get_float()?;
        return Ok(Value::Float(float_op(l, r)));
    }
    let l = left.get_int()?;
    let r = right.get_int()?;
    Ok(Value::Int(int_op(l, r)?))
}

fn apply_product(
    op: ArithmeticOperator,
    left: &Value,
    right: &Value,
) -> Result<Value, EvalError> {
    match op {
        ArithmeticOperator::Mul => {
            number_degradation(left, right, |l, r| Ok(l.wrapping_mul(r)), |l, r| l * r)
        }
        // Division always happens in float space.
        ArithmeticOperator::Div => {
            let l = left.get_float()?;
            let r = right.get_float()?;
            if r == 0.0 {
                return Err(EvalError::DivideByZero);
            }
            Ok(Value::Float(l / r))
        }
        // Modulo always happens in integer space.
        ArithmeticOperator::Mod => {
            let l = left.get_int()?;
            let r = right.get_int()?;
            if r == 0 {
                return Err(EvalError::DivideByZero);
            }
            Ok(Value::Int(l % r))
        }
        _ => unreachable!("operator {:?} is not a product", op),
    }
}

fn apply_sum(op: ArithmeticOperator, left: &Value, right: &Value) -> Result<Value, EvalError> {
    match op {
        // Addition dispatches on the left operand: numbers add, strings and
        // bytes concatenate, anything else is a type error.
        ArithmeticOperator::Add => match left {
            Value::Int(_) | Value::Float(_) => {
                number_degradation(left, right, |l, r| Ok(l.wrapping_add(r)), |l, r| l + r)
            }
            Value::String(_) | Value::Bytes(_) => {
                let l = left.get_string()?;
                let r = right.get_string()?;
                Ok(Value::String(l + &r))
            }
            other => Err(TypeError::new(
                other.value_type(),
                vec![ValueType::Number, ValueType::String],
            )
            .into()),
        },
        ArithmeticOperator::Sub => {
            number_degradation(left, right, |l, r| Ok(l.wrapping_sub(r)), |l, r| l - r)
        }
        _ => unreachable!("operator {:?} is not a sum", op),
    }
}

fn compare_floats(op: ArithmeticOperator, l: f64, r: f64) -> bool {
    match op {
        ArithmeticOperator::Eq => l == r,
        ArithmeticOperator::Neq => l != r,
        ArithmeticOperator::Gt => l > r,
        ArithmeticOperator::Gte => l >= r,
        ArithmeticOperator::Lt => l < r,
        ArithmeticOperator::Lte => l <= r,
        _ => false,
    }
}

fn compare_strings(op: ArithmeticOperator, l: &str, r: &str) -> bool {
    match op {
        ArithmeticOperator::Eq => l == r,
        ArithmeticOperator::Neq => l != r,
        ArithmeticOperator::Gt => l > r,
        ArithmeticOperator::Gte => l >= r,
        ArithmeticOperator::Lt => l < r,
        ArithmeticOperator::Lte => l <= r,
        _ => false,
    }
}

fn apply_comparison(
    op: ArithmeticOperator,
    left: &Value,
    right: &Value,
) -> Result<Value, EvalError> {
    // A right-hand side that refuses to coerce counts as "not equal" under
    // `!=`; every other comparison propagates the coercion failure.
    let mismatch = |err: TypeError| -> Result<Value, EvalError> {
        if op == ArithmeticOperator::Neq {
            Ok(Value::Bool(true))
        } else {
            Err(err.into())
        }
    };

    match left {
        Value::String(_) | Value::Bytes(_) => {
            let l = left.get_string()?;
            match right.get_string() {
                Ok(r) => Ok(Value::Bool(compare_strings(op, &l, &r))),
                Err(err) => mismatch(err),
            }
        }
        Value::Int(_) | Value::Float(_) => {
            let l = left.get_float()?;
            match right.get_float() {
                Ok(r) => Ok(Value::Bool(compare_floats(op, l, r))),
                Err(err) => mismatch(err),
            }
        }
        Value::Bool(l) => {
            if !matches!(op, ArithmeticOperator::Eq | ArithmeticOperator::Neq) {
                return Err(TypeError::new(ValueType::Bool, vec![]).into());
            }
            match right.get_bool() {
                Ok(r) => Ok(Value::Bool(match op {
                    ArithmeticOperator::Eq => *l == r,
                    _ => *l != r,
                })),
                Err(err) => mismatch(err),
            }
        }
        other => {
            // Structural equality for everything else.
            if !matches!(op, ArithmeticOperator::Eq | ArithmeticOperator::Neq) {
                return Err(TypeError::new(other.value_type(), vec![]).into());
            }
            let eq = left == right;
            Ok(Value::Bool(match op {
                ArithmeticOperator::Eq => eq,
                _ => !eq,
            }))
        }
    }
}

fn apply_value_op(
    op: ArithmeticOperator,
    left: &Value,
    right: &Value,
) -> Result<Value, EvalError> {
    if op.is_product() {
        apply_product(op, left, right)
    } else if op.is_sum() {
        apply_sum(op, left, right)
    } else {
        apply_comparison(op, left, right)
    }
}

// ── Combinator node ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct ArithmeticFunction {
    op: ArithmeticOperator,
    lhs: Box<dyn Function>,
    rhs: Box<dyn Function>,
}

impl Function for ArithmeticFunction {
    fn exec(&self, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
        match self.op {
            ArithmeticOperator::And => {
                let l = self.lhs.exec(ctx)?.get_bool()?;
                if !l {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.rhs.exec(ctx)?.get_bool()?))
            }
            ArithmeticOperator::Or => {
                let l = self.lhs.exec(ctx)?.get_bool()?;
                if l {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.rhs.exec(ctx)?.get_bool()?))
            }
            ArithmeticOperator::Pipe => match self.lhs.exec(ctx) {
                Ok(v) if !v.is_null() => Ok(v),
                _ => self.rhs.exec(ctx),
            },
            op => {
                let l = self.lhs.exec(ctx)?;
                let r = self.rhs.exec(ctx)?;
                apply_value_op(op, &l, &r)
            }
        }
    }

    fn query_targets(&self, ctx: &TargetsContext<'_>) -> Vec<TargetPath> {
        let mut targets = self.lhs.query_targets(ctx);
        targets.extend(self.rhs.query_targets(ctx));
        targets
    }
}

/// Combine two functions with an operator, collapsing literal operands of
/// value-level operators into a literal result at build time.
fn combine(
    op: ArithmeticOperator,
    lhs: Box<dyn Function>,
    rhs: Box<dyn Function>,
) -> Result<Box<dyn Function>, EvalError> {
    if op.is_value_op() {
        if let (Some(l), Some(r)) = (lhs.as_literal(), rhs.as_literal()) {
            let folded = apply_value_op(op, l, r)?;
            return Ok(crate::function::Literal::boxed(folded));
        }
    }
    Ok(Box::new(ArithmeticFunction { op, lhs, rhs }))
}

// ── Precedence resolution ────────────────────────────────────────────────────

/// Fold a flat sequence of child functions and the operators chaining them
/// into a single function. The number of functions must be exactly one more
/// than the number of operators.
///
/// Resolution happens in four passes, highest precedence first: products and
/// coalesce, then sums, then comparisons, then the boolean operators.
pub fn new_arithmetic_expression(
    mut fns: Vec<Box<dyn Function>>,
    mut ops: Vec<ArithmeticOperator>,
) -> Result<Box<dyn Function>, EvalError> {
    if fns.len() == 1 && ops.is_empty() {
        return Ok(fns.remove(0));
    }
    if fns.len() != ops.len() + 1 {
        return Err(EvalError::UserDefined(format!(
            "mismatch of functions ({}) to arithmetic operators ({})",
            fns.len(),
            ops.len()
        )));
    }

    let passes: [fn(ArithmeticOperator) -> bool; 4] = [
        |op| op.is_product() || op == ArithmeticOperator::Pipe,
        ArithmeticOperator::is_sum,
        ArithmeticOperator::is_comparison,
        |op| matches!(op, ArithmeticOperator::And | ArithmeticOperator::Or),
    ];

    for matches_pass in passes {
        let mut fns_new: Vec<Box<dyn Function>> = Vec::with_capacity(fns.len());
        let mut ops_new: Vec<ArithmeticOperator> = Vec::new();

        let mut iter = fns.into_iter();
        if let Some(first) = iter.next() {
            fns_new.push(first);
        }
        for (op, rhs) in ops.iter().copied().zip(iter) {
            if matches_pass(op) {
                let lhs = fns_new
                    .pop()
                    .ok_or_else(|| EvalError::UserDefined("empty expression".to_string()))?;
                fns_new.push(combine(op, lhs, rhs)?);
            } else {
                fns_new.push(rhs);
                ops_new.push(op);
            }
        }

        fns = fns_new;
        ops = ops_new;
        if fns.len() == 1 {
            return Ok(fns.remove(0));
        }
    }

    Err(EvalError::UserDefined(format!(
        "unresolved arithmetic operators ({:?})",
        ops
    )))
}
