// bloblang - embedded mapping language runtime
// Licensed under the MIT License

//! # bloblang
//!
//! The runtime for an embedded mapping language: compiled mappings transform
//! a message part's structured payload, metadata, and mapping-local
//! variables through an ordered list of assignment statements, each driven
//! by a composable query function.
//!
//! The source-text grammar is deliberately out of scope. A parser targets
//! the constructors exposed here: [`Literal`], [`FieldFunction`],
//! [`VarFunction`], the named-function registry ([`init_function`]), the
//! method registry ([`init_method`]), the arithmetic resolver
//! ([`new_arithmetic_expression`]), and finally [`Statement`] and
//! [`Executor`].
//!
//! ## Architecture
//!
//! - `value` - the dynamically typed value model and its coercions
//! - `message` - message parts and batches as consumed from the host
//! - `function` - the query-function tree and evaluation context
//! - `functions` - the named-function registry and built-ins
//! - `methods` - the method registry and built-ins
//! - `arithmetic` - operator precedence resolution with constant folding
//! - `args` - positional argument validation for registered functions
//! - `mapping` - assignments, statements, and the mapping executor
//!
//! ## Example
//!
//! ```
//! use bloblang::{
//!     Assignment, Executor, FieldFunction, Literal, MessageBatch, Part, Statement,
//! };
//!
//! // root.foo = this.bar
//! // root.bar = "baz"
//! let mapping = Executor::new(vec![
//!     Statement::new(0, Assignment::json("foo"), FieldFunction::boxed("bar")),
//!     Statement::new(1, Assignment::json("bar"), Literal::boxed("baz")),
//! ]);
//!
//! let mut batch = MessageBatch::new();
//! batch.push(Part::new(r#"{"bar":"old"}"#));
//!
//! let out = mapping.map_part(0, &batch).unwrap().unwrap();
//! assert_eq!(out.bytes(), br#"{"bar":"baz","foo":"old"}"#);
//! ```

pub mod args;
pub mod arithmetic;
pub mod function;
pub mod functions;
pub mod mapping;
pub mod message;
pub mod methods;
pub mod value;

pub use args::ArgSpec;
pub use arithmetic::{new_arithmetic_expression, ArithmeticOperator};
pub use function::{
    ClosureFunction, EvalContext, EvalError, FieldFunction, Function, Literal, NamedMaps,
    TargetKind, TargetPath, TargetsContext, VarFunction, Variables,
};
pub use functions::{init_function, FunctionSet, ALL_FUNCTIONS, NON_DETERMINISTIC_FUNCTIONS};
pub use mapping::{
    AssignError, Assignment, CancelToken, Executor, MapError, Statement,
};
pub use message::{MessageBatch, Metadata, Part, PayloadError};
pub use methods::{init_method, Arg, MethodSet, ALL_METHODS};
pub use value::{Object, TypeError, Value, ValueType};
