// Methods: dispatched on an evaluated receiver value. The registry mirrors
// the named-function registry, including the name rule and `without`.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::function::{
    split_path, EvalContext, EvalError, Function, Literal, TargetPath, TargetsContext,
};
use crate::functions::{RegistryError, NAME_PATTERN};
use crate::value::{Object, TypeError, Value, ValueType};

/// A method argument: either a fixed value or a query evaluated per call.
#[derive(Debug)]
pub enum Arg {
    Value(Value),
    Function(Box<dyn Function>),
}

impl Arg {
    fn into_function(self) -> Box<dyn Function> {
        match self {
            Arg::Value(v) => Box::new(Literal::new(v)),
            Arg::Function(f) => f,
        }
    }
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self {
        Arg::Value(v)
    }
}

impl From<Box<dyn Function>> for Arg {
    fn from(f: Box<dyn Function>) -> Self {
        Arg::Function(f)
    }
}

// Most methods want their arguments settled at build time.
fn literal_args(args: Vec<Arg>) -> Result<Vec<Value>, EvalError> {
    args.into_iter()
        .map(|arg| match arg {
            Arg::Value(v) => Ok(v),
            Arg::Function(f) => f
                .as_literal()
                .cloned()
                .ok_or_else(|| EvalError::UserDefined("expected literal argument".to_string())),
        })
        .collect()
}

fn expect_args(args: &[Arg], expected: usize) -> Result<(), EvalError> {
    if args.len() != expected {
        return Err(EvalError::WrongArity {
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}

type MethodCtor = fn(Box<dyn Function>, Vec<Arg>) -> Result<Box<dyn Function>, EvalError>;

/// An immutable registry of method constructors.
#[derive(Clone, Default)]
pub struct MethodSet {
    ctors: IndexMap<String, MethodCtor>,
}

impl MethodSet {
    pub fn new() -> Self {
        MethodSet {
            ctors: IndexMap::new(),
        }
    }

    pub fn add(&mut self, name: &str, ctor: MethodCtor) -> Result<(), RegistryError> {
        if !NAME_PATTERN.is_match(name) {
            return Err(RegistryError::BadMethodName(name.to_string()));
        }
        self.ctors.insert(name.to_string(), ctor);
        Ok(())
    }

    pub fn without(&self, names: &[&str]) -> MethodSet {
        let mut out = self.clone();
        for name in names {
            out.ctors.shift_remove(*name);
        }
        out
    }

    pub fn init(
        &self,
        name: &str,
        target: Box<dyn Function>,
        args: Vec<Arg>,
    ) -> Result<Box<dyn Function>, EvalError> {
        let ctor = self
            .ctors
            .get(name)
            .ok_or_else(|| EvalError::UnrecognizedMethod(name.to_string()))?;
        ctor(target, args)
    }

    pub fn list(&self) -> Vec<&str> {
        self.ctors.keys().map(String::as_str).collect()
    }
}

/// The full built-in method set.
pub static ALL_METHODS: Lazy<MethodSet> = Lazy::new(|| {
    let mut set = MethodSet::new();
    let entries: &[(&str, MethodCtor)] = &[
        ("apply", apply_ctor),
        ("bytes", bytes_ctor),
        ("catch", catch_ctor),
        ("contains", contains_ctor),
        ("exists", exists_ctor),
        ("from", from_ctor),
        ("get", get_ctor),
        ("keys", keys_ctor),
        ("length", length_ctor),
        ("lowercase", lowercase_ctor),
        ("merge", merge_ctor),
        ("not", not_ctor),
        ("number", number_ctor),
        ("or", or_ctor),
        ("string", string_ctor),
        ("trim", trim_ctor),
        ("type", type_ctor),
        ("uppercase", uppercase_ctor),
        ("values", values_ctor),
        ("without", without_ctor),
    ];
    for (name, ctor) in entries {
        if let Err(err) = set.add(name, *ctor) {
            debug!(%err, "skipping built-in method");
        }
    }
    debug!(methods = set.ctors.len(), "initialized method registry");
    set
});

/// Construct a registered method from the global set.
pub fn init_method(
    name: &str,
    target: Box<dyn Function>,
    args: Vec<Arg>,
) -> Result<Box<dyn Function>, EvalError> {
    ALL_METHODS.init(name, target, args)
}

// ── Dispatch node ────────────────────────────────────────────────────────────

#[derive(Debug)]
enum MethodKind {
    Apply(String),
    Bytes,
    Catch(Box<dyn Function>),
    Contains(Box<dyn Function>),
    Exists(Vec<String>),
    From(usize),
    Get(Vec<String>),
    Keys,
    Length,
    Lowercase,
    Merge(Box<dyn Function>),
    Not,
    Number,
    Or(Box<dyn Function>),
    StringCast,
    Trim,
    TypeName,
    Uppercase,
    Values,
    Without(Vec<String>),
}

#[derive(Debug)]
struct MethodFunction {
    target: Box<dyn Function>,
    kind: MethodKind,
}

impl MethodFunction {
    fn boxed(target: Box<dyn Function>, kind: MethodKind) -> Box<dyn Function> {
        Box::new(MethodFunction { target, kind })
    }
}

impl Function for MethodFunction {
    fn exec(&self, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
        // Fallback methods inspect the receiver's outcome rather than
        // propagating it.
        match &self.kind {
            MethodKind::Catch(fallback) => {
                return match self.target.exec(ctx) {
                    Ok(v) => Ok(v),
                    Err(_) => fallback.exec(ctx),
                };
            }
            MethodKind::Or(fallback) => {
                return match self.target.exec(ctx) {
                    Ok(v) if !v.is_null() => Ok(v),
                    _ => fallback.exec(ctx),
                };
            }
            MethodKind::From(index) => {
                let sub = EvalContext {
                    index: *index,
                    ..*ctx
                };
                return self.target.exec(&sub);
            }
            _ => {}
        }

        let value = self.target.exec(ctx)?;
        match &self.kind {
            MethodKind::Apply(name) => {
                let map = ctx.maps.get(name).ok_or_else(|| {
                    EvalError::UserDefined(format!("map '{}' was not found", name))
                })?;
                map.exec(&ctx.with_value(&value))
            }
            MethodKind::Bytes => Ok(Value::Bytes(value.to_bytes())),
            MethodKind::Contains(arg) => {
                let needle = arg.exec(ctx)?;
                contains(&value, &needle)
            }
            MethodKind::Exists(path) => Ok(Value::Bool(value.query_path(path).is_some())),
            MethodKind::Get(path) => value
                .query_path(path)
                .cloned()
                .ok_or_else(|| EvalError::NotFound(path.join("."))),
            MethodKind::Keys => match value {
                Value::Object(map) => Ok(Value::Array(
                    map.keys().map(|k| Value::from(k.as_str())).collect(),
                )),
                other => Err(TypeError::expected_one(other.value_type(), ValueType::Object).into()),
            },
            MethodKind::Length => length(&value),
            MethodKind::Lowercase => Ok(Value::String(value.get_string()?.to_lowercase())),
            MethodKind::Merge(arg) => {
                let with = arg.exec(ctx)?;
                merge(&value, &with)
            }
            MethodKind::Not => Ok(Value::Bool(!value.get_bool()?)),
            MethodKind::Number => Ok(Value::Float(value.to_float()?)),
            MethodKind::StringCast => Ok(Value::String(value.to_string())),
            MethodKind::Trim => Ok(Value::String(value.get_string()?.trim().to_string())),
            MethodKind::TypeName => Ok(Value::String(value.value_type().to_string())),
            MethodKind::Uppercase => Ok(Value::String(value.get_string()?.to_uppercase())),
            MethodKind::Values => match value {
                Value::Object(map) => Ok(Value::Array(map.into_iter().map(|(_, v)| v).collect())),
                other => Err(TypeError::expected_one(other.value_type(), ValueType::Object).into()),
            },
            MethodKind::Without(keys) => match value {
                Value::Object(mut map) => {
                    for key in keys {
                        map.shift_remove(key.as_str());
                    }
                    Ok(Value::Object(map))
                }
                other => Err(TypeError::expected_one(other.value_type(), ValueType::Object).into()),
            },
            // Handled before the receiver is evaluated.
            MethodKind::Catch(_) | MethodKind::Or(_) | MethodKind::From(_) => {
                Err(EvalError::UserDefined("unreachable method dispatch".to_string()))
            }
        }
    }

    fn query_targets(&self, ctx: &TargetsContext<'_>) -> Vec<TargetPath> {
        let mut targets = self.target.query_targets(ctx);
        match &self.kind {
            MethodKind::Apply(name) => {
                if let Some(map) = ctx.maps.get(name) {
                    targets.extend(map.query_targets(ctx));
                }
            }
            MethodKind::Catch(f)
            | MethodKind::Or(f)
            | MethodKind::Merge(f)
            | MethodKind::Contains(f) => {
                targets.extend(f.query_targets(ctx));
            }
            _ => {}
        }
        targets
    }
}

// ── Shared semantics ─────────────────────────────────────────────────────────

fn length(value: &Value) -> Result<Value, EvalError> {
    let len = match value {
        Value::String(s) => s.chars().count(),
        Value::Bytes(b) => b.len(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => {
            return Err(TypeError::new(
                other.value_type(),
                vec![ValueType::String, ValueType::Array, ValueType::Object],
            )
            .into())
        }
    };
    Ok(Value::Int(len as i64))
}

fn contains(value: &Value, needle: &Value) -> Result<Value, EvalError> {
    match value {
        Value::String(_) | Value::Bytes(_) => {
            let haystack = value.get_string()?;
            let sub = needle.get_string()?;
            Ok(Value::Bool(haystack.contains(&sub)))
        }
        Value::Array(items) => Ok(Value::Bool(items.iter().any(|v| v == needle))),
        Value::Object(map) => Ok(Value::Bool(map.values().any(|v| v == needle))),
        other => Err(TypeError::new(
            other.value_type(),
            vec![ValueType::String, ValueType::Array, ValueType::Object],
        )
        .into()),
    }
}

// Additive combination; neither input is mutated. Colliding object keys take
// the right-hand value.
fn merge(left: &Value, right: &Value) -> Result<Value, EvalError> {
    match (left, right) {
        (Value::Array(l), Value::Array(r)) => {
            let mut out = l.clone();
            out.extend(r.iter().cloned());
            Ok(Value::Array(out))
        }
        (Value::Array(l), other) => {
            let mut out = l.clone();
            out.push(other.clone());
            Ok(Value::Array(out))
        }
        (Value::Object(l), Value::Object(r)) => {
            let mut out: Object = l.clone();
            for (k, v) in r {
                out.insert(k.clone(), v.clone());
            }
            Ok(Value::Object(out))
        }
        (Value::Object(_), other) => {
            Err(TypeError::expected_one(other.value_type(), ValueType::Object).into())
        }
        (other, _) => Err(TypeError::new(
            other.value_type(),
            vec![ValueType::Object, ValueType::Array],
        )
        .into()),
    }
}

// ── Constructors ─────────────────────────────────────────────────────────────

fn single_string_arg(args: Vec<Arg>) -> Result<String, EvalError> {
    expect_args(&args, 1)?;
    let values = literal_args(args)?;
    values[0].get_string().map_err(|cause| EvalError::BadArgument {
        index: 0,
        cause,
    })
}

fn apply_ctor(target: Box<dyn Function>, args: Vec<Arg>) -> Result<Box<dyn Function>, EvalError> {
    let name = single_string_arg(args)?;
    Ok(MethodFunction::boxed(target, MethodKind::Apply(name)))
}

fn catch_ctor(target: Box<dyn Function>, args: Vec<Arg>) -> Result<Box<dyn Function>, EvalError> {
    expect_args(&args, 1)?;
    let mut args = args;
    let fallback = args.remove(0).into_function();
    Ok(MethodFunction::boxed(target, MethodKind::Catch(fallback)))
}

fn or_ctor(target: Box<dyn Function>, args: Vec<Arg>) -> Result<Box<dyn Function>, EvalError> {
    expect_args(&args, 1)?;
    let mut args = args;
    let fallback = args.remove(0).into_function();
    Ok(MethodFunction::boxed(target, MethodKind::Or(fallback)))
}

fn merge_ctor(target: Box<dyn Function>, args: Vec<Arg>) -> Result<Box<dyn Function>, EvalError> {
    expect_args(&args, 1)?;
    let mut args = args;
    let with = args.remove(0).into_function();
    Ok(MethodFunction::boxed(target, MethodKind::Merge(with)))
}

fn contains_ctor(
    target: Box<dyn Function>,
    args: Vec<Arg>,
) -> Result<Box<dyn Function>, EvalError> {
    expect_args(&args, 1)?;
    let mut args = args;
    let needle = args.remove(0).into_function();
    Ok(MethodFunction::boxed(target, MethodKind::Contains(needle)))
}

fn exists_ctor(target: Box<dyn Function>, args: Vec<Arg>) -> Result<Box<dyn Function>, EvalError> {
    let path = single_string_arg(args)?;
    Ok(MethodFunction::boxed(
        target,
        MethodKind::Exists(split_path(&path)),
    ))
}

fn get_ctor(target: Box<dyn Function>, args: Vec<Arg>) -> Result<Box<dyn Function>, EvalError> {
    let path = single_string_arg(args)?;
    Ok(MethodFunction::boxed(
        target,
        MethodKind::Get(split_path(&path)),
    ))
}

fn from_ctor(target: Box<dyn Function>, args: Vec<Arg>) -> Result<Box<dyn Function>, EvalError> {
    expect_args(&args, 1)?;
    let values = literal_args(args)?;
    let index = values[0].get_int().map_err(|cause| EvalError::BadArgument {
        index: 0,
        cause,
    })?;
    Ok(MethodFunction::boxed(
        target,
        MethodKind::From(index.max(0) as usize),
    ))
}

fn without_ctor(target: Box<dyn Function>, args: Vec<Arg>) -> Result<Box<dyn Function>, EvalError> {
    if args.is_empty() {
        return Err(EvalError::WrongArity {
            expected: 1,
            actual: 0,
        });
    }
    let values = literal_args(args)?;
    let keys = values
        .iter()
        .enumerate()
        .map(|(index, v)| {
            v.get_string()
                .map_err(|cause| EvalError::BadArgument { index, cause })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(MethodFunction::boxed(target, MethodKind::Without(keys)))
}

macro_rules! nullary_method_ctor {
    ($name:ident, $kind:expr) => {
        fn $name(
            target: Box<dyn Function>,
            args: Vec<Arg>,
        ) -> Result<Box<dyn Function>, EvalError> {
            expect_args(&args, 0)?;
            Ok(MethodFunction::boxed(target, $kind))
        }
    };
}

nullary_method_ctor!(bytes_ctor, MethodKind::Bytes);
nullary_method_ctor!(keys_ctor, MethodKind::Keys);
nullary_method_ctor!(length_ctor, MethodKind::Length);
nullary_method_ctor!(lowercase_ctor, MethodKind::Lowercase);
nullary_method_ctor!(not_ctor, MethodKind::Not);
nullary_method_ctor!(number_ctor, MethodKind::Number);
nullary_method_ctor!(string_ctor, MethodKind::StringCast);
nullary_method_ctor!(trim_ctor, MethodKind::Trim);
nullary_method_ctor!(type_ctor, MethodKind::TypeName);
nullary_method_ctor!(uppercase_ctor, MethodKind::Uppercase);
nullary_method_ctor!(values_ctor, MethodKind::Values);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{NamedMaps, Variables};
    use crate::message::{MessageBatch, Part};
    use serde_json::json;

    fn exec_method(
        name: &str,
        target: Value,
        args: Vec<Arg>,
    ) -> Result<Value, EvalError> {
        let method = init_method(name, Box::new(Literal::new(target)), args)?;
        let batch = MessageBatch::new();
        let vars = Variables::new();
        let maps = NamedMaps::new();
        let ctx = EvalContext {
            batch: &batch,
            index: 0,
            vars: &vars,
            maps: &maps,
            value: None,
        };
        method.exec(&ctx)
    }

    #[test]
    fn test_merge_arrays() {
        let res = exec_method(
            "merge",
            Value::from(json!(["foo", "bar"])),
            vec![Arg::Value(Value::from(json!(["baz", "buz"])))],
        )
        .unwrap();
        assert_eq!(res, Value::from(json!(["foo", "bar", "baz", "buz"])));
    }

    #[test]
    fn test_merge_object_into_array() {
        let res = exec_method(
            "merge",
            Value::from(json!(["foo", "bar"])),
            vec![Arg::Value(Value::from(json!({"baz": "buz"})))],
        )
        .unwrap();
        assert_eq!(res, Value::from(json!(["foo", "bar", {"baz": "buz"}])));
    }

    #[test]
    fn test_merge_objects_right_biased() {
        let res = exec_method(
            "merge",
            Value::from(json!({"foo": "bar", "shared": 1})),
            vec![Arg::Value(Value::from(json!({"baz": "buz", "shared": 2})))],
        )
        .unwrap();
        assert_eq!(
            res,
            Value::from(json!({"foo": "bar", "shared": 2, "baz": "buz"}))
        );
    }

    #[test]
    fn test_merge_does_not_mutate_inputs() {
        let target = Value::from(json!({"foo": "bar"}));
        let with = Value::from(json!({"baz": "buz"}));
        let target_clone = target.clone();
        let with_clone = with.clone();

        let res = exec_method("merge", target.clone(), vec![Arg::Value(with.clone())]).unwrap();
        assert_eq!(res, Value::from(json!({"foo": "bar", "baz": "buz"})));
        assert_eq!(target, target_clone);
        assert_eq!(with, with_clone);
    }

    #[test]
    fn test_casts() {
        assert_eq!(
            exec_method("string", Value::Int(5), vec![]).unwrap(),
            Value::from("5")
        );
        assert_eq!(
            exec_method("number", Value::from("5.5"), vec![]).unwrap(),
            Value::Float(5.5)
        );
        assert_eq!(
            exec_method("bytes", Value::from("abc"), vec![]).unwrap(),
            Value::Bytes(b"abc".to_vec())
        );
        assert_eq!(
            exec_method("not", Value::Bool(false), vec![]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            exec_method("type", Value::from(json!([])), vec![]).unwrap(),
            Value::from("array")
        );
    }

    #[test]
    fn test_string_methods() {
        assert_eq!(
            exec_method("uppercase", Value::from("abc"), vec![]).unwrap(),
            Value::from("ABC")
        );
        assert_eq!(
            exec_method("lowercase", Value::from("ABC"), vec![]).unwrap(),
            Value::from("abc")
        );
        assert_eq!(
            exec_method("trim", Value::from("  x  "), vec![]).unwrap(),
            Value::from("x")
        );
        let err = exec_method("uppercase", Value::Int(5), vec![]).unwrap_err();
        assert_eq!(err.to_string(), "expected string value, found number");
    }

    #[test]
    fn test_structured_methods() {
        let obj = Value::from(json!({"a": 1, "b": 2}));
        assert_eq!(
            exec_method("keys", obj.clone(), vec![]).unwrap(),
            Value::from(json!(["a", "b"]))
        );
        assert_eq!(
            exec_method("values", obj.clone(), vec![]).unwrap(),
            Value::from(json!([1, 2]))
        );
        assert_eq!(
            exec_method("length", obj.clone(), vec![]).unwrap(),
            Value::Int(2)
        );
        assert_eq!(
            exec_method("without", obj.clone(), vec![Arg::Value(Value::from("a"))]).unwrap(),
            Value::from(json!({"b": 2}))
        );
        assert_eq!(
            exec_method("get", obj.clone(), vec![Arg::Value(Value::from("b"))]).unwrap(),
            Value::Int(2)
        );
        assert_eq!(
            exec_method("exists", obj.clone(), vec![Arg::Value(Value::from("a"))]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            exec_method("exists", obj, vec![Arg::Value(Value::from("z"))]).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_contains() {
        assert_eq!(
            exec_method(
                "contains",
                Value::from("hello world"),
                vec![Arg::Value(Value::from("world"))]
            )
            .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            exec_method(
                "contains",
                Value::from(json!([1, 2, 3])),
                vec![Arg::Value(Value::Int(2))]
            )
            .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            exec_method(
                "contains",
                Value::from(json!({"a": "x"})),
                vec![Arg::Value(Value::from("y"))]
            )
            .unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_catch_and_or() {
        // catch recovers from a failing receiver.
        let failing = crate::function::ClosureFunction::boxed(
            |_| Err(EvalError::UserDefined("boom".to_string())),
            Vec::new(),
        );
        let method = init_method(
            "catch",
            failing,
            vec![Arg::Value(Value::from("fallback"))],
        )
        .unwrap();
        let batch = MessageBatch::new();
        let vars = Variables::new();
        let maps = NamedMaps::new();
        let ctx = EvalContext {
            batch: &batch,
            index: 0,
            vars: &vars,
            maps: &maps,
            value: None,
        };
        assert_eq!(method.exec(&ctx).unwrap(), Value::from("fallback"));

        // or falls back on null-ish values as well as errors.
        assert_eq!(
            exec_method("or", Value::Null, vec![Arg::Value(Value::from("fb"))]).unwrap(),
            Value::from("fb")
        );
        assert_eq!(
            exec_method("or", Value::from("kept"), vec![Arg::Value(Value::from("fb"))]).unwrap(),
            Value::from("kept")
        );
    }

    #[test]
    fn test_apply_named_map() {
        let mut maps = NamedMaps::new();
        maps.insert(
            "embiggen".to_string(),
            crate::function::FieldFunction::boxed("inner"),
        );

        let method = init_method(
            "apply",
            Box::new(Literal::new(Value::from(json!({"inner": "found"})))),
            vec![Arg::Value(Value::from("embiggen"))],
        )
        .unwrap();

        let batch = MessageBatch::new();
        let vars = Variables::new();
        let ctx = EvalContext {
            batch: &batch,
            index: 0,
            vars: &vars,
            maps: &maps,
            value: None,
        };
        assert_eq!(method.exec(&ctx).unwrap(), Value::from("found"));

        let missing = init_method(
            "apply",
            Box::new(Literal::new(Value::Null)),
            vec![Arg::Value(Value::from("nope"))],
        )
        .unwrap();
        assert_eq!(
            missing.exec(&ctx).unwrap_err().to_string(),
            "map 'nope' was not found"
        );
    }

    #[test]
    fn test_from_other_part() {
        let mut part_b = Part::new(r#"{"foo":"second"}"#);
        part_b.meta_set("k", "v");
        let batch = MessageBatch::from(vec![Part::new(r#"{"foo":"first"}"#), part_b]);
        let vars = Variables::new();
        let maps = NamedMaps::new();
        let ctx = EvalContext {
            batch: &batch,
            index: 0,
            vars: &vars,
            maps: &maps,
            value: None,
        };

        let method = init_method(
            "from",
            crate::function::FieldFunction::boxed("foo"),
            vec![Arg::Value(Value::Int(1))],
        )
        .unwrap();
        assert_eq!(method.exec(&ctx).unwrap(), Value::from("second"));
    }

    #[test]
    fn test_unrecognised_method() {
        let err = init_method("nope", Box::new(Literal::new(Value::Null)), vec![]).unwrap_err();
        assert_eq!(err.to_string(), "unrecognised method 'nope'");
    }

    #[test]
    fn test_method_set_without() {
        let reduced = ALL_METHODS.without(&["merge"]);
        assert!(!reduced.list().contains(&"merge"));
        assert!(reduced.list().contains(&"catch"));
    }
}
