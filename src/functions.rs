// Named functions: the table-driven registry and the built-in set.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::args::ArgSpec;
use crate::function::{
    split_path, ClosureFunction, EvalError, FieldFunction, Function, Literal, TargetPath,
};
use crate::value::{format_timestamp, Object, Value};

/// Function and method names follow the same shape: lowercase snake case.
pub static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-z0-9]+(_[a-z0-9]+)*$").expect("static pattern compiles"));

/// Registration failures. The registries are assembled once at startup, so
/// these surface immediately during initialization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("function name '{0}' does not match the required regular expression /^[a-z0-9]+(_[a-z0-9]+)*$/")]
    BadFunctionName(String),

    #[error("method name '{0}' does not match the required regular expression /^[a-z0-9]+(_[a-z0-9]+)*$/")]
    BadMethodName(String),
}

/// Functions declared non-deterministic: mappings containing them are not
/// pure functions of their input.
pub const NON_DETERMINISTIC_FUNCTIONS: &[&str] = &[
    "count",
    "hostname",
    "now",
    "random_int",
    "timestamp_unix",
    "timestamp_unix_nano",
    "uuid_v4",
];

type FunctionCtor = fn(Vec<Value>) -> Result<Box<dyn Function>, EvalError>;

/// An immutable registry of named function constructors.
///
/// The global registry is assembled once at process start; reduced views are
/// produced with [`FunctionSet::without`] rather than by mutation.
#[derive(Clone, Default)]
pub struct FunctionSet {
    ctors: IndexMap<String, FunctionCtor>,
}

impl FunctionSet {
    pub fn new() -> Self {
        FunctionSet {
            ctors: IndexMap::new(),
        }
    }

    /// Register a constructor under a validated name.
    pub fn add(&mut self, name: &str, ctor: FunctionCtor) -> Result<(), RegistryError> {
        if !NAME_PATTERN.is_match(name) {
            return Err(RegistryError::BadFunctionName(name.to_string()));
        }
        self.ctors.insert(name.to_string(), ctor);
        Ok(())
    }

    /// A copy of this set with the given names removed.
    pub fn without(&self, names: &[&str]) -> FunctionSet {
        let mut out = self.clone();
        for name in names {
            out.ctors.shift_remove(*name);
        }
        out
    }

    /// Construct the named function with the given arguments.
    pub fn init(&self, name: &str, args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
        let ctor = self
            .ctors
            .get(name)
            .ok_or_else(|| EvalError::UnrecognizedFunction(name.to_string()))?;
        ctor(args)
    }

    pub fn list(&self) -> Vec<&str> {
        self.ctors.keys().map(String::as_str).collect()
    }
}

/// The full built-in function set.
pub static ALL_FUNCTIONS: Lazy<FunctionSet> = Lazy::new(|| {
    let mut set = FunctionSet::new();
    let entries: &[(&str, FunctionCtor)] = &[
        ("batch_size", batch_size_ctor),
        ("content", content_ctor),
        ("count", count_ctor),
        ("deleted", deleted_ctor),
        ("env", env_ctor),
        ("hostname", hostname_ctor),
        ("json", json_ctor),
        ("meta", meta_ctor),
        ("nothing", nothing_ctor),
        ("now", now_ctor),
        ("random_int", random_int_ctor),
        ("root", root_ctor),
        ("this", this_ctor),
        ("timestamp_unix", timestamp_unix_ctor),
        ("timestamp_unix_nano", timestamp_unix_nano_ctor),
        ("uuid_v4", uuid_v4_ctor),
        ("var", var_ctor),
    ];
    for (name, ctor) in entries {
        if let Err(err) = set.add(name, *ctor) {
            // Built-in names are static and validated by tests.
            debug!(%err, "skipping built-in function");
        }
    }
    debug!(functions = set.ctors.len(), "initialized function registry");
    set
});

/// Construct a registered function from the global set.
pub fn init_function(name: &str, args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
    ALL_FUNCTIONS.init(name, args)
}

// ── Built-in constructors ────────────────────────────────────────────────────

// Either no argument (the root target) or a single string argument.
fn optional_string_arg(args: Vec<Value>) -> Result<Option<String>, EvalError> {
    if args.is_empty() {
        return Ok(None);
    }
    let mut extracted = ArgSpec::new().string().extract(&args)?;
    Ok(Some(extracted.remove(0).get_string()?))
}

fn meta_ctor(args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
    match optional_string_arg(args)? {
        Some(key) => {
            let targets = vec![TargetPath::metadata(vec![key.clone()])];
            Ok(ClosureFunction::boxed(
                move |ctx| {
                    let part = ctx.part()?;
                    part.meta_get(&key)
                        .map(Value::from)
                        .ok_or_else(|| EvalError::MetadataNotFound(key.clone()))
                },
                targets,
            ))
        }
        None => Ok(ClosureFunction::boxed(
            |ctx| {
                let part = ctx.part()?;
                let obj: Object = part
                    .metadata()
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                    .collect();
                Ok(Value::Object(obj))
            },
            vec![TargetPath::metadata(Vec::new())],
        )),
    }
}

fn json_ctor(args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
    let path = match optional_string_arg(args)? {
        Some(p) => split_path(&p),
        None => Vec::new(),
    };
    let targets = vec![TargetPath::value(path.clone())];
    Ok(ClosureFunction::boxed(
        move |ctx| {
            let part = ctx.part()?;
            let doc = part.structured().map_err(EvalError::from)?;
            doc.query_path(&path)
                .cloned()
                .ok_or_else(|| EvalError::NotFound(path.join(".")))
        },
        targets,
    ))
}

fn var_ctor(args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
    let mut extracted = ArgSpec::new().string().extract(&args)?;
    let name = extracted.remove(0).get_string()?;
    Ok(crate::function::VarFunction::boxed(name))
}

fn this_ctor(args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
    let path = optional_string_arg(args)?.unwrap_or_default();
    Ok(Box::new(FieldFunction::parse(&path)))
}

// In query position the mapped document is not yet materialized, so `root`
// reads the same context binding as `this`.
fn root_ctor(args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
    this_ctor(args)
}

fn content_ctor(args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
    ArgSpec::new().extract(&args)?;
    Ok(ClosureFunction::boxed(
        |ctx| Ok(Value::Bytes(ctx.part()?.bytes().to_vec())),
        vec![TargetPath::value(Vec::new())],
    ))
}

fn batch_size_ctor(args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
    ArgSpec::new().extract(&args)?;
    Ok(ClosureFunction::boxed(
        |ctx| Ok(Value::Int(ctx.batch.len() as i64)),
        Vec::new(),
    ))
}

fn deleted_ctor(args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
    ArgSpec::new().extract(&args)?;
    Ok(Literal::boxed(Value::Delete))
}

fn nothing_ctor(args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
    ArgSpec::new().extract(&args)?;
    Ok(Literal::boxed(Value::Nothing))
}

fn env_ctor(args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
    let mut extracted = ArgSpec::new().string().extract(&args)?;
    let name = extracted.remove(0).get_string()?;
    Ok(ClosureFunction::boxed(
        move |_| Ok(Value::String(std::env::var(&name).unwrap_or_default())),
        Vec::new(),
    ))
}

fn hostname_ctor(args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
    ArgSpec::new().extract(&args)?;
    Ok(ClosureFunction::boxed(
        |_| {
            hostname::get()
                .map(|h| Value::String(h.to_string_lossy().into_owned()))
                .map_err(|e| EvalError::UserDefined(format!("failed to get hostname: {}", e)))
        },
        Vec::new(),
    ))
}

// Named counters shared across every mapping in the process.
static COUNTERS: Lazy<Mutex<HashMap<String, i64>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn count_ctor(args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
    let mut extracted = ArgSpec::new().string().extract(&args)?;
    let name = extracted.remove(0).get_string()?;
    Ok(ClosureFunction::boxed(
        move |_| {
            let mut counters = COUNTERS
                .lock()
                .map_err(|_| EvalError::UserDefined("counter lock poisoned".to_string()))?;
            let counter = counters.entry(name.clone()).or_insert(0);
            *counter += 1;
            Ok(Value::Int(*counter))
        },
        Vec::new(),
    ))
}

fn now_ctor(args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
    ArgSpec::new().extract(&args)?;
    Ok(ClosureFunction::boxed(
        |_| Ok(Value::String(format_timestamp(Utc::now()))),
        Vec::new(),
    ))
}

fn timestamp_unix_ctor(args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
    ArgSpec::new().extract(&args)?;
    Ok(ClosureFunction::boxed(
        |_| Ok(Value::Int(Utc::now().timestamp())),
        Vec::new(),
    ))
}

fn timestamp_unix_nano_ctor(args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
    ArgSpec::new().extract(&args)?;
    Ok(ClosureFunction::boxed(
        |_| {
            let now = Utc::now();
            let nanos = now
                .timestamp()
                .saturating_mul(1_000_000_000)
                .saturating_add(i64::from(now.timestamp_subsec_nanos()));
            Ok(Value::Int(nanos))
        },
        Vec::new(),
    ))
}

fn uuid_v4_ctor(args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
    ArgSpec::new().extract(&args)?;
    Ok(ClosureFunction::boxed(
        |_| Ok(Value::String(uuid::Uuid::new_v4().to_string())),
        Vec::new(),
    ))
}

fn random_int_ctor(args: Vec<Value>) -> Result<Box<dyn Function>, EvalError> {
    ArgSpec::new().extract(&args)?;
    Ok(ClosureFunction::boxed(
        |_| Ok(Value::Int(rand::thread_rng().gen_range(0..i64::MAX))),
        Vec::new(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{EvalContext, NamedMaps, TargetsContext, Variables};
    use crate::message::{MessageBatch, Part};
    use serde_json::json;

    fn ctx_for<'a>(
        batch: &'a MessageBatch,
        vars: &'a Variables,
        maps: &'a NamedMaps,
    ) -> EvalContext<'a> {
        EvalContext {
            batch,
            index: 0,
            vars,
            maps,
            value: None,
        }
    }

    #[test]
    fn test_without() {
        let set_one = ALL_FUNCTIONS.clone();
        let set_two = set_one.without(&["uuid_v4"]);

        assert!(set_one.list().contains(&"uuid_v4"));
        assert!(!set_two.list().contains(&"uuid_v4"));

        assert!(set_one.init("uuid_v4", vec![]).is_ok());
        assert_eq!(
            set_two.init("uuid_v4", vec![]).unwrap_err().to_string(),
            "unrecognised function 'uuid_v4'"
        );
        assert!(set_two.init("timestamp_unix", vec![]).is_ok());
    }

    #[test]
    fn test_bad_names() {
        let cases = [
            ("!no", false),
            ("foo__bar", false),
            ("-foo-bar", false),
            ("foo-bar-", false),
            ("", false),
            ("foo-bar", false),
            ("FOO", false),
            ("foobarbaz", true),
            ("foobarbaz89", true),
            ("foo_bar_baz", true),
            ("fo1_ba2_ba3", true),
        ];
        for (name, ok) in cases {
            let mut set = FunctionSet::new();
            let res = set.add(name, deleted_ctor);
            if ok {
                assert!(res.is_ok(), "name {:?} should register", name);
            } else {
                assert_eq!(
                    res.unwrap_err().to_string(),
                    format!(
                        "function name '{}' does not match the required regular expression /^[a-z0-9]+(_[a-z0-9]+)*$/",
                        name
                    )
                );
            }
        }
    }

    #[test]
    fn test_meta() {
        let mut part = Part::new("{}");
        part.meta_set("foo", "bar");
        let batch = MessageBatch::from(vec![part]);
        let vars = Variables::new();
        let maps = NamedMaps::new();
        let ctx = ctx_for(&batch, &vars, &maps);

        let f = init_function("meta", vec![Value::from("foo")]).unwrap();
        assert_eq!(f.exec(&ctx).unwrap(), Value::from("bar"));

        let f = init_function("meta", vec![Value::from("nope")]).unwrap();
        assert_eq!(
            f.exec(&ctx).unwrap_err().to_string(),
            "metadata value 'nope' not found"
        );

        // Root form returns the whole metadata object.
        let f = init_function("meta", vec![]).unwrap();
        assert_eq!(f.exec(&ctx).unwrap(), Value::from(json!({"foo": "bar"})));

        // Target analysis reports the metadata key.
        let f = init_function("meta", vec![Value::from("foo")]).unwrap();
        assert_eq!(
            f.query_targets(&TargetsContext { maps: &maps }),
            vec![TargetPath::metadata(vec!["foo".to_string()])]
        );
    }

    #[test]
    fn test_json() {
        let batch = MessageBatch::from(vec![Part::new(r#"{"foo":{"bar":5}}"#)]);
        let vars = Variables::new();
        let maps = NamedMaps::new();
        let ctx = ctx_for(&batch, &vars, &maps);

        let f = init_function("json", vec![Value::from("foo.bar")]).unwrap();
        assert_eq!(f.exec(&ctx).unwrap(), Value::Int(5));

        let f = init_function("json", vec![]).unwrap();
        assert_eq!(f.exec(&ctx).unwrap(), Value::from(json!({"foo": {"bar": 5}})));

        let f = init_function("json", vec![Value::from("nope")]).unwrap();
        assert!(matches!(f.exec(&ctx).unwrap_err(), EvalError::NotFound(_)));
    }

    #[test]
    fn test_json_error_modes() {
        let vars = Variables::new();
        let maps = NamedMaps::new();

        let batch = MessageBatch::from(vec![Part::new("")]);
        let ctx = ctx_for(&batch, &vars, &maps);
        let f = init_function("json", vec![]).unwrap();
        assert_eq!(f.exec(&ctx).unwrap_err(), EvalError::MessageEmpty);

        let batch = MessageBatch::from(vec![Part::new("nope")]);
        let ctx = ctx_for(&batch, &vars, &maps);
        assert!(matches!(f.exec(&ctx).unwrap_err(), EvalError::JsonParse(_)));

        // No part in context at all.
        let batch = MessageBatch::new();
        let ctx = ctx_for(&batch, &vars, &maps);
        assert_eq!(f.exec(&ctx).unwrap_err(), EvalError::PartMissing);
    }

    #[test]
    fn test_content_and_batch_size() {
        let batch = MessageBatch::from(vec![Part::new("raw bytes"), Part::new("second")]);
        let vars = Variables::new();
        let maps = NamedMaps::new();
        let ctx = ctx_for(&batch, &vars, &maps);

        let f = init_function("content", vec![]).unwrap();
        assert_eq!(f.exec(&ctx).unwrap(), Value::Bytes(b"raw bytes".to_vec()));

        let f = init_function("batch_size", vec![]).unwrap();
        assert_eq!(f.exec(&ctx).unwrap(), Value::Int(2));
    }

    #[test]
    fn test_sentinel_functions() {
        let batch = MessageBatch::new();
        let vars = Variables::new();
        let maps = NamedMaps::new();
        let ctx = ctx_for(&batch, &vars, &maps);

        let f = init_function("deleted", vec![]).unwrap();
        assert_eq!(f.exec(&ctx).unwrap(), Value::Delete);

        let f = init_function("nothing", vec![]).unwrap();
        assert_eq!(f.exec(&ctx).unwrap(), Value::Nothing);
    }

    #[test]
    fn test_count_increments() {
        let batch = MessageBatch::new();
        let vars = Variables::new();
        let maps = NamedMaps::new();
        let ctx = ctx_for(&batch, &vars, &maps);

        let f = init_function("count", vec![Value::from("test_count_increments")]).unwrap();
        let first = f.exec(&ctx).unwrap().get_int().unwrap();
        let second = f.exec(&ctx).unwrap().get_int().unwrap();
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_uuid_v4_shape() {
        let batch = MessageBatch::new();
        let vars = Variables::new();
        let maps = NamedMaps::new();
        let ctx = ctx_for(&batch, &vars, &maps);

        let f = init_function("uuid_v4", vec![]).unwrap();
        let a = f.exec(&ctx).unwrap().get_string().unwrap();
        let b = f.exec(&ctx).unwrap().get_string().unwrap();
        assert_eq!(a.len(), 36);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_arity() {
        let err = init_function("uuid_v4", vec![Value::Int(1)]).unwrap_err();
        assert_eq!(err.to_string(), "expected 0 arguments, received 1");

        let err = init_function("var", vec![]).unwrap_err();
        assert_eq!(err.to_string(), "expected 1 arguments, received 0");
    }

    #[test]
    fn test_env() {
        std::env::set_var("BLOBLANG_TEST_ENV_VAR", "hello");
        let batch = MessageBatch::new();
        let vars = Variables::new();
        let maps = NamedMaps::new();
        let ctx = ctx_for(&batch, &vars, &maps);

        let f = init_function("env", vec![Value::from("BLOBLANG_TEST_ENV_VAR")]).unwrap();
        assert_eq!(f.exec(&ctx).unwrap(), Value::from("hello"));

        let f = init_function("env", vec![Value::from("BLOBLANG_TEST_ENV_UNSET")]).unwrap();
        assert_eq!(f.exec(&ctx).unwrap(), Value::from(""));
    }
}
