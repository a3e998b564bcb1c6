//! Built-in functions available in every evaluation environment.
//!
//! The set here is deliberately narrow: attribute/list primitives the
//! language itself can't express, string/numeric coercions, and the
//! `derivation` primitive that bridges the evaluator to `kiln-derive`.
//! General-purpose helpers (`map`, `filter`, string manipulation) are
//! expected to be written in the language itself against these primitives,
//! the way Nix's standard library is layered over `builtins`.

use std::collections::BTreeMap;
use std::rc::Rc;

use kiln_derive::{Derivation, Output};

use crate::env::Env;
use crate::eval::{EvalError, Evaluator};
use crate::thunk::Thunk;
use crate::value::{AttrSet, Builtin, KString, Value};

/// Install every builtin into a fresh root environment and return it.
pub fn root_env() -> Env {
    let env = Env::root();
    for (name, value) in builtins() {
        env.bind(name, Thunk::evaluated(value));
    }
    env
}

fn builtin(name: &'static str, arity: usize, func: crate::value::BuiltinFn) -> Value {
    Value::Builtin(Rc::new(Builtin { name, arity, func }))
}

pub fn builtins() -> Vec<(&'static str, Value)> {
    vec![
        ("derivation", builtin("derivation", 1, builtin_derivation)),
        ("toString", builtin("toString", 1, builtin_to_string)),
        ("throw", builtin("throw", 1, builtin_throw)),
        ("abort", builtin("abort", 1, builtin_abort)),
        ("length", builtin("length", 1, builtin_length)),
        ("head", builtin("head", 1, builtin_head)),
        ("tail", builtin("tail", 1, builtin_tail)),
        ("elemAt", builtin("elemAt", 2, builtin_elem_at)),
        ("attrNames", builtin("attrNames", 1, builtin_attr_names)),
        ("attrValues", builtin("attrValues", 1, builtin_attr_values)),
        ("hasAttr", builtin("hasAttr", 2, builtin_has_attr)),
        ("getAttr", builtin("getAttr", 2, builtin_get_attr)),
        ("map", builtin("map", 2, builtin_map)),
        ("filter", builtin("filter", 2, builtin_filter)),
        ("concatStringsSep", builtin("concatStringsSep", 2, builtin_concat_strings_sep)),
        ("compare", builtin("compare", 2, builtin_compare)),
        ("isAttrs", builtin("isAttrs", 1, builtin_is_attrs)),
        ("isList", builtin("isList", 1, builtin_is_list)),
        ("isString", builtin("isString", 1, builtin_is_string)),
        ("isInt", builtin("isInt", 1, builtin_is_int)),
        ("isBool", builtin("isBool", 1, builtin_is_bool)),
        ("isFunction", builtin("isFunction", 1, builtin_is_function)),
        ("isNull", builtin("isNull", 1, builtin_is_null)),
    ]
}

fn builtin_is_attrs(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    Ok(Value::Bool(matches!(args[0].force(ev)?, Value::Attrs(_))))
}

fn builtin_is_list(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    Ok(Value::Bool(matches!(args[0].force(ev)?, Value::List(_))))
}

fn builtin_is_string(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    Ok(Value::Bool(matches!(args[0].force(ev)?, Value::Str(_))))
}

fn builtin_is_int(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    Ok(Value::Bool(matches!(args[0].force(ev)?, Value::Int(_))))
}

fn builtin_is_bool(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    Ok(Value::Bool(matches!(args[0].force(ev)?, Value::Bool(_))))
}

fn builtin_is_function(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    Ok(Value::Bool(matches!(
        args[0].force(ev)?,
        Value::Lambda(_) | Value::Builtin(_) | Value::PartialBuiltin(_, _)
    )))
}

fn builtin_is_null(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    Ok(Value::Bool(matches!(args[0].force(ev)?, Value::Null)))
}

fn builtin_derivation(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    let attrs = match args[0].force(ev)? {
        Value::Attrs(a) => a,
        other => {
            return Err(EvalError::TypeError {
                expected: "set",
                got: other.type_name(),
            });
        }
    };

    let name = require_string_attr(ev, &attrs, "name")?;
    let system = require_string_attr(ev, &attrs, "system")?;
    let builder = require_string_attr(ev, &attrs, "builder")?;

    let mut env_vars = BTreeMap::new();
    let mut args_list = Vec::new();
    let mut input_srcs = Vec::new();

    for (sym, thunk) in attrs.iter() {
        let attr_name = ev.interner.get(*sym).to_string();
        match attr_name.as_str() {
            "name" | "system" | "builder" => continue,
            "args" => {
                let Value::List(items) = thunk.force(ev)? else {
                    return Err(EvalError::TypeError {
                        expected: "list",
                        got: "non-list `args`",
                    });
                };
                for item in items.iter() {
                    let v = item.force(ev)?;
                    args_list.push(ev.coerce_to_string(&v)?.text.to_string());
                }
            }
            _ => {
                let v = thunk.force(ev)?;
                let s = ev.coerce_to_string(&v)?;
                for path in s.context.iter() {
                    input_srcs.push(path.clone());
                }
                env_vars.insert(attr_name, s.text.to_string());
            }
        }
    }

    let mut builder_drv = Derivation::builder(name.clone(), "0")
        .system(system)
        .builder_path(builder)
        .args(args_list)
        .envs(env_vars)
        .output(Output::new("out"));

    for src in input_srcs {
        if let Some(path) = kiln_derive::StorePath::parse_name(
            std::path::Path::new(&src)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(&src),
        ) {
            builder_drv = builder_drv.input_src(path);
        }
    }

    let drv = builder_drv.build();
    let drv_path = drv.drv_path().path().display().to_string();
    let out_path = drv
        .out_path()
        .unwrap_or_else(|| kiln_derive::StorePath::from_derivation(drv.hash(), &drv.name))
        .path()
        .display()
        .to_string();

    let fields = [
        ("type", Value::Str(KString::new("derivation"))),
        ("name", Value::Str(KString::new(drv.name.clone()))),
        (
            "drvPath",
            Value::Str(KString::with_context(drv_path.clone(), [drv_path].into_iter().collect())),
        ),
        (
            "outPath",
            Value::Str(KString::with_context(out_path.clone(), [out_path].into_iter().collect())),
        ),
        ("system", Value::Str(KString::new(drv.system.clone()))),
    ];
    let entries = fields
        .into_iter()
        .map(|(key, value)| (ev.interner.intern(key), Thunk::evaluated(value)))
        .collect();

    Ok(Value::Attrs(Rc::new(AttrSet::from_entries(entries))))
}

fn require_string_attr(ev: &mut Evaluator, attrs: &AttrSet, name: &str) -> Result<String, EvalError> {
    let sym = ev.interner.intern(name);
    let thunk = attrs.get(sym).ok_or_else(|| EvalError::MissingAttr(name.to_string()))?;
    let value = thunk.force(ev)?;
    Ok(ev.coerce_to_string(&value)?.text.to_string())
}

fn builtin_to_string(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    let v = args[0].force(ev)?;
    Ok(Value::Str(ev.coerce_to_string(&v)?))
}

fn builtin_throw(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    let v = args[0].force(ev)?;
    let s = ev.coerce_to_string(&v)?;
    Err(EvalError::Thrown(s.text.to_string()))
}

fn builtin_abort(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    builtin_throw(ev, args)
}

fn builtin_length(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    match args[0].force(ev)? {
        Value::List(items) => Ok(Value::Int(items.len() as i64)),
        other => Err(EvalError::TypeError {
            expected: "list",
            got: other.type_name(),
        }),
    }
}

fn builtin_head(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    match args[0].force(ev)? {
        Value::List(items) => match items.first() {
            Some(t) => t.force(ev),
            None => Err(EvalError::MissingAttr("head of empty list".to_string())),
        },
        other => Err(EvalError::TypeError {
            expected: "list",
            got: other.type_name(),
        }),
    }
}

fn builtin_tail(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    match args[0].force(ev)? {
        Value::List(items) => {
            if items.is_empty() {
                return Err(EvalError::MissingAttr("tail of empty list".to_string()));
            }
            Ok(Value::List(Rc::new(items[1..].to_vec())))
        }
        other => Err(EvalError::TypeError {
            expected: "list",
            got: other.type_name(),
        }),
    }
}

fn builtin_elem_at(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    let items = match args[0].force(ev)? {
        Value::List(items) => items,
        other => {
            return Err(EvalError::TypeError {
                expected: "list",
                got: other.type_name(),
            });
        }
    };
    let index = match args[1].force(ev)? {
        Value::Int(n) => n,
        other => {
            return Err(EvalError::TypeError {
                expected: "int",
                got: other.type_name(),
            });
        }
    };
    items
        .get(index.max(0) as usize)
        .ok_or_else(|| EvalError::MissingAttr(format!("index {index} out of bounds")))?
        .force(ev)
}

fn builtin_attr_names(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    let attrs = match args[0].force(ev)? {
        Value::Attrs(a) => a,
        other => {
            return Err(EvalError::TypeError {
                expected: "set",
                got: other.type_name(),
            });
        }
    };
    let names: Vec<Thunk> = attrs
        .iter()
        .map(|(sym, _)| Thunk::evaluated(Value::Str(KString::new(ev.interner.get(*sym)))))
        .collect();
    Ok(Value::List(Rc::new(names)))
}

fn builtin_attr_values(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    let attrs = match args[0].force(ev)? {
        Value::Attrs(a) => a,
        other => {
            return Err(EvalError::TypeError {
                expected: "set",
                got: other.type_name(),
            });
        }
    };
    let values: Vec<Thunk> = attrs.iter().map(|(_, t)| t.clone()).collect();
    Ok(Value::List(Rc::new(values)))
}

fn builtin_has_attr(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    let name = match args[0].force(ev)? {
        Value::Str(s) => s.text.to_string(),
        other => {
            return Err(EvalError::TypeError {
                expected: "string",
                got: other.type_name(),
            });
        }
    };
    let attrs = match args[1].force(ev)? {
        Value::Attrs(a) => a,
        other => {
            return Err(EvalError::TypeError {
                expected: "set",
                got: other.type_name(),
            });
        }
    };
    let sym = ev.interner.intern(&name);
    Ok(Value::Bool(attrs.contains(sym)))
}

fn builtin_get_attr(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    let name = match args[0].force(ev)? {
        Value::Str(s) => s.text.to_string(),
        other => {
            return Err(EvalError::TypeError {
                expected: "string",
                got: other.type_name(),
            });
        }
    };
    let attrs = match args[1].force(ev)? {
        Value::Attrs(a) => a,
        other => {
            return Err(EvalError::TypeError {
                expected: "set",
                got: other.type_name(),
            });
        }
    };
    let sym = ev.interner.intern(&name);
    match attrs.get(sym) {
        Some(t) => t.force(ev),
        None => Err(EvalError::MissingAttr(name)),
    }
}

fn builtin_map(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    let func = args[0].force(ev)?;
    let items = match args[1].force(ev)? {
        Value::List(items) => items,
        other => {
            return Err(EvalError::TypeError {
                expected: "list",
                got: other.type_name(),
            });
        }
    };
    let mut mapped = Vec::with_capacity(items.len());
    for item in items.iter() {
        let value = ev.apply(func.clone(), item.clone())?;
        mapped.push(Thunk::evaluated(value));
    }
    Ok(Value::List(Rc::new(mapped)))
}

fn builtin_filter(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    let func = args[0].force(ev)?;
    let items = match args[1].force(ev)? {
        Value::List(items) => items,
        other => {
            return Err(EvalError::TypeError {
                expected: "list",
                got: other.type_name(),
            });
        }
    };
    let mut kept = Vec::new();
    for item in items.iter() {
        match ev.apply(func.clone(), item.clone())? {
            Value::Bool(true) => kept.push(item.clone()),
            Value::Bool(false) => {}
            other => {
                return Err(EvalError::TypeError {
                    expected: "bool",
                    got: other.type_name(),
                });
            }
        }
    }
    Ok(Value::List(Rc::new(kept)))
}

fn builtin_concat_strings_sep(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    let sep = match args[0].force(ev)? {
        Value::Str(s) => s,
        other => {
            return Err(EvalError::TypeError {
                expected: "string",
                got: other.type_name(),
            });
        }
    };
    let items = match args[1].force(ev)? {
        Value::List(items) => items,
        other => {
            return Err(EvalError::TypeError {
                expected: "list",
                got: other.type_name(),
            });
        }
    };
    let mut result = KString::new("");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            result = result.concat(&sep);
        }
        let v = item.force(ev)?;
        result = result.concat(&ev.coerce_to_string(&v)?);
    }
    Ok(Value::Str(result))
}

fn builtin_compare(ev: &mut Evaluator, args: &[Thunk]) -> Result<Value, EvalError> {
    let a = args[0].force(ev)?;
    let b = args[1].force(ev)?;
    let ordering = match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Str(x), Value::Str(y)) => x.text.cmp(&y.text),
        _ => {
            return Err(EvalError::TypeError {
                expected: "two ints or two strings",
                got: b.type_name(),
            });
        }
    };
    Ok(Value::Int(match ordering {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }))
}
