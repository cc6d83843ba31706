//! Callable values
//!
//! Three closure shapes exist: script closures wrap a compiled program plus
//! its captured upvalues, native closures wrap a host function, and method
//! closures bind a receiver to a method name resolved at call time.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::{Result, RuntimeError};
use crate::eval::Evaluator;
use crate::program::Program;
use crate::value::Value;

/// Entry type of a native closure. The evaluator is passed explicitly so the
/// host can call back into the VM.
pub type NativeFn = Rc<dyn Fn(&mut Evaluator, &[Value]) -> Result<Value>>;

/// A compiled function together with its captured upvalues
pub struct ScriptClosure {
    /// The function body
    pub prog: Arc<Program>,

    /// Captured upvalues; shared by every alias of this closure value
    pub upvalues: RefCell<Vec<Value>>,
}

impl ScriptClosure {
    pub fn new(prog: Arc<Program>, upvalues: Vec<Value>) -> Rc<Self> {
        Rc::new(ScriptClosure {
            prog,
            upvalues: RefCell::new(upvalues),
        })
    }
}

/// A host-provided callable with no program
pub struct NativeClosure {
    /// Diagnostic name
    pub name: Arc<str>,

    /// Host entry point
    pub entry: NativeFn,
}

impl NativeClosure {
    pub fn new(name: impl Into<Arc<str>>, entry: NativeFn) -> Rc<Self> {
        Rc::new(NativeClosure {
            name: name.into(),
            entry,
        })
    }
}

/// A method name bound to its receiver
pub struct MethodClosure {
    pub receiver: Value,
    pub name: Arc<str>,
}

/// Any callable PL value
#[derive(Clone)]
pub enum Closure {
    Script(Rc<ScriptClosure>),
    Native(Rc<NativeClosure>),
    Method(Rc<MethodClosure>),
}

impl Closure {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Closure::Script(_) => "script_func",
            Closure::Native(_) => "native_func",
            Closure::Method(_) => "method",
        }
    }

    /// Identity comparison; two closure values are equal when they share the
    /// same underlying callable
    pub fn same_handle(&self, other: &Closure) -> bool {
        match (self, other) {
            (Closure::Script(a), Closure::Script(b)) => Rc::ptr_eq(a, b),
            (Closure::Native(a), Closure::Native(b)) => Rc::ptr_eq(a, b),
            (Closure::Method(a), Closure::Method(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Invoke the closure from native code, re-entering the VM for script
    /// closures
    pub fn call(&self, eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
        match self {
            Closure::Script(sf) => eval
                .run_script_closure(sf, args)
                .map_err(RuntimeError::from),
            Closure::Native(nf) => eval.run_native_closure(nf, args),
            Closure::Method(mf) => eval.run_method_closure(mf, args),
        }
    }
}

/// Whether a built-in method name exists for the receiver kind. Objects are
/// excluded here; they resolve names at call time.
pub fn builtin_method_exists(recv: &Value, name: &str) -> bool {
    match recv {
        Value::Str(_) => matches!(name, "length" | "to_upper" | "to_lower" | "trim" | "split"),
        Value::List(_) => matches!(name, "length" | "push_back" | "pop_back" | "at"),
        Value::Map(_) => matches!(name, "length" | "has" | "get" | "set"),
        _ => false,
    }
}

fn check_method_arity(recv: &Value, name: &str, want: usize, got: usize) -> Result<()> {
    if want != got {
        return Err(RuntimeError::Arity(format!(
            "method {}.{} expects {} argument(s), got {}",
            recv.kind_name(),
            name,
            want,
            got
        )));
    }
    Ok(())
}

fn string_method(s: &Arc<str>, recv: &Value, name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "length" => {
            check_method_arity(recv, name, 0, args.len())?;
            Ok(Value::Int(s.len() as i64))
        }
        "to_upper" => {
            check_method_arity(recv, name, 0, args.len())?;
            Ok(Value::str(s.to_uppercase()))
        }
        "to_lower" => {
            check_method_arity(recv, name, 0, args.len())?;
            Ok(Value::str(s.to_lowercase()))
        }
        "trim" => {
            check_method_arity(recv, name, 0, args.len())?;
            Ok(Value::str(s.trim()))
        }
        "split" => {
            check_method_arity(recv, name, 1, args.len())?;
            let sep = match &args[0] {
                Value::Str(sep) => sep.clone(),
                other => {
                    return Err(RuntimeError::Type(format!(
                        "string.split separator must be a string, not {}",
                        other.kind_name()
                    )))
                }
            };
            let parts = s
                .split(sep.as_ref())
                .map(Value::str)
                .collect::<Vec<Value>>();
            Ok(Value::list(parts))
        }
        _ => Err(RuntimeError::Name(format!(
            "unknown method '{}' on type string",
            name
        ))),
    }
}

fn list_method(recv: &Value, name: &str, args: &[Value]) -> Result<Value> {
    let Value::List(l) = recv else {
        unreachable!("list method on a non-list receiver");
    };
    match name {
        "length" => {
            check_method_arity(recv, name, 0, args.len())?;
            Ok(Value::Int(l.borrow().len() as i64))
        }
        "push_back" => {
            check_method_arity(recv, name, 1, args.len())?;
            l.borrow_mut().push(args[0].clone());
            Ok(Value::Null)
        }
        "pop_back" => {
            check_method_arity(recv, name, 0, args.len())?;
            l.borrow_mut()
                .data
                .pop()
                .ok_or_else(|| RuntimeError::Key("pop_back on an empty list".to_string()))
        }
        "at" => {
            check_method_arity(recv, name, 1, args.len())?;
            recv.index(&args[0])
        }
        _ => Err(RuntimeError::Name(format!(
            "unknown method '{}' on type list",
            name
        ))),
    }
}

fn map_method(recv: &Value, name: &str, args: &[Value]) -> Result<Value> {
    let Value::Map(m) = recv else {
        unreachable!("map method on a non-map receiver");
    };
    match name {
        "length" => {
            check_method_arity(recv, name, 0, args.len())?;
            Ok(Value::Int(m.borrow().len() as i64))
        }
        "has" => {
            check_method_arity(recv, name, 1, args.len())?;
            match &args[0] {
                Value::Str(k) => Ok(Value::Bool(m.borrow().has(k))),
                other => Err(RuntimeError::Type(format!(
                    "map key must be a string, not {}",
                    other.kind_name()
                ))),
            }
        }
        "get" => {
            check_method_arity(recv, name, 1, args.len())?;
            recv.index(&args[0])
        }
        "set" => {
            check_method_arity(recv, name, 2, args.len())?;
            recv.index_set(&args[0], args[1].clone())?;
            Ok(Value::Null)
        }
        _ => Err(RuntimeError::Name(format!(
            "unknown method '{}' on type map",
            name
        ))),
    }
}

/// Resolve and run a method against its receiver
pub fn dispatch_method(
    eval: &mut Evaluator,
    recv: &Value,
    name: &str,
    args: &[Value],
) -> Result<Value> {
    match recv {
        Value::Str(s) => string_method(s, recv, name, args),
        Value::List(_) => list_method(recv, name, args),
        Value::Map(_) => map_method(recv, name, args),
        Value::Object(o) => o.clone().call_method(eval, name, args),
        other => Err(RuntimeError::Type(format!(
            "type {} does not support method call",
            other.kind_name()
        ))),
    }
}
