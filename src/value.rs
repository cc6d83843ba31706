//! The PL value system
//!
//! Values are tagged variants. Scalars (null, int, real, bool, string,
//! regex) copy by value; containers (pair, list, map, user objects) copy by
//! handle so mutation through one alias is visible through every other.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use regex::Regex;

use crate::closure::{self, Closure, MethodClosure};
use crate::error::{Result, RuntimeError};
use crate::frame::Frame;
use crate::iter::{ListIter, MapIter, PairIter, ValueIter};
use crate::object::UserObject;

/// A pair holds exactly two slots, `first` and `second`
#[derive(Debug, Clone)]
pub struct Pair {
    pub first: Value,
    pub second: Value,
}

/// An ordered sequence of values
#[derive(Debug, Clone, Default)]
pub struct List {
    pub data: Vec<Value>,
}

impl List {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn at(&self, idx: usize) -> Option<Value> {
        self.data.get(idx).cloned()
    }

    pub fn push(&mut self, v: Value) {
        self.data.push(v);
    }
}

/// A string-keyed mapping preserving insertion order
#[derive(Debug, Clone, Default)]
pub struct Map {
    entries: IndexMap<String, Value>,
}

impl Map {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).cloned()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Entry at an insertion-order position
    pub fn entry_at(&self, idx: usize) -> Option<(&str, &Value)> {
        self.entries.get_index(idx).map(|(k, v)| (k.as_str(), v))
    }

    /// Visit entries in insertion order; stop early when the callback
    /// returns false
    pub fn foreach(&self, mut f: impl FnMut(&str, &Value) -> bool) {
        for (k, v) in &self.entries {
            if !f(k, v) {
                break;
            }
        }
    }
}

/// A tagged PL value
#[derive(Clone)]
pub enum Value {
    Null,
    Int(i64),
    Real(f64),
    Bool(bool),
    Str(Arc<str>),
    Regexp(Arc<Regex>),
    Pair(Rc<RefCell<Pair>>),
    List(Rc<RefCell<List>>),
    Map(Rc<RefCell<Map>>),
    Iter(Rc<dyn ValueIter>),
    Closure(Closure),
    Object(Rc<dyn UserObject>),

    /// Saved caller frame; only the evaluator creates these
    Frame(Rc<RefCell<Frame>>),
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn pair(first: Value, second: Value) -> Value {
        Value::Pair(Rc::new(RefCell::new(Pair { first, second })))
    }

    pub fn list(data: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(List { data })))
    }

    pub fn map() -> Value {
        Value::Map(Rc::new(RefCell::new(Map::default())))
    }

    /// Kind name used in diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Real(_) => "real",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Regexp(_) => "regexp",
            Value::Pair(_) => "pair",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Iter(_) => "iterator",
            Value::Closure(c) => c.kind_name(),
            Value::Object(_) => "object",
            Value::Frame(_) => "#frame",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    pub fn is_real(&self) -> bool {
        matches!(self, Value::Real(_))
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Real(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::Str(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Value::List(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Value::Map(_))
    }

    pub fn is_pair(&self) -> bool {
        matches!(self, Value::Pair(_))
    }

    pub fn is_closure(&self) -> bool {
        matches!(self, Value::Closure(_))
    }

    pub fn is_iter(&self) -> bool {
        matches!(self, Value::Iter(_))
    }

    /// Numeric payload widened to real; caller checks `is_number` first
    pub fn as_real(&self) -> f64 {
        match self {
            Value::Int(i) => *i as f64,
            Value::Real(r) => *r,
            _ => panic!("as_real on a non-numeric value"),
        }
    }

    /// Truthiness: null is false, numbers compare against zero, strings and
    /// containers against emptiness, everything else is true
    pub fn to_boolean(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Int(i) => *i != 0,
            Value::Real(r) => *r != 0.0,
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
            Value::Pair(_) => true,
            Value::List(l) => !l.borrow().is_empty(),
            Value::Map(m) => !m.borrow().is_empty(),
            _ => true,
        }
    }

    /// Scalar-to-string coercion; containers and callables do not stringify
    pub fn to_string_value(&self) -> Result<String> {
        match self {
            Value::Null => Ok("null".to_string()),
            Value::Int(i) => Ok(i.to_string()),
            Value::Real(r) => Ok(r.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Str(s) => Ok(s.to_string()),
            Value::Regexp(r) => Ok(r.as_str().to_string()),
            other => Err(RuntimeError::Type(format!(
                "cannot convert {} to string",
                other.kind_name()
            ))),
        }
    }

    /// Container index coercion; only non-negative ints qualify
    pub fn to_index(&self) -> Result<usize> {
        match self {
            Value::Int(i) if *i >= 0 => Ok(*i as usize),
            Value::Int(_) => Err(RuntimeError::Key("index must be non-negative".to_string())),
            other => Err(RuntimeError::Type(format!(
                "index must be an int, not {}",
                other.kind_name()
            ))),
        }
    }

    /// `container[key]`
    pub fn index(&self, key: &Value) -> Result<Value> {
        match self {
            Value::List(l) => {
                let idx = key.to_index()?;
                l.borrow().at(idx).ok_or_else(|| {
                    RuntimeError::Key(format!(
                        "list index {} out of range, length {}",
                        idx,
                        l.borrow().len()
                    ))
                })
            }
            Value::Map(m) => {
                let key = match key {
                    Value::Str(s) => s.clone(),
                    other => {
                        return Err(RuntimeError::Type(format!(
                            "map key must be a string, not {}",
                            other.kind_name()
                        )))
                    }
                };
                m.borrow()
                    .get(&key)
                    .ok_or_else(|| RuntimeError::Key(format!("map key '{}' is not existed", key)))
            }
            Value::Pair(p) => match key.to_index()? {
                0 => Ok(p.borrow().first.clone()),
                1 => Ok(p.borrow().second.clone()),
                _ => Err(RuntimeError::Key(
                    "invalid index, 0 or 1 is allowed on pair".to_string(),
                )),
            },
            Value::Object(o) => o.index(key),
            other => Err(RuntimeError::Type(format!(
                "type {} does not support indexing",
                other.kind_name()
            ))),
        }
    }

    /// `container[key] = value`
    pub fn index_set(&self, key: &Value, value: Value) -> Result<()> {
        match self {
            Value::List(l) => {
                let idx = key.to_index()?;
                let mut l = l.borrow_mut();
                if idx >= l.len() {
                    return Err(RuntimeError::Key(format!(
                        "list index {} out of range, length {}",
                        idx,
                        l.len()
                    )));
                }
                l.data[idx] = value;
                Ok(())
            }
            Value::Map(m) => match key {
                Value::Str(s) => {
                    m.borrow_mut().set(s.to_string(), value);
                    Ok(())
                }
                other => Err(RuntimeError::Type(format!(
                    "map key must be a string, not {}",
                    other.kind_name()
                ))),
            },
            Value::Pair(p) => match key.to_index()? {
                0 => {
                    p.borrow_mut().first = value;
                    Ok(())
                }
                1 => {
                    p.borrow_mut().second = value;
                    Ok(())
                }
                _ => Err(RuntimeError::Key(
                    "invalid index, 0 or 1 is allowed on pair".to_string(),
                )),
            },
            Value::Object(o) => o.index_set(key, value),
            other => Err(RuntimeError::Type(format!(
                "type {} does not support index assignment",
                other.kind_name()
            ))),
        }
    }

    /// `value.name`
    pub fn dot(&self, name: &str) -> Result<Value> {
        match self {
            Value::Pair(p) => match name {
                "first" => Ok(p.borrow().first.clone()),
                "second" => Ok(p.borrow().second.clone()),
                _ => Err(RuntimeError::Key(
                    "invalid field name, 'first'/'second' is allowed on pair".to_string(),
                )),
            },
            Value::Map(m) => m
                .borrow()
                .get(name)
                .ok_or_else(|| RuntimeError::Key(format!("map key '{}' is not existed", name))),
            Value::Object(o) => o.dot(name),
            other => Err(RuntimeError::Type(format!(
                "type {} does not support field access",
                other.kind_name()
            ))),
        }
    }

    /// `value.name = v`
    pub fn dot_set(&self, name: &str, value: Value) -> Result<()> {
        match self {
            Value::Pair(p) => match name {
                "first" => {
                    p.borrow_mut().first = value;
                    Ok(())
                }
                "second" => {
                    p.borrow_mut().second = value;
                    Ok(())
                }
                _ => Err(RuntimeError::Key(
                    "invalid field name, 'first'/'second' is allowed on pair".to_string(),
                )),
            },
            Value::Map(m) => {
                m.borrow_mut().set(name.to_string(), value);
                Ok(())
            }
            Value::Object(o) => o.dot_set(name, value),
            other => Err(RuntimeError::Type(format!(
                "type {} does not support field assignment",
                other.kind_name()
            ))),
        }
    }

    /// Bind `value.name` into a callable method closure
    pub fn method(&self, name: &str) -> Result<Value> {
        match self {
            Value::Str(_) | Value::List(_) | Value::Map(_) => {
                if !closure::builtin_method_exists(self, name) {
                    return Err(RuntimeError::Name(format!(
                        "unknown method '{}' on type {}",
                        name,
                        self.kind_name()
                    )));
                }
            }
            // objects resolve the name when the call happens
            Value::Object(_) => {}
            other => {
                return Err(RuntimeError::Type(format!(
                    "type {} does not support method call",
                    other.kind_name()
                )))
            }
        }
        Ok(Value::Closure(Closure::Method(Rc::new(MethodClosure {
            receiver: self.clone(),
            name: Arc::from(name),
        }))))
    }

    /// Create an iterator over the value
    pub fn new_iterator(&self) -> Result<Rc<dyn ValueIter>> {
        match self {
            Value::List(l) => Ok(Rc::new(ListIter::new(l.clone()))),
            Value::Map(m) => Ok(Rc::new(MapIter::new(m.clone()))),
            Value::Pair(p) => Ok(Rc::new(PairIter::new(p.clone()))),
            Value::Object(o) => o.new_iterator(),
            other => Err(RuntimeError::Type(format!(
                "type {} is not iterable",
                other.kind_name()
            ))),
        }
    }

    /// Short human-readable rendering for diagnostics; containers render
    /// shallowly so aliased cycles stay printable
    pub fn to_display(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Real(r) => r.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Str(s) => s.to_string(),
            Value::Regexp(r) => format!("[regexp: {}]", r.as_str()),
            Value::Pair(p) => {
                let p = p.borrow();
                format!("[pair: {}=>{}]", p.first.kind_name(), p.second.kind_name())
            }
            Value::List(l) => format!("[list: {} elements]", l.borrow().len()),
            Value::Map(m) => format!("[map: {} entries]", m.borrow().len()),
            Value::Iter(_) => "[iterator]".to_string(),
            Value::Closure(c) => format!("[{}]", c.kind_name()),
            Value::Object(o) => o.display(),
            Value::Frame(_) => "[#frame]".to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}>", self.kind_name(), self.to_display())
    }
}

/// Equality is kind first, payload second; containers compare by handle
/// identity
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Regexp(a), Value::Regexp(b)) => Arc::ptr_eq(a, b),
            (Value::Pair(a), Value::Pair(b)) => Rc::ptr_eq(a, b),
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::Iter(a), Value::Iter(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => a.same_handle(b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}
