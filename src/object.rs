//! Host-defined script objects
//!
//! A host embeds its own types into the value system by implementing
//! [`UserObject`]. Every operation defaults to a type error so an object only
//! exposes what it overrides.

use std::rc::Rc;

use crate::error::{Result, RuntimeError};
use crate::eval::Evaluator;
use crate::iter::ValueIter;
use crate::value::Value;

/// A host value participating in indexing, field access, method dispatch and
/// iteration
pub trait UserObject {
    /// Short type name used in diagnostics
    fn type_name(&self) -> &str;

    /// `obj[key]`
    fn index(&self, key: &Value) -> Result<Value> {
        let _ = key;
        Err(RuntimeError::Type(format!(
            "type {} does not support indexing",
            self.type_name()
        )))
    }

    /// `obj[key] = value`
    fn index_set(&self, key: &Value, value: Value) -> Result<()> {
        let _ = (key, value);
        Err(RuntimeError::Type(format!(
            "type {} does not support index assignment",
            self.type_name()
        )))
    }

    /// `obj.field`
    fn dot(&self, name: &str) -> Result<Value> {
        let _ = name;
        Err(RuntimeError::Type(format!(
            "type {} does not support field access",
            self.type_name()
        )))
    }

    /// `obj.field = value`
    fn dot_set(&self, name: &str, value: Value) -> Result<()> {
        let _ = (name, value);
        Err(RuntimeError::Type(format!(
            "type {} does not support field assignment",
            self.type_name()
        )))
    }

    /// Invoke a method on the object. The evaluator is available for
    /// callbacks into the VM.
    fn call_method(&self, eval: &mut Evaluator, name: &str, args: &[Value]) -> Result<Value> {
        let _ = (eval, args);
        Err(RuntimeError::Name(format!(
            "unknown method '{}' on type {}",
            name,
            self.type_name()
        )))
    }

    /// Create an iterator over the object
    fn new_iterator(&self) -> Result<Rc<dyn ValueIter>> {
        Err(RuntimeError::Type(format!(
            "type {} is not iterable",
            self.type_name()
        )))
    }

    /// Whether the host may share this object across evaluators running on
    /// different threads
    fn is_thread_safe(&self) -> bool {
        false
    }

    /// Rendering used by diagnostics and string coercion of the object
    fn display(&self) -> String {
        format!("[object: {}]", self.type_name())
    }
}
