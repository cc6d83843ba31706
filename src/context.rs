//! Host collaboration seams
//!
//! The VM reaches the host through two traits: [`EvalContext`] resolves free
//! variables and actions, [`EvalConfig`] receives configuration directives.
//! Absence of a binding is an error, never a silent null.

use crate::error::{Result, RuntimeError};
use crate::value::Value;

/// Variable and action resolution for one evaluator
pub trait EvalContext {
    /// Resolve a free variable read
    fn load_var(&mut self, name: &str) -> Result<Value>;

    /// Resolve a free variable write
    fn store_var(&mut self, name: &str, value: Value) -> Result<()>;

    /// Apply an action directive to the host
    fn action(&mut self, name: &str, value: Value) -> Result<()>;
}

/// Context with no bindings at all; every resolution fails
pub struct NullEvalContext;

impl EvalContext for NullEvalContext {
    fn load_var(&mut self, name: &str) -> Result<Value> {
        Err(RuntimeError::Name(format!("load_var: {} is unknown", name)))
    }

    fn store_var(&mut self, name: &str, _value: Value) -> Result<()> {
        Err(RuntimeError::Name(format!("store_var: {} is unknown", name)))
    }

    fn action(&mut self, name: &str, _value: Value) -> Result<()> {
        Err(RuntimeError::Name(format!("action: {} is unknown", name)))
    }
}

/// Closure-backed context; any hook left unset behaves like
/// [`NullEvalContext`]
pub struct CallbackEvalContext {
    load_var_fn: Option<Box<dyn FnMut(&str) -> Result<Value>>>,
    store_var_fn: Option<Box<dyn FnMut(&str, Value) -> Result<()>>>,
    action_fn: Option<Box<dyn FnMut(&str, Value) -> Result<()>>>,
}

impl CallbackEvalContext {
    pub fn new() -> Self {
        CallbackEvalContext {
            load_var_fn: None,
            store_var_fn: None,
            action_fn: None,
        }
    }

    pub fn on_load_var(mut self, f: impl FnMut(&str) -> Result<Value> + 'static) -> Self {
        self.load_var_fn = Some(Box::new(f));
        self
    }

    pub fn on_store_var(mut self, f: impl FnMut(&str, Value) -> Result<()> + 'static) -> Self {
        self.store_var_fn = Some(Box::new(f));
        self
    }

    pub fn on_action(mut self, f: impl FnMut(&str, Value) -> Result<()> + 'static) -> Self {
        self.action_fn = Some(Box::new(f));
        self
    }
}

impl Default for CallbackEvalContext {
    fn default() -> Self {
        CallbackEvalContext::new()
    }
}

impl EvalContext for CallbackEvalContext {
    fn load_var(&mut self, name: &str) -> Result<Value> {
        match &mut self.load_var_fn {
            Some(f) => f(name),
            None => Err(RuntimeError::Name(format!("load_var: {} is unknown", name))),
        }
    }

    fn store_var(&mut self, name: &str, value: Value) -> Result<()> {
        match &mut self.store_var_fn {
            Some(f) => f(name, value),
            None => Err(RuntimeError::Name(format!("store_var: {} is unknown", name))),
        }
    }

    fn action(&mut self, name: &str, value: Value) -> Result<()> {
        match &mut self.action_fn {
            Some(f) => f(name, value),
            None => Err(RuntimeError::Name(format!("action: {} is unknown", name))),
        }
    }
}

/// Receiver of configuration directives emitted by config programs
pub trait EvalConfig {
    /// Open a nested configuration scope; `attr` defaults to null
    fn push_config(&mut self, name: &str, attr: Value) -> Result<()>;

    /// Close the innermost configuration scope
    fn pop_config(&mut self) -> Result<()>;

    /// Set one property in the current scope
    fn config_property(&mut self, name: &str, value: Value, attr: Value) -> Result<()>;

    /// Run one command in the current scope
    fn config_command(&mut self, name: &str, args: Vec<Value>, attr: Value) -> Result<()>;
}
