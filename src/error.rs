//! Error handling for the PL runtime
//!
//! Script-visible failures are classified by [`RuntimeError`]; an error that
//! escapes every script handler is reported as an [`EvalError`] carrying the
//! failing symbol, its source location and a bounded backtrace.

use std::fmt;

use crate::bytecode::SourceLoc;
use crate::frame::FrameSnapshot;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Maximum number of frames rendered in an error report
pub const BACKTRACE_LIMIT: usize = 10;

/// Classified runtime errors raised during script execution
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// Operand of the wrong kind (arithmetic, index, dot, method, regex)
    #[error("type error: {0}")]
    Type(String),

    /// Wrong number of arguments to a script or intrinsic call
    #[error("arity error: {0}")]
    Arity(String),

    /// Divide/modulo by zero or an invalid numeric operation
    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    /// Index out of range, unknown map key, missing pair slot
    #[error("key error: {0}")]
    Key(String),

    /// Unknown variable, action, method or intrinsic
    #[error("name error: {0}")]
    Name(String),

    /// Session slot out of range
    #[error("session error: {0}")]
    Session(String),

    /// Global slot out of range or mutability violation
    #[error("global error: {0}")]
    Global(String),

    /// Iteration out of bounds or iterator setup failure
    #[error("iterator error: {0}")]
    Iterator(String),

    /// Template compilation or execution failure
    #[error("template error: {0}")]
    Template(String),

    /// Raised by the host context or a native function
    #[error("host error: {0}")]
    Host(String),

    /// Invariant violation inside the runtime itself
    #[error("internal error: {0}")]
    Internal(String),
}

/// An error that escaped every script-level handler, decorated for reporting
#[derive(Debug, Clone)]
pub struct EvalError {
    /// The underlying classified error
    pub error: RuntimeError,

    /// Name of the failing symbol, or `[native function]`
    pub symbol: String,

    /// Source location of the failing instruction, if known
    pub location: Option<SourceLoc>,

    /// Frame snapshots from the failing frame outward
    pub backtrace: Vec<FrameSnapshot>,
}

impl EvalError {
    /// Wrap an error that has no script frame attached
    pub fn plain(error: RuntimeError) -> Self {
        EvalError {
            error,
            symbol: "[native function]".to_string(),
            location: None,
            backtrace: Vec::new(),
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Some(loc) => write!(
                f,
                "symbol({}), {} has error: {}",
                self.symbol, loc, self.error
            )?,
            None => write!(f, "symbol({}): {}", self.symbol, self.error)?,
        }

        if !self.backtrace.is_empty() {
            writeln!(f)?;
            let sep = ".....................";
            for (idx, frame) in self.backtrace.iter().enumerate() {
                if idx == BACKTRACE_LIMIT {
                    writeln!(f, ".........")?;
                    break;
                }
                writeln!(f, "{}>{}", idx, sep)?;
                writeln!(f, "{}", frame)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for EvalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<EvalError> for RuntimeError {
    /// Collapse a decorated report back into a classified error. Used when a
    /// callback re-entered the VM and failed: the outer VM sees the whole
    /// inner report as a single host-side failure.
    fn from(err: EvalError) -> Self {
        RuntimeError::Host(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::Arithmetic("divide zero".to_string());
        assert_eq!(err.to_string(), "arithmetic error: divide zero");

        let err = RuntimeError::Name("load_var: foo is unknown".to_string());
        assert_eq!(err.to_string(), "name error: load_var: foo is unknown");
    }

    #[test]
    fn test_plain_eval_error() {
        let err = EvalError::plain(RuntimeError::Host("boom".to_string()));
        assert_eq!(err.symbol, "[native function]");
        assert!(err.to_string().contains("host error: boom"));
    }
}
