//! Flint - an embedded rules language runtime
//!
//! Flint interprets the bytecode form of a small policy/routing scripting
//! language used inside HTTP/Redis service fabrics. A front end compiles
//! scripts into an immutable [`Module`] of named rules; a per-connection
//! [`Evaluator`] runs those rules against events, with:
//! - a tagged value system with reference-semantic containers
//! - first-class closures with captured upvalues
//! - resumable generator-style iterators on private stacks
//! - script-level exception handlers with stack restoration
//! - a cooperative deferred-event queue drained after each rule
//! - session/global state with immutability enforcement

pub mod bytecode;
pub mod closure;
pub mod context;
pub mod error;
pub mod eval;
pub mod event;
pub mod frame;
pub mod intrinsics;
pub mod iter;
pub mod object;
pub mod program;
pub mod template;
pub mod value;

// Re-export commonly used types
pub use closure::{Closure, MethodClosure, NativeClosure, NativeFn, ScriptClosure};
pub use context::{CallbackEvalContext, EvalConfig, EvalContext, NullEvalContext};
pub use error::{EvalError, Result, RuntimeError};
pub use eval::{Evaluator, CONFIG_RULE, GLOBAL_RULE, SESSION_RULE};
pub use event::{EventContext, EventOutcome, EventQueue, FifoEventQueue, QueuedEvent};
pub use iter::{ScriptIter, ValueIter};
pub use object::UserObject;
pub use program::{
    GlobalStore, Module, ModuleBuilder, Program, ProgramBuilder, ProgramKind, Scalar, UpvalueDesc,
};
pub use template::{register_template_factory, Template, TemplateFactory};
pub use value::Value;

pub use bytecode::{Instr, Opcode, SourceLoc};
