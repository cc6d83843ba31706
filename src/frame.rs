//! Call frames
//!
//! Frames are carved out of the single value stack. The slot at `fp` holds
//! the callee identity, argument `i` lives at `fp + 1 + i`, and the saved
//! caller frame sits just above the arguments as a marker value. Everything
//! above the marker belongs to the callee: reserved locals first, then the
//! operand stack.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::bytecode::SourceLoc;
use crate::closure::{Closure, ScriptClosure};
use crate::iter::ScriptIter;
use crate::program::Program;
use crate::value::Value;
use std::sync::Arc;

/// What kind of call produced a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// The sentinel frame below every run
    Top,

    /// A rule entry
    Rule,

    /// A direct script call by function-table index; no closure is created
    Script,

    /// An intrinsic call; no closure is created
    Intrinsic,

    /// A script closure call
    ScriptClosure,

    /// A native closure call
    NativeClosure,

    /// A method closure call
    MethodClosure,

    /// A suspended script iterator
    ScriptIter,
}

impl FrameKind {
    pub fn name(&self) -> &'static str {
        match self {
            FrameKind::Top => "#top",
            FrameKind::Rule => "rule",
            FrameKind::Script => "script",
            FrameKind::Intrinsic => "intrinsic",
            FrameKind::ScriptClosure => "script_func",
            FrameKind::NativeClosure => "native_func",
            FrameKind::MethodClosure => "method",
            FrameKind::ScriptIter => "script_iter",
        }
    }
}

/// One registered exception handler: where to resume and the stack size to
/// restore before resuming
#[derive(Debug, Clone, Copy)]
pub struct Handler {
    pub pc: usize,
    pub stack_size: usize,
}

/// An in-progress call
#[derive(Clone)]
pub struct Frame {
    pub kind: FrameKind,

    /// Number of arguments the caller pushed
    pub argc: usize,

    /// Resume position; kept current only while the frame is suspended
    pub pc: usize,

    /// Stack index of the callee slot
    pub fp: usize,

    /// Program under execution, if the frame runs script code
    pub prog: Option<Arc<Program>>,

    /// Closure identity for closure-backed frames
    pub closure: Option<Closure>,

    /// Owning iterator for generator frames
    pub iter: Option<Rc<ScriptIter>>,

    /// Registered exception handlers, innermost last
    pub handlers: Vec<Handler>,

    /// Event value for rule frames
    pub event: Value,
}

impl Frame {
    /// The sentinel frame
    pub fn top() -> Frame {
        Frame {
            kind: FrameKind::Top,
            argc: 0,
            pc: 0,
            fp: 0,
            prog: None,
            closure: None,
            iter: None,
            handlers: Vec::new(),
            event: Value::Null,
        }
    }

    pub fn is_top(&self) -> bool {
        self.kind == FrameKind::Top
    }

    /// Script frames can register and run exception handlers
    pub fn is_script(&self) -> bool {
        self.prog.is_some()
    }

    /// The script closure backing this frame, if any
    pub fn script_closure(&self) -> Option<&Rc<ScriptClosure>> {
        match &self.closure {
            Some(Closure::Script(sf)) => Some(sf),
            _ => None,
        }
    }

    /// The upvalue vector visible to this frame: a script closure's captures
    /// or a generator's captures
    pub fn upvalue_source(&self) -> Option<&RefCell<Vec<Value>>> {
        if let Some(sf) = self.script_closure() {
            return Some(&sf.upvalues);
        }
        if let Some(it) = &self.iter {
            return Some(&it.upvalues);
        }
        None
    }

    /// Duplicate the observable state of the frame for error reporting
    pub fn snapshot(&self) -> FrameSnapshot {
        let (symbol, location, instr) = match &self.prog {
            Some(p) => (
                Some(p.name.clone()),
                p.location_at(self.pc),
                p.code.get(self.pc).map(|i| i.to_string()),
            ),
            None => (
                self.closure.as_ref().map(|c| c.kind_name().to_string()),
                None,
                None,
            ),
        };
        FrameSnapshot {
            kind: self.kind,
            pc: self.pc,
            fp: self.fp,
            argc: self.argc,
            symbol,
            location,
            instr,
        }
    }
}

/// A frozen copy of a frame used in backtraces
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub kind: FrameKind,
    pub pc: usize,
    pub fp: usize,
    pub argc: usize,
    pub symbol: Option<String>,
    pub location: Option<SourceLoc>,
    pub instr: Option<String>,
}

impl fmt::Display for FrameSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[pc={}][framep={}][argcount={}][type={}]",
            self.pc,
            self.fp,
            self.argc,
            self.kind.name()
        )?;
        if let Some(sym) = &self.symbol {
            write!(f, "[name={}]", sym)?;
        }
        if let Some(instr) = &self.instr {
            write!(f, "[instr={}]", instr)?;
        }
        if let Some(loc) = self.location {
            write!(f, "[source={}]", loc)?;
        }
        Ok(())
    }
}
