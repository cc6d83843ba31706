//! The bytecode evaluator
//!
//! One evaluator owns one value stack and one current frame; scheduling is
//! single-threaded and cooperative. Function frames are carved out of the
//! stack:
//!
//! ```text
//! [reserved locals / operands]
//! [saved caller frame]  <------- fp + 1 + argc
//! [arg:N]
//!   ...
//! [arg:1]               <------- fp + 1 (local slots start here)
//! [callee identity]     <------- fp
//! ```
//!
//! Rules, config/session/global programs and deferred events all enter
//! through the same rule runner; script closures and generators re-enter
//! through their own prologues.

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::bytecode::Opcode;
use crate::closure::{self, Closure, MethodClosure, NativeClosure, NativeFn, ScriptClosure};
use crate::context::{EvalConfig, EvalContext, NullEvalContext};
use crate::error::{EvalError, Result, RuntimeError};
use crate::event::{EventContext, EventOutcome, EventQueue, FifoEventQueue};
use crate::frame::{Frame, FrameKind, FrameSnapshot, Handler};
use crate::intrinsics;
use crate::iter::ScriptIter;
use crate::program::{Module, Program, ProgramKind, UpvalueDesc};
use crate::value::Value;

/// Reserved rule names for the non-event entry points
pub const CONFIG_RULE: &str = "@config";
pub const SESSION_RULE: &str = "@session";
pub const GLOBAL_RULE: &str = "@global";

const DEFAULT_STACK_CAPACITY: usize = 2048;

/// Why the dispatch loop stopped
enum RunState {
    /// A `return` reached a native boundary; the result is on the stack
    Done(usize),

    /// A `halt` finished the rule; null is on the stack
    Halted,

    /// A generator produced a value; resume at the carried pc
    Yield(usize),

    /// The rule ceded to the next rule registered for its event
    NextRule,
}

/// An error plus where it was raised
struct VmError {
    prog: Option<Arc<Program>>,
    pc: usize,
    error: RuntimeError,
}

fn vm_err(prog: &Arc<Program>, pc: usize, error: RuntimeError) -> VmError {
    VmError {
        prog: Some(prog.clone()),
        pc,
        error,
    }
}

fn report(verr: VmError, backtrace: Vec<FrameSnapshot>) -> EvalError {
    match verr.prog {
        Some(p) => EvalError {
            symbol: p.name.clone(),
            location: p.location_at(verr.pc),
            error: verr.error,
            backtrace,
        },
        None => EvalError {
            symbol: "[native function]".to_string(),
            location: None,
            error: verr.error,
            backtrace,
        },
    }
}

/// Outcome of walking frames after a failure
enum Unwound {
    /// A handler took over; resume there
    Recovered { pc: usize, prog: Arc<Program> },

    /// No handler before the breaker frame; the error escapes
    Surfaced { backtrace: Vec<FrameSnapshot> },
}

/// How a single rule run ended
enum RuleFlow {
    /// The rule returned a value
    Return,

    /// The rule halted; chaining stops
    Halt,

    /// The rule ceded to the next rule for the event
    Next,
}

fn int_pow(n: i64, m: i64) -> Value {
    if m >= 0 {
        Value::Int(n.wrapping_pow(m as u32))
    } else {
        Value::Real((n as f64).powi(m as i32))
    }
}

/// Binary operator interpreter; promotion rules are int+int -> int,
/// real+real -> real, mixed numeric -> real, `+` concatenates when a string
/// is involved
fn binary_op(lhs: &Value, rhs: &Value, op: Opcode) -> Result<Value> {
    let bad = || RuntimeError::Type(format!("invalid operand for {}", op.operator_symbol()));

    match op {
        Opcode::Add => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
            (Value::Real(a), Value::Real(b)) => Ok(Value::Real(a + b)),
            _ if lhs.is_number() && rhs.is_number() => {
                Ok(Value::Real(lhs.as_real() + rhs.as_real()))
            }
            _ if lhs.is_string() || rhs.is_string() => {
                let a = lhs.to_string_value().map_err(|_| bad())?;
                let b = rhs.to_string_value().map_err(|_| bad())?;
                Ok(Value::str(a + &b))
            }
            _ => Err(bad()),
        },

        Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Pow => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => match op {
                Opcode::Sub => Ok(Value::Int(a - b)),
                Opcode::Mul => Ok(Value::Int(a * b)),
                Opcode::Pow => Ok(int_pow(*a, *b)),
                Opcode::Div => {
                    if *b == 0 {
                        Err(RuntimeError::Arithmetic("divide zero".to_string()))
                    } else {
                        Ok(Value::Int(a / b))
                    }
                }
                _ => unreachable!(),
            },
            (Value::Real(a), Value::Real(b)) => match op {
                Opcode::Sub => Ok(Value::Real(a - b)),
                Opcode::Mul => Ok(Value::Real(a * b)),
                Opcode::Pow => Ok(Value::Real(a.powf(*b))),
                Opcode::Div => Ok(Value::Real(a / b)),
                _ => unreachable!(),
            },
            _ if lhs.is_number() && rhs.is_number() => {
                let (a, b) = (lhs.as_real(), rhs.as_real());
                match op {
                    Opcode::Sub => Ok(Value::Real(a - b)),
                    Opcode::Mul => Ok(Value::Real(a * b)),
                    Opcode::Pow => Ok(Value::Real(a.powf(b))),
                    Opcode::Div => Ok(Value::Real(a / b)),
                    _ => unreachable!(),
                }
            }
            _ => Err(bad()),
        },

        Opcode::Mod => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => {
                if *b == 0 {
                    Err(RuntimeError::Arithmetic("divide zero".to_string()))
                } else {
                    Ok(Value::Int(a % b))
                }
            }
            _ => Err(bad()),
        },

        Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
            let ord = match (lhs, rhs) {
                (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
                (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
                _ if lhs.is_number() && rhs.is_number() => {
                    lhs.as_real().partial_cmp(&rhs.as_real())
                }
                _ => return Err(bad()),
            };
            let Some(ord) = ord else {
                return Ok(Value::Bool(false));
            };
            Ok(Value::Bool(match op {
                Opcode::Lt => ord.is_lt(),
                Opcode::Le => ord.is_le(),
                Opcode::Gt => ord.is_gt(),
                Opcode::Ge => ord.is_ge(),
                _ => unreachable!(),
            }))
        }

        Opcode::Eq | Opcode::Ne => {
            let eq = if lhs.is_number() && rhs.is_number() {
                lhs.as_real() == rhs.as_real()
            } else {
                lhs == rhs
            };
            Ok(Value::Bool(if op == Opcode::Eq { eq } else { !eq }))
        }

        Opcode::RegexpMatch | Opcode::RegexpNMatch => match (lhs, rhs) {
            (Value::Str(s), Value::Regexp(re)) => {
                let m = re.is_match(s);
                Ok(Value::Bool(if op == Opcode::RegexpMatch { m } else { !m }))
            }
            _ => Err(RuntimeError::Type(format!(
                "regexp operator {} must be applied on string and regexp",
                op.operator_symbol()
            ))),
        },

        _ => unreachable!("binary operator dispatch on {}", op.mnemonic()),
    }
}

fn negate(v: &Value) -> Result<Value> {
    match v {
        Value::Int(i) => Ok(Value::Int(-i)),
        Value::Real(r) => Ok(Value::Real(-r)),
        _ => Err(RuntimeError::Type("invalid operand for unary -".to_string())),
    }
}

/// The PL virtual machine
pub struct Evaluator {
    stack: Vec<Value>,
    session: Vec<Value>,

    /// Free-variable and action resolution
    pub context: Box<dyn EvalContext>,

    /// Configuration directive receiver; directives are skipped when unset
    pub config: Option<Box<dyn EvalConfig>>,

    /// Deferred-event error policy; defaults to dropping failed events
    pub event: Option<Box<dyn EventContext>>,

    cur_frame: Frame,
    cur_excep: Value,
    event_queue: Rc<RefCell<dyn EventQueue>>,
    in_event_queue: bool,
}

impl Evaluator {
    /// Evaluator with no host bindings at all
    pub fn new_simple() -> Evaluator {
        Evaluator::with_context(Box::new(NullEvalContext))
    }

    pub fn with_context(context: Box<dyn EvalContext>) -> Evaluator {
        Evaluator {
            stack: Vec::with_capacity(DEFAULT_STACK_CAPACITY),
            session: Vec::new(),
            context,
            config: None,
            event: None,
            cur_frame: Frame::top(),
            cur_excep: Value::Null,
            event_queue: Rc::new(RefCell::new(FifoEventQueue::new())),
            in_event_queue: false,
        }
    }

    pub fn new(context: Box<dyn EvalContext>, config: Box<dyn EvalConfig>) -> Evaluator {
        let mut e = Evaluator::with_context(context);
        e.config = Some(config);
        e
    }

    pub fn set_event_queue(&mut self, queue: Rc<RefCell<dyn EventQueue>>) {
        self.event_queue = queue;
    }

    pub fn event_queue(&self) -> Rc<RefCell<dyn EventQueue>> {
        self.event_queue.clone()
    }

    /// Current operand stack depth; exposed for stack-balance checks
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Per-evaluator session slots
    pub fn session(&self) -> &[Value] {
        &self.session
    }

    // stack manipulation ----------------------------------------------------

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) {
        self.pop_n(1);
    }

    fn pop_n(&mut self, n: usize) {
        assert!(self.stack.len() >= n, "invalid pop size");
        self.stack.truncate(self.stack.len() - n);
    }

    fn top_n(&self, nth: usize) -> Value {
        let sz = self.stack.len();
        assert!(sz > nth, "invalid top index");
        self.stack[sz - nth - 1].clone()
    }

    fn top0(&self) -> Value {
        self.top_n(0)
    }

    fn top1(&self) -> Value {
        self.top_n(1)
    }

    fn top2(&self) -> Value {
        self.top_n(2)
    }

    /// Stack index of local slot `i` in the current frame
    fn local_slot(&self, i: usize) -> usize {
        self.cur_frame.fp + 1 + i
    }

    /// The marker slot holding the saved caller frame
    fn saved_frame_cell(&self) -> Rc<RefCell<Frame>> {
        let pos = self.cur_frame.fp + self.cur_frame.argc + 1;
        match &self.stack[pos] {
            Value::Frame(f) => f.clone(),
            other => panic!("corrupted stack, frame marker expected, got {}", other.kind_name()),
        }
    }

    // frame discipline ------------------------------------------------------

    /// Save the current frame onto the stack and open a fresh frame whose
    /// callee slot sits `argc + 2` below the new top
    fn prologue(
        &mut self,
        kind: FrameKind,
        argc: usize,
        prog: Option<Arc<Program>>,
        closure: Option<Closure>,
        iter: Option<Rc<ScriptIter>>,
    ) {
        let saved = self.cur_frame.clone();
        self.push(Value::Frame(Rc::new(RefCell::new(saved))));

        let fp = self.stack.len() - 2 - argc;
        self.cur_frame = Frame {
            kind,
            argc,
            pc: 0,
            fp,
            prog,
            closure,
            iter,
            handlers: Vec::new(),
            event: Value::Null,
        };
    }

    /// Tear the current frame down, restore `prev`, and push the call result
    /// where the callee identity sat
    fn epilogue(&mut self, v: Value) -> (usize, Option<Arc<Program>>) {
        let prev = self.saved_frame_cell().borrow().clone();
        let pc = prev.pc;
        let prog = prev.prog.clone();
        self.pop_frame(prev);
        self.push(v);
        (pc, prog)
    }

    fn pop_frame(&mut self, prev: Frame) {
        let fp = self.cur_frame.fp;
        assert!(self.stack.len() >= fp, "invalid frame pointer");
        self.stack.truncate(fp);
        self.cur_frame = prev;
    }

    fn capture_upvalues(&self, descs: &[UpvalueDesc]) -> Vec<Value> {
        descs
            .iter()
            .map(|d| {
                if d.on_stack {
                    self.stack[self.local_slot(d.index)].clone()
                } else {
                    let src = self
                        .cur_frame
                        .upvalue_source()
                        .expect("upvalue capture source must exist");
                    let v = src.borrow()[d.index].clone();
                    v
                }
            })
            .collect()
    }

    // dispatch loop ---------------------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn run(&mut self, mut prog: Arc<Program>, mut pc: usize) -> std::result::Result<RunState, VmError> {
        loop {
            let at = pc;
            let instr = prog.code[pc];
            pc += 1;

            match instr.op {
                Opcode::Pop => {
                    self.pop();
                }

                Opcode::Dup1 => {
                    let t = self.top0();
                    self.push(t);
                }

                Opcode::Dup2 => {
                    let t1 = self.top1();
                    let t0 = self.top0();
                    self.push(t1);
                    self.push(t0);
                }

                Opcode::Swap => {
                    let sz = self.stack.len();
                    self.stack.swap(sz - 1, sz - 2);
                }

                // constants
                Opcode::LoadInt => self.push(Value::Int(prog.int_at(instr.arg))),
                Opcode::LoadReal => self.push(Value::Real(prog.real_at(instr.arg))),
                Opcode::LoadStr => self.push(Value::Str(prog.str_at(instr.arg))),
                Opcode::LoadRegexp => self.push(Value::Regexp(prog.regexp_at(instr.arg))),
                Opcode::LoadTrue => self.push(Value::Bool(true)),
                Opcode::LoadFalse => self.push(Value::Bool(false)),
                Opcode::LoadNull => self.push(Value::Null),

                op if op.is_binary() => {
                    let rhs = self.top0();
                    let lhs = self.top1();
                    self.pop_n(2);
                    let v = binary_op(&lhs, &rhs, op).map_err(|e| vm_err(&prog, at, e))?;
                    self.push(v);
                }

                Opcode::Not => {
                    let t = self.top0();
                    self.pop();
                    self.push(Value::Bool(!t.to_boolean()));
                }

                Opcode::Negate => {
                    let t = self.top0();
                    self.pop();
                    let v = negate(&t).map_err(|e| vm_err(&prog, at, e))?;
                    self.push(v);
                }

                // control flow; `and` keeps a falsy lhs, `or` keeps a truthy
                // lhs, both pop it otherwise to evaluate the rhs
                Opcode::And => {
                    if !self.top0().to_boolean() {
                        pc = instr.arg as usize;
                    } else {
                        self.pop();
                    }
                }

                Opcode::Or => {
                    if self.top0().to_boolean() {
                        pc = instr.arg as usize;
                    } else {
                        self.pop();
                    }
                }

                Opcode::Jump => {
                    pc = instr.arg as usize;
                }

                Opcode::JTrue => {
                    let cond = self.top0();
                    self.pop();
                    if cond.to_boolean() {
                        pc = instr.arg as usize;
                    }
                }

                Opcode::JFalse => {
                    let cond = self.top0();
                    self.pop();
                    if !cond.to_boolean() {
                        pc = instr.arg as usize;
                    }
                }

                Opcode::Ternary => {
                    let cond = self.top0();
                    self.pop();
                    if cond.to_boolean() {
                        pc = instr.arg as usize;
                    } else {
                        self.pop();
                    }
                }

                Opcode::Filter => {
                    let cond = self.top0();
                    self.pop();
                    if !cond.to_boolean() {
                        pc = instr.arg as usize;
                    }
                }

                // containers
                Opcode::NewList => self.push(Value::list(Vec::new())),

                Opcode::AddList => {
                    let cnt = instr.arg as usize;
                    let target = self.top_n(cnt);
                    let Value::List(l) = &target else {
                        panic!("add_list target must be a list");
                    };
                    let start = self.stack.len() - cnt;
                    for i in start..self.stack.len() {
                        l.borrow_mut().push(self.stack[i].clone());
                    }
                    self.pop_n(cnt);
                }

                Opcode::NewMap => self.push(Value::map()),

                Opcode::AddMap => {
                    let cnt = instr.arg as usize;
                    let target = self.top_n(cnt * 2);
                    let Value::Map(m) = &target else {
                        panic!("add_map target must be a map");
                    };
                    let mut i = self.stack.len() - cnt * 2;
                    while i < self.stack.len() {
                        let Value::Str(key) = &self.stack[i] else {
                            panic!("add_map key must be a string");
                        };
                        m.borrow_mut().set(key.to_string(), self.stack[i + 1].clone());
                        i += 2;
                    }
                    self.pop_n(cnt * 2);
                }

                Opcode::NewPair => {
                    let second = self.top0();
                    let first = self.top1();
                    self.pop_n(2);
                    self.push(Value::pair(first, second));
                }

                Opcode::Index => {
                    let key = self.top0();
                    let recv = self.top1();
                    let v = recv.index(&key).map_err(|e| vm_err(&prog, at, e))?;
                    self.pop_n(2);
                    self.push(v);
                }

                Opcode::IndexSet => {
                    let value = self.top0();
                    let key = self.top1();
                    let recv = self.top2();
                    self.pop_n(3);
                    recv.index_set(&key, value).map_err(|e| vm_err(&prog, at, e))?;
                }

                Opcode::Dot => {
                    let recv = self.top0();
                    let name = prog.str_at(instr.arg);
                    let v = recv.dot(&name).map_err(|e| vm_err(&prog, at, e))?;
                    self.pop();
                    self.push(v);
                }

                Opcode::DotSet => {
                    let value = self.top0();
                    let recv = self.top1();
                    self.pop_n(2);
                    recv.dot_set(&prog.str_at(instr.arg), value)
                        .map_err(|e| vm_err(&prog, at, e))?;
                }

                // locals
                Opcode::ReserveLocal => {
                    for _ in 0..instr.arg {
                        self.push(Value::Null);
                    }
                }

                Opcode::StoreLocal => {
                    let v = self.top0();
                    let slot = self.local_slot(instr.arg as usize);
                    self.stack[slot] = v;
                    self.pop();
                }

                Opcode::LoadLocal => {
                    let v = self.stack[self.local_slot(instr.arg as usize)].clone();
                    self.push(v);
                }

                // upvalues
                Opcode::LoadUpvalue => {
                    let src = self
                        .cur_frame
                        .upvalue_source()
                        .expect("load_upvalue outside of a capturing frame");
                    let v = src.borrow()[instr.arg as usize].clone();
                    self.push(v);
                }

                Opcode::StoreUpvalue => {
                    let v = self.top0();
                    {
                        let src = self
                            .cur_frame
                            .upvalue_source()
                            .expect("store_upvalue outside of a capturing frame");
                        src.borrow_mut()[instr.arg as usize] = v;
                    }
                    self.pop();
                }

                Opcode::NewClosure => {
                    let md = prog.module().map_err(|e| vm_err(&prog, at, e))?;
                    let target = md.functions[instr.arg as usize].clone();
                    if target.kind != ProgramKind::Function {
                        return Err(vm_err(
                            &prog,
                            at,
                            RuntimeError::Type(
                                "value must be function instead of iterator".to_string(),
                            ),
                        ));
                    }
                    let ups = self.capture_upvalues(&target.upvalues);
                    self.push(Value::Closure(Closure::Script(ScriptClosure::new(
                        target, ups,
                    ))));
                }

                // variables
                Opcode::LoadVar => {
                    let name = prog.str_at(instr.arg);
                    // intrinsics shadow host bindings and cannot be overwritten
                    if let Some((idx, intr)) = intrinsics::find(&name) {
                        let entry: NativeFn = Rc::new(move |eval, args| {
                            intrinsics::get(idx)
                                .expect("intrinsic table is append-only")
                                .call(eval, args)
                        });
                        self.push(Value::Closure(Closure::Native(NativeClosure::new(
                            intr.full_name(),
                            entry,
                        ))));
                    } else {
                        let v = self
                            .context
                            .load_var(&name)
                            .map_err(|e| vm_err(&prog, at, e))?;
                        self.push(v);
                    }
                }

                Opcode::StoreVar => {
                    let v = self.top0();
                    self.pop();
                    let name = prog.str_at(instr.arg);
                    self.context
                        .store_var(&name, v)
                        .map_err(|e| vm_err(&prog, at, e))?;
                }

                Opcode::LoadDollar => {
                    assert!(
                        self.cur_frame.kind == FrameKind::Rule,
                        "load_dollar outside of a rule frame"
                    );
                    let v = self.stack[self.cur_frame.fp + 1].clone();
                    self.push(v);
                }

                Opcode::Action => {
                    let name = prog.str_at(instr.arg);
                    let v = self.top0();
                    self.context
                        .action(&name, v)
                        .map_err(|e| vm_err(&prog, at, e))?;
                    self.pop();
                }

                // session
                Opcode::SetSession => {
                    let v = self.top0();
                    self.pop();
                    self.session.push(v);
                }

                Opcode::LoadSession => {
                    let idx = instr.arg as usize;
                    if idx >= self.session.len() {
                        return Err(vm_err(
                            &prog,
                            at,
                            RuntimeError::Session("session variable is not existed".to_string()),
                        ));
                    }
                    self.push(self.session[idx].clone());
                }

                Opcode::StoreSession => {
                    let idx = instr.arg as usize;
                    if idx >= self.session.len() {
                        return Err(vm_err(
                            &prog,
                            at,
                            RuntimeError::Session("session variable is not existed".to_string()),
                        ));
                    }
                    let v = self.top0();
                    self.session[idx] = v;
                    self.pop();
                }

                // globals
                Opcode::SetGlobal => {
                    let v = self.top0();
                    self.pop();
                    let md = prog.module().map_err(|e| vm_err(&prog, at, e))?;
                    if !md.global.add(&v) {
                        return Err(vm_err(
                            &prog,
                            at,
                            RuntimeError::Global(
                                "global variable must store immutable type, \
                                 ie int, real, bool, string, null"
                                    .to_string(),
                            ),
                        ));
                    }
                }

                Opcode::LoadGlobal => {
                    let md = prog.module().map_err(|e| vm_err(&prog, at, e))?;
                    match md.global.get(instr.arg as usize) {
                        Some(v) => self.push(v),
                        None => {
                            return Err(vm_err(
                                &prog,
                                at,
                                RuntimeError::Global(
                                    "global variable is not existed".to_string(),
                                ),
                            ))
                        }
                    }
                }

                Opcode::StoreGlobal => {
                    let v = self.top0();
                    self.pop();
                    let md = prog.module().map_err(|e| vm_err(&prog, at, e))?;
                    if !md.global.store(instr.arg as usize, &v) {
                        return Err(vm_err(
                            &prog,
                            at,
                            RuntimeError::Global(
                                "value is not immutable or global variable is not existed"
                                    .to_string(),
                            ),
                        ));
                    }
                }

                // exceptions
                Opcode::PushException => {
                    let size = self.stack.len();
                    self.cur_frame.handlers.push(Handler {
                        pc: instr.arg as usize,
                        stack_size: size,
                    });
                }

                Opcode::PopException => {
                    self.cur_frame
                        .handlers
                        .pop()
                        .expect("pop_exception without a handler");
                    pc = instr.arg as usize;
                }

                Opcode::LoadException => {
                    self.push(self.cur_excep.clone());
                }

                // strings and templates
                Opcode::ToStr => {
                    let t = self.top0();
                    let s = t.to_string_value().map_err(|e| vm_err(&prog, at, e))?;
                    self.pop();
                    self.push(Value::str(s));
                }

                Opcode::ConStr => {
                    let cnt = instr.arg as usize;
                    let start = self.stack.len() - cnt;
                    let mut out = String::new();
                    for v in &self.stack[start..] {
                        let Value::Str(s) = v else {
                            panic!("con_str operand must be a string");
                        };
                        out.push_str(s);
                    }
                    self.pop_n(cnt);
                    self.push(Value::str(out));
                }

                Opcode::Template => {
                    let ctx = self.top0();
                    self.pop();
                    let rendered = prog
                        .template_at(instr.arg)
                        .execute(&ctx)
                        .map_err(|e| vm_err(&prog, at, e))?;
                    self.push(Value::str(rendered));
                }

                // configuration
                Opcode::ConfigPush | Opcode::ConfigPushWithAttr => {
                    let attr = if instr.op == Opcode::ConfigPushWithAttr {
                        let a = self.top0();
                        self.pop();
                        a
                    } else {
                        Value::Null
                    };
                    let name = prog.str_at(instr.arg);
                    if let Some(cfg) = self.config.as_mut() {
                        cfg.push_config(&name, attr).map_err(|e| vm_err(&prog, at, e))?;
                    }
                }

                Opcode::ConfigPop => {
                    if let Some(cfg) = self.config.as_mut() {
                        cfg.pop_config().map_err(|e| vm_err(&prog, at, e))?;
                    }
                }

                Opcode::ConfigPropertySet | Opcode::ConfigPropertySetWithAttr => {
                    let value = self.top0();
                    let name = self.top1();
                    self.pop_n(2);

                    let attr = if instr.op == Opcode::ConfigPropertySetWithAttr {
                        let a = self.top0();
                        self.pop();
                        a
                    } else {
                        Value::Null
                    };

                    let name = name.to_string_value().map_err(|e| vm_err(&prog, at, e))?;
                    if let Some(cfg) = self.config.as_mut() {
                        cfg.config_property(&name, value, attr)
                            .map_err(|e| vm_err(&prog, at, e))?;
                    }
                }

                Opcode::ConfigCommand | Opcode::ConfigCommandWithAttr => {
                    let argc = instr.arg as usize;
                    let name = self.top_n(argc);
                    let mut pop_size = argc + 1;

                    let attr = if instr.op == Opcode::ConfigCommandWithAttr {
                        pop_size += 1;
                        self.top_n(argc + 1)
                    } else {
                        Value::Null
                    };

                    let name = name.to_string_value().map_err(|e| vm_err(&prog, at, e))?;

                    // config receivers typically retain the arguments, so
                    // hand them an owned copy
                    let start = self.stack.len() - argc;
                    let args = self.stack[start..].to_vec();

                    if let Some(cfg) = self.config.as_mut() {
                        cfg.config_command(&name, args, attr)
                            .map_err(|e| vm_err(&prog, at, e))?;
                    }
                    self.pop_n(pop_size);
                }

                // calls
                Opcode::ICall => {
                    let argc = instr.arg as usize;
                    let callee = self.top_n(argc);
                    let Value::Int(idx) = callee else {
                        panic!("intrinsic callee must be an int index");
                    };
                    assert!(idx >= 0, "intrinsic index must be non-negative");

                    let intrinsic = intrinsics::get(idx as usize).ok_or_else(|| {
                        vm_err(
                            &prog,
                            at,
                            RuntimeError::Name(format!("unknown intrinsic index {}", idx)),
                        )
                    })?;

                    let start = self.stack.len() - argc;
                    let args = self.stack[start..].to_vec();

                    self.cur_frame.pc = pc;
                    self.prologue(FrameKind::Intrinsic, argc, None, None, None);

                    let r = intrinsic
                        .call(self, &args)
                        .map_err(|e| vm_err(&prog, at, e))?;

                    let (npc, nprog) = self.epilogue(r);
                    pc = npc;
                    prog = nprog.expect("intrinsic caller must be a script frame");
                }

                Opcode::LoadMethod => {
                    let recv = self.top0();
                    self.pop();
                    let name = prog.str_at(instr.arg);
                    let method = recv.method(&name).map_err(|e| vm_err(&prog, at, e))?;
                    self.push(method);
                }

                Opcode::SCall | Opcode::VCall => {
                    let argc = instr.arg as usize;
                    let callee = self.top_n(argc);
                    self.cur_frame.pc = pc;

                    if instr.op == Opcode::SCall {
                        let Value::Int(idx) = callee else {
                            panic!("scall callee must be a function-table index");
                        };
                        let md = prog.module().map_err(|e| vm_err(&prog, at, e))?;
                        let target = md.functions[idx as usize].clone();
                        assert!(
                            target.kind == ProgramKind::Function,
                            "scall target must be a free function"
                        );

                        self.prologue(FrameKind::Script, argc, Some(target.clone()), None, None);
                        if argc != target.arity {
                            return Err(vm_err(
                                &target,
                                at,
                                RuntimeError::Arity(
                                    "script function call, argument number mismatch".to_string(),
                                ),
                            ));
                        }
                        prog = target;
                        pc = 0;
                        continue;
                    }

                    match callee {
                        Value::Closure(Closure::Script(sf)) => {
                            self.prologue(
                                FrameKind::ScriptClosure,
                                argc,
                                Some(sf.prog.clone()),
                                Some(Closure::Script(sf.clone())),
                                None,
                            );
                            if argc != sf.prog.arity {
                                return Err(vm_err(
                                    &sf.prog,
                                    at,
                                    RuntimeError::Arity(
                                        "script function call, argument number mismatch"
                                            .to_string(),
                                    ),
                                ));
                            }
                            prog = sf.prog.clone();
                            pc = 0;
                        }

                        Value::Closure(Closure::Native(nf)) => {
                            let start = self.stack.len() - argc;
                            let args = self.stack[start..].to_vec();
                            self.prologue(
                                FrameKind::NativeClosure,
                                argc,
                                None,
                                Some(Closure::Native(nf.clone())),
                                None,
                            );
                            let r = (*nf.entry)(self, &args).map_err(|e| vm_err(&prog, at, e))?;
                            let (npc, nprog) = self.epilogue(r);
                            pc = npc;
                            prog = nprog.expect("native caller must be a script frame");
                        }

                        Value::Closure(Closure::Method(mf)) => {
                            let start = self.stack.len() - argc;
                            let args = self.stack[start..].to_vec();
                            self.prologue(
                                FrameKind::MethodClosure,
                                argc,
                                None,
                                Some(Closure::Method(mf.clone())),
                                None,
                            );
                            let r = closure::dispatch_method(self, &mf.receiver, &mf.name, &args)
                                .map_err(|e| vm_err(&prog, at, e))?;
                            let (npc, nprog) = self.epilogue(r);
                            pc = npc;
                            prog = nprog.expect("method caller must be a script frame");
                        }

                        other => {
                            return Err(vm_err(
                                &prog,
                                at,
                                RuntimeError::Type(format!(
                                    "object must be callable function, but got type: {}",
                                    other.kind_name()
                                )),
                            ))
                        }
                    }
                }

                Opcode::Return => {
                    let kind = self.cur_frame.kind;
                    let rv = self.top0();
                    let (npc, nprog) = self.epilogue(rv);
                    match nprog {
                        Some(p) if kind != FrameKind::ScriptIter => {
                            pc = npc;
                            prog = p;
                        }
                        _ => return Ok(RunState::Done(npc)),
                    }
                }

                // iterators
                Opcode::NewIterator => {
                    let t = self.top0();
                    self.pop();
                    let it = t.new_iterator().map_err(|e| vm_err(&prog, at, e))?;
                    self.push(Value::Iter(it));
                }

                Opcode::LoadIterator => {
                    let md = prog.module().map_err(|e| vm_err(&prog, at, e))?;
                    let target = md.functions[instr.arg as usize].clone();
                    if target.kind != ProgramKind::Iterator {
                        return Err(vm_err(
                            &prog,
                            at,
                            RuntimeError::Type(
                                "function cannot be loaded as iterator".to_string(),
                            ),
                        ));
                    }
                    let ups = self.capture_upvalues(&target.upvalues);
                    self.push(Value::Iter(ScriptIter::new(target, ups)));
                }

                Opcode::SetUpIterator => {
                    let argc = instr.arg as usize;
                    let target = self.top_n(argc);
                    let Value::Iter(it) = target else {
                        return Err(vm_err(
                            &prog,
                            at,
                            RuntimeError::Type(
                                "value is not iterator, cannot use iterator setup expression"
                                    .to_string(),
                            ),
                        ));
                    };
                    let start = self.stack.len() - argc;
                    let args = self.stack[start..].to_vec();
                    it.set_up(self, &args).map_err(|e| vm_err(&prog, at, e))?;
                    self.pop_n(argc);
                }

                Opcode::HasIterator => {
                    let Value::Iter(it) = self.top0() else {
                        panic!("has_iterator target must be an iterator");
                    };
                    self.push(Value::Bool(it.has()));
                }

                Opcode::DerefIterator => {
                    let Value::Iter(it) = self.top0() else {
                        panic!("deref_iterator target must be an iterator");
                    };
                    let (k, v) = it.deref().map_err(|e| vm_err(&prog, at, e))?;
                    self.push(k);
                    self.push(v);
                }

                Opcode::NextIterator => {
                    let Value::Iter(it) = self.top0() else {
                        panic!("next_iterator target must be an iterator");
                    };
                    let has = it.next(self).map_err(|e| vm_err(&prog, at, e))?;
                    self.push(Value::Bool(has));
                }

                // rule and event control
                Opcode::Halt => {
                    self.push(Value::Null);
                    return Ok(RunState::Halted);
                }

                Opcode::NextRule => return Ok(RunState::NextRule),

                Opcode::Yield => return Ok(RunState::Yield(pc)),

                Opcode::Emit => {
                    let context = self.top0();
                    let name = self.top1();
                    self.pop_n(2);
                    let Value::Str(name) = name else {
                        return Err(vm_err(
                            &prog,
                            at,
                            RuntimeError::Type("event name must be string".to_string()),
                        ));
                    };
                    self.emit_event(&name, context);
                }

                other => unreachable!("unhandled opcode {}", other.mnemonic()),
            }
        }
    }

    // exception unwind ------------------------------------------------------

    /// Walk frames after a failure. The innermost handler of a script frame
    /// wins; the breaker bounds how far the walk may discard frames.
    fn unwind(&mut self, breaker: impl Fn(&Frame) -> bool, err: &RuntimeError) -> Unwound {
        let mut backtrace = vec![self.cur_frame.snapshot()];

        loop {
            if self.cur_frame.is_script() {
                if let Some(h) = self.cur_frame.handlers.last().copied() {
                    self.stack.truncate(h.stack_size);
                    self.cur_frame.handlers.pop();
                    self.cur_frame.pc = h.pc;
                    self.cur_excep = Value::str(err.to_string());
                    let prog = self
                        .cur_frame
                        .prog
                        .clone()
                        .expect("script frame holds a program");
                    return Unwound::Recovered { pc: h.pc, prog };
                }
            }

            if self.cur_frame.is_top() || breaker(&self.cur_frame) {
                return Unwound::Surfaced { backtrace };
            }

            let prev = self.saved_frame_cell().borrow().clone();
            if !prev.is_top() {
                backtrace.push(prev.snapshot());
            }
            self.pop_frame(prev);
        }
    }

    // rule execution --------------------------------------------------------

    fn run_rule_impl(
        &mut self,
        event: Value,
        entry: &Arc<Program>,
        _module: &Module,
    ) -> std::result::Result<(Value, RuleFlow), EvalError> {
        debug!(rule = %entry.name, "evaluating rule");

        // the evaluator is reused between runs
        self.stack.clear();
        self.cur_excep = Value::Null;
        self.cur_frame = Frame::top();

        // callee identity slot for the rule frame, then the event argument
        self.push(Value::Null);
        self.push(event.clone());
        self.prologue(FrameKind::Rule, 1, Some(entry.clone()), None, None);
        self.cur_frame.event = event;

        let mut prog = entry.clone();
        let mut pc = 0usize;

        loop {
            match self.run(prog.clone(), pc) {
                Ok(RunState::Done(_)) => {
                    let ret = self.top0();
                    self.pop();
                    return Ok((ret, RuleFlow::Return));
                }
                Ok(RunState::Halted) => {
                    self.pop();
                    return Ok((Value::Null, RuleFlow::Halt));
                }
                Ok(RunState::NextRule) => return Ok((Value::Null, RuleFlow::Next)),
                Ok(RunState::Yield(_)) => {
                    return Err(report(
                        VmError {
                            prog: Some(prog),
                            pc,
                            error: RuntimeError::Internal(
                                "yield outside of a script iterator".to_string(),
                            ),
                        },
                        Vec::new(),
                    ))
                }
                Err(verr) => match self.unwind(|_| false, &verr.error) {
                    Unwound::Recovered { pc: npc, prog: nprog } => {
                        pc = npc;
                        prog = nprog;
                    }
                    Unwound::Surfaced { backtrace } => {
                        return Err(report(verr, backtrace));
                    }
                },
            }
        }
    }

    fn run_rule(
        &mut self,
        event: Value,
        entry: &Arc<Program>,
        module: &Module,
    ) -> std::result::Result<Value, EvalError> {
        let (v, _) = self.run_rule_impl(event, entry, module)?;
        Ok(v)
    }

    /// Run every rule registered for an event in registration order. A rule
    /// chains onward by returning null or issuing `nextRule`; a non-null
    /// return or a halt stops the chain.
    fn run_rule_list(
        &mut self,
        event: Value,
        rules: &[Arc<Program>],
        module: &Module,
    ) -> std::result::Result<Value, EvalError> {
        for entry in rules {
            let (v, flow) = self.run_rule_impl(event.clone(), entry, module)?;
            match flow {
                RuleFlow::Next => continue,
                RuleFlow::Halt => return Ok(Value::Null),
                RuleFlow::Return => {
                    if !v.is_null() {
                        return Ok(v);
                    }
                }
            }
        }
        Ok(Value::Null)
    }

    // host re-entry ---------------------------------------------------------

    /// Re-enter the VM through a script closure. Used by intrinsics and host
    /// code holding closure values.
    pub fn run_script_closure(
        &mut self,
        sfunc: &Rc<ScriptClosure>,
        args: &[Value],
    ) -> std::result::Result<Value, EvalError> {
        if args.len() != sfunc.prog.arity {
            return Err(EvalError::plain(RuntimeError::Arity(format!(
                "function call, argument number mismatch, want {} got {}",
                sfunc.prog.arity,
                args.len()
            ))));
        }

        self.push(Value::Closure(Closure::Script(sfunc.clone())));
        for a in args {
            self.push(a.clone());
        }
        self.prologue(
            FrameKind::ScriptClosure,
            args.len(),
            Some(sfunc.prog.clone()),
            Some(Closure::Script(sfunc.clone())),
            None,
        );

        let mut prog = sfunc.prog.clone();
        let mut pc = 0usize;

        loop {
            match self.run(prog.clone(), pc) {
                Ok(RunState::Done(_)) | Ok(RunState::Halted) => {
                    let ret = self.top0();
                    self.pop();
                    return Ok(ret);
                }
                Ok(_) => {
                    return Err(EvalError::plain(RuntimeError::Internal(
                        "yield or nextRule escaped a callback frame".to_string(),
                    )))
                }
                Err(verr) => {
                    let target = sfunc.clone();
                    let outcome = self.unwind(
                        move |f| matches!(f.script_closure(), Some(s) if Rc::ptr_eq(s, &target)),
                        &verr.error,
                    );
                    match outcome {
                        Unwound::Recovered { pc: npc, prog: nprog } => {
                            pc = npc;
                            prog = nprog;
                        }
                        Unwound::Surfaced { backtrace } => {
                            // the entered frame is still current; discard it
                            let prev = self.saved_frame_cell().borrow().clone();
                            self.pop_frame(prev);
                            return Err(report(verr, backtrace));
                        }
                    }
                }
            }
        }
    }

    /// Run a native closure on its own frame
    pub(crate) fn run_native_closure(
        &mut self,
        nfunc: &Rc<NativeClosure>,
        args: &[Value],
    ) -> Result<Value> {
        self.push(Value::Closure(Closure::Native(nfunc.clone())));
        for a in args {
            self.push(a.clone());
        }
        self.prologue(
            FrameKind::NativeClosure,
            args.len(),
            None,
            Some(Closure::Native(nfunc.clone())),
            None,
        );

        let result = (*nfunc.entry)(self, args);
        let ret = result.as_ref().ok().cloned().unwrap_or(Value::Null);
        self.epilogue(ret);
        self.pop();
        result
    }

    /// Run a method closure on its own frame
    pub(crate) fn run_method_closure(
        &mut self,
        mfunc: &Rc<MethodClosure>,
        args: &[Value],
    ) -> Result<Value> {
        self.push(Value::Closure(Closure::Method(mfunc.clone())));
        for a in args {
            self.push(a.clone());
        }
        self.prologue(
            FrameKind::MethodClosure,
            args.len(),
            None,
            Some(Closure::Method(mfunc.clone())),
            None,
        );

        let result = closure::dispatch_method(self, &mfunc.receiver, &mfunc.name, args);
        let ret = result.as_ref().ok().cloned().unwrap_or(Value::Null);
        self.epilogue(ret);
        self.pop();
        result
    }

    // script iterators ------------------------------------------------------

    /// First entry into a generator: build its frame on the private stack
    /// and run to the first `yield` or `return`
    pub(crate) fn iter_set_up(&mut self, it: &Rc<ScriptIter>, args: &[Value]) -> Result<()> {
        mem::swap(&mut self.stack, &mut *it.stack.borrow_mut());

        self.push(Value::Iter(it.clone()));
        for a in args {
            self.push(a.clone());
        }
        self.prologue(
            FrameKind::ScriptIter,
            args.len(),
            Some(it.prog.clone()),
            None,
            Some(it.clone()),
        );

        let result = self.iter_drive(it, 0, it.prog.clone());

        mem::swap(&mut self.stack, &mut *it.stack.borrow_mut());
        result.map(|_| ())
    }

    /// Resume a suspended generator until its next `yield` or `return`
    pub(crate) fn iter_next(&mut self, it: &Rc<ScriptIter>) -> Result<bool> {
        mem::swap(&mut self.stack, &mut *it.stack.borrow_mut());

        // the consumer frame parks inside the generator's marker slot so a
        // `return` restores it
        let caller = mem::replace(&mut self.cur_frame, it.frame.borrow().clone());
        *self.saved_frame_cell().borrow_mut() = caller;

        let prog = self
            .cur_frame
            .prog
            .clone()
            .expect("iterator frame holds a program");
        let result = self.iter_drive(it, it.pc.get(), prog);

        mem::swap(&mut self.stack, &mut *it.stack.borrow_mut());
        result
    }

    fn iter_drive(
        &mut self,
        it: &Rc<ScriptIter>,
        mut pc: usize,
        mut prog: Arc<Program>,
    ) -> Result<bool> {
        loop {
            match self.run(prog.clone(), pc) {
                Ok(RunState::Yield(npc)) => {
                    let v = self.top0();
                    self.pop();
                    it.on_yield(v);
                    it.pc.set(npc);

                    // park the generator frame, restore the consumer frame
                    let caller = self.saved_frame_cell().borrow().clone();
                    *it.frame.borrow_mut() = mem::replace(&mut self.cur_frame, caller);
                    return Ok(true);
                }

                Ok(RunState::Done(_)) | Ok(RunState::Halted) => {
                    self.pop();
                    if matches!(&self.cur_frame.iter, Some(i) if Rc::ptr_eq(i, it)) {
                        // a halt skips the return epilogue; restore the
                        // consumer frame by hand
                        let caller = self.saved_frame_cell().borrow().clone();
                        self.cur_frame = caller;
                    }
                    it.on_return();
                    return Ok(false);
                }

                Ok(RunState::NextRule) => {
                    return Err(RuntimeError::Internal(
                        "nextRule escaped an iterator frame".to_string(),
                    ))
                }

                Err(verr) => {
                    let target = it.clone();
                    let outcome = self.unwind(
                        move |f| matches!(&f.iter, Some(i) if Rc::ptr_eq(i, &target)),
                        &verr.error,
                    );
                    match outcome {
                        Unwound::Recovered { pc: npc, prog: nprog } => {
                            pc = npc;
                            prog = nprog;
                        }
                        Unwound::Surfaced { backtrace } => {
                            it.on_fail();
                            let caller = self.saved_frame_cell().borrow().clone();
                            self.cur_frame = caller;
                            return Err(RuntimeError::from(report(verr, backtrace)));
                        }
                    }
                }
            }
        }
    }

    // events ----------------------------------------------------------------

    /// Queue an event for dispatch after the current top-level run
    pub fn emit_event(&mut self, name: &str, context: Value) {
        trace!(event = name, "emit event");
        self.event_queue
            .borrow_mut()
            .on_event(name.to_string(), context);
    }

    /// Dispatch queued events in FIFO order. Re-entrant emits enqueue into
    /// the same drain; a drain never nests.
    pub fn drain_event_queue(&mut self, module: &Module) {
        if self.in_event_queue {
            return;
        }
        self.in_event_queue = true;

        let queue = self.event_queue.clone();
        let mut status = EventOutcome::Continue;

        loop {
            let next = queue.borrow_mut().pop_front();
            let Some(ev) = next else { break };

            trace!(event = %ev.name, "dispatch deferred event");
            if let Err(err) = self.eval_deferred(&ev.name, ev.context.clone(), module) {
                warn!(event = %ev.name, error = %err, "deferred event failed");
                status = match self.event.as_mut() {
                    Some(ctx) => ctx.on_event_error(&ev.name, &err),
                    None => EventOutcome::Continue,
                };
                if status != EventOutcome::Continue {
                    break;
                }
            }
        }

        if status == EventOutcome::StopAndClear {
            queue.borrow_mut().clear();
        }
        self.in_event_queue = false;
    }

    // module entry points ---------------------------------------------------

    /// Run the config program, delivering directives to the config receiver
    pub fn eval_config(&mut self, module: &Module) -> std::result::Result<(), EvalError> {
        let result = match module.config_program().cloned() {
            None => Ok(()),
            Some(_) if self.config.is_none() => Err(EvalError::plain(RuntimeError::Host(
                "evaluator's config receiver is not set".to_string(),
            ))),
            Some(prog) => self.run_rule(Value::Null, &prog, module).map(|_| ()),
        };
        self.drain_event_queue(module);
        result
    }

    /// Reset and re-populate the module's global store
    pub fn eval_global(&mut self, module: &Module) -> std::result::Result<(), EvalError> {
        let result = (|| {
            if !module.has_global() {
                return Ok(());
            }
            module.global().reset();
            for prog in module.global_programs().to_vec() {
                self.run_rule(Value::Null, &prog, module)?;
            }
            Ok(())
        })();
        self.drain_event_queue(module);
        result
    }

    /// Reset and re-populate this evaluator's session slots
    pub fn eval_session(&mut self, module: &Module) -> std::result::Result<(), EvalError> {
        let result = (|| {
            if !module.has_session() {
                return Ok(());
            }
            self.session.clear();
            for prog in module.session_programs().to_vec() {
                self.run_rule(Value::Null, &prog, module)?;
            }
            Ok(())
        })();
        self.drain_event_queue(module);
        result
    }

    /// Evaluate an event with a null context
    pub fn eval(&mut self, event: &str, module: &Module) -> std::result::Result<Value, EvalError> {
        self.eval_with_context(event, Value::Null, module)
    }

    /// Evaluate every rule registered for an event, then drain the queue
    pub fn eval_with_context(
        &mut self,
        event: &str,
        context: Value,
        module: &Module,
    ) -> std::result::Result<Value, EvalError> {
        let result = match module.find_event(event) {
            Some(rules) => {
                let rules = rules.to_vec();
                self.run_rule_list(context, &rules, module)
            }
            None => Ok(Value::Null),
        };
        self.drain_event_queue(module);
        result
    }

    /// Evaluate an event without draining afterwards; this is the dispatch
    /// path used while a drain is already running
    pub fn eval_deferred(
        &mut self,
        event: &str,
        context: Value,
        module: &Module,
    ) -> std::result::Result<Value, EvalError> {
        match module.find_event(event) {
            Some(rules) => {
                let rules = rules.to_vec();
                self.run_rule_list(context, &rules, module)
            }
            None => Ok(Value::Null),
        }
    }
}
