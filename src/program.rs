//! Compiled units
//!
//! A [`Module`] is the immutable output of the front end: a function table,
//! constant pools, categorised entry points and a [`GlobalStore`]. The front
//! end itself is an external collaborator; [`ModuleBuilder`] and
//! [`ProgramBuilder`] are the construction surface it (and the test suite)
//! uses.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use indexmap::IndexMap;
use regex::Regex;

use crate::bytecode::{Instr, Opcode, SourceLoc};
use crate::error::{Result, RuntimeError};
use crate::template::{self, Template};
use crate::value::Value;

/// What role a program plays inside its module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramKind {
    Rule,
    Function,
    Iterator,
    Config,
    Session,
    Global,
}

/// How a closure captures one upvalue: from the live local slot of the
/// enclosing frame, or forwarded from the enclosing closure's own captures
#[derive(Debug, Clone, Copy)]
pub struct UpvalueDesc {
    pub on_stack: bool,
    pub index: usize,
}

/// Constant pools shared by a module and all of its programs
pub struct ConstPool {
    pub(crate) ints: Vec<i64>,
    pub(crate) reals: Vec<f64>,
    pub(crate) strings: Vec<Arc<str>>,
    pub(crate) regexps: Vec<Arc<Regex>>,
    pub(crate) templates: Vec<Box<dyn Template>>,
}

/// One compiled function, rule or generator body
pub struct Program {
    pub name: String,
    pub kind: ProgramKind,

    /// Declared parameter count
    pub arity: usize,

    /// Locals beyond the parameters, reserved by the emitter
    pub local_count: usize,

    pub code: Vec<Instr>,

    /// Source locations aligned to `code`
    pub debug: Vec<SourceLoc>,

    /// Capture plan for `newClosure`/`loadIterator`
    pub upvalues: Vec<UpvalueDesc>,

    pool: Arc<ConstPool>,
    module: Weak<ModuleData>,
}

impl Program {
    pub fn int_at(&self, idx: u32) -> i64 {
        self.pool.ints[idx as usize]
    }

    pub fn real_at(&self, idx: u32) -> f64 {
        self.pool.reals[idx as usize]
    }

    pub fn str_at(&self, idx: u32) -> Arc<str> {
        self.pool.strings[idx as usize].clone()
    }

    pub fn regexp_at(&self, idx: u32) -> Arc<Regex> {
        self.pool.regexps[idx as usize].clone()
    }

    pub fn template_at(&self, idx: u32) -> &dyn Template {
        self.pool.templates[idx as usize].as_ref()
    }

    pub fn location_at(&self, pc: usize) -> Option<SourceLoc> {
        self.debug.get(pc).copied()
    }

    /// The owning module. Fails if the module was unloaded while a closure
    /// kept this program alive.
    pub(crate) fn module(&self) -> Result<Arc<ModuleData>> {
        self.module
            .upgrade()
            .ok_or_else(|| RuntimeError::Internal("module has been unloaded".to_string()))
    }
}

/// The immutable compiled module
pub(crate) struct ModuleData {
    pub(crate) functions: Vec<Arc<Program>>,
    pub(crate) events: IndexMap<String, Vec<Arc<Program>>>,
    pub(crate) config: Option<Arc<Program>>,
    pub(crate) session: Vec<Arc<Program>>,
    pub(crate) globals: Vec<Arc<Program>>,
    pub(crate) global: GlobalStore,
}

/// Shared handle to a compiled module
#[derive(Clone)]
pub struct Module {
    data: Arc<ModuleData>,
}

impl Module {
    /// Rule programs registered for an event, in registration order
    pub fn find_event(&self, name: &str) -> Option<&[Arc<Program>]> {
        self.data.events.get(name).map(|v| v.as_slice())
    }

    pub fn has_config(&self) -> bool {
        self.data.config.is_some()
    }

    pub fn has_session(&self) -> bool {
        !self.data.session.is_empty()
    }

    pub fn has_global(&self) -> bool {
        !self.data.globals.is_empty()
    }

    /// Registered event names in registration order
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.data.events.keys().map(|k| k.as_str())
    }

    pub fn function_at(&self, idx: usize) -> Option<&Arc<Program>> {
        self.data.functions.get(idx)
    }

    pub fn global(&self) -> &GlobalStore {
        &self.data.global
    }

    pub(crate) fn config_program(&self) -> Option<&Arc<Program>> {
        self.data.config.as_ref()
    }

    pub(crate) fn session_programs(&self) -> &[Arc<Program>] {
        &self.data.session
    }

    pub(crate) fn global_programs(&self) -> &[Arc<Program>] {
        &self.data.globals
    }
}

/// The immutable-kind subset storable in a [`GlobalStore`]
#[derive(Debug, Clone)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(Arc<str>),
}

impl Scalar {
    /// Convert a value if it has an immutable kind
    pub fn from_value(v: &Value) -> Option<Scalar> {
        match v {
            Value::Null => Some(Scalar::Null),
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::Int(i) => Some(Scalar::Int(*i)),
            Value::Real(r) => Some(Scalar::Real(*r)),
            Value::Str(s) => Some(Scalar::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(i) => Value::Int(*i),
            Scalar::Real(r) => Value::Real(*r),
            Scalar::Str(s) => Value::Str(s.clone()),
        }
    }
}

/// Module-level storage restricted to immutable kinds. The restriction is
/// what makes sharing one module across evaluators on different threads
/// sound, so the slots live behind a lock.
pub struct GlobalStore {
    slots: RwLock<Vec<Scalar>>,
}

impl GlobalStore {
    pub fn new() -> Self {
        GlobalStore {
            slots: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.read().expect("global store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a value; false if the value is not an immutable kind
    pub fn add(&self, v: &Value) -> bool {
        match Scalar::from_value(v) {
            Some(s) => {
                self.slots.write().expect("global store lock").push(s);
                true
            }
            None => false,
        }
    }

    /// Overwrite a slot; false on a bad index or a non-immutable value
    pub fn store(&self, idx: usize, v: &Value) -> bool {
        let Some(s) = Scalar::from_value(v) else {
            return false;
        };
        let mut slots = self.slots.write().expect("global store lock");
        match slots.get_mut(idx) {
            Some(slot) => {
                *slot = s;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, idx: usize) -> Option<Value> {
        self.slots
            .read()
            .expect("global store lock")
            .get(idx)
            .map(Scalar::to_value)
    }

    /// Drop every slot; global programs re-populate on evaluation
    pub fn reset(&self) {
        self.slots.write().expect("global store lock").clear();
    }
}

impl Default for GlobalStore {
    fn default() -> Self {
        GlobalStore::new()
    }
}

/// Incremental assembly of one program body
pub struct ProgramBuilder {
    name: String,
    kind: ProgramKind,
    arity: usize,
    local_count: usize,
    code: Vec<Instr>,
    debug: Vec<SourceLoc>,
    upvalues: Vec<UpvalueDesc>,
    cur_loc: SourceLoc,
}

impl ProgramBuilder {
    pub fn new(name: impl Into<String>, kind: ProgramKind, arity: usize) -> Self {
        ProgramBuilder {
            name: name.into(),
            kind,
            arity,
            local_count: 0,
            code: Vec::new(),
            debug: Vec::new(),
            upvalues: Vec::new(),
            cur_loc: SourceLoc::default(),
        }
    }

    /// Set the source location attached to subsequently emitted instructions
    pub fn at(&mut self, line: u32, column: u32) -> &mut Self {
        self.cur_loc = SourceLoc::new(line, column);
        self
    }

    /// Emit an instruction with an operand
    pub fn emit(&mut self, op: Opcode, arg: u32) -> &mut Self {
        self.code.push(Instr::new(op, arg));
        self.debug.push(self.cur_loc);
        self
    }

    /// Emit an instruction without an operand
    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.emit(op, 0)
    }

    /// Position of the next instruction; used as a jump target or with
    /// [`ProgramBuilder::patch`]
    pub fn pos(&self) -> usize {
        self.code.len()
    }

    /// Rewrite the operand of an already emitted instruction
    pub fn patch(&mut self, at: usize, arg: u32) -> &mut Self {
        self.code[at].arg = arg;
        self
    }

    /// Declare one upvalue capture
    pub fn upvalue(&mut self, on_stack: bool, index: usize) -> &mut Self {
        self.upvalues.push(UpvalueDesc { on_stack, index });
        self
    }

    /// Declare how many locals beyond the parameters the body uses
    pub fn locals(&mut self, n: usize) -> &mut Self {
        self.local_count = n;
        self
    }

    fn build(self, pool: Arc<ConstPool>, module: Weak<ModuleData>) -> Arc<Program> {
        Arc::new(Program {
            name: self.name,
            kind: self.kind,
            arity: self.arity,
            local_count: self.local_count,
            code: self.code,
            debug: self.debug,
            upvalues: self.upvalues,
            pool,
            module,
        })
    }
}

/// Assembles constant pools, programs and entry points into a [`Module`]
pub struct ModuleBuilder {
    ints: Vec<i64>,
    int_idx: HashMap<i64, u32>,
    reals: Vec<f64>,
    real_idx: HashMap<u64, u32>,
    strings: Vec<Arc<str>>,
    string_idx: HashMap<String, u32>,
    regexps: Vec<Arc<Regex>>,
    regexp_idx: HashMap<String, u32>,
    templates: Vec<Box<dyn Template>>,
    functions: Vec<ProgramBuilder>,
    rules: Vec<(String, ProgramBuilder)>,
    config: Option<ProgramBuilder>,
    session: Vec<ProgramBuilder>,
    globals: Vec<ProgramBuilder>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        ModuleBuilder {
            ints: Vec::new(),
            int_idx: HashMap::new(),
            reals: Vec::new(),
            real_idx: HashMap::new(),
            strings: Vec::new(),
            string_idx: HashMap::new(),
            regexps: Vec::new(),
            regexp_idx: HashMap::new(),
            templates: Vec::new(),
            functions: Vec::new(),
            rules: Vec::new(),
            config: None,
            session: Vec::new(),
            globals: Vec::new(),
        }
    }

    /// Intern an int constant
    pub fn int(&mut self, v: i64) -> u32 {
        if let Some(idx) = self.int_idx.get(&v) {
            return *idx;
        }
        let idx = self.ints.len() as u32;
        self.ints.push(v);
        self.int_idx.insert(v, idx);
        idx
    }

    /// Intern a real constant
    pub fn real(&mut self, v: f64) -> u32 {
        if let Some(idx) = self.real_idx.get(&v.to_bits()) {
            return *idx;
        }
        let idx = self.reals.len() as u32;
        self.reals.push(v);
        self.real_idx.insert(v.to_bits(), idx);
        idx
    }

    /// Intern a string constant
    pub fn str(&mut self, v: &str) -> u32 {
        if let Some(idx) = self.string_idx.get(v) {
            return *idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(Arc::from(v));
        self.string_idx.insert(v.to_string(), idx);
        idx
    }

    /// Compile and intern a regex constant
    pub fn regexp(&mut self, pattern: &str) -> Result<u32> {
        if let Some(idx) = self.regexp_idx.get(pattern) {
            return Ok(*idx);
        }
        let re = Regex::new(pattern)
            .map_err(|e| RuntimeError::Type(format!("invalid regexp literal: {}", e)))?;
        let idx = self.regexps.len() as u32;
        self.regexps.push(Arc::new(re));
        self.regexp_idx.insert(pattern.to_string(), idx);
        Ok(idx)
    }

    /// Compile a template through the factory registry and intern it
    pub fn template(&mut self, engine: &str, name: &str, source: &str, opts: &Value) -> Result<u32> {
        let mut tpl = template::new_template(engine).ok_or_else(|| {
            RuntimeError::Template(format!("template engine '{}' is not registered", engine))
        })?;
        tpl.compile(name, source, opts)?;
        let idx = self.templates.len() as u32;
        self.templates.push(tpl);
        Ok(idx)
    }

    /// Register a callable function or generator body; returns its
    /// function-table index used by `sCall`, `newClosure` and `loadIterator`
    pub fn function(&mut self, pb: ProgramBuilder) -> u32 {
        let idx = self.functions.len() as u32;
        self.functions.push(pb);
        idx
    }

    /// Register a rule program for an event; rules sharing one event run in
    /// registration order
    pub fn rule(&mut self, event: &str, mut pb: ProgramBuilder) {
        pb.kind = ProgramKind::Rule;
        self.rules.push((event.to_string(), pb));
    }

    pub fn config(&mut self, mut pb: ProgramBuilder) {
        pb.kind = ProgramKind::Config;
        self.config = Some(pb);
    }

    pub fn session(&mut self, mut pb: ProgramBuilder) {
        pb.kind = ProgramKind::Session;
        self.session.push(pb);
    }

    pub fn global(&mut self, mut pb: ProgramBuilder) {
        pb.kind = ProgramKind::Global;
        self.globals.push(pb);
    }

    pub fn build(self) -> Module {
        let pool = Arc::new(ConstPool {
            ints: self.ints,
            reals: self.reals,
            strings: self.strings,
            regexps: self.regexps,
            templates: self.templates,
        });

        let functions = self.functions;
        let rules = self.rules;
        let config = self.config;
        let session = self.session;
        let globals = self.globals;

        let data = Arc::new_cyclic(|weak: &Weak<ModuleData>| {
            let functions = functions
                .into_iter()
                .map(|pb| pb.build(pool.clone(), weak.clone()))
                .collect();

            let mut events: IndexMap<String, Vec<Arc<Program>>> = IndexMap::new();
            for (event, pb) in rules {
                events
                    .entry(event)
                    .or_default()
                    .push(pb.build(pool.clone(), weak.clone()));
            }

            ModuleData {
                functions,
                events,
                config: config.map(|pb| pb.build(pool.clone(), weak.clone())),
                session: session
                    .into_iter()
                    .map(|pb| pb.build(pool.clone(), weak.clone()))
                    .collect(),
                globals: globals
                    .into_iter()
                    .map(|pb| pb.build(pool.clone(), weak.clone()))
                    .collect(),
                global: GlobalStore::new(),
            }
        });

        Module { data }
    }
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        ModuleBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_interning() {
        let mut mb = ModuleBuilder::new();
        assert_eq!(mb.int(10), mb.int(10));
        assert_ne!(mb.int(10), mb.int(11));
        assert_eq!(mb.str("x"), mb.str("x"));
        assert_eq!(mb.real(2.5), mb.real(2.5));
        assert!(mb.regexp("[").is_err(), "invalid regex must be rejected");
    }

    #[test]
    fn test_global_store_immutability() {
        let g = GlobalStore::new();
        assert!(g.add(&Value::Int(1)));
        assert!(g.add(&Value::str("s")));
        assert!(!g.add(&Value::list(vec![])), "containers are not storable");

        assert!(g.store(0, &Value::Bool(true)));
        assert!(!g.store(0, &Value::map()), "containers are not storable");
        assert!(!g.store(9, &Value::Int(1)), "bad index must fail");

        assert_eq!(g.get(0), Some(Value::Bool(true)));
        assert_eq!(g.get(9), None);

        g.reset();
        assert!(g.is_empty());
    }

    #[test]
    fn test_rule_registration_order() {
        let mut mb = ModuleBuilder::new();
        let mut a = ProgramBuilder::new("a", ProgramKind::Rule, 1);
        a.op(Opcode::LoadNull).op(Opcode::Return);
        let mut b = ProgramBuilder::new("b", ProgramKind::Rule, 1);
        b.op(Opcode::LoadNull).op(Opcode::Return);
        mb.rule("e", a);
        mb.rule("e", b);
        let module = mb.build();

        let rules = module.find_event("e").expect("event must be registered");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name, "a");
        assert_eq!(rules[1].name, "b");
        assert!(module.find_event("missing").is_none());
    }
}
