//! Bytecode representation
//!
//! A compiled program is a flat array of single-argument instructions with an
//! aligned source-location array. The argument meaning depends on the opcode:
//! a constant-pool index, a jump target, a slot number, an argument count or a
//! function-table index.

use std::fmt;

/// The closed instruction set of the PL virtual machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    // stack
    Pop,
    Dup1,
    Dup2,
    Swap,

    // constants
    LoadInt,
    LoadReal,
    LoadStr,
    LoadRegexp,
    LoadTrue,
    LoadFalse,
    LoadNull,

    // arithmetic and comparison
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    RegexpMatch,
    RegexpNMatch,
    Not,
    Negate,

    // control flow
    Jump,
    JTrue,
    JFalse,
    And,
    Or,
    Ternary,
    Filter,

    // variables
    LoadLocal,
    StoreLocal,
    ReserveLocal,
    LoadUpvalue,
    StoreUpvalue,
    LoadVar,
    StoreVar,
    LoadDollar,
    LoadGlobal,
    StoreGlobal,
    SetGlobal,
    LoadSession,
    StoreSession,
    SetSession,

    // containers
    NewList,
    AddList,
    NewMap,
    AddMap,
    NewPair,
    Index,
    IndexSet,
    Dot,
    DotSet,

    // calls
    ICall,
    SCall,
    VCall,
    LoadMethod,
    Return,

    // closures
    NewClosure,

    // iterators
    LoadIterator,
    SetUpIterator,
    NewIterator,
    HasIterator,
    DerefIterator,
    NextIterator,

    // exceptions
    PushException,
    PopException,
    LoadException,

    // strings and templates
    ToStr,
    ConStr,
    Template,

    // rule and event control
    Halt,
    NextRule,
    Yield,
    Emit,
    Action,

    // configuration directives
    ConfigPush,
    ConfigPushWithAttr,
    ConfigPop,
    ConfigPropertySet,
    ConfigPropertySetWithAttr,
    ConfigCommand,
    ConfigCommandWithAttr,
}

impl Opcode {
    /// Mnemonic used by the disassembler and frame dumps
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::Pop => "pop",
            Opcode::Dup1 => "dup1",
            Opcode::Dup2 => "dup2",
            Opcode::Swap => "swap",
            Opcode::LoadInt => "load_int",
            Opcode::LoadReal => "load_real",
            Opcode::LoadStr => "load_str",
            Opcode::LoadRegexp => "load_regexp",
            Opcode::LoadTrue => "load_true",
            Opcode::LoadFalse => "load_false",
            Opcode::LoadNull => "load_null",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Mod => "mod",
            Opcode::Pow => "pow",
            Opcode::Lt => "lt",
            Opcode::Le => "le",
            Opcode::Gt => "gt",
            Opcode::Ge => "ge",
            Opcode::Eq => "eq",
            Opcode::Ne => "ne",
            Opcode::RegexpMatch => "regexp_match",
            Opcode::RegexpNMatch => "regexp_nmatch",
            Opcode::Not => "not",
            Opcode::Negate => "negate",
            Opcode::Jump => "jump",
            Opcode::JTrue => "jtrue",
            Opcode::JFalse => "jfalse",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Ternary => "ternary",
            Opcode::Filter => "filter",
            Opcode::LoadLocal => "load_local",
            Opcode::StoreLocal => "store_local",
            Opcode::ReserveLocal => "reserve_local",
            Opcode::LoadUpvalue => "load_upvalue",
            Opcode::StoreUpvalue => "store_upvalue",
            Opcode::LoadVar => "load_var",
            Opcode::StoreVar => "store_var",
            Opcode::LoadDollar => "load_dollar",
            Opcode::LoadGlobal => "load_global",
            Opcode::StoreGlobal => "store_global",
            Opcode::SetGlobal => "set_global",
            Opcode::LoadSession => "load_session",
            Opcode::StoreSession => "store_session",
            Opcode::SetSession => "set_session",
            Opcode::NewList => "new_list",
            Opcode::AddList => "add_list",
            Opcode::NewMap => "new_map",
            Opcode::AddMap => "add_map",
            Opcode::NewPair => "new_pair",
            Opcode::Index => "index",
            Opcode::IndexSet => "index_set",
            Opcode::Dot => "dot",
            Opcode::DotSet => "dot_set",
            Opcode::ICall => "icall",
            Opcode::SCall => "scall",
            Opcode::VCall => "vcall",
            Opcode::LoadMethod => "load_method",
            Opcode::Return => "return",
            Opcode::NewClosure => "new_closure",
            Opcode::LoadIterator => "load_iterator",
            Opcode::SetUpIterator => "setup_iterator",
            Opcode::NewIterator => "new_iterator",
            Opcode::HasIterator => "has_iterator",
            Opcode::DerefIterator => "deref_iterator",
            Opcode::NextIterator => "next_iterator",
            Opcode::PushException => "push_exception",
            Opcode::PopException => "pop_exception",
            Opcode::LoadException => "load_exception",
            Opcode::ToStr => "to_str",
            Opcode::ConStr => "con_str",
            Opcode::Template => "template",
            Opcode::Halt => "halt",
            Opcode::NextRule => "next_rule",
            Opcode::Yield => "yield",
            Opcode::Emit => "emit",
            Opcode::Action => "action",
            Opcode::ConfigPush => "config_push",
            Opcode::ConfigPushWithAttr => "config_push_attr",
            Opcode::ConfigPop => "config_pop",
            Opcode::ConfigPropertySet => "config_property_set",
            Opcode::ConfigPropertySetWithAttr => "config_property_set_attr",
            Opcode::ConfigCommand => "config_command",
            Opcode::ConfigCommandWithAttr => "config_command_attr",
        }
    }

    /// True for the binary arithmetic/comparison family dispatched as a group
    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::Pow
                | Opcode::Lt
                | Opcode::Le
                | Opcode::Gt
                | Opcode::Ge
                | Opcode::Eq
                | Opcode::Ne
                | Opcode::RegexpMatch
                | Opcode::RegexpNMatch
        )
    }

    /// Symbol used in operand-mismatch error messages
    pub fn operator_symbol(&self) -> &'static str {
        match self {
            Opcode::Add => "+",
            Opcode::Sub => "-",
            Opcode::Mul => "*",
            Opcode::Div => "/",
            Opcode::Mod => "%",
            Opcode::Pow => "**",
            Opcode::Lt => "<",
            Opcode::Le => "<=",
            Opcode::Gt => ">",
            Opcode::Ge => ">=",
            Opcode::Eq => "==",
            Opcode::Ne => "!=",
            Opcode::RegexpMatch => "~",
            Opcode::RegexpNMatch => "!~",
            _ => self.mnemonic(),
        }
    }
}

/// A single bytecode instruction
#[derive(Debug, Clone, Copy)]
pub struct Instr {
    /// Operation to perform
    pub op: Opcode,

    /// Operand; meaning depends on the opcode
    pub arg: u32,
}

impl Instr {
    pub fn new(op: Opcode, arg: u32) -> Self {
        Instr { op, arg }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op.mnemonic(), self.arg)
    }
}

/// Source location attached to one instruction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceLoc {
    pub line: u32,
    pub column: u32,
}

impl SourceLoc {
    pub fn new(line: u32, column: u32) -> Self {
        SourceLoc { line, column }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "around line {}:{}", self.line, self.column)
    }
}
