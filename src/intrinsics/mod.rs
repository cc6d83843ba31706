//! Intrinsic functions
//!
//! Intrinsics are built-in callables addressed by index from `iCall` and by
//! `module::name` from `loadVar`. The table is built once at startup and is
//! read-only afterwards, so evaluators on different threads can dispatch
//! without coordination.
//!
//! Each entry declares a signature such as `"{%l%c}{%m%c}"`: one brace group
//! per overload (braces optional for a single overload), one `%` code per
//! argument, and a trailing `*` repeating the previous code zero or more
//! times.

pub mod query;
pub mod re;

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::error::{Result, RuntimeError};
use crate::eval::Evaluator;
use crate::value::Value;

/// Entry point of an intrinsic
pub type IntrinsicFn = fn(&Intrinsic, &mut Evaluator, &[Value]) -> Result<Value>;

/// Argument kind codes accepted by signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgKind {
    Int,
    Real,
    Bool,
    Str,
    Regexp,
    List,
    Map,
    Pair,
    Closure,
    Any,
}

impl ArgKind {
    fn from_code(c: char) -> Option<ArgKind> {
        match c {
            'd' => Some(ArgKind::Int),
            'f' => Some(ArgKind::Real),
            'b' => Some(ArgKind::Bool),
            's' => Some(ArgKind::Str),
            'r' => Some(ArgKind::Regexp),
            'l' => Some(ArgKind::List),
            'm' => Some(ArgKind::Map),
            'p' => Some(ArgKind::Pair),
            'c' => Some(ArgKind::Closure),
            'a' => Some(ArgKind::Any),
            _ => None,
        }
    }

    fn matches(&self, v: &Value) -> bool {
        match self {
            ArgKind::Int => v.is_int(),
            ArgKind::Real => v.is_real(),
            ArgKind::Bool => matches!(v, Value::Bool(_)),
            ArgKind::Str => v.is_string(),
            ArgKind::Regexp => matches!(v, Value::Regexp(_)),
            ArgKind::List => v.is_list(),
            ArgKind::Map => v.is_map(),
            ArgKind::Pair => v.is_pair(),
            ArgKind::Closure => v.is_closure(),
            ArgKind::Any => true,
        }
    }
}

/// One signature alternative
#[derive(Debug, Clone)]
struct Overload {
    codes: Vec<ArgKind>,
    variadic: Option<ArgKind>,
}

impl Overload {
    fn matches(&self, args: &[Value]) -> bool {
        match self.variadic {
            None => {
                args.len() == self.codes.len()
                    && self.codes.iter().zip(args).all(|(k, v)| k.matches(v))
            }
            Some(tail) => {
                args.len() >= self.codes.len()
                    && self.codes.iter().zip(args).all(|(k, v)| k.matches(v))
                    && args[self.codes.len()..].iter().all(|v| tail.matches(v))
            }
        }
    }

    fn arity_accepts(&self, n: usize) -> bool {
        match self.variadic {
            None => n == self.codes.len(),
            Some(_) => n >= self.codes.len(),
        }
    }
}

/// Signatures are written by hand at registration time; a malformed one is a
/// programmer error, so parsing panics instead of returning.
fn parse_signature(sig: &str) -> Vec<Overload> {
    fn parse_group(group: &str, sig: &str) -> Overload {
        let mut codes = Vec::new();
        let mut variadic = None;
        let mut chars = group.chars().peekable();
        while let Some(c) = chars.next() {
            assert!(c == '%', "bad signature '{}': expected %, got '{}'", sig, c);
            let code = chars
                .next()
                .and_then(ArgKind::from_code)
                .unwrap_or_else(|| panic!("bad signature '{}': unknown code", sig));
            if chars.peek() == Some(&'*') {
                chars.next();
                assert!(
                    chars.peek().is_none(),
                    "bad signature '{}': * must be last",
                    sig
                );
                variadic = Some(code);
            } else {
                codes.push(code);
            }
        }
        Overload { codes, variadic }
    }

    if !sig.starts_with('{') {
        return vec![parse_group(sig, sig)];
    }

    let mut overloads = Vec::new();
    let mut rest = sig;
    while !rest.is_empty() {
        assert!(rest.starts_with('{'), "bad signature '{}'", sig);
        let close = rest.find('}').unwrap_or_else(|| panic!("bad signature '{}'", sig));
        overloads.push(parse_group(&rest[1..close], sig));
        rest = &rest[close + 1..];
    }
    overloads
}

/// One registered intrinsic
pub struct Intrinsic {
    pub module: &'static str,
    pub name: &'static str,
    pub signature: &'static str,
    overloads: Vec<Overload>,
    entry: IntrinsicFn,
}

impl Intrinsic {
    /// Fully qualified `module::name`
    pub fn full_name(&self) -> String {
        if self.module.is_empty() {
            self.name.to_string()
        } else {
            format!("{}::{}", self.module, self.name)
        }
    }

    /// Validate arguments against the signature; returns the index of the
    /// matched overload
    pub fn check(&self, args: &[Value]) -> Result<usize> {
        for (idx, ov) in self.overloads.iter().enumerate() {
            if ov.matches(args) {
                return Ok(idx);
            }
        }
        if self.overloads.iter().any(|ov| ov.arity_accepts(args.len())) {
            Err(RuntimeError::Type(format!(
                "{}: invalid argument types, signature is {}",
                self.full_name(),
                self.signature
            )))
        } else {
            Err(RuntimeError::Arity(format!(
                "{}: invalid number of arguments, signature is {}",
                self.full_name(),
                self.signature
            )))
        }
    }

    pub fn call(&self, eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
        (self.entry)(self, eval, args)
    }
}

/// The process-wide intrinsic table
pub struct IntrinsicTable {
    list: Vec<Intrinsic>,
    by_name: HashMap<String, usize>,
}

impl IntrinsicTable {
    fn new() -> Self {
        IntrinsicTable {
            list: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        module: &'static str,
        name: &'static str,
        signature: &'static str,
        entry: IntrinsicFn,
    ) {
        let intrinsic = Intrinsic {
            module,
            name,
            signature,
            overloads: parse_signature(signature),
            entry,
        };
        let full = intrinsic.full_name();
        assert!(
            !self.by_name.contains_key(&full),
            "intrinsic {} registered twice",
            full
        );
        self.by_name.insert(full, self.list.len());
        self.list.push(intrinsic);
    }

    pub fn get(&self, idx: usize) -> Option<&Intrinsic> {
        self.list.get(idx)
    }

    pub fn find(&self, name: &str) -> Option<(usize, &Intrinsic)> {
        self.by_name.get(name).map(|idx| (*idx, &self.list[*idx]))
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

lazy_static! {
    /// Built once on first use, read-only afterwards
    pub static ref INTRINSICS: IntrinsicTable = {
        let mut table = IntrinsicTable::new();
        query::register(&mut table);
        re::register(&mut table);
        table
    };
}

/// Table lookup by `iCall` index
pub fn get(idx: usize) -> Option<&'static Intrinsic> {
    INTRINSICS.get(idx)
}

/// Table lookup by fully qualified name
pub fn find(name: &str) -> Option<(usize, &'static Intrinsic)> {
    INTRINSICS.find(name)
}
