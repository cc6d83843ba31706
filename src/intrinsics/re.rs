//! The `re::` regex module
//!
//! Thin wrappers over the `regex` crate working on regexp values produced by
//! `re::new` or regexp literals.

use std::sync::Arc;

use regex::Regex;

use crate::error::{Result, RuntimeError};
use crate::eval::Evaluator;
use crate::intrinsics::{Intrinsic, IntrinsicTable};
use crate::value::Value;

pub(super) fn register(table: &mut IntrinsicTable) {
    table.register("re", "new", "%s", re_new);
    table.register("re", "match", "%r%s", re_match);
    table.register("re", "find", "%r%s", re_find);
    table.register("re", "find_all", "%r%s%d", re_find_all);
    table.register("re", "replace_all", "%r%s%s", re_replace_all);
    table.register("re", "split", "%r%s", re_split);
}

fn operands<'a>(args: &'a [Value]) -> (&'a Arc<Regex>, &'a str) {
    match (&args[0], &args[1]) {
        (Value::Regexp(r), Value::Str(s)) => (r, s.as_ref()),
        _ => unreachable!("re:: operands checked"),
    }
}

fn re_new(info: &Intrinsic, _eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    let Value::Str(pattern) = &args[0] else {
        unreachable!("re::new operand checked");
    };
    let re = Regex::new(pattern)
        .map_err(|e| RuntimeError::Type(format!("invalid regexp: {}", e)))?;
    Ok(Value::Regexp(Arc::new(re)))
}

fn re_match(info: &Intrinsic, _eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    let (re, s) = operands(args);
    Ok(Value::Bool(re.is_match(s)))
}

fn re_find(info: &Intrinsic, _eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    let (re, s) = operands(args);
    Ok(Value::str(
        re.find(s).map(|m| m.as_str()).unwrap_or_default(),
    ))
}

fn re_find_all(info: &Intrinsic, _eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    let (re, s) = operands(args);
    let Value::Int(limit) = args[2] else {
        unreachable!("re::find_all limit checked");
    };

    let mut out = Vec::new();
    for m in re.find_iter(s) {
        if limit >= 0 && out.len() as i64 >= limit {
            break;
        }
        out.push(Value::str(m.as_str()));
    }
    Ok(Value::list(out))
}

fn re_replace_all(info: &Intrinsic, _eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    let (re, s) = operands(args);
    let Value::Str(rep) = &args[2] else {
        unreachable!("re::replace_all replacement checked");
    };
    Ok(Value::str(re.replace_all(s, rep.as_ref()).into_owned()))
}

fn re_split(info: &Intrinsic, _eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    let (re, s) = operands(args);
    Ok(Value::list(re.split(s).map(Value::str).collect()))
}
