//! The `q::` query module
//!
//! List/map pipeline helpers: anchors (`first`/`last`/`rest`), projection
//! (`select`/`slice`), map/reduce (`map`/`filter`/`filter_not`) and
//! aggregation (`min`/`max`/`sum`/`avg`/`count`).
//!
//! Aggregations adopt the kind of the first numeric element and skip every
//! element of any other kind; an input without numeric elements aggregates
//! to null (`count` to 0).

use crate::closure::Closure;
use crate::error::{Result, RuntimeError};
use crate::eval::Evaluator;
use crate::intrinsics::{Intrinsic, IntrinsicTable};
use crate::value::{Map, Value};

pub(super) fn register(table: &mut IntrinsicTable) {
    table.register("q", "first", "{%l}{%p}", q_first);
    table.register("q", "last", "{%l}{%p}", q_last);
    table.register("q", "rest", "{%l}{%p}", q_rest);
    table.register("q", "select", "{%l%d*}{%m%s*}", q_select);
    table.register("q", "slice", "{%l%d}{%l%d%d}{%l%d%d%d}", q_slice);
    table.register("q", "map", "{%l%c}{%m%c}", q_map);
    table.register("q", "filter", "{%l%c}{%m%c}", q_filter);
    table.register("q", "filter_not", "{%l%c}{%m%c}", q_filter_not);
    table.register("q", "min", "{%l}", q_min);
    table.register("q", "max", "{%l}", q_max);
    table.register("q", "sum", "{%l}", q_sum);
    table.register("q", "count", "{%l}", q_count);
    table.register("q", "avg", "{%l}", q_avg);
}

fn q_first(info: &Intrinsic, _eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    match &args[0] {
        Value::List(l) => l
            .borrow()
            .at(0)
            .ok_or_else(|| RuntimeError::Key("list is empty".to_string())),
        Value::Pair(p) => Ok(p.borrow().first.clone()),
        _ => unreachable!("q::first operand checked"),
    }
}

fn q_last(info: &Intrinsic, _eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    match &args[0] {
        Value::List(l) => {
            let l = l.borrow();
            match l.len() {
                0 => Err(RuntimeError::Key("list is empty".to_string())),
                n => Ok(l.at(n - 1).unwrap()),
            }
        }
        Value::Pair(p) => Ok(p.borrow().second.clone()),
        _ => unreachable!("q::last operand checked"),
    }
}

fn q_rest(info: &Intrinsic, _eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    match &args[0] {
        Value::List(l) => {
            let l = l.borrow();
            Ok(Value::list(l.data.iter().skip(1).cloned().collect()))
        }
        Value::Pair(p) => Ok(Value::list(vec![p.borrow().second.clone()])),
        _ => unreachable!("q::rest operand checked"),
    }
}

fn q_select(info: &Intrinsic, _eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    match &args[0] {
        Value::List(l) => {
            let l = l.borrow();
            let mut out = Vec::new();
            for sel in &args[1..] {
                let Value::Int(idx) = sel else {
                    unreachable!("q::select selector checked");
                };
                if *idx >= 0 && (*idx as usize) < l.len() {
                    out.push(l.data[*idx as usize].clone());
                }
            }
            Ok(Value::list(out))
        }
        Value::Map(m) => {
            let m = m.borrow();
            let out = Value::map();
            for sel in &args[1..] {
                let Value::Str(key) = sel else {
                    unreachable!("q::select selector checked");
                };
                if let Some(v) = m.get(key) {
                    out.index_set(sel, v)?;
                }
            }
            Ok(out)
        }
        _ => unreachable!("q::select operand checked"),
    }
}

fn q_slice(info: &Intrinsic, _eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    let Value::List(l) = &args[0] else {
        unreachable!("q::slice operand checked");
    };
    let l = l.borrow();

    let int_arg = |i: usize| -> i64 {
        match &args[i] {
            Value::Int(v) => *v,
            _ => unreachable!("q::slice bound checked"),
        }
    };

    let mut start = int_arg(1).max(0) as usize;
    let mut end = if args.len() >= 3 {
        int_arg(2).max(0) as usize
    } else {
        l.len()
    };
    let step = if args.len() >= 4 { int_arg(3) } else { 1 };
    if step < 1 {
        return Err(RuntimeError::Key("slice step must be positive".to_string()));
    }

    if end > l.len() {
        end = l.len();
    }
    if start > end {
        start = end;
    }

    let mut out = Vec::new();
    while start < end {
        out.push(l.data[start].clone());
        start += step as usize;
    }
    Ok(Value::list(out))
}

fn callback_of(v: &Value) -> Closure {
    match v {
        Value::Closure(c) => c.clone(),
        _ => unreachable!("callback operand checked"),
    }
}

/// Snapshot of the input as `(key, value)` callback arguments; maps are
/// copied out first so a callback mutating its receiver cannot invalidate
/// the walk
fn callback_input(v: &Value) -> Vec<(Value, Value)> {
    match v {
        Value::List(l) => l
            .borrow()
            .data
            .iter()
            .enumerate()
            .map(|(k, v)| (Value::Int(k as i64), v.clone()))
            .collect(),
        Value::Map(m) => {
            let mut out = Vec::new();
            m.borrow().foreach(|k, v| {
                out.push((Value::str(k), v.clone()));
                true
            });
            out
        }
        _ => unreachable!("callback input checked"),
    }
}

fn group_into(map: &mut Map, key: &str, value: Value) {
    match map.get(key) {
        Some(Value::List(l)) => l.borrow_mut().push(value),
        Some(_) => unreachable!("q::map groups are always lists"),
        None => map.set(key, Value::list(vec![value])),
    }
}

fn q_map(info: &Intrinsic, eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    let cb = callback_of(&args[1]);
    let out = Value::map();

    for (k, v) in callback_input(&args[0]) {
        let produced = cb.call(eval, &[k, v])?;
        let Value::Pair(p) = &produced else {
            return Err(RuntimeError::Type(
                "q::map's callback function must return a pair".to_string(),
            ));
        };
        let p = p.borrow();
        let Value::Str(key) = &p.first else {
            return Err(RuntimeError::Type(
                "q::map's callback function must return a pair with first to be string"
                    .to_string(),
            ));
        };
        if let Value::Map(m) = &out {
            group_into(&mut m.borrow_mut(), key, p.second.clone());
        }
    }
    Ok(out)
}

fn filter_impl(
    name: &str,
    eval: &mut Evaluator,
    args: &[Value],
    keep: impl Fn(bool) -> bool,
) -> Result<Value> {
    let cb = callback_of(&args[1]);
    let is_list = args[0].is_list();
    let kept = {
        let mut kept = Vec::new();
        for (k, v) in callback_input(&args[0]) {
            let verdict = cb.call(eval, &[k.clone(), v.clone()])?;
            let Value::Bool(b) = verdict else {
                return Err(RuntimeError::Type(format!(
                    "{} callback function must return bool",
                    name
                )));
            };
            if keep(b) {
                kept.push((k, v));
            }
        }
        kept
    };

    if is_list {
        Ok(Value::list(kept.into_iter().map(|(_, v)| v).collect()))
    } else {
        let out = Value::map();
        for (k, v) in kept {
            out.index_set(&k, v)?;
        }
        Ok(out)
    }
}

fn q_filter(info: &Intrinsic, eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    filter_impl("q::filter", eval, args, |b| b)
}

fn q_filter_not(info: &Intrinsic, eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    filter_impl("q::filter_not", eval, args, |b| !b)
}

/// The numeric elements an aggregation works on, in the kind of the first
/// numeric element found
enum Nums {
    Ints(Vec<i64>),
    Reals(Vec<f64>),
    Empty,
}

fn collect_nums(v: &Value) -> Nums {
    let Value::List(l) = v else {
        unreachable!("aggregation operand checked");
    };
    let l = l.borrow();
    for (idx, first) in l.data.iter().enumerate() {
        match first {
            Value::Int(_) => {
                return Nums::Ints(
                    l.data[idx..]
                        .iter()
                        .filter_map(|v| match v {
                            Value::Int(i) => Some(*i),
                            _ => None,
                        })
                        .collect(),
                )
            }
            Value::Real(_) => {
                return Nums::Reals(
                    l.data[idx..]
                        .iter()
                        .filter_map(|v| match v {
                            Value::Real(r) => Some(*r),
                            _ => None,
                        })
                        .collect(),
                )
            }
            _ => continue,
        }
    }
    Nums::Empty
}

fn q_max(info: &Intrinsic, _eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    Ok(match collect_nums(&args[0]) {
        Nums::Ints(v) => Value::Int(v.into_iter().max().unwrap()),
        Nums::Reals(v) => Value::Real(v.into_iter().fold(f64::NEG_INFINITY, f64::max)),
        Nums::Empty => Value::Null,
    })
}

fn q_min(info: &Intrinsic, _eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    Ok(match collect_nums(&args[0]) {
        Nums::Ints(v) => Value::Int(v.into_iter().min().unwrap()),
        Nums::Reals(v) => Value::Real(v.into_iter().fold(f64::INFINITY, f64::min)),
        Nums::Empty => Value::Null,
    })
}

fn q_sum(info: &Intrinsic, _eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    Ok(match collect_nums(&args[0]) {
        Nums::Ints(v) => Value::Int(v.into_iter().sum()),
        Nums::Reals(v) => Value::Real(v.into_iter().sum()),
        Nums::Empty => Value::Null,
    })
}

fn q_avg(info: &Intrinsic, _eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    Ok(match collect_nums(&args[0]) {
        Nums::Ints(v) => Value::Real(v.iter().sum::<i64>() as f64 / v.len() as f64),
        Nums::Reals(v) => Value::Real(v.iter().sum::<f64>() / v.len() as f64),
        Nums::Empty => Value::Null,
    })
}

fn q_count(info: &Intrinsic, _eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
    info.check(args)?;
    Ok(match collect_nums(&args[0]) {
        Nums::Ints(v) => Value::Int(v.len() as i64),
        Nums::Reals(v) => Value::Int(v.len() as i64),
        Nums::Empty => Value::Int(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closure::NativeClosure;
    use crate::intrinsics;
    use std::rc::Rc;

    fn call(name: &str, eval: &mut Evaluator, args: &[Value]) -> Result<Value> {
        let (_, intr) = intrinsics::find(name).expect("intrinsic registered");
        intr.call(eval, args)
    }

    fn int_list(vs: &[i64]) -> Value {
        Value::list(vs.iter().map(|v| Value::Int(*v)).collect())
    }

    #[test]
    fn test_anchors() {
        let mut eval = Evaluator::new_simple();
        let l = int_list(&[1, 2, 3]);
        assert_eq!(call("q::first", &mut eval, &[l.clone()]).unwrap(), Value::Int(1));
        assert_eq!(call("q::last", &mut eval, &[l.clone()]).unwrap(), Value::Int(3));
        let rest = call("q::rest", &mut eval, &[l]).unwrap();
        assert_eq!(rest.index(&Value::Int(0)).unwrap(), Value::Int(2));

        let empty = Value::list(vec![]);
        assert!(call("q::first", &mut eval, &[empty]).is_err());

        let p = Value::pair(Value::Int(7), Value::Int(8));
        assert_eq!(call("q::first", &mut eval, &[p.clone()]).unwrap(), Value::Int(7));
        assert_eq!(call("q::last", &mut eval, &[p]).unwrap(), Value::Int(8));
    }

    #[test]
    fn test_select_and_slice() {
        let mut eval = Evaluator::new_simple();
        let l = int_list(&[10, 20, 30, 40]);
        let picked = call(
            "q::select",
            &mut eval,
            &[l.clone(), Value::Int(3), Value::Int(0), Value::Int(9)],
        )
        .unwrap();
        assert_eq!(
            picked.index(&Value::Int(0)).unwrap(),
            Value::Int(40),
            "out of range selectors are skipped"
        );
        assert_eq!(picked.index(&Value::Int(1)).unwrap(), Value::Int(10));

        let sliced = call(
            "q::slice",
            &mut eval,
            &[l, Value::Int(0), Value::Int(4), Value::Int(2)],
        )
        .unwrap();
        assert_eq!(sliced.index(&Value::Int(0)).unwrap(), Value::Int(10));
        assert_eq!(sliced.index(&Value::Int(1)).unwrap(), Value::Int(30));
    }

    #[test]
    fn test_filter_with_native_callback() {
        let mut eval = Evaluator::new_simple();
        let even = NativeClosure::new(
            "even",
            Rc::new(|_eval: &mut Evaluator, args: &[Value]| {
                let Value::Int(v) = args[1] else {
                    return Err(RuntimeError::Type("want int".to_string()));
                };
                Ok(Value::Bool(v % 2 == 0))
            }),
        );
        let out = call(
            "q::filter",
            &mut eval,
            &[int_list(&[1, 2, 3, 4]), Value::Closure(Closure::Native(even))],
        )
        .unwrap();
        let Value::List(l) = &out else { panic!("want list") };
        assert_eq!(l.borrow().data, vec![Value::Int(2), Value::Int(4)]);
    }

    #[test]
    fn test_map_groups_by_pair_key() {
        let mut eval = Evaluator::new_simple();
        let parity = NativeClosure::new(
            "parity",
            Rc::new(|_eval: &mut Evaluator, args: &[Value]| {
                let Value::Int(k) = args[0] else {
                    return Err(RuntimeError::Type("want int key".to_string()));
                };
                let tag = if k % 2 == 0 { "even" } else { "odd" };
                Ok(Value::pair(Value::str(tag), args[1].clone()))
            }),
        );
        let out = call(
            "q::map",
            &mut eval,
            &[
                int_list(&[1, 2, 3, 4, 5]),
                Value::Closure(Closure::Native(parity)),
            ],
        )
        .unwrap();

        let even = out.index(&Value::str("even")).unwrap();
        let odd = out.index(&Value::str("odd")).unwrap();
        let Value::List(even) = &even else { panic!("want list") };
        let Value::List(odd) = &odd else { panic!("want list") };
        assert_eq!(
            even.borrow().data,
            vec![Value::Int(1), Value::Int(3), Value::Int(5)],
            "zero-based even positions hold 1,3,5"
        );
        assert_eq!(odd.borrow().data, vec![Value::Int(2), Value::Int(4)]);
    }

    #[test]
    fn test_aggregations() {
        let mut eval = Evaluator::new_simple();
        let l = int_list(&[1, 2, 3, 4]);
        assert_eq!(call("q::sum", &mut eval, &[l.clone()]).unwrap(), Value::Int(10));
        assert_eq!(call("q::avg", &mut eval, &[l.clone()]).unwrap(), Value::Real(2.5));
        assert_eq!(call("q::max", &mut eval, &[l.clone()]).unwrap(), Value::Int(4));
        assert_eq!(call("q::min", &mut eval, &[l.clone()]).unwrap(), Value::Int(1));
        assert_eq!(call("q::count", &mut eval, &[l]).unwrap(), Value::Int(4));

        let empty = Value::list(vec![]);
        assert_eq!(call("q::max", &mut eval, &[empty.clone()]).unwrap(), Value::Null);
        assert_eq!(call("q::count", &mut eval, &[empty]).unwrap(), Value::Int(0));

        // mixed input adopts the kind of the first numeric element
        let mixed = Value::list(vec![
            Value::str("x"),
            Value::Real(1.5),
            Value::Int(2),
            Value::Real(2.5),
        ]);
        assert_eq!(call("q::sum", &mut eval, &[mixed]).unwrap(), Value::Real(4.0));
    }
}
