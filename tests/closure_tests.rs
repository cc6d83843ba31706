//! Closure construction, upvalue capture and sharing

use flint::{Evaluator, ModuleBuilder, Opcode, ProgramBuilder, ProgramKind, Value};

/// `fn make(x) { return fn(v) { if v != 0 { x = v } return x } }`
fn build_make_module() -> flint::Module {
    let mut mb = ModuleBuilder::new();
    let c0 = mb.int(0);

    // the returned closure both reads and, for a non-zero argument, writes
    // its captured upvalue
    let mut accessor = ProgramBuilder::new("accessor", ProgramKind::Function, 1);
    accessor.upvalue(true, 0);
    accessor.emit(Opcode::LoadLocal, 0);
    accessor.emit(Opcode::LoadInt, c0);
    accessor.op(Opcode::Ne);
    let j = accessor.pos();
    accessor.emit(Opcode::JFalse, 0);
    accessor.emit(Opcode::LoadLocal, 0);
    accessor.emit(Opcode::StoreUpvalue, 0);
    let read = accessor.pos() as u32;
    accessor.emit(Opcode::LoadUpvalue, 0);
    accessor.op(Opcode::Return);
    accessor.patch(j, read);
    let accessor_idx = mb.function(accessor);

    let mut make = ProgramBuilder::new("make", ProgramKind::Function, 1);
    make.emit(Opcode::NewClosure, accessor_idx);
    make.op(Opcode::Return);
    let make_idx = mb.function(make);

    let c42 = mb.int(42);
    let c7 = mb.int(7);
    let make_const = mb.int(make_idx as i64);

    // f = make(42); g = f; f(0)==42; f(7); g(0)==7
    let mut pb = ProgramBuilder::new("share", ProgramKind::Rule, 1);
    pb.emit(Opcode::ReserveLocal, 2);
    pb.emit(Opcode::LoadInt, make_const);
    pb.emit(Opcode::LoadInt, c42);
    pb.emit(Opcode::SCall, 1);
    pb.emit(Opcode::StoreLocal, 2);
    pb.emit(Opcode::LoadLocal, 2);
    pb.emit(Opcode::StoreLocal, 3);

    let mut fails = Vec::new();

    pb.emit(Opcode::LoadLocal, 2);
    pb.emit(Opcode::LoadInt, c0);
    pb.emit(Opcode::VCall, 1);
    pb.emit(Opcode::LoadInt, c42);
    pb.op(Opcode::Eq);
    fails.push(pb.pos());
    pb.emit(Opcode::JFalse, 0);

    pb.emit(Opcode::LoadLocal, 2);
    pb.emit(Opcode::LoadInt, c7);
    pb.emit(Opcode::VCall, 1);
    pb.op(Opcode::Pop);

    pb.emit(Opcode::LoadLocal, 3);
    pb.emit(Opcode::LoadInt, c0);
    pb.emit(Opcode::VCall, 1);
    pb.emit(Opcode::LoadInt, c7);
    pb.op(Opcode::Eq);
    fails.push(pb.pos());
    pb.emit(Opcode::JFalse, 0);

    pb.op(Opcode::LoadTrue).op(Opcode::Return);
    let fail_at = pb.pos() as u32;
    pb.op(Opcode::LoadFalse).op(Opcode::Return);
    for at in fails {
        pb.patch(at, fail_at);
    }
    mb.rule("share", pb);

    // two separate make() calls must not share their captures
    let c1 = mb.int(1);
    let c2 = mb.int(2);
    let c9 = mb.int(9);
    let mut pb = ProgramBuilder::new("isolate", ProgramKind::Rule, 1);
    pb.emit(Opcode::ReserveLocal, 2);
    pb.emit(Opcode::LoadInt, make_const);
    pb.emit(Opcode::LoadInt, c1);
    pb.emit(Opcode::SCall, 1);
    pb.emit(Opcode::StoreLocal, 2);
    pb.emit(Opcode::LoadInt, make_const);
    pb.emit(Opcode::LoadInt, c2);
    pb.emit(Opcode::SCall, 1);
    pb.emit(Opcode::StoreLocal, 3);
    // store through the first closure, then read the second
    pb.emit(Opcode::LoadLocal, 2);
    pb.emit(Opcode::LoadInt, c9);
    pb.emit(Opcode::VCall, 1);
    pb.op(Opcode::Pop);
    pb.emit(Opcode::LoadLocal, 3);
    pb.emit(Opcode::LoadInt, c0);
    pb.emit(Opcode::VCall, 1);
    pb.op(Opcode::Return);
    mb.rule("isolate", pb);

    mb.build()
}

#[test]
fn test_upvalue_capture_and_sharing() {
    let module = build_make_module();
    let mut eval = Evaluator::new_simple();
    assert_eq!(
        eval.eval("share", &module).unwrap(),
        Value::Bool(true),
        "a store through one alias of a closure must be seen through the other"
    );
}

#[test]
fn test_upvalue_capture_is_per_closure() {
    let module = build_make_module();
    let mut eval = Evaluator::new_simple();
    assert_eq!(
        eval.eval("isolate", &module).unwrap(),
        Value::Int(2),
        "closures from separate calls capture separate upvalues"
    );
}

#[test]
fn test_host_runs_script_closure() {
    // a rule builds a closure capturing one of its locals and returns it to
    // the host, which then re-enters the VM through it
    let mut mb = ModuleBuilder::new();
    let mut getter = ProgramBuilder::new("getter", ProgramKind::Function, 0);
    getter.upvalue(true, 2);
    getter.emit(Opcode::LoadUpvalue, 0);
    getter.op(Opcode::Return);
    let gidx = mb.function(getter);

    let c5 = mb.int(5);
    let mut pb = ProgramBuilder::new("makeg", ProgramKind::Rule, 1);
    pb.emit(Opcode::ReserveLocal, 1);
    pb.emit(Opcode::LoadInt, c5);
    pb.emit(Opcode::StoreLocal, 2);
    pb.emit(Opcode::NewClosure, gidx);
    pb.op(Opcode::Return);
    mb.rule("makeg", pb);
    let module = mb.build();

    let mut eval = Evaluator::new_simple();
    let out = eval.eval("makeg", &module).unwrap();
    let Value::Closure(flint::Closure::Script(sf)) = out else {
        panic!("rule must return a script closure");
    };
    let v = eval
        .run_script_closure(&sf, &[])
        .expect("callback re-entry must succeed");
    assert_eq!(v, Value::Int(5), "the closure sees the captured local");

    // wrong arity is rejected before any frame is built
    let err = eval
        .run_script_closure(&sf, &[Value::Int(1)])
        .expect_err("arity is validated");
    assert!(err.to_string().contains("argument number mismatch"));
}

#[test]
fn test_scall_arity_mismatch() {
    let mut mb = ModuleBuilder::new();
    let mut two = ProgramBuilder::new("two", ProgramKind::Function, 2);
    two.emit(Opcode::LoadLocal, 0);
    two.op(Opcode::Return);
    let fidx = mb.function(two);

    let fconst = mb.int(fidx as i64);
    let c1 = mb.int(1);
    let mut pb = ProgramBuilder::new("bad_call", ProgramKind::Rule, 1);
    pb.emit(Opcode::LoadInt, fconst);
    pb.emit(Opcode::LoadInt, c1);
    pb.emit(Opcode::SCall, 1);
    pb.op(Opcode::Return);
    mb.rule("bad_call", pb);

    let module = mb.build();
    let mut eval = Evaluator::new_simple();
    let err = eval.eval("bad_call", &module).expect_err("arity mismatch raises");
    assert!(err.to_string().contains("argument number mismatch"));
}

#[test]
fn test_method_closures_on_builtins() {
    let mut mb = ModuleBuilder::new();
    let ab = mb.str("a,b");
    let sep = mb.str(",");
    let split = mb.str("split");

    let mut pb = ProgramBuilder::new("split_str", ProgramKind::Rule, 1);
    pb.emit(Opcode::LoadStr, ab);
    pb.emit(Opcode::LoadMethod, split);
    pb.emit(Opcode::LoadStr, sep);
    pb.emit(Opcode::VCall, 1);
    pb.op(Opcode::Return);
    mb.rule("split_str", pb);

    let nope = mb.str("nope");
    let mut pb = ProgramBuilder::new("bad_method", ProgramKind::Rule, 1);
    pb.emit(Opcode::LoadStr, ab);
    pb.emit(Opcode::LoadMethod, nope);
    pb.op(Opcode::Return);
    mb.rule("bad_method", pb);

    let module = mb.build();
    let mut eval = Evaluator::new_simple();

    let out = eval.eval("split_str", &module).unwrap();
    assert_eq!(out.index(&Value::Int(0)).unwrap(), Value::str("a"));
    assert_eq!(out.index(&Value::Int(1)).unwrap(), Value::str("b"));

    let err = eval.eval("bad_method", &module).expect_err("unknown method raises");
    assert!(err.to_string().contains("unknown method 'nope'"));
}
