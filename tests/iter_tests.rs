//! Iterator protocol tests: container iteration and suspended generators

use flint::{Evaluator, ModuleBuilder, Opcode, ProgramBuilder, ProgramKind, Value};

fn list_values(v: &Value) -> Vec<Value> {
    let Value::List(l) = v else {
        panic!("expected list, got {}", v.kind_name());
    };
    let out = l.borrow().data.clone();
    out
}

/// Sum a literal list by driving an intrinsic container iterator in bytecode
#[test]
fn test_container_iteration_in_bytecode() {
    let mut mb = ModuleBuilder::new();
    let c0 = mb.int(0);
    let c1 = mb.int(1);
    let c2 = mb.int(2);
    let c3 = mb.int(3);

    let mut pb = ProgramBuilder::new("walk", ProgramKind::Rule, 1);
    pb.emit(Opcode::ReserveLocal, 1);
    pb.emit(Opcode::LoadInt, c0);
    pb.emit(Opcode::StoreLocal, 2);
    pb.op(Opcode::NewList);
    pb.emit(Opcode::LoadInt, c1);
    pb.emit(Opcode::LoadInt, c2);
    pb.emit(Opcode::LoadInt, c3);
    pb.emit(Opcode::AddList, 3);
    pb.op(Opcode::NewIterator);

    let loop_at = pb.pos() as u32;
    pb.op(Opcode::HasIterator);
    let jf = pb.pos();
    pb.emit(Opcode::JFalse, 0);
    pb.op(Opcode::DerefIterator); // [iter, k, v]
    pb.emit(Opcode::LoadLocal, 2); // [iter, k, v, acc]
    pb.op(Opcode::Add); // [iter, k, v+acc]
    pb.emit(Opcode::StoreLocal, 2); // [iter, k]
    pb.op(Opcode::Pop); // [iter]
    pb.op(Opcode::NextIterator);
    pb.op(Opcode::Pop);
    pb.emit(Opcode::Jump, loop_at);
    let done = pb.pos() as u32;
    pb.op(Opcode::Pop); // drop the iterator
    pb.emit(Opcode::LoadLocal, 2);
    pb.op(Opcode::Return);
    pb.patch(jf, done);
    mb.rule("walk", pb);

    let module = mb.build();
    let mut eval = Evaluator::new_simple();
    assert_eq!(eval.eval("walk", &module).unwrap(), Value::Int(6));
}

/// A generator that yields its argument, then argument + 1, then returns;
/// the driver collects `(key, value)` pairs
#[test]
fn test_generator_yields_and_terminates() {
    let mut mb = ModuleBuilder::new();
    let c1 = mb.int(1);

    let mut counter = ProgramBuilder::new("counter", ProgramKind::Iterator, 1);
    counter.emit(Opcode::LoadLocal, 0);
    counter.op(Opcode::Yield);
    counter.emit(Opcode::LoadLocal, 0);
    counter.emit(Opcode::LoadInt, c1);
    counter.op(Opcode::Add);
    counter.op(Opcode::Yield);
    counter.op(Opcode::LoadNull);
    counter.op(Opcode::Return);
    let gen_idx = mb.function(counter);

    let c10 = mb.int(10);
    let mut pb = ProgramBuilder::new("drive", ProgramKind::Rule, 1);
    pb.emit(Opcode::ReserveLocal, 1);
    pb.op(Opcode::NewList);
    pb.emit(Opcode::StoreLocal, 2);
    pb.emit(Opcode::LoadIterator, gen_idx);
    pb.emit(Opcode::LoadInt, c10);
    pb.emit(Opcode::SetUpIterator, 1);

    let loop_at = pb.pos() as u32;
    pb.op(Opcode::HasIterator);
    let jf = pb.pos();
    pb.emit(Opcode::JFalse, 0);
    pb.op(Opcode::DerefIterator); // [iter, k, v]
    pb.op(Opcode::NewPair); // [iter, (k,v)]
    pb.emit(Opcode::LoadLocal, 2); // [iter, (k,v), list]
    pb.op(Opcode::Swap); // [iter, list, (k,v)]
    pb.emit(Opcode::AddList, 1); // [iter, list]
    pb.op(Opcode::Pop); // [iter]
    pb.op(Opcode::NextIterator);
    pb.op(Opcode::Pop);
    pb.emit(Opcode::Jump, loop_at);
    let done = pb.pos() as u32;
    pb.op(Opcode::Pop);
    pb.emit(Opcode::LoadLocal, 2);
    pb.op(Opcode::Return);
    pb.patch(jf, done);
    mb.rule("drive", pb);

    let module = mb.build();
    let mut eval = Evaluator::new_simple();

    let out = eval.eval("drive", &module).expect("generator drives clean");
    let pairs = list_values(&out);
    assert_eq!(pairs.len(), 2, "two yields then a terminal return");

    let first = &pairs[0];
    assert_eq!(first.dot("first").unwrap(), Value::Int(0), "ordinal keys");
    assert_eq!(first.dot("second").unwrap(), Value::Int(10));
    let second = &pairs[1];
    assert_eq!(second.dot("first").unwrap(), Value::Int(1));
    assert_eq!(second.dot("second").unwrap(), Value::Int(11));
}

/// Generators capture upvalues from the frame that loads them
#[test]
fn test_generator_with_captured_upvalue() {
    let mut mb = ModuleBuilder::new();

    let mut gen = ProgramBuilder::new("gen_up", ProgramKind::Iterator, 0);
    gen.upvalue(true, 2);
    gen.emit(Opcode::LoadUpvalue, 0);
    gen.op(Opcode::Yield);
    gen.op(Opcode::LoadNull);
    gen.op(Opcode::Return);
    let gen_idx = mb.function(gen);

    let c5 = mb.int(5);
    let mut pb = ProgramBuilder::new("upgen", ProgramKind::Rule, 1);
    pb.emit(Opcode::ReserveLocal, 1);
    pb.emit(Opcode::LoadInt, c5);
    pb.emit(Opcode::StoreLocal, 2);
    pb.emit(Opcode::LoadIterator, gen_idx);
    pb.emit(Opcode::SetUpIterator, 0);
    pb.op(Opcode::DerefIterator); // [iter, k, v]
    pb.op(Opcode::Swap); // [iter, v, k]
    pb.op(Opcode::Pop); // [iter, v]
    pb.op(Opcode::Swap); // [v, iter]
    pb.op(Opcode::Pop); // [v]
    pb.op(Opcode::Return);
    mb.rule("upgen", pb);

    let module = mb.build();
    let mut eval = Evaluator::new_simple();
    assert_eq!(
        eval.eval("upgen", &module).unwrap(),
        Value::Int(5),
        "the generator reads the captured local"
    );
}

/// An error inside the generator body surfaces to the consumer of the
/// iterator, not past it
#[test]
fn test_generator_error_surfaces_to_consumer() {
    let mut mb = ModuleBuilder::new();
    let c1 = mb.int(1);
    let c0 = mb.int(0);

    let mut boom = ProgramBuilder::new("boom_gen", ProgramKind::Iterator, 0);
    boom.emit(Opcode::LoadInt, c1);
    boom.emit(Opcode::LoadInt, c0);
    boom.op(Opcode::Div);
    boom.op(Opcode::Yield);
    boom.op(Opcode::LoadNull);
    boom.op(Opcode::Return);
    let gen_idx = mb.function(boom);

    let mut pb = ProgramBuilder::new("drive_boom", ProgramKind::Rule, 1);
    pb.emit(Opcode::LoadIterator, gen_idx);
    pb.emit(Opcode::SetUpIterator, 0);
    pb.op(Opcode::Pop);
    pb.op(Opcode::LoadNull);
    pb.op(Opcode::Return);
    mb.rule("drive_boom", pb);

    let module = mb.build();
    let mut eval = Evaluator::new_simple();

    let err = eval
        .eval("drive_boom", &module)
        .expect_err("setup failure must surface");
    assert!(err.to_string().contains("divide zero"), "got: {}", err);
}

/// A generator can recover from its own failures with a script handler
#[test]
fn test_generator_internal_handler_recovers() {
    let mut mb = ModuleBuilder::new();
    let c1 = mb.int(1);
    let c0 = mb.int(0);
    let c9 = mb.int(9);

    let mut gen = ProgramBuilder::new("safe_gen", ProgramKind::Iterator, 0);
    let push_at = gen.pos();
    gen.emit(Opcode::PushException, 0);
    gen.emit(Opcode::LoadInt, c1);
    gen.emit(Opcode::LoadInt, c0);
    gen.op(Opcode::Div);
    gen.op(Opcode::Pop);
    let pop_at = gen.pos();
    gen.emit(Opcode::PopException, 0);
    let handler = gen.pos() as u32;
    gen.op(Opcode::LoadException);
    gen.op(Opcode::Pop);
    gen.emit(Opcode::LoadInt, c9);
    gen.op(Opcode::Yield);
    let tail = gen.pos() as u32;
    gen.op(Opcode::LoadNull);
    gen.op(Opcode::Return);
    gen.patch(push_at, handler);
    gen.patch(pop_at, tail);
    let gen_idx = mb.function(gen);

    let mut pb = ProgramBuilder::new("drive_safe", ProgramKind::Rule, 1);
    pb.emit(Opcode::LoadIterator, gen_idx);
    pb.emit(Opcode::SetUpIterator, 0);
    pb.op(Opcode::DerefIterator); // [iter, k, v]
    pb.op(Opcode::Swap);
    pb.op(Opcode::Pop); // [iter, v]
    pb.op(Opcode::Swap);
    pb.op(Opcode::Pop); // [v]
    pb.op(Opcode::Return);
    mb.rule("drive_safe", pb);

    let module = mb.build();
    let mut eval = Evaluator::new_simple();
    assert_eq!(
        eval.eval("drive_safe", &module).unwrap(),
        Value::Int(9),
        "the generator's own handler catches before the boundary"
    );
}
