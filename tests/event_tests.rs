//! Rule chaining and the deferred event queue

use std::cell::RefCell;
use std::rc::Rc;

use flint::{
    CallbackEvalContext, EvalError, EventContext, EventOutcome, Evaluator, Module, ModuleBuilder,
    Opcode, ProgramBuilder, ProgramKind, Value,
};

type Marks = Rc<RefCell<Vec<String>>>;

fn marking_evaluator(marks: &Marks) -> Evaluator {
    let sink = marks.clone();
    let ctx = CallbackEvalContext::new().on_action(move |name, value| {
        assert_eq!(name, "mark");
        sink.borrow_mut().push(value.to_string());
        Ok(())
    });
    Evaluator::with_context(Box::new(ctx))
}

/// Emit `action mark <label>` into a program
fn emit_mark(mb: &mut ModuleBuilder, pb: &mut ProgramBuilder, label: &str) {
    let lbl = mb.str(label);
    let mark = mb.str("mark");
    pb.emit(Opcode::LoadStr, lbl);
    pb.emit(Opcode::Action, mark);
}

/// Rules A and B share event "e"; A emits "child" and returns null, B
/// returns 7; the deferred "child" dispatches only after both ran
fn build_chain_module() -> Module {
    let mut mb = ModuleBuilder::new();

    let mut a = ProgramBuilder::new("a", ProgramKind::Rule, 1);
    emit_mark(&mut mb, &mut a, "A");
    let child = mb.str("child");
    a.emit(Opcode::LoadStr, child);
    a.op(Opcode::LoadNull);
    a.op(Opcode::Emit);
    a.op(Opcode::LoadNull);
    a.op(Opcode::Return);
    mb.rule("e", a);

    let c7 = mb.int(7);
    let mut b = ProgramBuilder::new("b", ProgramKind::Rule, 1);
    emit_mark(&mut mb, &mut b, "B");
    b.emit(Opcode::LoadInt, c7);
    b.op(Opcode::Return);
    mb.rule("e", b);

    let mut child_rule = ProgramBuilder::new("on_child", ProgramKind::Rule, 1);
    emit_mark(&mut mb, &mut child_rule, "child-run");
    child_rule.op(Opcode::LoadNull);
    child_rule.op(Opcode::Return);
    mb.rule("child", child_rule);

    mb.build()
}

#[test]
fn test_rule_chaining_and_deferred_event() {
    let module = build_chain_module();
    let marks: Marks = Rc::new(RefCell::new(Vec::new()));
    let mut eval = marking_evaluator(&marks);

    let out = eval.eval("e", &module).expect("chain runs clean");
    assert_eq!(out, Value::Int(7), "the first non-null return wins");
    assert_eq!(
        marks.borrow().as_slice(),
        ["A", "B", "child-run"],
        "rules run in registration order, deferred events after the rule"
    );
    assert!(
        eval.event_queue().borrow().is_empty(),
        "the drain must consume the queue"
    );
}

#[test]
fn test_next_rule_moves_to_next_registration() {
    let mut mb = ModuleBuilder::new();

    let mut x1 = ProgramBuilder::new("x1", ProgramKind::Rule, 1);
    emit_mark(&mut mb, &mut x1, "x1");
    x1.op(Opcode::NextRule);
    mb.rule("x", x1);

    let c9 = mb.int(9);
    let mut x2 = ProgramBuilder::new("x2", ProgramKind::Rule, 1);
    emit_mark(&mut mb, &mut x2, "x2");
    x2.emit(Opcode::LoadInt, c9);
    x2.op(Opcode::Return);
    mb.rule("x", x2);

    let module = mb.build();
    let marks: Marks = Rc::new(RefCell::new(Vec::new()));
    let mut eval = marking_evaluator(&marks);

    assert_eq!(eval.eval("x", &module).unwrap(), Value::Int(9));
    assert_eq!(marks.borrow().as_slice(), ["x1", "x2"]);
}

#[test]
fn test_halt_stops_the_chain() {
    let mut mb = ModuleBuilder::new();

    let mut h1 = ProgramBuilder::new("h1", ProgramKind::Rule, 1);
    emit_mark(&mut mb, &mut h1, "h1");
    h1.op(Opcode::Halt);
    mb.rule("h", h1);

    let c5 = mb.int(5);
    let mut h2 = ProgramBuilder::new("h2", ProgramKind::Rule, 1);
    emit_mark(&mut mb, &mut h2, "h2");
    h2.emit(Opcode::LoadInt, c5);
    h2.op(Opcode::Return);
    mb.rule("h", h2);

    let module = mb.build();
    let marks: Marks = Rc::new(RefCell::new(Vec::new()));
    let mut eval = marking_evaluator(&marks);

    assert_eq!(eval.eval("h", &module).unwrap(), Value::Null);
    assert_eq!(marks.borrow().as_slice(), ["h1"], "halt must stop the chain");
}

#[test]
fn test_non_null_return_stops_the_chain() {
    let mut mb = ModuleBuilder::new();

    let c1 = mb.int(1);
    let mut s1 = ProgramBuilder::new("s1", ProgramKind::Rule, 1);
    s1.emit(Opcode::LoadInt, c1);
    s1.op(Opcode::Return);
    mb.rule("s", s1);

    let mut s2 = ProgramBuilder::new("s2", ProgramKind::Rule, 1);
    emit_mark(&mut mb, &mut s2, "s2");
    s2.op(Opcode::LoadNull);
    s2.op(Opcode::Return);
    mb.rule("s", s2);

    let module = mb.build();
    let marks: Marks = Rc::new(RefCell::new(Vec::new()));
    let mut eval = marking_evaluator(&marks);

    assert_eq!(eval.eval("s", &module).unwrap(), Value::Int(1));
    assert!(marks.borrow().is_empty(), "s2 must not run after a non-null return");
}

/// Events emitted while draining join the same FIFO drain; no nested drain
/// starts
#[test]
fn test_reentrant_emit_during_drain() {
    let mut mb = ModuleBuilder::new();

    let c1name = mb.str("c1");
    let mut outer = ProgramBuilder::new("outer", ProgramKind::Rule, 1);
    emit_mark(&mut mb, &mut outer, "outer");
    outer.emit(Opcode::LoadStr, c1name);
    outer.op(Opcode::LoadNull);
    outer.op(Opcode::Emit);
    outer.op(Opcode::LoadNull);
    outer.op(Opcode::Return);
    mb.rule("o", outer);

    let c2name = mb.str("c2");
    let mut c1 = ProgramBuilder::new("c1", ProgramKind::Rule, 1);
    c1.emit(Opcode::LoadStr, c2name);
    c1.op(Opcode::LoadNull);
    c1.op(Opcode::Emit);
    emit_mark(&mut mb, &mut c1, "c1");
    c1.op(Opcode::LoadNull);
    c1.op(Opcode::Return);
    mb.rule("c1", c1);

    let mut c2 = ProgramBuilder::new("c2", ProgramKind::Rule, 1);
    emit_mark(&mut mb, &mut c2, "c2");
    c2.op(Opcode::LoadNull);
    c2.op(Opcode::Return);
    mb.rule("c2", c2);

    let module = mb.build();
    let marks: Marks = Rc::new(RefCell::new(Vec::new()));
    let mut eval = marking_evaluator(&marks);

    eval.eval("o", &module).unwrap();
    assert_eq!(
        marks.borrow().as_slice(),
        ["outer", "c1", "c2"],
        "re-entrant emits drain in FIFO order within the same drain"
    );
}

struct PolicyEventContext {
    outcome: EventOutcome,
    failures: Rc<RefCell<Vec<String>>>,
}

impl EventContext for PolicyEventContext {
    fn on_event_error(&mut self, name: &str, _err: &EvalError) -> EventOutcome {
        self.failures.borrow_mut().push(name.to_string());
        self.outcome
    }
}

/// Module whose "t" rule queues [boom, boom, tail]; "boom" rules always
/// raise, "tail" marks
fn build_failing_module() -> Module {
    let mut mb = ModuleBuilder::new();

    let boom = mb.str("boom");
    let tail = mb.str("tail");
    let mut t = ProgramBuilder::new("t", ProgramKind::Rule, 1);
    for _ in 0..2 {
        t.emit(Opcode::LoadStr, boom);
        t.op(Opcode::LoadNull);
        t.op(Opcode::Emit);
    }
    t.emit(Opcode::LoadStr, tail);
    t.op(Opcode::LoadNull);
    t.op(Opcode::Emit);
    t.op(Opcode::LoadNull);
    t.op(Opcode::Return);
    mb.rule("t", t);

    let c1 = mb.int(1);
    let c0 = mb.int(0);
    let mut b = ProgramBuilder::new("boom", ProgramKind::Rule, 1);
    b.emit(Opcode::LoadInt, c1);
    b.emit(Opcode::LoadInt, c0);
    b.op(Opcode::Div);
    b.op(Opcode::Return);
    mb.rule("boom", b);

    let mut tl = ProgramBuilder::new("tail", ProgramKind::Rule, 1);
    emit_mark(&mut mb, &mut tl, "tail");
    tl.op(Opcode::LoadNull);
    tl.op(Opcode::Return);
    mb.rule("tail", tl);

    mb.build()
}

#[test]
fn test_event_error_continue_drops_and_keeps_draining() {
    let module = build_failing_module();
    let marks: Marks = Rc::new(RefCell::new(Vec::new()));
    let failures: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

    let mut eval = marking_evaluator(&marks);
    eval.event = Some(Box::new(PolicyEventContext {
        outcome: EventOutcome::Continue,
        failures: failures.clone(),
    }));

    eval.eval("t", &module).unwrap();
    assert_eq!(failures.borrow().as_slice(), ["boom", "boom"]);
    assert_eq!(marks.borrow().as_slice(), ["tail"], "tail still dispatches");
    assert!(eval.event_queue().borrow().is_empty());
}

#[test]
fn test_event_error_pause_leaves_the_queue() {
    let module = build_failing_module();
    let marks: Marks = Rc::new(RefCell::new(Vec::new()));
    let failures: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

    let mut eval = marking_evaluator(&marks);
    eval.event = Some(Box::new(PolicyEventContext {
        outcome: EventOutcome::Pause,
        failures: failures.clone(),
    }));

    eval.eval("t", &module).unwrap();
    assert_eq!(failures.borrow().as_slice(), ["boom"]);
    assert!(marks.borrow().is_empty());
    assert_eq!(
        eval.event_queue().borrow().len(),
        2,
        "pause leaves the rest of the queue queued"
    );
}

#[test]
fn test_event_error_stop_and_clear_flushes_the_queue() {
    let module = build_failing_module();
    let marks: Marks = Rc::new(RefCell::new(Vec::new()));
    let failures: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

    let mut eval = marking_evaluator(&marks);
    eval.event = Some(Box::new(PolicyEventContext {
        outcome: EventOutcome::StopAndClear,
        failures: failures.clone(),
    }));

    eval.eval("t", &module).unwrap();
    assert_eq!(failures.borrow().as_slice(), ["boom"]);
    assert!(marks.borrow().is_empty());
    assert!(eval.event_queue().borrow().is_empty(), "the queue is flushed");
}

#[test]
fn test_host_emit_and_unknown_event() {
    let module = build_chain_module();
    let marks: Marks = Rc::new(RefCell::new(Vec::new()));
    let mut eval = marking_evaluator(&marks);

    // unknown events evaluate to null without error
    assert_eq!(eval.eval("missing", &module).unwrap(), Value::Null);

    // host-emitted events queue until the next top-level evaluation drains
    eval.emit_event("child", Value::Null);
    assert_eq!(eval.event_queue().borrow().len(), 1);
    eval.eval("missing", &module).unwrap();
    assert_eq!(marks.borrow().as_slice(), ["child-run"]);
}

#[test]
fn test_event_context_value_reaches_rules() {
    let mut mb = ModuleBuilder::new();
    let mut r = ProgramBuilder::new("echo", ProgramKind::Rule, 1);
    r.op(Opcode::LoadDollar);
    r.op(Opcode::Return);
    mb.rule("echo", r);
    let module = mb.build();

    let mut eval = Evaluator::new_simple();
    let out = eval
        .eval_with_context("echo", Value::str("ctx"), &module)
        .unwrap();
    assert_eq!(out, Value::str("ctx"), "loadDollar reads the rule's event value");
}
