//! Iterator protocol
//!
//! Every iterable value produces a [`ValueIter`]: set up once, then drive
//! with `has`/`deref`/`next`. Container iterators walk live containers by
//! position; script iterators suspend a whole program frame on a private
//! stack and resume it on every `next`.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::error::{Result, RuntimeError};
use crate::eval::Evaluator;
use crate::frame::Frame;
use crate::program::Program;
use crate::value::{List, Map, Pair, Value};

/// The iteration protocol shared by containers, generators and user objects.
/// `set_up` and `next` receive the evaluator because script iterators run
/// bytecode to produce their values; container iterators ignore it.
pub trait ValueIter {
    /// Bind setup arguments and advance to the first element
    fn set_up(&self, eval: &mut Evaluator, args: &[Value]) -> Result<()>;

    /// Whether a current element exists
    fn has(&self) -> bool;

    /// Advance; returns whether a current element exists afterwards
    fn next(&self, eval: &mut Evaluator) -> Result<bool>;

    /// The current `(key, value)` element
    fn deref(&self) -> Result<(Value, Value)>;
}

fn out_of_bound() -> RuntimeError {
    RuntimeError::Iterator("iterator out of bound".to_string())
}

/// Positional iterator over a list, yielding `(index, value)`
pub struct ListIter {
    list: Rc<RefCell<List>>,
    pos: Cell<usize>,
}

impl ListIter {
    pub fn new(list: Rc<RefCell<List>>) -> Self {
        ListIter {
            list,
            pos: Cell::new(0),
        }
    }
}

impl ValueIter for ListIter {
    fn set_up(&self, _eval: &mut Evaluator, _args: &[Value]) -> Result<()> {
        Ok(())
    }

    fn has(&self) -> bool {
        self.pos.get() < self.list.borrow().len()
    }

    fn next(&self, _eval: &mut Evaluator) -> Result<bool> {
        self.pos.set(self.pos.get() + 1);
        Ok(self.has())
    }

    fn deref(&self) -> Result<(Value, Value)> {
        let pos = self.pos.get();
        let v = self.list.borrow().at(pos).ok_or_else(out_of_bound)?;
        Ok((Value::Int(pos as i64), v))
    }
}

/// Insertion-order iterator over a map, yielding `(key, value)`
pub struct MapIter {
    map: Rc<RefCell<Map>>,
    pos: Cell<usize>,
}

impl MapIter {
    pub fn new(map: Rc<RefCell<Map>>) -> Self {
        MapIter {
            map,
            pos: Cell::new(0),
        }
    }
}

impl ValueIter for MapIter {
    fn set_up(&self, _eval: &mut Evaluator, _args: &[Value]) -> Result<()> {
        Ok(())
    }

    fn has(&self) -> bool {
        self.pos.get() < self.map.borrow().len()
    }

    fn next(&self, _eval: &mut Evaluator) -> Result<bool> {
        self.pos.set(self.pos.get() + 1);
        Ok(self.has())
    }

    fn deref(&self) -> Result<(Value, Value)> {
        let map = self.map.borrow();
        let (k, v) = map.entry_at(self.pos.get()).ok_or_else(out_of_bound)?;
        Ok((Value::str(k), v.clone()))
    }
}

/// Two-element iterator over a pair: `(0, first)` then `(1, second)`
pub struct PairIter {
    pair: Rc<RefCell<Pair>>,
    pos: Cell<usize>,
}

impl PairIter {
    pub fn new(pair: Rc<RefCell<Pair>>) -> Self {
        PairIter {
            pair,
            pos: Cell::new(0),
        }
    }
}

impl ValueIter for PairIter {
    fn set_up(&self, _eval: &mut Evaluator, _args: &[Value]) -> Result<()> {
        Ok(())
    }

    fn has(&self) -> bool {
        self.pos.get() < 2
    }

    fn next(&self, _eval: &mut Evaluator) -> Result<bool> {
        self.pos.set(self.pos.get() + 1);
        Ok(self.has())
    }

    fn deref(&self) -> Result<(Value, Value)> {
        match self.pos.get() {
            0 => Ok((Value::Int(0), self.pair.borrow().first.clone())),
            1 => Ok((Value::Int(1), self.pair.borrow().second.clone())),
            _ => Err(out_of_bound()),
        }
    }
}

/// A generator: a suspended program frame with its own value stack.
///
/// `set_up` runs the program until its first `yield` or `return`; every
/// `next` swaps the evaluator onto the private stack and resumes at the saved
/// program counter. Yielded values are keyed by ordinal index.
pub struct ScriptIter {
    /// The generator body
    pub prog: Arc<Program>,

    /// Captured upvalues, visible to `loadUpvalue` inside the generator
    pub upvalues: RefCell<Vec<Value>>,

    /// Private value stack holding the suspended frame
    pub(crate) stack: RefCell<Vec<Value>>,

    /// The suspended frame record
    pub(crate) frame: RefCell<Frame>,

    /// Resume position
    pub(crate) pc: Cell<usize>,

    pub(crate) started: Cell<bool>,
    pub(crate) done: Cell<bool>,
    has: Cell<bool>,

    /// Next ordinal key
    key: Cell<i64>,

    current: RefCell<(Value, Value)>,

    /// Back-reference handed to the evaluator when this iterator pushes
    /// itself as a callee
    pub(crate) me: Weak<ScriptIter>,
}

impl ScriptIter {
    pub fn new(prog: Arc<Program>, upvalues: Vec<Value>) -> Rc<Self> {
        Rc::new_cyclic(|me| ScriptIter {
            prog,
            upvalues: RefCell::new(upvalues),
            stack: RefCell::new(Vec::new()),
            frame: RefCell::new(Frame::top()),
            pc: Cell::new(0),
            started: Cell::new(false),
            done: Cell::new(false),
            has: Cell::new(false),
            key: Cell::new(0),
            current: RefCell::new((Value::Null, Value::Null)),
            me: me.clone(),
        })
    }

    fn strong(&self) -> Rc<ScriptIter> {
        self.me.upgrade().expect("script iterator owner dropped")
    }

    /// Record a yielded value as the current element
    pub(crate) fn on_yield(&self, value: Value) {
        let key = self.key.get();
        self.key.set(key + 1);
        *self.current.borrow_mut() = (Value::Int(key), value);
        self.has.set(true);
    }

    /// Record terminal completion
    pub(crate) fn on_return(&self) {
        self.done.set(true);
        self.has.set(false);
    }

    /// Drop the iterator into the terminal state after a failed resume
    pub(crate) fn on_fail(&self) {
        self.done.set(true);
        self.has.set(false);
    }
}

impl ValueIter for ScriptIter {
    fn set_up(&self, eval: &mut Evaluator, args: &[Value]) -> Result<()> {
        if self.started.get() {
            return Err(RuntimeError::Iterator(
                "iterator is already set up".to_string(),
            ));
        }
        if args.len() != self.prog.arity {
            return Err(RuntimeError::Arity(format!(
                "iterator {} expects {} argument(s), got {}",
                self.prog.name,
                self.prog.arity,
                args.len()
            )));
        }
        self.started.set(true);
        eval.iter_set_up(&self.strong(), args)
    }

    fn has(&self) -> bool {
        self.has.get()
    }

    fn next(&self, eval: &mut Evaluator) -> Result<bool> {
        if !self.started.get() {
            return Err(RuntimeError::Iterator(
                "iterator is not set up".to_string(),
            ));
        }
        if self.done.get() {
            self.has.set(false);
            return Ok(false);
        }
        eval.iter_next(&self.strong())
    }

    fn deref(&self) -> Result<(Value, Value)> {
        if !self.has.get() {
            return Err(out_of_bound());
        }
        Ok(self.current.borrow().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_iteration() {
        let mut eval = Evaluator::new_simple();
        let list = Value::list(vec![Value::Int(5), Value::Int(6)]);
        let it = list.new_iterator().unwrap();
        it.set_up(&mut eval, &[]).unwrap();

        assert!(it.has());
        assert_eq!(
            it.deref().unwrap(),
            (Value::Int(0), Value::Int(5)),
            "list iteration yields (index, value)"
        );
        assert!(it.next(&mut eval).unwrap());
        assert_eq!(it.deref().unwrap(), (Value::Int(1), Value::Int(6)));
        assert!(!it.next(&mut eval).unwrap());
        assert!(it.deref().is_err(), "deref past the end must fail");
    }

    #[test]
    fn test_pair_iteration() {
        let mut eval = Evaluator::new_simple();
        let pair = Value::pair(Value::str("a"), Value::str("b"));
        let it = pair.new_iterator().unwrap();
        it.set_up(&mut eval, &[]).unwrap();

        let mut seen = Vec::new();
        while it.has() {
            seen.push(it.deref().unwrap());
            it.next(&mut eval).unwrap();
        }
        assert_eq!(
            seen,
            vec![
                (Value::Int(0), Value::str("a")),
                (Value::Int(1), Value::str("b")),
            ]
        );
    }

    #[test]
    fn test_map_iteration_order() {
        let mut eval = Evaluator::new_simple();
        let map = Value::map();
        map.index_set(&Value::str("z"), Value::Int(1)).unwrap();
        map.index_set(&Value::str("a"), Value::Int(2)).unwrap();

        let it = map.new_iterator().unwrap();
        it.set_up(&mut eval, &[]).unwrap();
        let mut keys = Vec::new();
        while it.has() {
            keys.push(it.deref().unwrap().0);
            it.next(&mut eval).unwrap();
        }
        assert_eq!(keys, vec![Value::str("z"), Value::str("a")]);
    }
}
