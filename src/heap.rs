use tracing::debug;

use crate::compiler::Compiled;
use crate::env::{Binding, Frame};
use crate::error::{SchemeError, SchemeResult};
use crate::syntax_rules::SyntaxRules;
use crate::value::{
    BindingId, Closure, ClosureCode, ClosureId, FrameId, PairId, RulesId, StrId, Value, VectorId,
};

/// Per-block bookkeeping overhead, in words.
pub const HEADER_WORDS: usize = 1;

/// Terminator for the grey worklist threaded through block headers.
const NO_LINK: u32 = u32::MAX;

/// A single cons cell.
#[derive(Clone, Copy)]
pub struct Pair {
    pub car: Value,
    pub cdr: Value,
}

/// Everything that can live in the arena.
pub enum Object {
    Free,
    Pair(Pair),
    Vector(Vec<Value>),
    Str(String),
    Closure(Closure),
    Rules(SyntaxRules),
    Frame(Frame),
    Binding(Binding),
}

impl Object {
    /// Size of the object in arena words, header included.
    pub fn words(&self) -> usize {
        HEADER_WORDS
            + match self {
                Object::Free => 0,
                Object::Pair(_) => 2,
                Object::Vector(items) => 1 + items.len(),
                Object::Str(text) => 1 + text.len().div_ceil(8),
                Object::Closure(closure) => match &closure.code {
                    ClosureCode::Interpreted(_) => 4,
                    ClosureCode::Compiled(compiled) => compiled.words(),
                },
                Object::Rules(_) => 2,
                Object::Frame(_) => 2,
                Object::Binding(_) => 4,
            }
    }

    /// Push the arena slots this object refers to.
    pub fn trace(&self, out: &mut Vec<u32>) {
        fn value(out: &mut Vec<u32>, v: Value) {
            if let Some(slot) = v.heap_slot() {
                out.push(slot);
            }
        }

        match self {
            Object::Free | Object::Str(_) => {}
            Object::Pair(pair) => {
                value(out, pair.car);
                value(out, pair.cdr);
            }
            Object::Vector(items) => items.iter().for_each(|&v| value(out, v)),
            Object::Closure(closure) => match &closure.code {
                ClosureCode::Interpreted(lambda) => {
                    value(out, lambda.params);
                    value(out, lambda.body);
                    out.push(lambda.env.0);
                }
                ClosureCode::Compiled(compiled) => {
                    value(out, compiled.params);
                    value(out, compiled.body);
                    out.push(compiled.env.0);
                    out.extend(compiled.captures.iter().map(|b| b.0));
                    compiled.constants().for_each(|v| value(out, v));
                }
            },
            Object::Rules(rules) => {
                value(out, rules.literals);
                value(out, rules.clauses);
            }
            Object::Frame(frame) => {
                if let Some(parent) = frame.parent {
                    out.push(parent.0);
                }
                if let Some(root) = frame.root {
                    out.push(root.0);
                }
            }
            Object::Binding(binding) => {
                value(out, binding.value);
                if let Some(left) = binding.left {
                    out.push(left.0);
                }
                if let Some(right) = binding.right {
                    out.push(right.0);
                }
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Object::Free => "free block",
            Object::Pair(_) => "pair",
            Object::Vector(_) => "vector",
            Object::Str(_) => "string",
            Object::Closure(_) => "closure",
            Object::Rules(_) => "syntax-rules",
            Object::Frame(_) => "frame",
            Object::Binding(_) => "binding",
        }
    }
}

struct Header {
    words: u32,
    /// Live iff equal to the heap's `current_mark`.
    mark: bool,
    /// Next grey block while the block sits on the mark worklist.
    link: u32,
}

struct Block {
    header: Header,
    object: Object,
}

/// Outcome of one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub reclaimed_blocks: usize,
    pub reclaimed_words: usize,
    pub live_words: usize,
}

/// The object arena. Handles are indices into `blocks`; objects never move,
/// so a handle stays valid for as long as its object is reachable.
pub struct Heap {
    blocks: Vec<Block>,
    free_list: Vec<u32>,
    capacity: usize,
    used: usize,
    current_mark: bool,
    grey_head: u32,
    grey_tail: u32,
    scan: Vec<u32>,
    collections: usize,
}

impl Heap {
    /// Create an arena holding at most `capacity` words.
    pub fn new(capacity: usize) -> Self {
        Heap {
            blocks: Vec::with_capacity(1024),
            free_list: Vec::new(),
            capacity,
            used: 0,
            current_mark: false,
            grey_head: NO_LINK,
            grey_tail: NO_LINK,
            scan: Vec::new(),
            collections: 0,
        }
    }

    /// Place `object` in the arena. When it does not fit, the object is
    /// handed back so the caller can collect and retry.
    pub fn try_alloc(&mut self, object: Object) -> Result<u32, Object> {
        let words = object.words();
        if self.used + words > self.capacity {
            return Err(object);
        }
        self.used += words;
        let header = Header {
            words: words as u32,
            mark: self.current_mark,
            link: NO_LINK,
        };

        if let Some(slot) = self.free_list.pop() {
            self.blocks[slot as usize] = Block { header, object };
            return Ok(slot);
        }

        let slot = self.blocks.len() as u32;
        self.blocks.push(Block { header, object });
        Ok(slot)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Words currently occupied, headers included.
    pub fn used_words(&self) -> usize {
        self.used
    }

    pub fn live_blocks(&self) -> usize {
        self.blocks.len() - self.free_list.len()
    }

    pub fn collections(&self) -> usize {
        self.collections
    }

    /// True if `slot` currently holds an object (not a reclaimed block).
    pub fn is_live(&self, slot: u32) -> bool {
        self.blocks
            .get(slot as usize)
            .is_some_and(|b| !matches!(b.object, Object::Free))
    }

    // === Typed access ===

    #[inline]
    fn object(&self, slot: u32) -> &Object {
        &self.blocks[slot as usize].object
    }

    #[inline]
    fn object_mut(&mut self, slot: u32) -> &mut Object {
        &mut self.blocks[slot as usize].object
    }

    #[inline]
    pub fn pair(&self, id: PairId) -> Pair {
        match self.object(id.0) {
            Object::Pair(pair) => *pair,
            other => stale(id.0, "pair", other),
        }
    }

    #[inline]
    pub fn car(&self, id: PairId) -> Value {
        self.pair(id).car
    }

    #[inline]
    pub fn cdr(&self, id: PairId) -> Value {
        self.pair(id).cdr
    }

    pub fn set_car(&mut self, id: PairId, val: Value) {
        match self.object_mut(id.0) {
            Object::Pair(pair) => pair.car = val,
            _ => stale_mut(id.0, "pair"),
        }
    }

    pub fn set_cdr(&mut self, id: PairId, val: Value) {
        match self.object_mut(id.0) {
            Object::Pair(pair) => pair.cdr = val,
            _ => stale_mut(id.0, "pair"),
        }
    }

    pub fn vector(&self, id: VectorId) -> &[Value] {
        match self.object(id.0) {
            Object::Vector(items) => items,
            other => stale(id.0, "vector", other),
        }
    }

    pub fn string(&self, id: StrId) -> &str {
        match self.object(id.0) {
            Object::Str(text) => text,
            other => stale(id.0, "string", other),
        }
    }

    pub fn closure(&self, id: ClosureId) -> &Closure {
        match self.object(id.0) {
            Object::Closure(closure) => closure,
            other => stale(id.0, "closure", other),
        }
    }

    pub fn closure_mut(&mut self, id: ClosureId) -> &mut Closure {
        match self.object_mut(id.0) {
            Object::Closure(closure) => closure,
            _ => stale_mut(id.0, "closure"),
        }
    }

    pub fn rules(&self, id: RulesId) -> &SyntaxRules {
        match self.object(id.0) {
            Object::Rules(rules) => rules,
            other => stale(id.0, "syntax-rules", other),
        }
    }

    pub fn frame(&self, id: FrameId) -> &Frame {
        match self.object(id.0) {
            Object::Frame(frame) => frame,
            other => stale(id.0, "frame", other),
        }
    }

    pub fn frame_mut(&mut self, id: FrameId) -> &mut Frame {
        match self.object_mut(id.0) {
            Object::Frame(frame) => frame,
            _ => stale_mut(id.0, "frame"),
        }
    }

    pub fn binding(&self, id: BindingId) -> &Binding {
        match self.object(id.0) {
            Object::Binding(binding) => binding,
            other => stale(id.0, "binding", other),
        }
    }

    pub fn binding_mut(&mut self, id: BindingId) -> &mut Binding {
        match self.object_mut(id.0) {
            Object::Binding(binding) => binding,
            _ => stale_mut(id.0, "binding"),
        }
    }

    /// Swap a closure's code for its compiled form, re-accounting its size.
    /// Hands the code back if the arena cannot absorb the growth.
    pub fn install_compiled(
        &mut self,
        id: ClosureId,
        compiled: Box<Compiled>,
    ) -> Result<(), Box<Compiled>> {
        let new_words = HEADER_WORDS + compiled.words();
        let old_words = self.blocks[id.0 as usize].header.words as usize;
        if self.used - old_words + new_words > self.capacity {
            return Err(compiled);
        }
        self.used = self.used - old_words + new_words;
        let block = &mut self.blocks[id.0 as usize];
        block.header.words = new_words as u32;
        match &mut block.object {
            Object::Closure(closure) => closure.code = ClosureCode::Compiled(compiled),
            _ => stale_mut(id.0, "closure"),
        }
        Ok(())
    }

    // === List helpers ===

    /// Returns true if this value is a proper list.
    pub fn is_proper_list(&self, val: Value) -> bool {
        let mut current = val;
        loop {
            match current {
                Value::Null => return true,
                Value::Pair(id) => current = self.cdr(id),
                _ => return false,
            }
        }
    }

    /// Collect a proper list into a Vec. Returns None if not a proper list.
    pub fn list_to_vec(&self, val: Value) -> Option<Vec<Value>> {
        let mut result = Vec::new();
        let mut current = val;
        loop {
            match current {
                Value::Null => return Some(result),
                Value::Pair(id) => {
                    let pair = self.pair(id);
                    result.push(pair.car);
                    current = pair.cdr;
                }
                _ => return None,
            }
        }
    }

    // === GC ===

    /// Run one mark-sweep cycle from `roots` (arena slots).
    ///
    /// Flipping `current_mark` makes every block unmarked at once. Grey
    /// blocks are chained through their header `link` field, so tracing
    /// a long pair chain needs no native recursion and no side stack.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = u32>) -> GcStats {
        self.current_mark = !self.current_mark;
        for root in roots {
            self.shade(root);
            self.drain();
        }
        let stats = self.sweep();
        self.collections += 1;
        debug!(
            target: "ember::gc",
            cycle = self.collections,
            reclaimed_blocks = stats.reclaimed_blocks,
            reclaimed_words = stats.reclaimed_words,
            live_words = stats.live_words,
            "collection finished"
        );
        stats
    }

    /// Mark a block and append it to the grey worklist, unless it is
    /// already marked this cycle.
    fn shade(&mut self, slot: u32) {
        let current = self.current_mark;
        let Some(block) = self.blocks.get_mut(slot as usize) else {
            return;
        };
        if block.header.mark == current || matches!(block.object, Object::Free) {
            return;
        }
        block.header.mark = current;
        block.header.link = NO_LINK;
        if self.grey_tail == NO_LINK {
            self.grey_head = slot;
        } else {
            self.blocks[self.grey_tail as usize].header.link = slot;
        }
        self.grey_tail = slot;
    }

    /// Blacken grey blocks until the worklist is empty.
    fn drain(&mut self) {
        let mut scan = std::mem::take(&mut self.scan);
        while self.grey_head != NO_LINK {
            let slot = self.grey_head;
            let block = &mut self.blocks[slot as usize];
            self.grey_head = block.header.link;
            block.header.link = NO_LINK;
            if self.grey_head == NO_LINK {
                self.grey_tail = NO_LINK;
            }

            scan.clear();
            self.blocks[slot as usize].object.trace(&mut scan);
            for &child in &scan {
                self.shade(child);
            }
        }
        scan.clear();
        self.scan = scan;
    }

    /// Reclaim every block whose mark is stale.
    fn sweep(&mut self) -> GcStats {
        let mut stats = GcStats::default();
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if matches!(block.object, Object::Free) {
                continue;
            }
            if block.header.mark != self.current_mark {
                let words = block.header.words as usize;
                block.object = Object::Free;
                block.header.words = 0;
                self.used -= words;
                self.free_list.push(i as u32);
                stats.reclaimed_blocks += 1;
                stats.reclaimed_words += words;
            }
        }
        stats.live_words = self.used;
        stats
    }
}

#[cold]
fn stale(slot: u32, expected: &str, found: &Object) -> ! {
    panic!("handle {} expected {}, found {}", slot, expected, found.kind())
}

#[cold]
fn stale_mut(slot: u32, expected: &str) -> ! {
    panic!("handle {} does not address a {}", slot, expected)
}

/// The allocation seam. Anything that builds heap structure goes through
/// a `Mutator`, which may run a collection before giving up.
///
/// Values held only in Rust locals are invisible to the collector; code
/// that allocates more than once must `protect` intermediate results and
/// `release` them when done.
pub trait Mutator {
    fn heap(&self) -> &Heap;
    fn heap_mut(&mut self) -> &mut Heap;
    fn allocate(&mut self, object: Object) -> SchemeResult<u32>;

    fn protect(&mut self, _value: Value) {}

    /// Current depth of the protected set, for a later `release`.
    fn protected(&self) -> usize {
        0
    }

    fn release(&mut self, _mark: usize) {}

    fn cons(&mut self, car: Value, cdr: Value) -> SchemeResult<Value> {
        let slot = self.allocate(Object::Pair(Pair { car, cdr }))?;
        Ok(Value::Pair(PairId(slot)))
    }

    /// Build a list of `items` ending in `tail`. The items must already be
    /// reachable by the collector.
    fn list_with_tail(&mut self, items: &[Value], tail: Value) -> SchemeResult<Value> {
        let mark = self.protected();
        let mut result = tail;
        for &item in items.iter().rev() {
            result = self.cons(item, result)?;
            self.protect(result);
        }
        self.release(mark);
        Ok(result)
    }

    fn list(&mut self, items: &[Value]) -> SchemeResult<Value> {
        self.list_with_tail(items, Value::Null)
    }
}

/// A bare heap never collects: allocation fails as soon as the arena is full.
impl Mutator for Heap {
    fn heap(&self) -> &Heap {
        self
    }

    fn heap_mut(&mut self) -> &mut Heap {
        self
    }

    fn allocate(&mut self, object: Object) -> SchemeResult<u32> {
        self.try_alloc(object)
            .map_err(|object| SchemeError::OutOfMemory {
                requested: object.words(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(heap: &mut Heap, car: Value, cdr: Value) -> PairId {
        match heap.cons(car, cdr) {
            Ok(Value::Pair(id)) => id,
            other => panic!("cons failed: {:?}", other),
        }
    }

    #[test]
    fn allocation_fails_at_capacity() {
        let mut heap = Heap::new(6);
        pair(&mut heap, Value::Int(1), Value::Null);
        pair(&mut heap, Value::Int(2), Value::Null);
        assert_eq!(heap.used_words(), 6);
        assert!(matches!(
            heap.cons(Value::Int(3), Value::Null),
            Err(SchemeError::OutOfMemory { requested: 3 })
        ));
    }

    #[test]
    fn unreachable_blocks_are_reclaimed() {
        let mut heap = Heap::new(1024);
        let keep = pair(&mut heap, Value::Int(1), Value::Null);
        let drop = pair(&mut heap, Value::Int(2), Value::Null);

        let stats = heap.collect([keep.0]);
        assert_eq!(stats.reclaimed_blocks, 1);
        assert!(heap.is_live(keep.0));
        assert!(!heap.is_live(drop.0));
        assert_eq!(heap.car(keep), Value::Int(1));
    }

    #[test]
    fn reclaimed_slots_are_reused() {
        let mut heap = Heap::new(9);
        pair(&mut heap, Value::Int(1), Value::Null);
        pair(&mut heap, Value::Int(2), Value::Null);
        let kept = pair(&mut heap, Value::Int(3), Value::Null);
        heap.collect([kept.0]);
        assert_eq!(heap.used_words(), 3);

        let reused = pair(&mut heap, Value::Int(4), Value::Null);
        assert_ne!(reused, kept);
        assert_eq!(heap.live_blocks(), 2);
    }

    #[test]
    fn long_chains_trace_without_recursion() {
        let mut heap = Heap::new(4 * 3 * 200_000);
        let mut list = Value::Null;
        for i in 0..200_000 {
            list = Value::Pair(pair(&mut heap, Value::Int(i), list));
        }
        let stats = heap.collect(list.heap_slot());
        assert_eq!(stats.reclaimed_blocks, 0);
        assert_eq!(heap.live_blocks(), 200_000);
    }

    #[test]
    fn marks_survive_repeated_cycles() {
        let mut heap = Heap::new(1024);
        let inner = pair(&mut heap, Value::Int(1), Value::Null);
        let outer = pair(&mut heap, Value::Pair(inner), Value::Null);
        for _ in 0..5 {
            heap.collect([outer.0]);
        }
        assert!(heap.is_live(inner.0));
        assert_eq!(heap.collections(), 5);

        heap.collect(std::iter::empty());
        assert!(!heap.is_live(inner.0));
        assert!(!heap.is_live(outer.0));
        assert_eq!(heap.used_words(), 0);
    }

    #[test]
    fn cycles_are_traced_once() {
        let mut heap = Heap::new(1024);
        let a = pair(&mut heap, Value::Int(1), Value::Null);
        let b = pair(&mut heap, Value::Int(2), Value::Pair(a));
        heap.set_cdr(a, Value::Pair(b));
        let stats = heap.collect([a.0]);
        assert_eq!(stats.reclaimed_blocks, 0);
        assert_eq!(stats.live_words, 6);
    }
}
