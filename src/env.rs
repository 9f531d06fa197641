use std::cmp::Ordering;

use crate::error::SchemeResult;
use crate::heap::{Heap, Mutator, Object};
use crate::value::{BindingId, FrameId, SymbolId, Value};

/// An environment frame: an unbalanced binary search tree of bindings
/// ordered by symbol handle, plus a link to the parent frame. Frames and
/// their nodes live in the arena, so an environment stays alive exactly as
/// long as a closure or call frame can reach it.
pub struct Frame {
    pub parent: Option<FrameId>,
    pub root: Option<BindingId>,
}

pub struct Binding {
    pub symbol: SymbolId,
    pub value: Value,
    pub left: Option<BindingId>,
    pub right: Option<BindingId>,
}

pub fn create_frame<M: Mutator>(m: &mut M, parent: Option<FrameId>) -> SchemeResult<FrameId> {
    let slot = m.allocate(Object::Frame(Frame { parent, root: None }))?;
    Ok(FrameId(slot))
}

/// Where a symbol sits, or would sit, in one frame's tree.
enum Search {
    Found(BindingId),
    Empty,
    Left(BindingId),
    Right(BindingId),
}

fn search(heap: &Heap, frame: FrameId, symbol: SymbolId) -> Search {
    let Some(mut node) = heap.frame(frame).root else {
        return Search::Empty;
    };
    loop {
        let binding = heap.binding(node);
        match symbol.cmp(&binding.symbol) {
            Ordering::Equal => return Search::Found(node),
            Ordering::Less => match binding.left {
                Some(next) => node = next,
                None => return Search::Left(node),
            },
            Ordering::Greater => match binding.right {
                Some(next) => node = next,
                None => return Search::Right(node),
            },
        }
    }
}

/// Insert or update `symbol` in `frame` only. The frame must be reachable
/// by the collector; `value` is kept alive by the pending node.
pub fn bind<M: Mutator>(
    m: &mut M,
    frame: FrameId,
    symbol: SymbolId,
    value: Value,
) -> SchemeResult<BindingId> {
    if let Search::Found(id) = search(m.heap(), frame, symbol) {
        m.heap_mut().binding_mut(id).value = value;
        return Ok(id);
    }

    let node = BindingId(m.allocate(Object::Binding(Binding {
        symbol,
        value,
        left: None,
        right: None,
    }))?);

    // A collection may have run, but nothing moved and the frame is live,
    // so probing again finds the same insertion point.
    let heap = m.heap_mut();
    match search(heap, frame, symbol) {
        Search::Empty => heap.frame_mut(frame).root = Some(node),
        Search::Left(parent) => heap.binding_mut(parent).left = Some(node),
        Search::Right(parent) => heap.binding_mut(parent).right = Some(node),
        Search::Found(_) => unreachable!("binding appeared during allocation"),
    }
    Ok(node)
}

/// Update the nearest existing binding of `symbol` anywhere on the chain,
/// or insert it into `frame` when no frame binds it.
pub fn bind_with_rebind<M: Mutator>(
    m: &mut M,
    frame: FrameId,
    symbol: SymbolId,
    value: Value,
) -> SchemeResult<BindingId> {
    match lookup_chain(m.heap(), frame, symbol) {
        Some(id) => {
            m.heap_mut().binding_mut(id).value = value;
            Ok(id)
        }
        None => bind(m, frame, symbol, value),
    }
}

pub fn lookup_local(heap: &Heap, frame: FrameId, symbol: SymbolId) -> Option<BindingId> {
    match search(heap, frame, symbol) {
        Search::Found(id) => Some(id),
        _ => None,
    }
}

/// Search `frame` and then each ancestor in turn.
pub fn lookup_chain(heap: &Heap, frame: FrameId, symbol: SymbolId) -> Option<BindingId> {
    let mut current = Some(frame);
    while let Some(frame) = current {
        if let Some(id) = lookup_local(heap, frame, symbol) {
            return Some(id);
        }
        current = heap.frame(frame).parent;
    }
    None
}
