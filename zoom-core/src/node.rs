//! The prefix tree's node/counter arena and age-list linkage.
//!
//! Nodes are stored in a `Monitor`-owned arena and referenced by a stable
//! `NodeId` handle rather than through raw pointers: destruction returns
//! the freed node's age-list neighbors directly instead of threading them
//! through scratch fields.

use crate::ewma::Ewma;

/// A stable handle to a node in the monitor's arena. Cheap to copy, never
/// reused for a different node while that node is still referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(u32);

/// A per-address-byte traffic counter.
///
/// Exposes no mutating operations beyond field access — all tree surgery
/// (creation, zoom-in, destruction) is owned by the monitor.
#[derive(Debug, Clone)]
pub(crate) struct Counter {
    pub fwd_rate: Ewma,
    pub rev_rate: Ewma,
    pub child: Option<NodeId>,
    pub anno_tick: u64,
}

impl Counter {
    pub fn new(fwd_rate: Ewma, rev_rate: Ewma) -> Self {
        Self { fwd_rate, rev_rate, child: None, anno_tick: 0 }
    }
}

/// 256-way fan-out node keyed by one address byte per level.
///
/// Each slot holds an *owned pointer* to its `Counter`, not the `Counter`
/// inline — 256 inline `Counter`s (one per possible address byte, almost
/// always mostly empty) would make every `Node` tens of kilobytes
/// regardless of how many slots are actually in use, defeating the point
/// of a sparse 256-way array and making a small `memmax` impossible to
/// honor even for the root alone. Boxing each slot keeps an
/// empty slot at one pointer's worth of bytes; `SIZE_OF_COUNTER` is billed
/// separately, only when a slot is actually populated.
pub(crate) struct Node {
    pub counters: Box<[Option<Box<Counter>>; 256]>,
    /// The `(node, slot)` of the Counter whose `child` points to this node.
    /// `None` only for the root.
    pub parent: Option<(NodeId, u8)>,
    pub prev: Option<NodeId>,
    pub next: Option<NodeId>,
}

impl Node {
    pub fn empty(parent: Option<(NodeId, u8)>) -> Self {
        Self { counters: Box::new(std::array::from_fn(|_| None)), parent, prev: None, next: None }
    }
}

/// Byte footprint this implementation books against `allocated_bytes` for
/// one `Node`: the 256-slot pointer array plus the linkage fields.
pub(crate) const SIZE_OF_NODE: usize = std::mem::size_of::<[Option<Box<Counter>>; 256]>()
    + std::mem::size_of::<Option<(NodeId, u8)>>()
    + 2 * std::mem::size_of::<Option<NodeId>>();

/// Byte footprint booked against `allocated_bytes` for one `Counter`.
pub(crate) const SIZE_OF_COUNTER: usize = std::mem::size_of::<Counter>();

/// Slab arena of `Node`s, indexed by `NodeId`. Freed slots are recycled.
pub(crate) struct Arena {
    slots: Vec<Option<Node>>,
    free: Vec<u32>,
}

impl Arena {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new() }
    }

    pub fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(node);
            NodeId(idx)
        } else {
            self.slots.push(Some(node));
            NodeId((self.slots.len() - 1) as u32)
        }
    }

    pub fn dealloc(&mut self, id: NodeId) -> Node {
        let node = self.slots[id.0 as usize].take().expect("double free of tree node");
        self.free.push(id.0);
        node
    }

    pub fn get(&self, id: NodeId) -> &Node {
        self.slots[id.0 as usize].as_ref().expect("use of freed tree node")
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        self.slots[id.0 as usize].as_mut().expect("use of freed tree node")
    }
}
