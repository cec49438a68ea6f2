//! The data model of spec.md §3: global state `S`, nodes, edges, and
//! the access-info/failure records hung off an edge.

use crate::value::Handle;

/// The immutable-once-interned global state of the system.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GlobalState {
    /// The shared memory: a handle to an interned `Value::Dict`.
    pub vars: Handle,
    /// Snapshot of `vars` at the start of the current macrostep, for
    /// two-state invariants.
    pub pre: Handle,
    /// Context handle of the thread currently at a `choose` point, or
    /// `Handle::NONE`.
    pub choosing: Handle,
    /// Multiset of runnable contexts: (context handle, multiplicity).
    pub bag: Vec<(Handle, u32)>,
    /// Multiset of stopped contexts.
    pub stopbag: Vec<(Handle, u32)>,
    /// Current state in the behavior DFA, 0 if none is configured.
    pub dfa_state: u32,
}

impl GlobalState {
    /// Canonical byte encoding used as the C1 dedup key. Deterministic
    /// given the (already-sorted) bag/stopbag representation, so two
    /// structurally equal states always produce the same bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.bag.len() * 12 + self.stopbag.len() * 12);
        out.extend_from_slice(&self.vars.0.to_le_bytes());
        out.extend_from_slice(&self.pre.0.to_le_bytes());
        out.extend_from_slice(&self.choosing.0.to_le_bytes());
        out.extend_from_slice(&self.dfa_state.to_le_bytes());
        out.extend_from_slice(&(self.bag.len() as u32).to_le_bytes());
        for (h, m) in &self.bag {
            out.extend_from_slice(&h.0.to_le_bytes());
            out.extend_from_slice(&m.to_le_bytes());
        }
        out.extend_from_slice(&(self.stopbag.len() as u32).to_le_bytes());
        for (h, m) in &self.stopbag {
            out.extend_from_slice(&h.0.to_le_bytes());
            out.extend_from_slice(&m.to_le_bytes());
        }
        out
    }

    /// Adds one instance of `ctx` to the bag, merging multiplicities.
    pub fn bag_add(&mut self, ctx: Handle) {
        add_to_multiset(&mut self.bag, ctx);
    }

    pub fn bag_remove(&mut self, ctx: Handle) {
        remove_from_multiset(&mut self.bag, ctx);
    }

    pub fn stopbag_add(&mut self, ctx: Handle) {
        add_to_multiset(&mut self.stopbag, ctx);
    }
}

fn add_to_multiset(set: &mut Vec<(Handle, u32)>, key: Handle) {
    if let Some(entry) = set.iter_mut().find(|(h, _)| *h == key) {
        entry.1 += 1;
    } else {
        set.push((key, 1));
        set.sort_unstable_by_key(|(h, _)| *h);
    }
}

fn remove_from_multiset(set: &mut Vec<(Handle, u32)>, key: Handle) {
    if let Some(pos) = set.iter().position(|(h, _)| *h == key) {
        if set[pos].1 > 1 {
            set[pos].1 -= 1;
        } else {
            set.remove(pos);
        }
    }
}

/// Dense index into the graph's node array.
pub type NodeId = u32;
/// Dense index into the graph's edge array.
pub type EdgeId = u32;

pub const NO_EDGE: EdgeId = u32::MAX;
pub const NO_NODE: NodeId = u32::MAX;

/// One reachable global state, plus BFS bookkeeping and analysis flags.
pub struct Node {
    pub id: NodeId,
    pub state: GlobalState,
    /// Shortest path length (sum of edge weights) from the initial node.
    pub len: u32,
    /// VM-instruction count along that same shortest path.
    pub steps: u64,
    /// The incoming edge on the shortest path, or `NO_EDGE` for the
    /// initial node.
    pub to_parent: EdgeId,
    /// Head of the outgoing-edge intrusive list.
    pub fwd: EdgeId,
    /// Head of the incoming-edge intrusive list.
    pub bwd: EdgeId,
    /// Strongly-connected-component id, assigned in phase 2.
    pub component: u32,
    pub visited: bool,
    pub reachable: bool,
    pub is_final: bool,
}

impl Node {
    pub fn new(id: NodeId, state: GlobalState) -> Self {
        Node {
            id,
            state,
            len: 0,
            steps: 0,
            to_parent: NO_EDGE,
            fwd: NO_EDGE,
            bwd: NO_EDGE,
            component: u32::MAX,
            visited: false,
            reachable: false,
            is_final: false,
        }
    }
}

/// A record of a shared-memory access inside one macrostep, used for
/// race detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessInfo {
    pub pc: usize,
    pub atomic_depth: u32,
    pub is_write: bool,
    pub is_delete: bool,
    pub address: Handle,
}

/// One macrostep: an edge of the Kripke structure.
pub struct Edge {
    pub src: NodeId,
    pub dst: NodeId,
    /// Thread identity (interned context handle) before the step.
    pub ctx: Handle,
    /// Interned context handle after the step.
    pub after: Handle,
    /// Value chosen at a choose-point, or `Handle::NONE`.
    pub choice: Handle,
    pub interrupt: bool,
    /// 0 if this edge continues the parent's current thread, 1 otherwise.
    pub weight: u32,
    /// VM-instruction count in this macrostep.
    pub nsteps: u64,
    /// Values printed during this macrostep, in order.
    pub print_log: Vec<Handle>,
    pub accesses: Vec<AccessInfo>,
    /// Next outgoing edge of `src` (intrusive list, see `Node::fwd`).
    pub next_fwd: EdgeId,
    /// Next incoming edge of `dst` (intrusive list, see `Node::bwd`).
    pub next_bwd: EdgeId,
}

/// A recorded violation, ready to be ordered in the failure min-heap
/// by `(dst.len, dst.steps, dst.id)` and reconstructed by C8.
#[derive(Debug, Clone)]
pub enum FailureKind {
    Safety,
    Invariant { pc: usize },
    Termination,
    Busywait,
    Behavior,
    Race { address: Handle, pc_a: usize, pc_b: usize },
}

#[derive(Debug, Clone)]
pub struct Failure {
    pub kind: FailureKind,
    pub edge: EdgeId,
    pub node: NodeId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_deterministic_for_equal_states() {
        let s1 = GlobalState {
            vars: Handle(1),
            pre: Handle(1),
            choosing: Handle::NONE,
            bag: vec![(Handle(2), 1)],
            stopbag: vec![],
            dfa_state: 0,
        };
        let s2 = s1.clone();
        assert_eq!(s1.encode(), s2.encode());
    }

    #[test]
    fn bag_add_merges_multiplicities() {
        let mut s = GlobalState {
            vars: Handle(0),
            pre: Handle(0),
            choosing: Handle::NONE,
            bag: vec![],
            stopbag: vec![],
            dfa_state: 0,
        };
        s.bag_add(Handle(5));
        s.bag_add(Handle(5));
        assert_eq!(s.bag, vec![(Handle(5), 2)]);
        s.bag_remove(Handle(5));
        assert_eq!(s.bag, vec![(Handle(5), 1)]);
        s.bag_remove(Handle(5));
        assert!(s.bag.is_empty());
    }
}
