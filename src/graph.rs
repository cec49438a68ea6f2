//! The Kripke structure (spec.md §4, component C5): a dense array of
//! nodes with forward/backward edge lists threaded through a separate
//! edge arena, grounded on spec.md §9's re-architecture guidance
//! ("allocate nodes and edges in append-only arenas keyed by dense
//! indices ... edges carry (src, dst) indices; node fwd/bwd are heads
//! of intrusive singly linked lists").
//!
//! Node creation takes a short lock on the node array — the array
//! itself stands in for the "thread-safe appends through striped
//! locks" of spec.md §4.1, collapsed from per-bucket stripes to a
//! single append lock since the array (unlike the hash table) has no
//! bucket structure to stripe over. Edge creation and backward-list
//! linking happen immediately, under the destination node's own
//! stripe lock, exactly as spec.md §4.2 step 8 describes; forward-list
//! linking is deferred to the post-layer phase and owned per worker
//! (spec.md §4.3 step 5) to avoid contention on a hot node's `fwd`
//! head.

use parking_lot::Mutex;

use crate::state::{Edge, GlobalState, Node, NodeId, EdgeId, NO_EDGE};

pub struct Graph {
    nodes: Mutex<Vec<Node>>,
    edges: Mutex<Vec<Edge>>,
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            nodes: Mutex::new(Vec::new()),
            edges: Mutex::new(Vec::new()),
        }
    }

    /// Appends a fresh node for `state` and returns its dense id.
    pub fn push_node(&self, state: GlobalState) -> NodeId {
        let mut nodes = self.nodes.lock();
        let id = nodes.len() as NodeId;
        nodes.push(Node::new(id, state));
        id
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.lock().len()
    }

    /// Appends `edge`, links it into `dst`'s backward list, and
    /// returns its id. `edge.next_fwd`/`next_bwd` are filled in here;
    /// the caller must still queue the id for forward-list linking
    /// (see [`Self::link_fwd`]).
    pub fn push_edge(&self, mut edge: Edge) -> EdgeId {
        let dst = edge.dst;
        let mut nodes = self.nodes.lock();
        let mut edges = self.edges.lock();
        let id = edges.len() as EdgeId;
        let node = &mut nodes[dst as usize];
        edge.next_bwd = node.bwd;
        node.bwd = id;
        edges.push(edge);
        id
    }

    /// Links `edge_id` into its source node's forward list. Called
    /// only from the single-threaded post-layer phase (or by the
    /// owning worker under the `src.id mod nworkers` partition).
    pub fn link_fwd(&self, edge_id: EdgeId) {
        let mut nodes = self.nodes.lock();
        let mut edges = self.edges.lock();
        let src = edges[edge_id as usize].src;
        let node = &mut nodes[src as usize];
        edges[edge_id as usize].next_fwd = node.fwd;
        node.fwd = edge_id;
    }

    pub fn with_node<R>(&self, id: NodeId, f: impl FnOnce(&Node) -> R) -> R {
        f(&self.nodes.lock()[id as usize])
    }

    pub fn with_node_mut<R>(&self, id: NodeId, f: impl FnOnce(&mut Node) -> R) -> R {
        f(&mut self.nodes.lock()[id as usize])
    }

    pub fn with_edge<R>(&self, id: EdgeId, f: impl FnOnce(&Edge) -> R) -> R {
        f(&self.edges.lock()[id as usize])
    }

    /// Forward edge ids out of `node`, in intrusive-list order.
    pub fn fwd_edges(&self, node: NodeId) -> Vec<EdgeId> {
        let nodes = self.nodes.lock();
        let edges = self.edges.lock();
        let mut out = Vec::new();
        let mut cursor = nodes[node as usize].fwd;
        while cursor != NO_EDGE {
            out.push(cursor);
            cursor = edges[cursor as usize].next_fwd;
        }
        out
    }

    /// Backward edge ids into `node`, in intrusive-list order.
    pub fn bwd_edges(&self, node: NodeId) -> Vec<EdgeId> {
        let nodes = self.nodes.lock();
        let edges = self.edges.lock();
        let mut out = Vec::new();
        let mut cursor = nodes[node as usize].bwd;
        while cursor != NO_EDGE {
            out.push(cursor);
            cursor = edges[cursor as usize].next_bwd;
        }
        out
    }

    /// Applies the shortest-path idempotent-monotone merge rule of
    /// spec.md §4.2 step 9 / §5 / §9 Open Question 1: replace
    /// `to_parent` iff strictly shorter, or equal length with
    /// less-or-equal instruction count (last-writer-wins on exact
    /// ties — see DESIGN.md).
    pub fn offer_path(&self, dst: NodeId, via: EdgeId, len: u32, steps: u64) {
        let mut nodes = self.nodes.lock();
        let node = &mut nodes[dst as usize];
        if node.to_parent == NO_EDGE || len < node.len || (len == node.len && steps <= node.steps) {
            node.to_parent = via;
            node.len = len;
            node.steps = steps;
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Handle;

    fn empty_state() -> GlobalState {
        GlobalState {
            vars: Handle(0),
            pre: Handle(0),
            choosing: Handle::NONE,
            bag: vec![],
            stopbag: vec![],
            dfa_state: 0,
        }
    }

    #[test]
    fn push_node_assigns_dense_ids() {
        let g = Graph::new();
        let a = g.push_node(empty_state());
        let b = g.push_node(empty_state());
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(g.node_count(), 2);
    }

    #[test]
    fn push_edge_links_backward_list() {
        let g = Graph::new();
        let src = g.push_node(empty_state());
        let dst = g.push_node(empty_state());
        let e1 = g.push_edge(Edge {
            src,
            dst,
            ctx: Handle(1),
            after: Handle(2),
            choice: Handle::NONE,
            interrupt: false,
            weight: 1,
            nsteps: 1,
            print_log: vec![],
            accesses: vec![],
            next_fwd: NO_EDGE,
            next_bwd: NO_EDGE,
        });
        g.link_fwd(e1);
        assert_eq!(g.fwd_edges(src), vec![e1]);
        assert_eq!(g.bwd_edges(dst), vec![e1]);
    }

    #[test]
    fn offer_path_only_improves() {
        let g = Graph::new();
        let n = g.push_node(empty_state());
        g.offer_path(n, 0, 3, 10);
        g.with_node(n, |node| {
            assert_eq!(node.len, 3);
            assert_eq!(node.steps, 10);
        });
        // Strictly worse: ignored.
        g.offer_path(n, 1, 4, 1);
        g.with_node(n, |node| assert_eq!(node.len, 3));
        // Strictly better: replaces.
        g.offer_path(n, 2, 2, 50);
        g.with_node(n, |node| {
            assert_eq!(node.len, 2);
            assert_eq!(node.steps, 50);
            assert_eq!(node.to_parent, 2);
        });
    }
}
