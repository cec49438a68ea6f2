//! Analyzer (spec.md §4.5, component C7): classifies components,
//! detects busy-wait loops, and scans for invariant/behavior/race
//! failures once C6 has labelled every node.

use std::collections::{HashMap, HashSet};

use crate::dfa::Dfa;
use crate::graph::Graph;
use crate::state::{Failure, FailureKind, NodeId};
use crate::value::ValueTable;

pub struct Analyzer<'a> {
    pub graph: &'a Graph,
    pub values: &'a ValueTable,
    pub dfa: Option<&'a Dfa>,
    pub busywait_enabled: bool,
}

impl<'a> Analyzer<'a> {
    /// Runs every C7 check over the fully-explored, SCC-labelled
    /// graph and returns the failures it finds, appended to whatever
    /// C3 already recorded.
    pub fn analyze(&self, node_count: usize) -> Vec<Failure> {
        let mut failures = Vec::new();
        let members = self.component_members(node_count);

        for (component, nodes) in &members {
            let good = nodes.iter().any(|&n| self.leaves_component(n, *component));
            if good {
                continue;
            }

            let all_same = self.is_all_same(nodes);
            if all_same {
                self.mark_final(nodes);
                if let Some(dfa) = self.dfa {
                    for &n in nodes {
                        let dfa_state = self.graph.with_node(n, |node| node.state.dfa_state);
                        if !dfa.is_accepting(dfa_state) {
                            failures.push(Failure {
                                kind: FailureKind::Behavior,
                                edge: self.graph.with_node(n, |node| node.to_parent),
                                node: n,
                            });
                        }
                    }
                }
                continue;
            }

            for &n in nodes {
                failures.push(Failure {
                    kind: FailureKind::Termination,
                    edge: self.graph.with_node(n, |node| node.to_parent),
                    node: n,
                });
            }

            if self.busywait_enabled && nodes.len() > 1 {
                failures.extend(self.busywait_scan(nodes, *component));
            }
        }

        failures.extend(self.race_scan(node_count));
        failures
    }

    fn component_members(&self, node_count: usize) -> HashMap<u32, Vec<NodeId>> {
        let mut members: HashMap<u32, Vec<NodeId>> = HashMap::new();
        for id in 0..node_count as NodeId {
            let component = self.graph.with_node(id, |n| n.component);
            members.entry(component).or_default().push(id);
        }
        members
    }

    fn leaves_component(&self, node: NodeId, component: u32) -> bool {
        self.graph
            .fwd_edges(node)
            .into_iter()
            .any(|e| self.graph.with_edge(e, |edge| self.graph.with_node(edge.dst, |d| d.component != component)))
    }

    /// A component is all-same if every node shares `vars` and every
    /// context in every node's bag/stopbag is eternal (spec.md §4.5).
    fn is_all_same(&self, nodes: &[NodeId]) -> bool {
        let first_vars = self.graph.with_node(nodes[0], |n| n.state.vars);
        nodes.iter().all(|&n| {
            self.graph.with_node(n, |node| {
                if node.state.vars != first_vars {
                    return false;
                }
                node.state
                    .bag
                    .iter()
                    .chain(node.state.stopbag.iter())
                    .all(|(h, _)| self.values.get_context(*h).is_eternal())
            })
        })
    }

    fn mark_final(&self, nodes: &[NodeId]) {
        for &n in nodes {
            self.graph.with_node_mut(n, |node| node.is_final = true);
        }
    }

    /// DFS per spec.md §4.5: a context `c` at node `N` is busy-waiting
    /// if every chain of `c`'s own edges inside the component either
    /// returns to `N` with `vars` unchanged or dead-ends.
    fn busywait_scan(&self, nodes: &[NodeId], component: u32) -> Vec<Failure> {
        let mut failures = Vec::new();
        for &n in nodes {
            let bag = self.graph.with_node(n, |node| node.state.bag.clone());
            for (ctx, _) in bag {
                let vars_at_n = self.graph.with_node(n, |node| node.state.vars);
                let mut visited = HashSet::new();
                if self.busywaits(n, n, ctx, vars_at_n, component, &mut visited) {
                    let to_parent = self.graph.with_node(n, |node| node.to_parent);
                    failures.push(Failure { kind: FailureKind::Busywait, edge: to_parent, node: n });
                }
            }
        }
        failures
    }

    fn busywaits(
        &self,
        origin: NodeId,
        at: NodeId,
        ctx: crate::value::Handle,
        vars_at_origin: crate::value::Handle,
        component: u32,
        visited: &mut HashSet<NodeId>,
    ) -> bool {
        if !visited.insert(at) {
            return true;
        }
        let outgoing: Vec<_> = self
            .graph
            .fwd_edges(at)
            .into_iter()
            .filter(|&e| self.graph.with_edge(e, |edge| edge.ctx == ctx))
            .collect();
        let in_component = |n: NodeId| self.graph.with_node(n, |node| node.component == component);

        let result = if outgoing.is_empty() {
            true
        } else {
            outgoing.into_iter().all(|e| {
                let dst = self.graph.with_edge(e, |edge| edge.dst);
                if !in_component(dst) {
                    true
                } else if dst == origin {
                    self.graph.with_node(origin, |node| node.state.vars) == vars_at_origin
                } else {
                    self.busywaits(origin, dst, ctx, vars_at_origin, component, visited)
                }
            })
        };
        visited.remove(&at);
        result
    }

    /// Race scan per spec.md §4.5: for each pair of concurrent
    /// accesses to the same address from the same node's outgoing
    /// edges, at least one a write and at least one at atomic-depth 0.
    fn race_scan(&self, node_count: usize) -> Vec<Failure> {
        let mut failures = Vec::new();
        for n in 0..node_count as NodeId {
            let edges = self.graph.fwd_edges(n);
            for i in 0..edges.len() {
                for j in (i + 1)..edges.len() {
                    let (src_i, src_j) = (edges[i], edges[j]);
                    let accesses_i = self.graph.with_edge(src_i, |e| e.accesses.clone());
                    let accesses_j = self.graph.with_edge(src_j, |e| e.accesses.clone());
                    for a in &accesses_i {
                        for b in &accesses_j {
                            if a.address == b.address
                                && (a.is_write || b.is_write)
                                && (a.atomic_depth == 0 || b.atomic_depth == 0)
                            {
                                failures.push(Failure {
                                    kind: FailureKind::Race { address: a.address, pc_a: a.pc, pc_b: b.pc },
                                    edge: src_i,
                                    node: n,
                                });
                            }
                        }
                    }
                }
            }
        }
        failures
    }
}

