//! Top-level orchestration: wires components C1–C8 together into one
//! checking run (spec.md §4, §7).

use tracing::info;

use crate::analyzer::Analyzer;
use crate::config::Config;
use crate::dfa::Dfa;
use crate::error::CharmError;
use crate::graph::Graph;
use crate::hashtable::{Arena, HashTable};
use crate::context::Context;
use crate::report::{self, Report};
use crate::scc;
use crate::state::{Failure, GlobalState, NodeId};
use crate::value::{Handle, ValueTable};
use crate::vmcode::Program;
use crate::witness::Reconstructor;
use crate::worker::Coordinator;

const INITIAL_BUCKETS: usize = 4096;

pub struct CheckOutcome {
    pub report: Report,
    pub timed_out: bool,
}

/// Runs one complete check: explores the state space (C3/C4) into a
/// graph (C5/C1), decomposes it into components (C6), analyzes the
/// result (C7), and — on the worst surviving failure — reconstructs a
/// witness (C8) before building the final report.
pub struct Checker {
    program: Program,
    dfa: Option<Dfa>,
    nworkers: usize,
    timeout_secs: u64,
    busywait_enabled: bool,
}

impl Checker {
    pub fn from_config(config: &Config) -> Result<Self, CharmError> {
        let program = crate::input::load(&config.input)?;
        let dfa = match &config.dfa_file {
            Some(path) => Some(Dfa::load(path)?),
            None => None,
        };
        Ok(Checker {
            program,
            dfa,
            nworkers: config.nworkers.max(1),
            timeout_secs: config.timeout_secs,
            busywait_enabled: config.busywait_enabled,
        })
    }

    pub fn run(&self) -> CheckOutcome {
        let values = ValueTable::new();
        let graph = Graph::new();
        let states: HashTable<NodeId> = HashTable::new(INITIAL_BUCKETS, self.nworkers);

        let initial_ctx = Context::new(self.program.entry_pc, Handle::NONE);
        let initial_ctx_handle = values.intern_context(initial_ctx);
        let mut initial_state = GlobalState {
            vars: values.intern_dict(Vec::new()),
            pre: values.intern_dict(Vec::new()),
            choosing: Handle::NONE,
            bag: Vec::new(),
            stopbag: Vec::new(),
            dfa_state: self.dfa.as_ref().map(Dfa::start).unwrap_or(0),
        };
        initial_state.bag_add(initial_ctx_handle);

        let key = initial_state.encode();
        let mut arena = Arena::new();
        let (slot, _is_new) = states.insert(&mut arena, &key, || graph.push_node(initial_state));
        let initial_node = *slot;

        info!(workers = self.nworkers, "starting exploration");
        let coordinator = Coordinator {
            program: &self.program,
            values: &values,
            states: &states,
            graph: &graph,
            dfa: self.dfa.as_ref(),
            nworkers: self.nworkers,
            timeout_secs: self.timeout_secs,
        };
        let run_result = coordinator.run(initial_node);
        let node_count = graph.node_count();
        info!(nodes = node_count, edges = graph.edge_count(), diameter = run_result.diameter, "exploration complete");

        scc::decompose(&graph, node_count, self.nworkers);

        let analyzer = Analyzer {
            graph: &graph,
            values: &values,
            dfa: self.dfa.as_ref(),
            busywait_enabled: self.busywait_enabled,
        };
        let mut failures = run_result.failures;
        failures.extend(analyzer.analyze(node_count));

        let hvm = serde_json::json!({
            "nodes": node_count,
            "edges": graph.edge_count(),
            "diameter": run_result.diameter,
            "workers": self.nworkers,
        });

        if let Some(worst) = pick_worst(&graph, &failures) {
            let reconstructor = Reconstructor {
                graph: &graph,
                values: &values,
                program: &self.program,
            };
            let witness = reconstructor.reconstruct(worst);
            let report = report::build_failure(report::issue_tag(&worst.kind), witness.macrosteps, hvm);
            return CheckOutcome { report, timed_out: run_result.timed_out };
        }

        let report = report::build_success(&graph, &values, node_count, run_result.profile, hvm);
        CheckOutcome { report, timed_out: run_result.timed_out }
    }
}

/// Picks the failure to report per spec.md §7: ordered by `(dst.len,
/// dst.steps, dst.id)` so the shortest, then most-deterministic,
/// counterexample wins ties.
fn pick_worst<'f>(graph: &Graph, failures: &'f [Failure]) -> Option<&'f Failure> {
    failures.iter().min_by_key(|f| {
        let (len, steps) = graph.with_node(f.node, |n| (n.len, n.steps));
        (len, steps, f.node)
    })
}
