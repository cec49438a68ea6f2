//! Worker pool and BFS coordinator (spec.md §4.3, component C4).
//!
//! Grounded on spec.md §5's concurrency model (three reusable
//! barriers per epoch, a single mutex over the `(todo, goal)` cursor)
//! and, for the barrier/scoped-thread shape itself, on the teacher's
//! idiom of driving worker fan-out through `crossbeam::thread::scope`
//! rather than manually joined `std::thread::spawn` handles.

use std::sync::atomic::AtomicPtr;
use std::sync::Barrier;

use parking_lot::Mutex;

use crate::dfa::Dfa;
use crate::graph::Graph;
use crate::hashtable::{HashTable, HtNode};
use crate::state::{Failure, NodeId};
use crate::step::{FwdQueues, StepExecutor, StepOutcome, WorkerScratch};
use crate::value::{Handle, ValueTable};
use crate::vmcode::Program;

/// Minimum batch of nodes a worker claims per cursor fetch-and-add
/// (spec.md §4.3 step 2).
const MIN_BATCH: usize = 100;
/// Sub-layer growth increment for `goal` (spec.md §4.3 step 4).
const SUBLAYER_STEP: usize = 1024;

struct Cursor {
    todo: usize,
    goal: usize,
}

pub struct Coordinator<'a> {
    pub program: &'a Program,
    pub values: &'a ValueTable,
    pub states: &'a HashTable<NodeId>,
    pub graph: &'a Graph,
    pub dfa: Option<&'a Dfa>,
    pub nworkers: usize,
    pub timeout_secs: u64,
}

pub struct RunResult {
    pub diameter: u32,
    pub failures: Vec<Failure>,
    pub profile: Vec<u64>,
    pub timed_out: bool,
}

impl<'a> Coordinator<'a> {
    /// Runs BFS layers to fixpoint (or until the first failure
    /// closes the layer, or the timeout fires), returning the merged
    /// per-worker failure queue and instruction profile.
    pub fn run(&self, initial: NodeId) -> RunResult {
        let cursor = Mutex::new(Cursor { todo: 0, goal: 1 });
        let start_barrier = Barrier::new(self.nworkers);
        let middle_barrier = Barrier::new(self.nworkers);
        let end_barrier = Barrier::new(self.nworkers);

        let diameter = std::sync::atomic::AtomicU32::new(0);
        let done = std::sync::atomic::AtomicBool::new(false);
        let timed_out = std::sync::atomic::AtomicBool::new(false);
        let total_new_nodes = std::sync::atomic::AtomicUsize::new(0);
        let any_failure = std::sync::atomic::AtomicBool::new(false);
        let failures: Mutex<Vec<Failure>> = Mutex::new(Vec::new());
        let profile: Mutex<Vec<u64>> = Mutex::new(vec![0; self.program.code.len()]);
        let fwd_queues = FwdQueues::new(self.nworkers);
        // Set by worker 0 at the quiesced middle-barrier handoff when
        // `should_grow` fires; every worker then rehashes its own
        // disjoint stripe of the new array before the next layer starts
        // (spec.md §4.1 "Modes", `grow_prepare`/`make_stable`).
        let grow_job: Mutex<Option<(&'static Vec<AtomicPtr<HtNode<NodeId>>>, usize)>> = Mutex::new(None);

        self.states.begin_concurrent();
        let start = std::time::Instant::now();
        let _ = initial;

        crossbeam::thread::scope(|scope| {
            for worker_id in 0..self.nworkers {
                let cursor = &cursor;
                let start_barrier = &start_barrier;
                let middle_barrier = &middle_barrier;
                let end_barrier = &end_barrier;
                let diameter = &diameter;
                let done = &done;
                let timed_out = &timed_out;
                let failures = &failures;
                let profile = &profile;
                let fwd_queues = &fwd_queues;
                let total_new_nodes = &total_new_nodes;
                let any_failure = &any_failure;
                let grow_job = &grow_job;
                scope.spawn(move |_| {
                    let mut scratch = WorkerScratch::new(self.program.code.len());
                    let executor = StepExecutor {
                        program: self.program,
                        values: self.values,
                        states: self.states,
                        graph: self.graph,
                        dfa: self.dfa,
                        fwd_queues,
                        nworkers: self.nworkers,
                    };

                    loop {
                        start_barrier.wait();
                        if done.load(std::sync::atomic::Ordering::SeqCst) {
                            break;
                        }

                        self.run_sublayer(worker_id, cursor, &executor, &mut scratch);

                        total_new_nodes.fetch_add(scratch.new_nodes.len(), std::sync::atomic::Ordering::SeqCst);
                        if !scratch.failures.is_empty() {
                            any_failure.store(true, std::sync::atomic::Ordering::SeqCst);
                        }
                        {
                            let mut merged = failures.lock();
                            merged.append(&mut scratch.failures);
                            let mut p = profile.lock();
                            for (slot, count) in p.iter_mut().zip(scratch.profile.iter()) {
                                *slot += count;
                            }
                        }

                        middle_barrier.wait();
                        if worker_id == 0 {
                            if start.elapsed().as_secs() >= self.timeout_secs {
                                timed_out.store(true, std::sync::atomic::Ordering::SeqCst);
                                done.store(true, std::sync::atomic::Ordering::SeqCst);
                            } else {
                                let mut c = cursor.lock();
                                let layer_done = c.todo >= self.graph.node_count();
                                if layer_done {
                                    diameter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                                    let no_new = total_new_nodes.swap(0, std::sync::atomic::Ordering::SeqCst) == 0;
                                    let has_failure = any_failure.swap(false, std::sync::atomic::Ordering::SeqCst);
                                    c.goal = self.graph.node_count();
                                    if has_failure || no_new {
                                        done.store(true, std::sync::atomic::Ordering::SeqCst);
                                    }
                                } else {
                                    c.goal = self.graph.node_count().min(c.todo + SUBLAYER_STEP * self.nworkers);
                                }
                            }
                            *grow_job.lock() = self.states.should_grow().map(|n| (self.states.grow_prepare(n), n));
                        }

                        end_barrier.wait();
                        if let Some((old, new_nbuckets)) = *grow_job.lock() {
                            self.rehash_my_stripe(worker_id, old, new_nbuckets);
                        }
                        self.flush_forward_edges(worker_id, fwd_queues);
                        scratch.new_nodes.clear();

                        if done.load(std::sync::atomic::Ordering::SeqCst) {
                            break;
                        }
                    }
                });
            }
        })
        .expect("worker thread panicked");

        self.states.end_concurrent();

        RunResult {
            diameter: diameter.load(std::sync::atomic::Ordering::SeqCst),
            failures: failures.into_inner(),
            profile: profile.into_inner(),
            timed_out: timed_out.load(std::sync::atomic::Ordering::SeqCst),
        }
    }

    /// Claims and processes batches from `[todo, goal)` until the
    /// cursor is exhausted (spec.md §4.3 steps 2–3).
    fn run_sublayer(&self, worker_id: usize, cursor: &Mutex<Cursor>, executor: &StepExecutor<'_>, scratch: &mut WorkerScratch) {
        loop {
            let batch = {
                let mut c = cursor.lock();
                if c.todo >= c.goal {
                    return;
                }
                let remaining = c.goal - c.todo;
                let batch_size = remaining.min(MIN_BATCH.max(remaining / (2 * self.nworkers.max(1))).max(1));
                let start = c.todo;
                c.todo += batch_size;
                start..(start + batch_size)
            };

            for node in batch {
                let node = node as NodeId;
                let (choosing, bag) = self.graph.with_node(node, |n| (n.state.choosing, n.state.bag.clone()));
                if !choosing.is_none() {
                    let choices = self.values.choice_set_members(choosing);
                    for choice in choices {
                        self.run_one(executor, scratch, node, choosing, choice, false, worker_id);
                    }
                } else {
                    for (ctx, mult) in bag {
                        let _ = mult;
                        self.run_one(executor, scratch, node, ctx, Handle::NONE, false, worker_id);
                        // An interruptible thread parked in front of `setintlevel(true)`
                        // or a terminal `return` (spec.md §4.2 step 5) also gets the
                        // trap handler tried first, alongside the normal continuation.
                        if crate::step::context_awaits_interrupt(self.program, &self.values.get_context(ctx)) {
                            self.run_one(executor, scratch, node, ctx, Handle::NONE, true, worker_id);
                        }
                    }
                }
            }
        }
    }

    fn run_one(
        &self,
        executor: &StepExecutor<'_>,
        scratch: &mut WorkerScratch,
        node: NodeId,
        ctx: Handle,
        choice: Handle,
        interrupt: bool,
        _worker_id: usize,
    ) {
        match executor.step(scratch, node, ctx, choice, interrupt, false, 1) {
            StepOutcome::Edge(_) => {}
            StepOutcome::Retry => {
                executor.step(scratch, node, ctx, choice, interrupt, true, 1);
            }
        }
    }

    /// Rehashes this worker's disjoint slice of `[0, new_nbuckets)`
    /// out of `old` (spec.md §4.1 `make_stable`); every worker calls
    /// this once per growth, between the middle and end barriers of
    /// the same epoch that decided to grow, so no insertion races the
    /// rehash.
    fn rehash_my_stripe(&self, worker_id: usize, old: &[AtomicPtr<HtNode<NodeId>>], new_nbuckets: usize) {
        let nworkers = self.nworkers.max(1);
        let share = (new_nbuckets + nworkers - 1) / nworkers;
        let start = (worker_id * share).min(new_nbuckets);
        let end = (start + share).min(new_nbuckets);
        if start < end {
            self.states.rehash_stripe(old, start, end);
        }
    }

    /// Links worker `worker_id`'s partition of queued edges into
    /// their source nodes' forward lists (spec.md §4.3 step 5); no
    /// two workers ever touch the same node's `fwd` head, since
    /// `FwdQueues` partitions by `src.id mod nworkers`.
    fn flush_forward_edges(&self, worker_id: usize, fwd_queues: &FwdQueues) {
        for edge_id in fwd_queues.drain(worker_id) {
            self.graph.link_fwd(edge_id);
        }
    }
}
