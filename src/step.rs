//! The step executor (spec.md §4.2, component C3): turns one thread's
//! turn into one graph edge.
//!
//! Grounded on spec.md §9's guidance to factor the original's two
//! near-copies of the step executor (`onestep`/`twostep`) into one
//! state machine parameterised by its break/detection flags, and on
//! `execution_engine.rs`'s fetch-decode-execute loop shape (a `match`
//! over the current instruction mutating worker-local scratch, rather
//! than a recursive evaluator).

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::dfa::Dfa;
use crate::error::CharmError;
use crate::graph::Graph;
use crate::hashtable::{Arena, HashTable};
use crate::context::Context;
use crate::state::{AccessInfo, Edge, Failure, FailureKind, GlobalState, NodeId};
use crate::value::{Handle, Value, ValueTable};
use crate::vmcode::{eval_nary, Address, Const, EvalResult, Instr, Program};

/// Per-worker mutable state that outlives a single `step` call:
/// allocator, forward-edge-link queue, newly discovered nodes, and
/// this worker's local failure list and per-pc profile counts.
pub struct WorkerScratch {
    pub arena: Arena,
    pub new_nodes: Vec<NodeId>,
    pub failures: Vec<Failure>,
    pub profile: Vec<u64>,
}

impl WorkerScratch {
    pub fn new(code_len: usize) -> Self {
        WorkerScratch {
            arena: Arena::new(),
            new_nodes: Vec::new(),
            failures: Vec::new(),
            profile: vec![0; code_len],
        }
    }
}

/// Shared per-target-worker queues of edges awaiting forward-list
/// linking: `fwd_queues[w]` holds every edge whose `src.id mod
/// nworkers == w`, regardless of which worker's step call created it
/// (spec.md §4.3 step 8 / step 5: "queued on `edges[src.id mod
/// nworkers]` for the owning worker to link ... in the post-layer
/// phase").
pub struct FwdQueues {
    queues: Vec<Mutex<Vec<crate::state::EdgeId>>>,
}

impl FwdQueues {
    pub fn new(nworkers: usize) -> Self {
        FwdQueues {
            queues: (0..nworkers.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    fn push(&self, owner: usize, edge: crate::state::EdgeId) {
        self.queues[owner % self.queues.len()].lock().push(edge);
    }

    /// Drains worker `id`'s queue for the post-layer link phase.
    pub fn drain(&self, id: usize) -> Vec<crate::state::EdgeId> {
        std::mem::take(&mut *self.queues[id % self.queues.len()].lock())
    }
}

pub enum StepOutcome {
    /// A macrostep completed and produced this edge.
    Edge(crate::state::EdgeId),
    /// An infinite loop was suspected; retry this same call with
    /// `infloop_detect = true` (spec.md §4.2 step 4).
    Retry,
}

/// Instruction budget before infinite-loop detection engages
/// unconditionally (spec.md §4.2 step 4).
const INFLOOP_THRESHOLD: u32 = 1000;

pub struct StepExecutor<'a> {
    pub program: &'a Program,
    pub values: &'a ValueTable,
    pub states: &'a HashTable<NodeId>,
    pub graph: &'a Graph,
    pub dfa: Option<&'a Dfa>,
    pub fwd_queues: &'a FwdQueues,
    pub nworkers: usize,
}

impl<'a> StepExecutor<'a> {
    /// Runs one macrostep of `thread` from `node`. `choice` is the
    /// value decided for a pending `choose` point (`Handle::NONE` if
    /// none is pending), `interrupt` requests the trap handler run
    /// first, `infloop_detect` forces cycle detection from
    /// instruction zero, and `multiplicity` is the bag count of
    /// `thread` at `node` (informational: it does not change which
    /// single copy is stepped).
    pub fn step(
        &self,
        scratch: &mut WorkerScratch,
        node: NodeId,
        thread: Handle,
        choice: Handle,
        interrupt: bool,
        infloop_detect: bool,
        multiplicity: u32,
    ) -> StepOutcome {
        let _ = multiplicity;
        let parent_state = self.graph.with_node(node, |n| n.state.clone());
        let mut ctx = self.values.get_context(thread);
        let mut vars = decode_vars(self.values, parent_state.vars);

        if interrupt {
            if let Some(trap_pc) = ctx.trap_pc {
                ctx.push(ctx.trap_arg);
                ctx.pc = trap_pc;
            }
        }

        let mut instr_count: u32 = 0;
        let mut seen: Option<HashSet<Vec<u8>>> = None;
        let mut snapshot: Option<(Context, HashMap<String, Handle>, u32)> = None;
        let mut print_log: Vec<Handle> = Vec::new();
        let mut accesses: Vec<AccessInfo> = Vec::new();
        let mut resumed_choice = !choice.is_none();
        let mut infloop_failure = false;

        loop {
            if ctx.terminated || ctx.failed || ctx.stopped {
                break;
            }

            let Some(instr) = self.program.fetch(ctx.pc) else {
                ctx.terminated = true;
                break;
            };

            if let Instr::Choose = instr {
                if resumed_choice {
                    // Already decided on entry: pop the set, push the
                    // chosen value, and fall through to execute it as
                    // a normal instruction below.
                } else {
                    match self.values.get(ctx.top()) {
                        Value::Set(members) if !members.is_empty() => {
                            if ctx.is_atomic() && !ctx.atomic_flag {
                                if let Some((snap_ctx, snap_vars, snap_count)) = snapshot.take() {
                                    ctx = snap_ctx;
                                    vars = snap_vars;
                                    instr_count = snap_count;
                                }
                            }
                            let after = self.values.intern_context(ctx.clone());
                            return self.finish_macrostep(
                                scratch,
                                node,
                                thread,
                                after,
                                true,
                                interrupt,
                                parent_state,
                                vars,
                                instr_count,
                                print_log,
                                accesses,
                                None,
                            );
                        }
                        _ => {
                            ctx.failed = true;
                            ctx.failure = Some("choose on empty or non-set value".to_string());
                            break;
                        }
                    }
                }
            } else if (instr.is_breakable() || is_interrupt_break(instr, &ctx)) && instr_count > 0 {
                if ctx.is_atomic() && !ctx.atomic_flag {
                    if let Some((snap_ctx, snap_vars, snap_count)) = snapshot.take() {
                        ctx = snap_ctx;
                        vars = snap_vars;
                        instr_count = snap_count;
                    }
                }
                break;
            }
            resumed_choice = false;

            scratch.profile[ctx.pc] += 1;
            exec_one(
                instr,
                &mut ctx,
                &mut vars,
                self.values,
                &mut print_log,
                &mut accesses,
                &mut snapshot,
                instr_count,
                choice,
            );
            ctx.pc = ctx.pc.wrapping_add(1);
            instr_count += 1;

            if instr_count > INFLOOP_THRESHOLD || infloop_detect {
                let set = seen.get_or_insert_with(HashSet::new);
                let mut key = Vec::new();
                key.extend_from_slice(&ctx.pc.to_le_bytes());
                for h in &ctx.stack {
                    key.extend_from_slice(&h.0.to_le_bytes());
                }
                for h in &ctx.locals {
                    key.extend_from_slice(&h.0.to_le_bytes());
                }
                if !set.insert(key) {
                    if infloop_detect {
                        ctx.failed = true;
                        ctx.failure = Some("infinite loop detected within macrostep".to_string());
                        infloop_failure = true;
                        break;
                    } else {
                        return StepOutcome::Retry;
                    }
                }
            }
        }

        let failure_kind = if ctx.failed {
            Some(if infloop_failure { FailureKind::Termination } else { FailureKind::Safety })
        } else {
            None
        };
        let after = self.values.intern_context(ctx);
        self.finish_macrostep(
            scratch,
            node,
            thread,
            after,
            false,
            interrupt,
            parent_state,
            vars,
            instr_count,
            print_log,
            accesses,
            failure_kind,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_macrostep(
        &self,
        scratch: &mut WorkerScratch,
        node: NodeId,
        thread: Handle,
        after: Handle,
        is_choosing_break: bool,
        interrupt: bool,
        parent_state: GlobalState,
        vars: HashMap<String, Handle>,
        instr_count: u32,
        print_log: Vec<Handle>,
        accesses: Vec<AccessInfo>,
        failure_kind: Option<FailureKind>,
    ) -> StepOutcome {
        let mut new_state = GlobalState {
            vars: encode_vars(self.values, &vars),
            pre: parent_state.vars,
            choosing: Handle::NONE,
            bag: parent_state.bag.clone(),
            stopbag: parent_state.stopbag.clone(),
            dfa_state: parent_state.dfa_state,
        };
        new_state.bag_remove(thread);

        let after_ctx = self.values.get_context(after);
        if is_choosing_break {
            new_state.choosing = after;
        } else if after_ctx.stopped {
            new_state.stopbag_add(after);
        } else if !after_ctx.terminated {
            new_state.bag_add(after);
        }

        if let Some(dfa) = self.dfa {
            for sym in &print_log {
                new_state.dfa_state = dfa.step(new_state.dfa_state, &self.values.display(*sym));
            }
        }

        let key = new_state.encode();
        let (dst, is_new, _guard) = self.states.insert_locked(&mut scratch.arena, &key, || {
            self.graph.push_node(new_state.clone())
        });
        let dst_id = *dst;
        if is_new {
            scratch.new_nodes.push(dst_id);
        }

        let parent_edge_after = self.graph.with_node(node, |n| {
            if n.to_parent == crate::state::NO_EDGE {
                None
            } else {
                Some(self.graph.with_edge(n.to_parent, |e| e.ctx))
            }
        });
        let weight = match parent_edge_after {
            Some(prev_ctx) if prev_ctx == thread => 0,
            _ => 1,
        };

        let edge = Edge {
            src: node,
            dst: dst_id,
            ctx: thread,
            after,
            choice: Handle::NONE,
            interrupt,
            weight,
            nsteps: instr_count as u64,
            print_log,
            accesses,
            next_fwd: crate::state::NO_EDGE,
            next_bwd: crate::state::NO_EDGE,
        };
        let edge_id = self.graph.push_edge(edge);
        let owner = node as usize % self.nworkers.max(1);
        self.fwd_queues.push(owner, edge_id);

        let (parent_len, parent_steps) = self.graph.with_node(node, |n| (n.len, n.steps));
        self.graph
            .offer_path(dst_id, edge_id, parent_len + weight, parent_steps + instr_count as u64);

        if let Some(kind) = failure_kind {
            scratch.failures.push(Failure { kind, edge: edge_id, node: dst_id });
        }

        if !is_choosing_break && !self.program.invariants.is_empty() {
            for inv in &self.program.invariants {
                if !self.check_invariant(scratch, inv, &parent_state, &new_state) {
                    scratch.failures.push(Failure {
                        kind: FailureKind::Invariant { pc: inv.pc },
                        edge: edge_id,
                        node: dst_id,
                    });
                    break;
                }
            }
        }

        StepOutcome::Edge(edge_id)
    }

    /// Evaluates one registered invariant as its own miniature
    /// macrostep starting at `inv.pc`, per spec.md §4.2 step 10.
    fn check_invariant(
        &self,
        scratch: &mut WorkerScratch,
        inv: &crate::vmcode::InvariantDecl,
        pre: &GlobalState,
        post: &GlobalState,
    ) -> bool {
        let _ = inv.uses_pre;
        let mut ctx = Context::new(inv.pc, Handle::NONE);
        ctx.push(pre.vars);
        ctx.push(post.vars);
        let mut vars = decode_vars(self.values, post.vars);
        let mut print_log = Vec::new();
        let mut accesses = Vec::new();
        let mut snapshot = None;
        let mut guard = 0u32;
        loop {
            if ctx.terminated || ctx.failed || guard > INFLOOP_THRESHOLD {
                break;
            }
            let Some(instr) = self.program.fetch(ctx.pc) else {
                break;
            };
            if matches!(instr, Instr::Return) {
                break;
            }
            exec_one(
                instr,
                &mut ctx,
                &mut vars,
                self.values,
                &mut print_log,
                &mut accesses,
                &mut snapshot,
                guard,
                Handle::NONE,
            );
            ctx.pc = ctx.pc.wrapping_add(1);
            guard += 1;
            scratch.profile[ctx.pc.saturating_sub(1)] += 1;
        }
        match ctx.stack.last() {
            Some(h) => matches!(self.values.get(*h), Value::Bool(true)),
            None => true,
        }
    }
}

/// Whether `ctx`, about to execute `instr`, is an interruptible thread
/// at a point spec.md §4.2 step 5's last bullet forces a break in
/// front of: masked interrupts stay masked, so only a thread with a
/// registered trap handler and `interrupt_level == false` qualifies.
fn is_interrupt_break(instr: &Instr, ctx: &Context) -> bool {
    ctx.extended && ctx.trap_pc.is_some() && !ctx.interrupt_level && matches!(instr, Instr::SetIntLevel(true) | Instr::Return)
}

/// Whether the context `ctx` is currently parked in front of such a
/// forced interrupt break, so the BFS fan-out (`worker.rs`) should try
/// `interrupt = true` from it in addition to the normal continuation.
pub fn context_awaits_interrupt(program: &Program, ctx: &Context) -> bool {
    match program.fetch(ctx.pc) {
        Some(instr) => is_interrupt_break(instr, ctx),
        None => false,
    }
}

fn decode_vars(values: &ValueTable, handle: Handle) -> HashMap<String, Handle> {
    match values.get(handle) {
        Value::Dict(entries) => entries.into_iter().map(|(k, v)| (values.display(k), v)).collect(),
        _ => HashMap::new(),
    }
}

fn encode_vars(values: &ValueTable, vars: &HashMap<String, Handle>) -> Handle {
    let entries = vars
        .iter()
        .map(|(k, v)| (values.intern_atom(k.clone()), *v))
        .collect();
    values.intern_dict(entries)
}

#[allow(clippy::too_many_arguments)]
fn exec_one(
    instr: &Instr,
    ctx: &mut Context,
    vars: &mut HashMap<String, Handle>,
    values: &ValueTable,
    print_log: &mut Vec<Handle>,
    accesses: &mut Vec<AccessInfo>,
    snapshot: &mut Option<(Context, HashMap<String, Handle>, u32)>,
    instr_count: u32,
    choice: Handle,
) {
    match instr {
        Instr::Push(c) => {
            let h = match c {
                Const::Bool(b) => values.intern_bool(*b),
                Const::Int(i) => values.intern_int(*i),
                Const::Atom(s) => values.intern_atom(s.clone()),
            };
            ctx.push(h);
        }
        Instr::Load(addr) => {
            let h = load_address(addr, ctx, vars);
            accesses.push(AccessInfo {
                pc: ctx.pc,
                atomic_depth: ctx.atomic,
                is_write: false,
                is_delete: false,
                address: address_handle(addr, values),
            });
            ctx.push(h);
        }
        Instr::Store(addr) => {
            let v = ctx.pop();
            accesses.push(AccessInfo {
                pc: ctx.pc,
                atomic_depth: ctx.atomic,
                is_write: true,
                is_delete: false,
                address: address_handle(addr, values),
            });
            store_address(addr, v, ctx, vars);
        }
        Instr::Del(addr) => {
            accesses.push(AccessInfo {
                pc: ctx.pc,
                atomic_depth: ctx.atomic,
                is_write: true,
                is_delete: true,
                address: address_handle(addr, values),
            });
            if let Address::Global(name) = addr {
                vars.remove(name);
            }
        }
        Instr::Dup => {
            let top = ctx.top();
            ctx.push(top);
        }
        Instr::Pop => {
            ctx.pop();
        }
        Instr::Nary(op) => {
            let b = int_of(values, ctx.pop());
            let result = match op {
                crate::vmcode::NaryOp::Not => eval_nary(*op, &[b]),
                _ => {
                    let a = int_of(values, ctx.pop());
                    eval_nary(*op, &[a, b])
                }
            };
            let h = match result {
                EvalResult::Int(i) => values.intern_int(i),
                EvalResult::Bool(b) => values.intern_bool(b),
            };
            ctx.push(h);
        }
        Instr::Choose => {
            ctx.pop();
            ctx.push(choice);
        }
        Instr::AtomicInc => {
            if instr_count == 0 {
                ctx.atomic_flag = true;
            } else if ctx.atomic == 0 {
                *snapshot = Some((ctx.clone(), vars.clone(), instr_count));
            }
            ctx.atomic += 1;
        }
        Instr::AtomicDec => {
            if ctx.atomic > 0 {
                ctx.atomic -= 1;
            }
            if ctx.atomic == 0 {
                *snapshot = None;
            }
        }
        Instr::ReadonlyInc => ctx.readonly += 1,
        Instr::ReadonlyDec => {
            if ctx.readonly > 0 {
                ctx.readonly -= 1;
            }
        }
        Instr::Print => {
            let v = ctx.top();
            print_log.push(v);
        }
        Instr::Spawn { pc } => {
            let this = ctx.pop();
            let child = Context::new(*pc, this);
            let handle = values.intern_context(child);
            ctx.push(handle);
        }
        Instr::SetIntLevel(level) => ctx.interrupt_level = *level,
        Instr::Jump(target) => ctx.pc = target.wrapping_sub(1),
        Instr::JumpCond(target) => {
            let v = ctx.pop();
            if matches!(values.get(v), Value::Bool(true)) {
                ctx.pc = target.wrapping_sub(1);
            }
        }
        Instr::Assert { reason } => {
            let v = ctx.pop();
            if !matches!(values.get(v), Value::Bool(true)) {
                ctx.failed = true;
                ctx.failure = Some(reason.clone());
            }
        }
        Instr::Return => ctx.terminated = true,
        Instr::Stop => ctx.stopped = true,
        Instr::Nop => {}
    }
}

fn load_address(addr: &Address, ctx: &Context, vars: &HashMap<String, Handle>) -> Handle {
    match addr {
        Address::Global(name) => vars.get(name).copied().unwrap_or(Handle::NONE),
        Address::Local(slot) => ctx.locals.get(*slot).copied().unwrap_or(Handle::NONE),
    }
}

fn store_address(addr: &Address, value: Handle, ctx: &mut Context, vars: &mut HashMap<String, Handle>) {
    match addr {
        Address::Global(name) => {
            vars.insert(name.clone(), value);
        }
        Address::Local(slot) => {
            if *slot >= ctx.locals.len() {
                ctx.locals.resize(*slot + 1, Handle::NONE);
            }
            ctx.locals[*slot] = value;
        }
    }
}

fn address_handle(addr: &Address, values: &ValueTable) -> Handle {
    match addr {
        Address::Global(name) => values.intern_atom(name.clone()),
        Address::Local(slot) => values.intern_int(*slot as i64),
    }
}

fn int_of(values: &ValueTable, h: Handle) -> i64 {
    match values.get(h) {
        Value::Int(i) => i,
        Value::Bool(b) => b as i64,
        other => panic!("expected an int-like value, got {other:?}"),
    }
}

/// Distinguishes the two ways `CharmError` can surface from
/// step-adjacent I/O (DFA/program loading happen outside the hot
/// loop, so they return `Result` rather than panicking).
pub type StepResult<T> = Result<T, CharmError>;
