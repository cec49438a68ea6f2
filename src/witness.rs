//! Witness reconstructor (spec.md §4.6, component C8).
//!
//! Walks a failed node's `to_parent` chain back to the root, then
//! replays each macrostep instruction-by-instruction to produce a
//! human-readable microstep trace (spec.md §6 output format).
//! Grounded on the same fetch-decode shape as `step.rs`, factored out
//! per spec.md §9's "one state machine" guidance rather than kept as
//! a second near-copy of the executor.

use crate::context::Context;
use crate::graph::Graph;
use crate::state::{EdgeId, Failure, NodeId, NO_EDGE};
use crate::value::{Handle, Value, ValueTable};
use crate::vmcode::{Address, Instr, Program};

/// One VM instruction's recorded effect.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Microstep {
    pub pc: usize,
    pub npc: usize,
    pub code: String,
    pub explain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub print: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// One reconstructed macrostep.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Macrostep {
    pub id: u32,
    pub len: u32,
    pub tid: u64,
    pub shared: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choice: Option<String>,
    pub microsteps: Vec<Microstep>,
}

pub struct Witness {
    pub macrosteps: Vec<Macrostep>,
}

pub struct Reconstructor<'a> {
    pub graph: &'a Graph,
    pub values: &'a ValueTable,
    pub program: &'a Program,
}

impl<'a> Reconstructor<'a> {
    pub fn reconstruct(&self, failure: &Failure) -> Witness {
        let path = self.path_to_root(failure.node);
        let mut macrosteps: Vec<Macrostep> = path
            .iter()
            .enumerate()
            .map(|(i, &edge_id)| self.replay_edge(i as u32, edge_id))
            .collect();

        self.trim_path(&mut macrosteps);

        if let crate::state::FailureKind::Invariant { pc } = failure.kind {
            macrosteps.push(self.replay_invariant(macrosteps.len() as u32, pc, failure));
        }

        Witness { macrosteps }
    }

    /// Collects the edge chain from the root to `node`, via
    /// `Node::to_parent`, in forward (root-first) order.
    fn path_to_root(&self, node: NodeId) -> Vec<EdgeId> {
        let mut reversed = Vec::new();
        let mut cursor = node;
        loop {
            let to_parent = self.graph.with_node(cursor, |n| n.to_parent);
            if to_parent == NO_EDGE {
                break;
            }
            reversed.push(to_parent);
            cursor = self.graph.with_edge(to_parent, |e| e.src);
        }
        reversed.reverse();
        reversed
    }

    fn replay_edge(&self, id: u32, edge_id: EdgeId) -> Macrostep {
        let (thread, choice, nsteps) = self.graph.with_edge(edge_id, |e| (e.ctx, e.choice, e.nsteps));
        let mut ctx = self.values.get_context(thread);
        let start_pc = ctx.pc;
        let mut microsteps = Vec::new();

        // The macrostep already recorded how many instructions it ran
        // (`nsteps`); replaying exactly that many keeps this edge's
        // microsteps from bleeding into whatever the same thread does
        // in its *next* macrostep, which would otherwise happen for any
        // thread that never terminates (spec.md §4.6).
        loop {
            if microsteps.len() as u64 >= nsteps {
                break;
            }
            if ctx.terminated || ctx.failed || ctx.stopped {
                break;
            }
            let Some(instr) = self.program.fetch(ctx.pc) else { break };
            let pc = ctx.pc;
            let explain = self.program.pretty_at(pc).to_string();
            let mut print = None;
            let mut shared = None;
            let mut failure_note = None;

            match instr {
                Instr::Print => {
                    print = Some(self.values.display(ctx.top()));
                }
                Instr::Store(Address::Global(name)) => {
                    let v = ctx.stack.last().copied().unwrap_or(Handle::NONE);
                    shared = Some(format!("{name} = {}", self.values.display(v)));
                }
                Instr::Assert { reason } => {
                    if !matches!(self.values.get(ctx.stack.last().copied().unwrap_or(Handle::NONE)), Value::Bool(true)) {
                        failure_note = Some(reason.clone());
                    }
                }
                Instr::Choose => {
                    ctx.pop();
                    ctx.push(choice);
                }
                _ => {}
            }

            microsteps.push(Microstep {
                pc,
                npc: pc + 1,
                code: format!("{instr:?}"),
                explain,
                shared,
                local: None,
                print,
                failure: failure_note,
            });

            step_context_forward(instr, &mut ctx, self.values);
            ctx.pc = ctx.pc.wrapping_add(1);
        }

        Macrostep {
            id,
            len: (ctx.pc.saturating_sub(start_pc)) as u32,
            tid: thread.0,
            shared: String::new(),
            name: self.program.pretty_at(start_pc).to_string(),
            choice: (!choice.is_none()).then(|| self.values.display(choice)),
            microsteps,
        }
    }

    /// A synthetic macrostep for an invariant failure (spec.md §4.6):
    /// a fresh context at the invariant's entry pc with `(pre, post)`
    /// pushed, re-executed so the predicate evaluation is visible.
    fn replay_invariant(&self, id: u32, pc: usize, failure: &Failure) -> Macrostep {
        let post_state = self.graph.with_node(failure.node, |n| n.state.clone());
        let mut ctx = Context::new(pc, Handle::NONE);
        ctx.push(post_state.pre);
        ctx.push(post_state.vars);
        let mut microsteps = Vec::new();
        loop {
            if ctx.terminated || ctx.failed || microsteps.len() > 10_000 {
                break;
            }
            let Some(instr) = self.program.fetch(ctx.pc) else { break };
            if matches!(instr, Instr::Return) {
                break;
            }
            microsteps.push(Microstep {
                pc: ctx.pc,
                npc: ctx.pc + 1,
                code: format!("{instr:?}"),
                explain: self.program.pretty_at(ctx.pc).to_string(),
                shared: None,
                local: None,
                print: None,
                failure: None,
            });
            step_context_forward(instr, &mut ctx, self.values);
            ctx.pc = ctx.pc.wrapping_add(1);
        }
        Macrostep {
            id,
            len: microsteps.len() as u32,
            tid: 0,
            shared: format!(
                "pre={}, post={}",
                self.values.display(post_state.pre),
                self.values.display(post_state.vars)
            ),
            name: "invariant".to_string(),
            choice: None,
            microsteps,
        }
    }

    /// Path trimming (spec.md §4.6): for every thread other than the
    /// last macrostep's, if its last macrostep both starts and ends
    /// on a load/store/print, collapse it to its first microstep.
    fn trim_path(&self, macrosteps: &mut [Macrostep]) {
        let Some(last) = macrosteps.last() else { return };
        let last_tid = last.tid;
        let mut last_seen: std::collections::HashMap<u64, usize> = std::collections::HashMap::new();
        for (i, m) in macrosteps.iter().enumerate() {
            if m.tid != last_tid {
                last_seen.insert(m.tid, i);
            }
        }
        for (tid, idx) in last_seen {
            let _ = tid;
            let m = &mut macrosteps[idx];
            if m.microsteps.len() > 1 {
                let ends_breakable = self
                    .program
                    .fetch(m.microsteps.last().unwrap().pc)
                    .map(|i| i.is_breakable())
                    .unwrap_or(false);
                let starts_breakable = self
                    .program
                    .fetch(m.microsteps.first().unwrap().pc)
                    .map(|i| i.is_breakable())
                    .unwrap_or(false);
                if ends_breakable && starts_breakable {
                    m.microsteps.truncate(1);
                }
            }
        }
    }
}

/// Advances `ctx`'s stack/locals/flags for `instr`, mirroring
/// `step::exec_one`'s state transitions without re-recording
/// access/print bookkeeping (already captured per-microstep above).
fn step_context_forward(instr: &Instr, ctx: &mut Context, values: &ValueTable) {
    match instr {
        Instr::Push(c) => {
            let h = match c {
                crate::vmcode::Const::Bool(b) => values.intern_bool(*b),
                crate::vmcode::Const::Int(i) => values.intern_int(*i),
                crate::vmcode::Const::Atom(s) => values.intern_atom(s.clone()),
            };
            ctx.push(h);
        }
        Instr::Load(Address::Local(slot)) => {
            let h = ctx.locals.get(*slot).copied().unwrap_or(Handle::NONE);
            ctx.push(h);
        }
        Instr::Load(Address::Global(_)) => {
            ctx.push(Handle::NONE);
        }
        Instr::Store(_) | Instr::Del(_) | Instr::Print | Instr::Assert { .. } => {
            ctx.pop();
        }
        Instr::Dup => {
            let top = ctx.top();
            ctx.push(top);
        }
        Instr::Pop => {
            ctx.pop();
        }
        Instr::Nary(op) => {
            ctx.pop();
            if !matches!(op, crate::vmcode::NaryOp::Not) {
                ctx.pop();
            }
            ctx.push(Handle::NONE);
        }
        Instr::AtomicInc => ctx.atomic += 1,
        Instr::AtomicDec => {
            if ctx.atomic > 0 {
                ctx.atomic -= 1;
            }
        }
        Instr::ReadonlyInc => ctx.readonly += 1,
        Instr::ReadonlyDec => {
            if ctx.readonly > 0 {
                ctx.readonly -= 1;
            }
        }
        Instr::SetIntLevel(level) => ctx.interrupt_level = *level,
        Instr::Jump(target) => ctx.pc = target.wrapping_sub(1),
        Instr::JumpCond(target) => {
            let v = ctx.pop();
            if matches!(values.get(v), Value::Bool(true)) {
                ctx.pc = target.wrapping_sub(1);
            }
        }
        Instr::Spawn { pc } => {
            ctx.pop();
            let child = Context::new(*pc, Handle::NONE);
            let h = values.intern_context(child);
            ctx.push(h);
        }
        Instr::Return => ctx.terminated = true,
        Instr::Stop => ctx.stopped = true,
        Instr::Choose | Instr::Nop => {}
    }
}
