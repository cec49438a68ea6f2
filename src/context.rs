//! The execution state of one VM thread (spec.md §3, "Context").
//!
//! Contexts are value-typed: a `Context` is cloned into worker-local
//! scratch before being stepped (spec.md §4.2 step 1), and the
//! resulting context is interned into a [`crate::value::Handle`] when
//! it is stored in a state's `bag`/`stopbag` or as a `choosing` pointer.

use crate::value::Handle;

/// One thread's full execution state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Context {
    /// Program counter into the shared code array.
    pub pc: usize,
    /// Operand stack.
    pub stack: Vec<Handle>,
    /// Local variables, addressed by frame-relative slot.
    pub locals: Vec<Handle>,
    /// Nesting depth of atomic sections.
    pub atomic: u32,
    /// Nesting depth of read-only sections.
    pub readonly: u32,
    /// Whether interrupts are currently masked.
    pub interrupt_level: bool,
    /// True once an atomic section has already been announced this
    /// macrostep (so a lazy-atomic break is not needed on exit).
    pub atomic_flag: bool,
    /// Unlocks the trap/interrupt fields below; contexts created by
    /// `Spawn` without an interrupt handler never set this.
    pub extended: bool,
    /// Program counter of the registered interrupt handler, if any.
    pub trap_pc: Option<usize>,
    /// Argument handle passed to the trap handler.
    pub trap_arg: Handle,
    /// The `this` value for method-style dispatch.
    pub this: Handle,
    pub terminated: bool,
    pub failed: bool,
    pub stopped: bool,
    /// Set together with `failed`; the reason a Safety failure fired.
    pub failure: Option<String>,
}

impl Context {
    /// A fresh context for a newly spawned thread starting at `pc`.
    pub fn new(pc: usize, this: Handle) -> Self {
        Context {
            pc,
            stack: Vec::new(),
            locals: Vec::new(),
            atomic: 0,
            readonly: 0,
            interrupt_level: false,
            atomic_flag: false,
            extended: false,
            trap_pc: None,
            trap_arg: Handle::NONE,
            this,
            terminated: false,
            failed: false,
            stopped: false,
            failure: None,
        }
    }

    /// A context is eternal once it can never take another step: it
    /// terminated normally or was explicitly stopped (spec.md
    /// GLOSSARY, "Eternal context").
    pub fn is_eternal(&self) -> bool {
        self.terminated || self.stopped
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic > 0
    }

    pub fn push(&mut self, value: Handle) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Handle {
        self.stack
            .pop()
            .unwrap_or_else(|| panic!("pop from empty operand stack at pc {}", self.pc))
    }

    pub fn top(&self) -> Handle {
        *self
            .stack
            .last()
            .unwrap_or_else(|| panic!("peek on empty operand stack at pc {}", self.pc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_is_not_eternal() {
        let ctx = Context::new(0, Handle::NONE);
        assert!(!ctx.is_eternal());
    }

    #[test]
    fn terminated_or_stopped_contexts_are_eternal() {
        let mut ctx = Context::new(0, Handle::NONE);
        ctx.terminated = true;
        assert!(ctx.is_eternal());

        let mut ctx2 = Context::new(0, Handle::NONE);
        ctx2.stopped = true;
        assert!(ctx2.is_eternal());
    }

    #[test]
    fn push_pop_round_trips() {
        let mut ctx = Context::new(0, Handle::NONE);
        ctx.push(Handle(7));
        assert_eq!(ctx.top(), Handle(7));
        assert_eq!(ctx.pop(), Handle(7));
    }
}
