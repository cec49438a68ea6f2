//! Value interning — the external C2 collaborator, stubbed at its interface.
//!
//! The real system interns arbitrarily rich immutable values (dicts,
//! lists, sets, contexts, addresses) behind a stable 64-bit handle;
//! that subsystem is out of scope here (spec.md §1). This module gives
//! the rest of the crate something concrete to compile and run against:
//! a minimal value universe sufficient to express the end-to-end
//! scenarios in spec.md §8 (mutexes, counters, spin loops, a DFA over
//! printed symbols), interned the same way — structural equality in,
//! bitwise handle equality out.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::context::Context;

/// Opaque 64-bit identifier for an interned immutable value.
///
/// Equality is bitwise equality on the identifier, never on the
/// pointed-to value; two handles compare equal iff they were produced
/// by the same `intern` call (or ones that happened to structurally
/// collide, which `ValueTable` collapses to a single handle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub u64);

impl Handle {
    /// The handle reserved for "no value" (e.g. `choosing == 0`).
    pub const NONE: Handle = Handle(0);

    pub fn is_none(self) -> bool {
        self == Handle::NONE
    }
}

/// A value in the VM's universe, prior to interning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Bool(bool),
    Int(i64),
    /// An interned symbol, used for variable names, print arguments, and
    /// opcode-level atoms.
    Atom(String),
    /// An address: a path of interned components indexing into `vars`.
    Address(Vec<Handle>),
    /// An unordered collection, kept in a canonical (sorted) order so
    /// structural equality is just slice equality.
    Set(Vec<Handle>),
    /// An ordered association list, kept sorted by key for the same
    /// reason.
    Dict(Vec<(Handle, Handle)>),
    /// A context, interned so it can live in a `bag`/`stopbag` multiset
    /// or be pointed to by `choosing`.
    Context(Box<Context>),
}

impl Value {
    fn type_tag(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Int(_) => 1,
            Value::Atom(_) => 2,
            Value::Address(_) => 3,
            Value::Set(_) => 4,
            Value::Dict(_) => 5,
            Value::Context(_) => 6,
        }
    }
}

/// Thread-safe interner. Concurrent `intern` calls with structurally
/// equal values return the same handle; the table never forgets an
/// entry once inserted, matching the write-once discipline the rest of
/// the checker relies on (a `Handle` is valid for the lifetime of the
/// whole run).
#[derive(Default)]
pub struct ValueTable {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    values: Vec<Value>,
    index: HashMap<Value, Handle>,
}

impl ValueTable {
    pub fn new() -> Self {
        let mut table = Self::default();
        // Handle::NONE must resolve to something; reserve slot 0 for it.
        table.inner.get_mut().values.push(Value::Bool(false));
        table
    }

    /// Interns `value`, returning its stable handle.
    pub fn intern(&self, value: Value) -> Handle {
        if let Some(existing) = self.inner.read().index.get(&value) {
            return *existing;
        }
        let mut inner = self.inner.write();
        if let Some(existing) = inner.index.get(&value) {
            return *existing;
        }
        let tag = value.type_tag();
        let idx = inner.values.len() as u64;
        let handle = Handle((tag as u64) << 56 | idx);
        inner.values.push(value.clone());
        inner.index.insert(value, handle);
        handle
    }

    pub fn intern_bool(&self, b: bool) -> Handle {
        self.intern(Value::Bool(b))
    }

    pub fn intern_int(&self, i: i64) -> Handle {
        self.intern(Value::Int(i))
    }

    pub fn intern_atom(&self, s: impl Into<String>) -> Handle {
        self.intern(Value::Atom(s.into()))
    }

    pub fn intern_address(&self, path: Vec<Handle>) -> Handle {
        self.intern(Value::Address(path))
    }

    pub fn intern_set(&self, mut members: Vec<Handle>) -> Handle {
        members.sort_unstable();
        members.dedup();
        self.intern(Value::Set(members))
    }

    pub fn intern_dict(&self, mut entries: Vec<(Handle, Handle)>) -> Handle {
        entries.sort_unstable_by_key(|(k, _)| *k);
        self.intern(Value::Dict(entries))
    }

    pub fn intern_context(&self, ctx: Context) -> Handle {
        self.intern(Value::Context(Box::new(ctx)))
    }

    /// Recovers the context behind a handle. Panics if `handle` does
    /// not point to a context value — a checker bug, not a user error.
    pub fn get_context(&self, handle: Handle) -> Context {
        match self.get(handle) {
            Value::Context(ctx) => *ctx,
            other => panic!("expected a context handle, got {other:?}"),
        }
    }

    /// Looks up the value behind a handle. Panics if the handle was
    /// never produced by this table — that is always a checker bug,
    /// never a user error.
    pub fn get(&self, handle: Handle) -> Value {
        let idx = (handle.0 & 0x00ff_ffff_ffff_ffff) as usize;
        self.inner
            .read()
            .values
            .get(idx)
            .cloned()
            .unwrap_or_else(|| panic!("dangling value handle {handle:?}"))
    }

    /// Renders a handle as the human-readable form used in `pretty`
    /// output and print logs.
    pub fn display(&self, handle: Handle) -> String {
        match self.get(handle) {
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Atom(s) => s,
            Value::Address(parts) => {
                let rendered: Vec<String> = parts.iter().map(|h| self.display(*h)).collect();
                format!("?{}", rendered.join("."))
            }
            Value::Set(members) => {
                let rendered: Vec<String> = members.iter().map(|h| self.display(*h)).collect();
                format!("{{{}}}", rendered.join(", "))
            }
            Value::Dict(entries) => {
                let rendered: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", self.display(*k), self.display(*v)))
                    .collect();
                format!("{{{}}}", rendered.join(", "))
            }
            Value::Context(ctx) => format!("ctx@{}", ctx.pc),
        }
    }

    /// Members of the set at the top of `choosing`'s operand stack,
    /// used by C4 to fan out one step call per choice (spec.md §4.3
    /// step 3).
    pub fn choice_set_members(&self, choosing: Handle) -> Vec<Handle> {
        let ctx = self.get_context(choosing);
        match ctx.stack.last() {
            Some(top) => match self.get(*top) {
                Value::Set(members) => members,
                _ => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structurally_equal_values_share_a_handle() {
        let table = ValueTable::new();
        let a = table.intern_int(42);
        let b = table.intern_int(42);
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_values_get_distinct_handles() {
        let table = ValueTable::new();
        let a = table.intern_int(1);
        let b = table.intern_int(2);
        assert_ne!(a, b);
    }

    #[test]
    fn sets_are_order_independent() {
        let table = ValueTable::new();
        let x = table.intern_int(1);
        let y = table.intern_int(2);
        let s1 = table.intern_set(vec![x, y]);
        let s2 = table.intern_set(vec![y, x]);
        assert_eq!(s1, s2);
    }

    #[test]
    fn display_renders_nested_structures() {
        let table = ValueTable::new();
        let x = table.intern_int(1);
        let y = table.intern_int(2);
        let set = table.intern_set(vec![x, y]);
        assert_eq!(table.display(set), "{1, 2}");
    }
}
