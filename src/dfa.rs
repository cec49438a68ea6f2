//! Behavior DFA over print-log symbols (spec.md §6, "-B<dfa-file>";
//! out of scope as an implementation but spec'd at its interface in
//! §1). Consumed by C7 to classify final components as Behavior
//! failures when a run's printed sequence is rejected.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::DfaError;

#[derive(Debug, Deserialize)]
struct DfaFile {
    start: u32,
    accepting: Vec<u32>,
    /// `(from, symbol, to)` triples.
    transitions: Vec<(u32, String, u32)>,
}

/// A deterministic finite automaton over printed-value symbols.
/// Transitions are total in practice via an implicit self-loop on any
/// symbol with no declared outgoing transition, matching the original
/// engine's "absent edge means stay put" behavior for `ab*`-style
/// automata.
pub struct Dfa {
    start: u32,
    accepting: std::collections::HashSet<u32>,
    transitions: HashMap<(u32, String), u32>,
    state_count: u32,
}

impl Dfa {
    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn step(&self, state: u32, symbol: &str) -> u32 {
        self.transitions
            .get(&(state, symbol.to_string()))
            .copied()
            .unwrap_or(state)
    }

    pub fn is_accepting(&self, state: u32) -> bool {
        self.accepting.contains(&state)
    }

    pub fn load(path: &str) -> Result<Self, DfaError> {
        let text = std::fs::read_to_string(path).map_err(|source| DfaError::Read {
            path: path.to_string(),
            source,
        })?;
        let file: DfaFile = serde_json::from_str(&text)?;
        let mut max_state = file.start;
        for &s in &file.accepting {
            max_state = max_state.max(s);
        }
        let mut transitions = HashMap::new();
        for (from, sym, to) in file.transitions {
            max_state = max_state.max(from).max(to);
            transitions.insert((from, sym), to);
        }
        if file.accepting.is_empty() && transitions.is_empty() {
            return Err(DfaError::NoStartState);
        }
        Ok(Dfa {
            start: file.start,
            accepting: file.accepting.into_iter().collect(),
            transitions,
            state_count: max_state + 1,
        })
    }

    pub fn state_count(&self) -> u32 {
        self.state_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ab_star() -> Dfa {
        // Accepts "a" then any number of "b"s: 0 -a-> 1, 1 -b-> 1, accepting = {1}.
        let mut transitions = HashMap::new();
        transitions.insert((0, "a".to_string()), 1);
        transitions.insert((1, "b".to_string()), 1);
        Dfa {
            start: 0,
            accepting: [1].into_iter().collect(),
            transitions,
            state_count: 2,
        }
    }

    #[test]
    fn accepts_a_then_many_b() {
        let dfa = ab_star();
        let mut state = dfa.start();
        for sym in ["a", "b", "b", "b"] {
            state = dfa.step(state, sym);
        }
        assert!(dfa.is_accepting(state));
    }

    #[test]
    fn rejects_b_then_a() {
        let dfa = ab_star();
        let mut state = dfa.start();
        for sym in ["b", "a"] {
            state = dfa.step(state, sym);
        }
        assert!(!dfa.is_accepting(state));
    }
}
