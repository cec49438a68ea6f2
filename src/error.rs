//! Error types for the model checker.
//!
//! Errors are split by the boundary they cross: malformed input, a bad
//! DFA file, or a configuration mistake. Violations the checker *finds*
//! in the program under test (safety, invariant, termination, ...) are
//! not errors — they are [`crate::state::Failure`] values threaded
//! through the normal control flow. A violated internal invariant of
//! the checker itself is a bug and panics rather than returning here.

use thiserror::Error;

/// Errors that can cause the checker to abort before or during a run.
#[derive(Error, Debug)]
pub enum CharmError {
    /// The input JSON did not parse or was missing required keys.
    #[error("invalid input: {0}")]
    Input(#[from] InputError),

    /// The behavior DFA file did not parse.
    #[error("invalid DFA: {0}")]
    Dfa(#[from] DfaError),

    /// A CLI argument was missing, malformed, or referred to a file
    /// that could not be opened.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The wall-clock timeout elapsed before exploration finished.
    #[error("timed out after {0} seconds")]
    Timeout(u64),

    /// Writing the output report failed.
    #[error("failed to write output to {path}: {source}")]
    Output {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors parsing the `code`/`pretty` input document.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("instruction {index} has no opcode")]
    MissingOpcode { index: usize },

    #[error("instruction {index} has unknown opcode {opcode:?}")]
    UnknownOpcode { index: usize, opcode: String },

    #[error("instruction {index} ({opcode}): {reason}")]
    BadOperand {
        index: usize,
        opcode: String,
        reason: String,
    },

    #[error("`code` and `pretty` arrays have different lengths ({code} vs {pretty})")]
    LengthMismatch { code: usize, pretty: usize },
}

/// Errors parsing a behavior DFA description.
#[derive(Error, Debug)]
pub enum DfaError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transition from state {state} references unknown state {target}")]
    UnknownState { state: usize, target: usize },

    #[error("no start state declared")]
    NoStartState,
}

/// Errors validating CLI arguments.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("output path (-o) is required")]
    MissingOutput,

    #[error("timeout must be a positive number of seconds, got {0:?}")]
    BadTimeout(String),

    #[error("no input file given")]
    MissingInput,
}

pub type CharmResult<T> = std::result::Result<T, CharmError>;
