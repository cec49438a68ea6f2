//! CLI configuration (spec.md §6).

use clap::Parser;

use crate::error::ConfigError;

/// Parallel explicit-state model checker for a small concurrent VM.
#[derive(Parser, Debug)]
#[command(name = "charm", version, about)]
pub struct Cli {
    /// Disables busy-wait detection.
    #[arg(short = 'c', long = "no-busywait")]
    pub no_busywait: bool,

    /// Wall-clock timeout in seconds.
    #[arg(short = 't', value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Path to a DFA description over print-log symbols.
    #[arg(short = 'B', value_name = "DFA_FILE")]
    pub dfa_file: Option<String>,

    /// Output report path (required unless `-x`).
    #[arg(short = 'o', value_name = "OUTFILE")]
    pub output: Option<String>,

    /// Print a banner and exit 0 (liveness probe).
    #[arg(short = 'x')]
    pub probe: bool,

    /// Number of worker threads; defaults to the machine's core count.
    #[arg(long = "workers")]
    pub workers: Option<usize>,

    /// Input program, as JSON.
    pub input: Option<String>,
}

pub struct Config {
    pub busywait_enabled: bool,
    pub timeout_secs: u64,
    pub dfa_file: Option<String>,
    pub output: String,
    pub probe: bool,
    pub nworkers: usize,
    pub input: String,
}

/// Default wall-clock timeout, matching spec.md §6 ("default ≈ 10^7
/// seconds" — effectively unbounded).
const DEFAULT_TIMEOUT_SECS: u64 = 10_000_000;

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        if cli.probe {
            return Ok(Config {
                busywait_enabled: !cli.no_busywait,
                timeout_secs: DEFAULT_TIMEOUT_SECS,
                dfa_file: None,
                output: String::new(),
                probe: true,
                nworkers: 1,
                input: cli.input.unwrap_or_default(),
            });
        }

        let output = cli.output.ok_or(ConfigError::MissingOutput)?;
        let input = cli.input.ok_or(ConfigError::MissingInput)?;
        let timeout_secs = match cli.timeout {
            Some(t) if t > 0 => t,
            Some(t) => return Err(ConfigError::BadTimeout(t.to_string())),
            None => DEFAULT_TIMEOUT_SECS,
        };

        Ok(Config {
            busywait_enabled: !cli.no_busywait,
            timeout_secs,
            dfa_file: cli.dfa_file,
            output,
            probe: false,
            nworkers: cli.workers.unwrap_or_else(num_cpus::get),
            input,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            no_busywait: false,
            timeout: None,
            dfa_file: None,
            output: Some("out.json".to_string()),
            probe: false,
            workers: Some(4),
            input: Some("prog.json".to_string()),
        }
    }

    #[test]
    fn defaults_timeout_when_unset() {
        let config = Config::from_cli(base_cli()).unwrap();
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.nworkers, 4);
    }

    #[test]
    fn missing_output_is_an_error_unless_probing() {
        let mut cli = base_cli();
        cli.output = None;
        assert!(matches!(Config::from_cli(cli), Err(ConfigError::MissingOutput)));

        let mut probe_cli = base_cli();
        probe_cli.output = None;
        probe_cli.probe = true;
        assert!(Config::from_cli(probe_cli).is_ok());
    }
}
