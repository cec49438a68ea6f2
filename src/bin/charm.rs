//! CLI entrypoint (spec.md §6).

use clap::Parser;
use tracing_subscriber::EnvFilter;

use charm_core::checker::Checker;
use charm_core::config::{Cli, Config};
use charm_core::report;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();
    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "bad configuration");
            return 1;
        }
    };

    if config.probe {
        println!("charm: ready");
        return 0;
    }

    let checker = match Checker::from_config(&config) {
        Ok(checker) => checker,
        Err(err) => {
            tracing::error!(%err, "failed to start checker");
            return 1;
        }
    };

    let outcome = checker.run();
    if let Err(err) = report::write(&config.output, &outcome.report) {
        tracing::error!(%err, "failed to write report");
        return 1;
    }

    if outcome.timed_out {
        tracing::warn!("exploration timed out before reaching a fixpoint");
        return 1;
    }

    if outcome.report.issue != "No issues" {
        return 1;
    }
    0
}
