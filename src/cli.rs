use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "footfall-pipeline",
    version,
    about = "People-counting sensor ingest, rollup and alerting"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the trigger endpoints, with the in-process schedule when configured.
    Serve {
        /// Overrides FOOTFALL_LISTEN_ADDR.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Run one ingestion pass (chained per FOOTFALL_CHAIN_ROLLUP) and print the report.
    RunOnce {
        /// Skip rollup and alert evaluation for this pass.
        #[arg(long, default_value_t = false)]
        no_chain: bool,
    },
    /// Recompute stale rollups, then evaluate alerts.
    Rollup,
    /// Evaluate alert thresholds against the current rollups.
    EvaluateAlerts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands() {
        let args = Args::parse_from(["footfall-pipeline", "serve", "--listen", "0.0.0.0:9000"]);
        match args.command {
            Command::Serve { listen } => assert_eq!(listen.as_deref(), Some("0.0.0.0:9000")),
            other => panic!("unexpected command {other:?}"),
        }
        let args = Args::parse_from(["footfall-pipeline", "run-once", "--no-chain"]);
        assert!(matches!(args.command, Command::RunOnce { no_chain: true }));
        let args = Args::parse_from(["footfall-pipeline", "evaluate-alerts"]);
        assert!(matches!(args.command, Command::EvaluateAlerts));
    }
}
