//! Command-line surface of `rhythmd`.

use clap::{Args, Parser, Subcommand};
use rhythm_dlq::DlqStatus;

#[derive(Parser, Debug)]
#[command(name = "rhythmd", version, about = "Rhythm orchestrator daemon", long_about = None)]
pub struct Cli {
    /// Config file (defaults to ~/.rhythm/rhythm.toml)
    #[arg(long, short = 'c', env = "RHYTHM_CONFIG", global = true)]
    pub config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the orchestrator in the foreground until SIGINT/SIGTERM
    Run,
    /// Query a running daemon's health endpoint
    Health {
        /// Base URL of the control endpoint (defaults to control.bind:control.port)
        #[arg(long)]
        url: Option<String>,
    },
    /// Inspect or replay the dead letter queue
    Dlq(DlqArgs),
}

#[derive(Args, Debug)]
pub struct DlqArgs {
    #[command(subcommand)]
    pub command: DlqCommand,
}

#[derive(Subcommand, Debug)]
pub enum DlqCommand {
    /// List dead letters, oldest first
    List {
        /// Only entries in this status (pending, retrying, resolved, abandoned)
        #[arg(long, value_parser = parse_status)]
        status: Option<DlqStatus>,
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Replay dead letters without a running daemon
    Replay {
        /// Replay a single entry by ID
        #[arg(long, conflicts_with_all = ["limit", "include_abandoned"])]
        id: Option<String>,
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
        /// Also replay entries that exhausted their retries
        #[arg(long)]
        include_abandoned: bool,
    },
}

fn parse_status(s: &str) -> Result<DlqStatus, String> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dlq_list() {
        let cli = Cli::try_parse_from(["rhythmd", "dlq", "list", "--status", "abandoned", "-n", "5"])
            .unwrap();
        match cli.command {
            Command::Dlq(DlqArgs {
                command: DlqCommand::List { status, limit },
            }) => {
                assert_eq!(status, Some(DlqStatus::Abandoned));
                assert_eq!(limit, 5);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn replay_id_conflicts_with_batch_flags() {
        assert!(
            Cli::try_parse_from(["rhythmd", "dlq", "replay", "--id", "x", "--include-abandoned"])
                .is_err()
        );
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["rhythmd", "run", "--log-json", "--config", "/etc/r.toml"])
            .unwrap();
        assert!(cli.log_json);
        assert_eq!(cli.config.as_deref(), Some("/etc/r.toml"));
    }

    #[test]
    fn unknown_status_rejected() {
        assert!(Cli::try_parse_from(["rhythmd", "dlq", "list", "--status", "done"]).is_err());
    }
}
