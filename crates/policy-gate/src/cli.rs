use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "policy-gate",
    version,
    about = "Validate policy documents and evaluate contexts against them"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Parse and validate a policy document
    Validate {
        /// Path to the policy file (overrides config file setting)
        #[arg(short, long)]
        policy: Option<PathBuf>,
    },

    /// Evaluate one or more contexts and print one JSON decision per line
    Evaluate {
        /// Path to the policy file (overrides config file setting)
        #[arg(short, long)]
        policy: Option<PathBuf>,

        /// JSON file holding a context object or an array of them
        #[arg(long)]
        context: PathBuf,

        /// Treat deny decisions as violations (exit code 3)
        #[arg(long)]
        enforce: bool,

        /// Print the metrics snapshot after evaluating
        #[arg(long)]
        metrics: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_validate() {
        let cli = Cli::try_parse_from(["policy-gate", "validate", "-p", "p.yaml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("config.yaml"));
        match cli.command {
            Command::Validate { policy } => assert_eq!(policy, Some(PathBuf::from("p.yaml"))),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parse_evaluate_with_flags() {
        let cli = Cli::try_parse_from([
            "policy-gate",
            "evaluate",
            "--context",
            "ctx.json",
            "--enforce",
            "-c",
            "gate.yaml",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("gate.yaml"));
        match cli.command {
            Command::Evaluate {
                policy,
                context,
                enforce,
                metrics,
            } => {
                assert!(policy.is_none());
                assert_eq!(context, PathBuf::from("ctx.json"));
                assert!(enforce);
                assert!(!metrics);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn evaluate_requires_context() {
        assert!(Cli::try_parse_from(["policy-gate", "evaluate"]).is_err());
    }
}
