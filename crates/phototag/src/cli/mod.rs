use clap::{ArgAction, CommandFactory, Parser, Subcommand};

mod ingest;
mod records;
pub mod validators;

pub use ingest::IngestArgs;
pub use records::RecordsArgs;

/// Top-level CLI entry point.
#[derive(Debug, Default, Parser)]
#[command(
    name = "phototag",
    version,
    author,
    about = "Ingest images, auto-tag them with detectors, and store the results"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Stage, tag, upload and record one batch of local images.
    Ingest(IngestArgs),
    /// List an owner's stored image records, newest first.
    Records(RecordsArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_args_parse() {
        let cli = Cli::try_parse_from([
            "phototag", "-vv", "ingest", "--owner", "u1", "--workers", "2", "a.png", "b.jpg",
        ])
        .expect("parse");
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Some(Commands::Ingest(args)) => {
                assert_eq!(args.owner, "u1");
                assert_eq!(args.workers, Some(2));
                assert_eq!(args.folder, None);
                assert_eq!(args.files.len(), 2);
            }
            other => panic!("expected ingest, got {other:?}"),
        }
    }

    #[test]
    fn ingest_requires_files_and_owner() {
        assert!(Cli::try_parse_from(["phototag", "ingest", "--owner", "u1"]).is_err());
        assert!(Cli::try_parse_from(["phototag", "ingest", "a.png"]).is_err());
        assert!(
            Cli::try_parse_from(["phototag", "ingest", "--owner", "u1", "--workers", "0", "a.png"])
                .is_err()
        );
    }

    #[test]
    fn records_args_parse() {
        let cli = Cli::try_parse_from(["phototag", "records", "--owner", "u1", "--limit", "5"])
            .expect("parse");
        match cli.command {
            Some(Commands::Records(args)) => {
                assert_eq!(args.owner, "u1");
                assert_eq!(args.limit, Some(5));
            }
            other => panic!("expected records, got {other:?}"),
        }
    }
}
