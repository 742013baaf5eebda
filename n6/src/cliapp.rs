//! This module implements the definition of the command line app.

use std::path::PathBuf;

use clap::builder::ValueParser;
use clap::{Arg, ArgAction, Command, ValueHint};
use clap_complete::Shell;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "The n6 aggregator collapses repeated events into summaries.";

fn config_arg() -> Arg {
    Arg::new("config")
        .value_name("CONFIG")
        .long("config")
        .short('c')
        .required(true)
        .value_hint(ValueHint::DirPath)
        .value_parser(ValueParser::path_buf())
        .help("The path to the config folder.")
}

pub fn make_app() -> Command {
    Command::new("n6")
        .disable_help_subcommand(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .max_term_width(79)
        .version(VERSION)
        .about(ABOUT)
        .subcommand(
            Command::new("run")
                .about("Run the aggregator")
                .after_help(
                    "This runs the aggregator in the foreground until its input ends, it is \
                     shut down or it has finished enough groups to ask for a restart. Events \
                     are read from stdin and published to stdout.",
                )
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("inspect")
                .about("Print a summary of the persisted state")
                .after_help(
                    "This reads the index file without modifying it and prints the sources, \
                     their watermarks and groups together with the payload storage usage as \
                     JSON. It must not run while the aggregator is running on the same state.",
                )
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("generate-completions")
                .about("Generate shell completion file")
                .after_help(
                    "This generates a completions file for the shell of choice. The default \
                     selection will be an educated guess for the currently running shell.",
                )
                .arg(
                    Arg::new("format")
                        .long("format")
                        .short('f')
                        .value_name("SHELL")
                        .action(ArgAction::Set)
                        .value_parser(clap::value_parser!(Shell))
                        .help(
                            "Explicitly pick the shell to generate a completion file for. The \
                             default is autodetection.",
                        ),
                ),
        )
}

/// Returns the config folder passed to a subcommand.
pub fn config_path(matches: &clap::ArgMatches) -> Option<&PathBuf> {
    matches.get_one::<PathBuf>("config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app() {
        make_app().debug_assert();
    }

    #[test]
    fn test_config_path() {
        let matches = make_app()
            .try_get_matches_from(["n6", "run", "-c", "/etc/n6"])
            .unwrap();

        let (name, run) = matches.subcommand().unwrap();
        assert_eq!(name, "run");
        assert_eq!(config_path(run).unwrap(), &PathBuf::from("/etc/n6"));
    }

    #[test]
    fn test_config_required() {
        let result = make_app().try_get_matches_from(["n6", "inspect"]);
        assert!(result.is_err());
    }
}
