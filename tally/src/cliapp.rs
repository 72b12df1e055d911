//! This module implements the definition of the command line app.

use clap::builder::ValueParser;
use clap::{Arg, ArgAction, Command, value_parser};

/// The name of the environment variable that points to the config folder.
pub const CONFIG_ENV: &str = "TALLY_CONFIG";

/// The default config folder.
pub const DEFAULT_CONFIG_PATH: &str = ".tally";

pub fn make_app() -> Command {
    Command::new("tally")
        .version(tally_log::RELEASE)
        .about("Dispatches application events as statsd metrics")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_name("CONFIG")
                .env(CONFIG_ENV)
                .default_value(DEFAULT_CONFIG_PATH)
                .help("The path to the config folder."),
        )
        .arg(
            Arg::new("log_level")
                .long("log-level")
                .global(true)
                .value_name("LEVEL")
                .env("TALLY_LOG_LEVEL")
                .value_parser(["off", "error", "warn", "info", "debug", "trace"])
                .help("The log level of tally."),
        )
        .arg(
            Arg::new("log_format")
                .long("log-format")
                .global(true)
                .value_name("FORMAT")
                .env("TALLY_LOG_FORMAT")
                .value_parser(["auto", "pretty", "simplified", "json"])
                .help("The format of log output."),
        )
        .arg(
            Arg::new("metrics_prefix")
                .long("metrics-prefix")
                .global(true)
                .value_name("PREFIX")
                .env("TALLY_METRICS_PREFIX")
                .help("Prefix prepended to all metric names."),
        )
        .arg(
            Arg::new("sample_rate")
                .long("sample-rate")
                .global(true)
                .value_name("RATE")
                .env("TALLY_SAMPLE_RATE")
                .help("Global sample rate between 0.0 and 1.0."),
        )
        .subcommand(
            Command::new("config")
                .about("Manage the tally config")
                .subcommand_required(true)
                .after_help(
                    "This command provides basic config management.  It can be \
                     used to print the effective configuration or to check that \
                     all clients and their metric rules are valid.",
                )
                .subcommand(
                    Command::new("show").about("Show the entire config out for debugging purposes"),
                )
                .subcommand(
                    Command::new("validate")
                        .about("Validate the config and print a summary of all clients"),
                ),
        )
        .subcommand(
            Command::new("emit")
                .about("Dispatch a single event through all clients")
                .after_help(
                    "The event payload is a JSON document.  Its fields are available to \
                     metric name templates and to the value and timing accessors.",
                )
                .arg(
                    Arg::new("event")
                        .value_name("EVENT")
                        .required(true)
                        .help("The name of the event."),
                )
                .arg(
                    Arg::new("payload")
                        .long("payload")
                        .short('p')
                        .value_name("JSON")
                        .value_parser(ValueParser::new(parse_payload))
                        .help("The JSON payload of the event."),
                ),
        )
        .subcommand(
            Command::new("exec")
                .about("Run a command and report console events")
                .after_help(
                    "Dispatches console.command before the program starts, \
                     console.exception if it fails and console.terminate once it \
                     exited.  The exit code of the program is passed through.",
                )
                .arg(
                    Arg::new("command")
                        .value_name("PROGRAM")
                        .required(true)
                        .num_args(1..)
                        .trailing_var_arg(true)
                        .allow_hyphen_values(true)
                        .action(ArgAction::Append)
                        .value_parser(value_parser!(String))
                        .help("The program to run followed by its arguments."),
                ),
        )
}

fn parse_payload(value: &str) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::from_str(value)
}
