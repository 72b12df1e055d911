use anyhow::{Context, Result};
use clap::ArgMatches;
use tally_config::{Config, OverridableConfig};
use tally_protocol::JsonEvent;

use crate::cliapp::make_app;
use crate::{console, setup};

/// Runs the command line application. Returns the exit code of the process.
pub fn execute() -> Result<i32> {
    let matches = make_app().get_matches();
    let config_path = matches
        .get_one::<String>("config")
        .map_or(crate::cliapp::DEFAULT_CONFIG_PATH, String::as_str);

    if !Config::config_exists(config_path) {
        anyhow::bail!("config does not exist, expected a config.yml in folder {config_path}");
    }

    let mut config = Config::from_path(config_path)?;
    config.apply_override(extract_config_args(&matches))?;

    tally_log::init(config.logging());
    setup::dump_spawn_infos(&config);

    match matches.subcommand() {
        Some(("config", matches)) => manage_config(&config, matches),
        Some(("emit", matches)) => emit(&config, matches),
        Some(("exec", matches)) => exec(&config, matches),
        _ => unreachable!(),
    }
}

/// Extracts config overrides from the command line and environment.
fn extract_config_args(matches: &ArgMatches) -> OverridableConfig {
    OverridableConfig {
        log_level: matches.get_one("log_level").cloned(),
        log_format: matches.get_one("log_format").cloned(),
        metrics_prefix: matches.get_one("metrics_prefix").cloned(),
        sample_rate: matches.get_one("sample_rate").cloned(),
    }
}

#[allow(clippy::print_stdout)]
fn manage_config(config: &Config, matches: &ArgMatches) -> Result<i32> {
    match matches.subcommand() {
        Some(("show", _)) => {
            print!("{}", config.to_yaml_string()?);
        }
        Some(("validate", _)) => {
            setup::dump_clients(config);
            println!("config is valid");
        }
        _ => unreachable!(),
    }

    Ok(0)
}

fn emit(config: &Config, matches: &ArgMatches) -> Result<i32> {
    let name = matches
        .get_one::<String>("event")
        .context("missing event name")?;
    let payload = matches
        .get_one::<serde_json::Value>("payload")
        .cloned()
        .unwrap_or_else(|| serde_json::Value::Object(Default::default()));

    let mut router = setup::init_router(config)?;
    let event = JsonEvent::new(name.as_str(), payload);

    let dispatched = router.handle_event(&event);
    let flushed = router.flush();

    if let Err(error) = dispatched.and(flushed) {
        for client in &error.errors {
            tally_log::error!("{}", tally_log::LogError(client));
        }
        return Err(error).with_context(|| format!("failed to dispatch event '{name}'"));
    }

    Ok(0)
}

fn exec(config: &Config, matches: &ArgMatches) -> Result<i32> {
    let command: Vec<String> = matches
        .get_many::<String>("command")
        .context("missing program to run")?
        .cloned()
        .collect();

    let mut router = setup::init_router(config)?;
    console::execute(&mut router, &command, config.console_events())
}
