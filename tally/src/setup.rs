use anyhow::{Context, Result};
use tally_config::{ClientConfig, Config};
use tally_dispatch::{Dispatcher, Router};
use tally_statsd::{MetricsClient, MetricsClientConfig, SampleRate};

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().as_os_str().is_empty() {
        tally_log::debug!("running tally without config folder");
    } else {
        tally_log::debug!(
            "running tally from config folder {}",
            config.path().display()
        );
    }
    tally_log::debug!("  log level: {}", config.logging().level);
    tally_log::debug!("  console events: {}", config.console_events());
    tally_log::debug!("  clients: {}", config.clients().len());
}

/// Prints a summary of all clients, their servers and the events they listen to.
#[allow(clippy::print_stdout)]
pub fn dump_clients(config: &Config) {
    for client in config.clients() {
        println!("client {}:", client.name());
        println!("  servers: {}", client.upstreams().join(", "));
        for (event, rules) in client.rules().iter() {
            let kinds: Vec<_> = rules.iter().map(|rule| rule.kind().as_str()).collect();
            println!("  {event}: {}", kinds.join(", "));
        }
    }
}

/// Creates the metrics client of a configured client.
pub fn init_metrics(config: &Config, client: &ClientConfig) -> Result<MetricsClient> {
    let mut default_tags = config.metrics_default_tags().clone();
    if let Some(hostname_tag) = config.metrics_hostname_tag()
        && let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok())
    {
        default_tags.insert(hostname_tag.to_owned(), hostname);
    }

    let metrics = MetricsClient::new(MetricsClientConfig {
        prefix: config.metrics_prefix(),
        upstreams: client.upstreams().to_vec(),
        default_tags,
        default_sample_rate: SampleRate::from(config.metrics_sample_rate()),
        buffering: config.metrics_buffering(),
        buffer_size: config.metrics_buffer_size(),
    })
    .with_context(|| format!("failed to set up metrics client '{}'", client.name()))?;

    Ok(metrics)
}

/// Builds a router that hands events to every configured client.
pub fn init_router(config: &Config) -> Result<Router<MetricsClient>> {
    let mut router = Router::new();

    for client in config.clients() {
        let metrics = init_metrics(config, client)?;
        let dispatcher = Dispatcher::with_rules(client.rules().clone(), metrics);
        router.add_client(client.name(), dispatcher);
    }

    if router.is_empty() {
        tally_log::warn!("no metrics clients configured, events are not reported");
    }

    Ok(router)
}
