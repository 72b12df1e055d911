use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use globset::GlobBuilder;
use serde::{Deserialize, Serialize};
use tally_dispatch::{RawRules, RuleSet};
use tally_log::{LogConfig, LogFormat, LogLevel};

/// The server alias that selects every configured server.
pub const ALL_SERVERS: &str = "all";

/// The port used for servers that do not declare one.
pub const DEFAULT_STATSD_PORT: u16 = 8125;

/// Defines the source of a config error
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override (an env var, or a CLI parameter).
    FieldOverride(String),
    /// An error in the section of a metrics client.
    Client(String),
}

impl fmt::Display for ConfigErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErrorSource::None => Ok(()),
            ConfigErrorSource::File(file_name) => {
                write!(f, " (file {})", file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, " (field {name})"),
            ConfigErrorSource::Client(name) => write!(f, " (client {name})"),
        }
    }
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    cause: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            cause: None,
        }
    }

    #[inline]
    fn wrap<E>(cause: E, kind: ConfigErrorKind) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync + 'static>>,
    {
        Self {
            source: ConfigErrorSource::None,
            kind,
            cause: Some(cause.into()),
        }
    }

    #[inline]
    fn for_field<E>(cause: E, field: &'static str) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync + 'static>>,
    {
        Self::wrap(cause, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, p: impl AsRef<Path>) -> Self {
        self.source = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    #[inline]
    fn client(mut self, name: &str) -> Self {
        self.source = ConfigErrorSource::Client(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.source)
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_ref().map(|cause| &**cause as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to serialize the configuration.
    #[error("could not write config")]
    CouldNotWriteFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config")]
    BadJson,
    /// Invalid config value
    #[error("invalid config value")]
    InvalidValue,
    /// A client refers to a server that is not defined in the servers section.
    #[error("unknown server")]
    UnknownServer,
    /// The metric rules of a client are invalid.
    #[error("invalid metric rules")]
    InvalidRules,
}

/// Structure used to hold information about configuration overrides via
/// CLI parameters or environment variables
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The log level of Tally's own crates.
    pub log_level: Option<String>,
    /// The log output format.
    pub log_format: Option<String>,
    /// Prefix prepended to all metric names.
    pub metrics_prefix: Option<String>,
    /// Global sample rate between `0.0` and `1.0`.
    pub sample_rate: Option<String>,
}

/// A statsd server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Server {
    /// Hostname or IP address of the server.
    ///
    /// Addresses with a scheme, such as `udp://host:port` or `unixgram:///path/to/socket`, are
    /// used as is and ignore the port.
    pub address: String,
    /// The UDP port, defaults to `8125`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Server {
    /// Returns the upstream address that metrics are sent to.
    pub fn upstream(&self) -> String {
        if self.address.contains("://") {
            return self.address.clone();
        }

        let port = self.port.unwrap_or(DEFAULT_STATSD_PORT);
        if self.address.contains(':') && !self.address.starts_with('[') {
            // A bare IPv6 address.
            format!("[{}]:{port}", self.address)
        } else {
            format!("{}:{port}", self.address)
        }
    }
}

/// The section of a metrics client.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
struct Client {
    /// Server names, glob patterns over server names, or `all`.
    servers: Vec<String>,
    /// Metric rules by event name.
    events: BTreeMap<String, RawRules>,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            servers: vec![ALL_SERVERS.to_owned()],
            events: BTreeMap::new(),
        }
    }
}

/// Controls internal reporting of metrics.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
struct Metrics {
    /// Common prefix that should be added to all metrics.
    ///
    /// Defaults to no prefix.
    prefix: String,
    /// Default tags to apply to all metrics.
    default_tags: BTreeMap<String, String>,
    /// Tag name to report the hostname to for each metric. Defaults to not sending such a tag.
    hostname_tag: Option<String>,
    /// Emitted metrics will be buffered until flushed.
    ///
    /// Defaults to `true`.
    buffering: bool,
    /// Maximum size of a datagram in bytes.
    ///
    /// Defaults to 512 for UDP and 1024 for Unix datagram sockets.
    buffer_size: Option<usize>,
    /// Global sample rate for all emitted metrics between `0.0` and `1.0`.
    ///
    /// For example, a value of `0.3` means that only 30% of the emitted metrics will be sent.
    /// Defaults to `1.0` (100%).
    sample_rate: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            prefix: String::new(),
            default_tags: BTreeMap::new(),
            hostname_tag: None,
            buffering: true,
            buffer_size: None,
            sample_rate: 1.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
struct ConfigValues {
    logging: LogConfig,
    metrics: Metrics,
    console_events: bool,
    servers: BTreeMap<String, Server>,
    clients: BTreeMap<String, Client>,
}

impl Default for ConfigValues {
    fn default() -> Self {
        Self {
            logging: LogConfig::default(),
            metrics: Metrics::default(),
            console_events: true,
            servers: BTreeMap::new(),
            clients: BTreeMap::new(),
        }
    }
}

impl ConfigValues {
    fn path(base: &Path) -> PathBuf {
        base.join("config.yml")
    }

    fn load(base: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(base);

        let f = fs::File::open(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&path))?;

        serde_yaml::from_reader(io::BufReader::new(f))
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&path))
    }
}

/// A metrics client with its servers and validated rules.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    name: String,
    servers: Vec<String>,
    upstreams: Vec<String>,
    rules: RuleSet,
}

impl ClientConfig {
    /// Returns the name of the client.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the names of the servers the client sends to.
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Returns the upstream addresses of the client's servers.
    pub fn upstreams(&self) -> &[String] {
        &self.upstreams
    }

    /// Returns the metric rules of the client.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }
}

fn glob_matches(pattern: &str, name: &str) -> Result<bool, globset::Error> {
    let glob = GlobBuilder::new(pattern).build()?;
    Ok(glob.compile_matcher().is_match(name))
}

/// Resolves the server aliases of a client to server names.
///
/// An alias is either `all`, the exact name of a server, or a glob pattern that matches at least
/// one server name.
fn resolve_servers(
    client: &str,
    aliases: &[String],
    servers: &BTreeMap<String, Server>,
) -> Result<Vec<String>, ConfigError> {
    let mut matched: Vec<String> = Vec::new();
    let mut push = |name: &String| {
        if !matched.contains(name) {
            matched.push(name.clone());
        }
    };

    for alias in aliases {
        if alias == ALL_SERVERS {
            servers.keys().for_each(&mut push);
            continue;
        }

        if servers.contains_key(alias) {
            push(alias);
            continue;
        }

        let mut found = false;
        for name in servers.keys() {
            let is_match = glob_matches(alias, name).map_err(|e| {
                ConfigError::wrap(e, ConfigErrorKind::InvalidValue).client(client)
            })?;

            if is_match {
                push(name);
                found = true;
            }
        }

        if !found {
            return Err(ConfigError::wrap(
                format!(
                    "client {client} used server {alias} which is not defined in the servers section"
                ),
                ConfigErrorKind::UnknownServer,
            )
            .client(client));
        }
    }

    if matched.is_empty() {
        return Err(ConfigError::wrap(
            format!("client {client} does not use any server"),
            ConfigErrorKind::UnknownServer,
        )
        .client(client));
    }

    Ok(matched)
}

/// Config struct.
pub struct Config {
    values: ConfigValues,
    clients: Vec<ClientConfig>,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Config {
    /// Loads a config from a given config folder.
    ///
    /// The folder must contain a `config.yml`. Servers of all clients are resolved and their rules
    /// are validated while loading.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = std::env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        Self::from_values(ConfigValues::load(&path)?, path)
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        let values = serde_json::from_value(value)
            .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadJson))?;

        Self::from_values(values, PathBuf::new())
    }

    fn from_values(values: ConfigValues, path: PathBuf) -> Result<Config, ConfigError> {
        let mut config = Config {
            values,
            clients: Vec::new(),
            path,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        let values = &self.values;

        let sample_rate = values.metrics.sample_rate;
        if !(0.0..=1.0).contains(&sample_rate) {
            return Err(ConfigError::wrap(
                format!("sample rate {sample_rate} is not between 0.0 and 1.0"),
                ConfigErrorKind::InvalidValue,
            )
            .file(&self.path));
        }

        let mut clients = Vec::with_capacity(values.clients.len());

        for (name, client) in &values.clients {
            let servers = resolve_servers(name, &client.servers, &values.servers)?;
            let upstreams = servers
                .iter()
                .filter_map(|server| values.servers.get(server))
                .map(Server::upstream)
                .collect();

            let mut rules = RuleSet::new();
            for (event, raw_rules) in &client.events {
                rules.add_event_to_listen(event, raw_rules).map_err(|e| {
                    ConfigError::wrap(e, ConfigErrorKind::InvalidRules).client(name)
                })?;
            }

            clients.push(ClientConfig {
                name: name.clone(),
                servers,
                upstreams,
                rules,
            });
        }

        self.clients = clients;
        Ok(())
    }

    /// Override configuration with values coming from other sources (e.g. env variables or
    /// command line parameters)
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        let logging = &mut self.values.logging;

        if let Some(level) = overrides.log_level {
            logging.level = level
                .parse::<LogLevel>()
                .map_err(|err| ConfigError::for_field(err, "log_level"))?;
        }

        if let Some(format) = overrides.log_format {
            logging.format =
                serde_json::from_value::<LogFormat>(serde_json::Value::String(format))
                    .map_err(|err| ConfigError::for_field(err, "log_format"))?;
        }

        let metrics = &mut self.values.metrics;

        if let Some(prefix) = overrides.metrics_prefix {
            metrics.prefix = prefix;
        }

        if let Some(sample_rate) = overrides.sample_rate {
            let sample_rate = sample_rate
                .parse::<f64>()
                .map_err(|err| ConfigError::for_field(err, "sample_rate"))?;

            if !(0.0..=1.0).contains(&sample_rate) {
                return Err(ConfigError::new(ConfigErrorKind::InvalidValue).field("sample_rate"));
            }

            metrics.sample_rate = sample_rate;
        }

        Ok(self)
    }

    /// Checks if the config is already initialized.
    pub fn config_exists<P: AsRef<Path>>(path: P) -> bool {
        fs::metadata(ConfigValues::path(path.as_ref())).is_ok()
    }

    /// Returns the path of the config folder.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dumps out a YAML string of the values.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile))
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Returns `true` if the events of wrapped console commands are dispatched.
    pub fn console_events(&self) -> bool {
        self.values.console_events
    }

    /// Returns the prefix for metric names.
    pub fn metrics_prefix(&self) -> &str {
        &self.values.metrics.prefix
    }

    /// Returns the default tags for metrics.
    pub fn metrics_default_tags(&self) -> &BTreeMap<String, String> {
        &self.values.metrics.default_tags
    }

    /// Returns the name of the hostname tag that should be attached to each outgoing metric.
    pub fn metrics_hostname_tag(&self) -> Option<&str> {
        self.values.metrics.hostname_tag.as_deref()
    }

    /// Returns `true` if metrics are buffered until flushed.
    pub fn metrics_buffering(&self) -> bool {
        self.values.metrics.buffering
    }

    /// Returns the maximum datagram size, if configured.
    pub fn metrics_buffer_size(&self) -> Option<usize> {
        self.values.metrics.buffer_size
    }

    /// Returns the global sample rate for all metrics.
    pub fn metrics_sample_rate(&self) -> f64 {
        self.values.metrics.sample_rate
    }

    /// Returns all configured servers by name.
    pub fn servers(&self) -> &BTreeMap<String, Server> {
        &self.values.servers
    }

    /// Returns all metrics clients in order of their names.
    pub fn clients(&self) -> &[ClientConfig] {
        &self.clients
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;

    fn servers() -> serde_json::Value {
        json!({
            "local": {"address": "127.0.0.1", "port": 8125},
            "backup-eu": {"address": "10.0.0.1"},
            "backup-us": {"address": "10.0.0.2", "port": 9125},
            "socket": {"address": "unixgram:///var/run/statsd.sock"},
        })
    }

    fn client_servers(aliases: serde_json::Value) -> Result<Vec<String>, ConfigError> {
        let config = Config::from_json_value(json!({
            "servers": servers(),
            "clients": {"default": {"servers": aliases}},
        }))?;

        Ok(config.clients()[0].servers().to_vec())
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_json_value(json!({})).unwrap();

        assert_eq!(config.logging().level, LogLevel::Info);
        assert!(config.console_events());
        assert_eq!(config.metrics_prefix(), "");
        assert!(config.metrics_buffering());
        assert_eq!(config.metrics_buffer_size(), None);
        assert_eq!(config.metrics_sample_rate(), 1.0);
        assert!(config.clients().is_empty());
    }

    #[test]
    fn test_server_upstream() {
        let server = |address: &str, port| Server {
            address: address.to_owned(),
            port,
        };

        assert_eq!(server("127.0.0.1", None).upstream(), "127.0.0.1:8125");
        assert_eq!(server("statsd", Some(9125)).upstream(), "statsd:9125");
        assert_eq!(server("::1", None).upstream(), "[::1]:8125");
        assert_eq!(
            server("unixgram:///tmp/statsd.sock", Some(1)).upstream(),
            "unixgram:///tmp/statsd.sock"
        );
    }

    #[test]
    fn test_resolve_all_servers() {
        assert_eq!(
            client_servers(json!(["all"])).unwrap(),
            ["backup-eu", "backup-us", "local", "socket"]
        );
    }

    #[test]
    fn test_default_client_uses_all_servers() {
        let config = Config::from_json_value(json!({
            "servers": {"local": {"address": "127.0.0.1"}},
            "clients": {"default": {}},
        }))
        .unwrap();

        assert_eq!(config.clients()[0].servers(), ["local"]);
        assert_eq!(config.clients()[0].upstreams(), ["127.0.0.1:8125"]);
    }

    #[test]
    fn test_resolve_named_and_glob_servers() {
        assert_eq!(
            client_servers(json!(["local", "backup-*", "local"])).unwrap(),
            ["local", "backup-eu", "backup-us"]
        );
    }

    #[test]
    fn test_unknown_server() {
        let error = client_servers(json!(["local", "missing"])).unwrap_err();

        assert_eq!(error.kind(), ConfigErrorKind::UnknownServer);
        assert_eq!(error.to_string(), "unknown server (client default)");
        assert_eq!(
            error.source().unwrap().to_string(),
            "client default used server missing which is not defined in the servers section"
        );
    }

    #[test]
    fn test_client_without_servers() {
        let error = Config::from_json_value(json!({"clients": {"default": {}}})).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::UnknownServer);
    }

    #[test]
    fn test_invalid_rules() {
        let error = Config::from_json_value(json!({
            "servers": servers(),
            "clients": {
                "default": {
                    "events": {"order.created": {"histogram": "orders"}},
                },
            },
        }))
        .unwrap_err();

        assert_eq!(error.kind(), ConfigErrorKind::InvalidRules);
        assert_eq!(
            error.source().unwrap().to_string(),
            "the metric kind 'histogram' used by event 'order.created' is not allowed"
        );
    }

    #[test]
    fn test_rules_keep_declaration_order() {
        let config = Config::from_json_value(json!({
            "servers": servers(),
            "clients": {
                "default": {
                    "events": {
                        "request.completed": {
                            "timing": "t",
                            "increment": "i",
                            "count": "c",
                        },
                    },
                },
            },
        }))
        .unwrap();

        let rules = config.clients()[0].rules().get("request.completed").unwrap();
        let kinds: Vec<_> = rules.iter().map(|rule| rule.kind().as_str()).collect();
        assert_eq!(kinds, ["timing", "increment", "count"]);
    }

    #[test]
    fn test_invalid_sample_rate() {
        let error = Config::from_json_value(json!({"metrics": {"sample_rate": 2.0}})).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);
    }

    #[test]
    fn test_apply_override() {
        let mut config = Config::from_json_value(json!({})).unwrap();

        config
            .apply_override(OverridableConfig {
                log_level: Some("debug".to_owned()),
                log_format: Some("json".to_owned()),
                metrics_prefix: Some("shop".to_owned()),
                sample_rate: Some("0.5".to_owned()),
            })
            .unwrap();

        assert_eq!(config.logging().level, LogLevel::Debug);
        assert_eq!(config.logging().format, LogFormat::Json);
        assert_eq!(config.metrics_prefix(), "shop");
        assert_eq!(config.metrics_sample_rate(), 0.5);
    }

    #[test]
    fn test_apply_invalid_override() {
        let mut config = Config::from_json_value(json!({})).unwrap();

        let error = config
            .apply_override(OverridableConfig {
                sample_rate: Some("often".to_owned()),
                ..Default::default()
            })
            .unwrap_err();

        assert_eq!(error.to_string(), "invalid config value (field sample_rate)");
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.yml"),
            "
logging:
  level: trace
metrics:
  prefix: shop
  default_tags:
    env: prod
servers:
  local:
    address: 127.0.0.1
    port: 8125
clients:
  default:
    servers: [all]
    events:
      order.created:
        count: orders.count
      request.completed:
        - timing: http.<route>.time
        - immediate_send: true
",
        )
        .unwrap();

        assert!(Config::config_exists(dir.path()));
        let config = Config::from_path(dir.path()).unwrap();

        assert_eq!(config.logging().level, LogLevel::Trace);
        assert_eq!(config.metrics_prefix(), "shop");
        assert_eq!(config.metrics_default_tags()["env"], "prod");

        let client = &config.clients()[0];
        assert_eq!(client.name(), "default");
        assert_eq!(client.upstreams(), ["127.0.0.1:8125"]);
        assert_eq!(
            client.rules().event_names().collect::<Vec<_>>(),
            ["order.created", "request.completed"]
        );
        assert_eq!(client.rules().get("request.completed").unwrap().len(), 2);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let error = Config::from_path(dir.path()).unwrap_err();

        assert_eq!(error.kind(), ConfigErrorKind::CouldNotOpenFile);
        assert!(error.to_string().starts_with("could not open config file (file "));
    }

    #[test]
    fn test_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.yml"), "clients: [").unwrap();

        let error = Config::from_path(dir.path()).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::BadYaml);
    }

    #[test]
    fn test_yaml_round_trip_keeps_rules() {
        let config = Config::from_json_value(json!({
            "servers": servers(),
            "clients": {
                "default": {
                    "events": {"user.login": {"increment": "users.<action>"}},
                },
            },
        }))
        .unwrap();

        let yaml = config.to_yaml_string().unwrap();
        assert!(yaml.contains("users.<action>"), "{yaml}");
    }
}
