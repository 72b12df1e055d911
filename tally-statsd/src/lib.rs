//! A StatsD metrics transport built on cadence.
//!
//! The dispatch engine talks to the network through the [`MetricsTransport`] trait. Its main
//! implementation is [`MetricsClient`], which formats metrics with a [`cadence::StatsdClient`] and
//! writes them to one or more statsd servers through an [`UpstreamSink`].
//!
//! ## Wire Format
//!
//! Every metric is one line of the form `<bucket>:<value>|<type>[|@<rate>][|#<tags>]`:
//!
//! | primitive   | line                 |
//! |-------------|----------------------|
//! | `increment` | `orders.count:1|c`   |
//! | `count`     | `orders.count:5|c`   |
//! | `count`     | `bytes.sent:2.5|c`   |
//! | `gauge`     | `cart.size:3|g`      |
//! | `set`       | `users.unique:u-42|s`|
//! | `timing`    | `http.time:120|ms`   |
//!
//! Lines are joined with newlines into datagrams. With buffering enabled, nothing is sent until
//! [`MetricsTransport::flush`] is called or a datagram is full.
//!
//! ## Initializing the Client
//!
//! ```no_run
//! use std::collections::BTreeMap;
//!
//! use tally_statsd::{MetricsClient, MetricsClientConfig, MetricsTransport};
//!
//! let mut client = MetricsClient::new(MetricsClientConfig {
//!     prefix: "shop",
//!     upstreams: vec!["127.0.0.1:8125".to_owned()],
//!     default_tags: BTreeMap::new(),
//!     default_sample_rate: 1.0.into(),
//!     buffering: true,
//!     buffer_size: None,
//! })?;
//!
//! client.increment("orders.created")?;
//! client.flush()?;
//! # Ok::<(), tally_statsd::TransportError>(())
//! ```

#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::io;
use std::panic::RefUnwindSafe;

use cadence::ext::{MetricBackend, MetricValue, ToCounterValue};
use cadence::prelude::*;
use cadence::{
    ErrorKind, Metric, MetricBuilder, MetricError, MetricResult, MetricSink, NopMetricSink,
    StatsdClient,
};
use rand::Rng;
use rand::distr::StandardUniform;

mod upstream;

pub use self::upstream::UpstreamSink;

/// A sample rate between 0.0 (= 0%) and 1.0 (= 100%).
///
/// Values outside of this range are clamped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRate(f64);

impl SampleRate {
    /// Sends every metric.
    pub const ALL: Self = Self(1.0);
}

impl Default for SampleRate {
    fn default() -> Self {
        Self::ALL
    }
}

impl From<f64> for SampleRate {
    fn from(value: f64) -> Self {
        if value.is_nan() {
            return Self::ALL;
        }
        Self(value.clamp(0.0, 1.0))
    }
}

impl From<SampleRate> for f64 {
    fn from(value: SampleRate) -> Self {
        value.0
    }
}

/// Error returned by a [`MetricsTransport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Formatting or writing a metric failed.
    #[error("failed to send metric")]
    Metric(#[from] cadence::MetricError),

    /// The statsd upstream could not be reached or configured.
    #[error("failed to connect to statsd upstream")]
    Io(#[from] io::Error),
}

/// The primitives the dispatch engine emits metrics through.
///
/// All operations are fire-and-forget: a returned error means the metric is lost, never that it
/// will be retried.
pub trait MetricsTransport {
    /// Increments a counter by one.
    fn increment(&mut self, name: &str) -> Result<(), TransportError>;

    /// Adds `value` to a counter. Whole numbers are sent as integers.
    fn count(&mut self, name: &str, value: f64) -> Result<(), TransportError>;

    /// Sets a gauge to `value`.
    fn gauge(&mut self, name: &str, value: f64) -> Result<(), TransportError>;

    /// Records `member` as a member of a set, which counts unique occurrences.
    fn set(&mut self, name: &str, member: &str) -> Result<(), TransportError>;

    /// Records a duration in milliseconds.
    fn timing(&mut self, name: &str, millis: u64) -> Result<(), TransportError>;

    /// Sends all buffered metrics.
    fn flush(&mut self) -> Result<(), TransportError>;
}

impl<T: MetricsTransport + ?Sized> MetricsTransport for Box<T> {
    fn increment(&mut self, name: &str) -> Result<(), TransportError> {
        (**self).increment(name)
    }

    fn count(&mut self, name: &str, value: f64) -> Result<(), TransportError> {
        (**self).count(name, value)
    }

    fn gauge(&mut self, name: &str, value: f64) -> Result<(), TransportError> {
        (**self).gauge(name, value)
    }

    fn set(&mut self, name: &str, member: &str) -> Result<(), TransportError> {
        (**self).set(name, member)
    }

    fn timing(&mut self, name: &str, millis: u64) -> Result<(), TransportError> {
        (**self).timing(name, millis)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        (**self).flush()
    }
}

/// Client configuration used for initialization of [`MetricsClient`].
#[derive(Debug)]
pub struct MetricsClientConfig<'a> {
    /// Prefix which is prepended to all metric names, separated by a dot.
    pub prefix: &'a str,
    /// Addresses of the statsd servers, see [`UpstreamSink`].
    pub upstreams: Vec<String>,
    /// Tags that are added to all metrics.
    pub default_tags: BTreeMap<String, String>,
    /// Default sample rate for metrics.
    pub default_sample_rate: SampleRate,
    /// If metrics should be batched until flushed or sent immediately.
    pub buffering: bool,
    /// Maximum size of a datagram in bytes.
    pub buffer_size: Option<usize>,
}

/// A counter value that keeps whole numbers integral on the wire.
struct CountValue(f64);

impl ToCounterValue for CountValue {
    fn try_to_value(self) -> MetricResult<MetricValue> {
        let Self(value) = self;
        if !value.is_finite() {
            return Err(MetricError::from((
                ErrorKind::InvalidInput,
                "counter value must be finite",
            )));
        }

        if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
            Ok(MetricValue::Signed(value as i64))
        } else {
            Ok(MetricValue::Float(value))
        }
    }
}

/// A fully formatted metric line.
struct MetricLine(String);

impl Metric for MetricLine {
    fn as_metric_str(&self) -> &str {
        &self.0
    }
}

/// Returns the prefix in the form cadence prepends it to metric names.
fn normalize_prefix(prefix: &str) -> String {
    let prefix = prefix.trim_end_matches('.');
    if prefix.is_empty() {
        String::new()
    } else {
        format!("{prefix}.")
    }
}

/// A [`MetricsTransport`] that formats metrics with cadence.
#[derive(Debug)]
pub struct MetricsClient {
    /// The raw statsd client.
    pub statsd_client: StatsdClient,
    /// Default tags to apply to every metric.
    pub default_tags: BTreeMap<String, String>,
    /// Global sample rate.
    pub default_sample_rate: SampleRate,
    prefix: String,
}

impl MetricsClient {
    fn from_sink<S>(prefix: &str, sink: S) -> Self
    where
        S: MetricSink + Send + Sync + RefUnwindSafe + 'static,
    {
        Self {
            statsd_client: StatsdClient::from_sink(prefix, sink),
            default_tags: BTreeMap::new(),
            default_sample_rate: SampleRate::ALL,
            prefix: normalize_prefix(prefix),
        }
    }

    /// Connects to the configured statsd servers.
    pub fn new(config: MetricsClientConfig<'_>) -> Result<Self, TransportError> {
        let sink = UpstreamSink::connect(&config.upstreams, config.buffer_size, config.buffering)?;
        tally_log::info!(
            "reporting metrics to statsd at {}",
            config.upstreams.join(", ")
        );

        let sample_rate: f64 = config.default_sample_rate.into();
        tally_log::debug!(
            "metrics sample rate is set to {sample_rate}{}",
            if sample_rate == 0.0 {
                ", no metrics will be reported"
            } else {
                ""
            }
        );

        Ok(Self {
            default_tags: config.default_tags,
            default_sample_rate: config.default_sample_rate,
            ..Self::from_sink(config.prefix, sink)
        })
    }

    /// Creates a client that discards all metrics.
    pub fn noop() -> Self {
        Self::from_sink("", NopMetricSink)
    }

    /// Creates a client that captures every metric line into a channel.
    ///
    /// Lines are captured unbuffered, as soon as they are emitted.
    #[cfg(any(test, feature = "test"))]
    pub fn capturing(prefix: &str) -> (Self, crossbeam_channel::Receiver<Vec<u8>>) {
        let (rx, sink) = cadence::SpyMetricSink::new();
        (Self::from_sink(prefix, sink), rx)
    }

    /// Sends a metric with the default tags and sample rate of this client.
    fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>) -> Result<(), TransportError>
    where
        T: Metric + From<String>,
    {
        let sample_rate = self.default_sample_rate.0;
        if !Self::should_send(sample_rate) {
            return Ok(());
        }

        for (k, v) in &self.default_tags {
            metric = metric.with_tag(k, v);
        }

        if sample_rate < 1.0 {
            metric = metric.with_sampling_rate(sample_rate);
        }

        match metric.try_send() {
            Ok(_) => Ok(()),
            Err(error) => Err(Self::send_failed(error)),
        }
    }

    /// Formats and sends a line that cadence has no builder for, such as a set with a string
    /// member.
    fn send_line(&self, name: &str, value: &str, ty: &str) -> Result<(), TransportError> {
        if value.is_empty() || value.contains(['|', '\n', '\r']) {
            return Err(Self::send_failed(MetricError::from((
                ErrorKind::InvalidInput,
                "metric value must be non-empty and must not contain '|' or line breaks",
            ))));
        }

        let sample_rate = self.default_sample_rate.0;
        if !Self::should_send(sample_rate) {
            return Ok(());
        }

        let mut line = format!("{}{name}:{value}|{ty}", self.prefix);
        if sample_rate < 1.0 {
            line.push_str(&format!("|@{sample_rate}"));
        }

        if !self.default_tags.is_empty() {
            let tags: Vec<_> = self
                .default_tags
                .iter()
                .map(|(k, v)| format!("{k}:{v}"))
                .collect();
            line.push_str("|#");
            line.push_str(&tags.join(","));
        }

        self.statsd_client
            .send_metric(&MetricLine(line))
            .map_err(Self::send_failed)
    }

    fn send_failed(error: MetricError) -> TransportError {
        tally_log::warn!(
            error = &error as &dyn std::error::Error,
            "error sending a metric",
        );
        error.into()
    }

    fn should_send(sample_rate: f64) -> bool {
        if sample_rate <= 0.0 {
            false
        } else if sample_rate >= 1.0 {
            true
        } else {
            let mut rng = rand::rng();
            let s: f64 = rng.sample(StandardUniform);
            s <= sample_rate
        }
    }
}

impl MetricsTransport for MetricsClient {
    fn increment(&mut self, name: &str) -> Result<(), TransportError> {
        self.send_metric(self.statsd_client.count_with_tags(name, 1i64))
    }

    fn count(&mut self, name: &str, value: f64) -> Result<(), TransportError> {
        self.send_metric(self.statsd_client.count_with_tags(name, CountValue(value)))
    }

    fn gauge(&mut self, name: &str, value: f64) -> Result<(), TransportError> {
        self.send_metric(self.statsd_client.gauge_with_tags(name, value))
    }

    fn set(&mut self, name: &str, member: &str) -> Result<(), TransportError> {
        self.send_line(name, member, "s")
    }

    fn timing(&mut self, name: &str, millis: u64) -> Result<(), TransportError> {
        self.send_metric(self.statsd_client.time_with_tags(name, millis))
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.statsd_client.flush().map_err(|error| {
            tally_log::warn!(
                error = &error as &dyn std::error::Error,
                "error flushing metrics",
            );
            error.into()
        })
    }
}
