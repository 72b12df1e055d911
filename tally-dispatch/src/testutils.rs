use tally_statsd::{MetricsTransport, TransportError};

/// A primitive invoked on a [`RecordingTransport`].
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Increment(String),
    Count(String, f64),
    Gauge(String, f64),
    Set(String, String),
    Timing(String, u64),
    Flush,
}

/// Records all calls instead of sending metrics.
///
/// With `fail` set, every call is still recorded but returns an error.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub calls: Vec<Call>,
    pub fail: bool,
}

impl RecordingTransport {
    fn record(&mut self, call: Call) -> Result<(), TransportError> {
        self.calls.push(call);
        match self.fail {
            true => Err(std::io::Error::other("connection refused").into()),
            false => Ok(()),
        }
    }
}

impl MetricsTransport for RecordingTransport {
    fn increment(&mut self, name: &str) -> Result<(), TransportError> {
        self.record(Call::Increment(name.to_owned()))
    }

    fn count(&mut self, name: &str, value: f64) -> Result<(), TransportError> {
        self.record(Call::Count(name.to_owned(), value))
    }

    fn gauge(&mut self, name: &str, value: f64) -> Result<(), TransportError> {
        self.record(Call::Gauge(name.to_owned(), value))
    }

    fn set(&mut self, name: &str, member: &str) -> Result<(), TransportError> {
        self.record(Call::Set(name.to_owned(), member.to_owned()))
    }

    fn timing(&mut self, name: &str, millis: u64) -> Result<(), TransportError> {
        self.record(Call::Timing(name.to_owned(), millis))
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.record(Call::Flush)
    }
}
