use tally_protocol::Event;
use tally_statsd::MetricsTransport;

use crate::dispatcher::{DispatchError, Dispatcher};

/// The failure of a single client within a [`Router`].
#[derive(Debug, thiserror::Error)]
#[error("metrics client '{client}' failed")]
pub struct ClientError {
    /// The name of the client.
    pub client: String,
    /// The error of the client's dispatcher.
    #[source]
    pub error: DispatchError,
}

/// Error returned from [`Router`] when at least one client failed.
#[derive(Debug, thiserror::Error)]
#[error("{} of {total} metrics clients failed", .errors.len())]
pub struct RouterError {
    /// The number of clients that were attempted.
    pub total: usize,
    /// The failures of individual clients in client order.
    pub errors: Vec<ClientError>,
}

/// Hands every event to a list of named dispatchers.
///
/// Each configured client has its own rules and transport. A failing client does not prevent the
/// remaining clients from handling the event.
#[derive(Debug)]
pub struct Router<T> {
    clients: Vec<(String, Dispatcher<T>)>,
}

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self {
            clients: Vec::new(),
        }
    }
}

impl<T: MetricsTransport> Router<T> {
    /// Creates a router without clients.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a client. Clients handle events in the order they were added.
    pub fn add_client(&mut self, name: impl Into<String>, dispatcher: Dispatcher<T>) {
        self.clients.push((name.into(), dispatcher));
    }

    /// Returns the dispatcher of a client by name.
    pub fn get(&self, name: &str) -> Option<&Dispatcher<T>> {
        self.clients
            .iter()
            .find(|(client, _)| client == name)
            .map(|(_, dispatcher)| dispatcher)
    }

    /// Iterates over all clients and their dispatchers.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Dispatcher<T>)> {
        self.clients
            .iter()
            .map(|(name, dispatcher)| (name.as_str(), dispatcher))
    }

    /// Returns the number of clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns `true` if there are no clients.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Hands the event to every client.
    pub fn handle_event(&mut self, event: &dyn Event) -> Result<(), RouterError> {
        self.for_each_client(|dispatcher| dispatcher.handle_event(event))
    }

    /// Flushes the transports of all clients.
    pub fn flush(&mut self) -> Result<(), RouterError> {
        self.for_each_client(Dispatcher::flush)
    }

    fn for_each_client<F>(&mut self, mut f: F) -> Result<(), RouterError>
    where
        F: FnMut(&mut Dispatcher<T>) -> Result<(), DispatchError>,
    {
        let errors: Vec<_> = self
            .clients
            .iter_mut()
            .filter_map(|(client, dispatcher)| {
                f(dispatcher).err().map(|error| ClientError {
                    client: client.clone(),
                    error,
                })
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RouterError {
                total: self.clients.len(),
                errors,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;
    use tally_protocol::JsonEvent;

    use super::*;
    use crate::rule::{MetricRule, RuleSet};
    use crate::template::Template;
    use crate::testutils::{Call, RecordingTransport};

    fn client(rules: Vec<MetricRule>) -> Dispatcher<RecordingTransport> {
        let mut rule_set = RuleSet::new();
        rule_set.insert("user.login", rules);
        Dispatcher::with_rules(rule_set, RecordingTransport::default())
    }

    #[test]
    fn test_every_client_handles_event() {
        let mut router = Router::new();
        router.add_client(
            "default",
            client(vec![MetricRule::Increment(Template::parse("logins"))]),
        );
        router.add_client(
            "audit",
            client(vec![MetricRule::Count(Template::parse("audit.logins"))]),
        );

        let event = JsonEvent::new("user.login", json!({"value": 2}));
        router.handle_event(&event).unwrap();

        assert_eq!(
            router.get("default").unwrap().transport().calls,
            [Call::Increment("logins".to_owned())]
        );
        assert_eq!(
            router.get("audit").unwrap().transport().calls,
            [Call::Count("audit.logins".to_owned(), 2.0)]
        );
    }

    #[test]
    fn test_failing_client_does_not_stop_others() {
        let mut router = Router::new();
        router.add_client(
            "broken",
            client(vec![MetricRule::Count(Template::parse("a"))]),
        );
        router.add_client(
            "working",
            client(vec![MetricRule::Increment(Template::parse("b"))]),
        );

        let event = JsonEvent::new("user.login", json!({}));
        let error = router.handle_event(&event).unwrap_err();

        assert_eq!(error.to_string(), "1 of 2 metrics clients failed");
        assert_eq!(error.errors[0].client, "broken");
        assert_eq!(
            router.get("working").unwrap().transport().calls,
            [Call::Increment("b".to_owned())]
        );
    }

    #[test]
    fn test_flush_all_clients() {
        let mut router = Router::new();
        router.add_client("a", client(vec![]));
        router.add_client("b", client(vec![]));

        router.flush().unwrap();

        for (_, dispatcher) in router.iter() {
            assert_eq!(dispatcher.transport().calls, [Call::Flush]);
        }
        assert_eq!(router.len(), 2);
    }
}
