use tally_protocol::{AccessError, Event, Val, resolve};
use tally_statsd::{MetricsTransport, TransportError};

use crate::rule::{ConfigurationError, MetricRule, RawRules, RuleSet};
use crate::template::Template;

/// Accessor that provides the value of `count`, `gauge` and `set` rules.
pub const VALUE_ACCESSOR: &str = "getValue";

/// Accessor that provides the duration of `timing` rules.
pub const TIMING_ACCESSOR: &str = "getTiming";

/// Error returned from [`Dispatcher::handle_event`].
///
/// An error aborts the rule that caused it and all rules after it. Metrics of earlier rules have
/// already been handed to the transport.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The event does not provide a field or accessor that a rule needs.
    #[error("the event class {event_type} ({event}) must have a {path} method or field")]
    MissingAccessor {
        /// The name of the event.
        event: String,
        /// The concrete type of the event.
        event_type: &'static str,
        /// The path that could not be resolved.
        path: String,
    },

    /// The value read from the event cannot be used for the metric.
    #[error("the value of {path} on event {event} is {found}, expected {expected}")]
    InvalidValue {
        /// The name of the event.
        event: String,
        /// The path the value was read from.
        path: String,
        /// Describes the expected value.
        expected: &'static str,
        /// The type of the value that was found.
        found: &'static str,
    },

    /// A path in a rule is syntactically invalid.
    #[error("invalid path '{path}' in the rules of event {event}")]
    InvalidPath {
        /// The name of the event.
        event: String,
        /// The invalid path.
        path: String,
    },

    /// The transport failed to send a metric.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl DispatchError {
    fn access(event: &dyn Event, error: AccessError) -> Self {
        match error {
            AccessError::Missing { path } => Self::MissingAccessor {
                event: event.name().to_owned(),
                event_type: event.type_name(),
                path,
            },
            AccessError::InvalidPath { path } => Self::InvalidPath {
                event: event.name().to_owned(),
                path,
            },
        }
    }
}

fn read<'a>(event: &'a dyn Event, path: &str) -> Result<Val<'a>, DispatchError> {
    resolve(event, path).map_err(|error| DispatchError::access(event, error))
}

fn invalid_value(
    event: &dyn Event,
    path: &str,
    value: Val<'_>,
    expected: &'static str,
) -> DispatchError {
    DispatchError::InvalidValue {
        event: event.name().to_owned(),
        path: path.to_owned(),
        expected,
        found: value.kind(),
    }
}

fn read_number(event: &dyn Event, path: &str) -> Result<f64, DispatchError> {
    let value = read(event, path)?;
    value
        .to_number()
        .ok_or_else(|| invalid_value(event, path, value, "a number"))
}

/// Reads the member of a set. Strings are used as is, numbers in their canonical form.
fn read_member(event: &dyn Event, path: &str) -> Result<String, DispatchError> {
    match read(event, path)? {
        value @ Val::Bool(_) => Err(invalid_value(event, path, value, "a string or number")),
        value => Ok(value.to_string()),
    }
}

fn expand(event: &dyn Event, template: &Template) -> Result<String, DispatchError> {
    template
        .expand(event)
        .map_err(|error| DispatchError::access(event, error))
}

/// Turns events into metrics according to a [`RuleSet`].
///
/// A dispatcher owns its rules and its transport. Rules are registered during setup; afterwards
/// events are handed to [`handle_event`](Self::handle_event) one at a time.
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use tally_dispatch::{Dispatcher, RawRules};
/// use tally_protocol::JsonEvent;
/// use tally_statsd::MetricsClient;
///
/// let mut dispatcher = Dispatcher::new(MetricsClient::noop());
///
/// let rules: RawRules = serde_json::from_value(json!({"count": "orders.count"})).unwrap();
/// dispatcher.add_event_to_listen("order.created", &rules).unwrap();
///
/// let event = JsonEvent::new("order.created", json!({"value": 1}));
/// dispatcher.handle_event(&event).unwrap();
/// ```
#[derive(Debug)]
pub struct Dispatcher<T> {
    rules: RuleSet,
    transport: T,
}

impl<T: MetricsTransport> Dispatcher<T> {
    /// Creates a dispatcher without any rules.
    pub fn new(transport: T) -> Self {
        Self::with_rules(RuleSet::new(), transport)
    }

    /// Creates a dispatcher with the given rules.
    pub fn with_rules(rules: RuleSet, transport: T) -> Self {
        Self { rules, transport }
    }

    /// Validates and registers the rules of an event, see [`RuleSet::add_event_to_listen`].
    pub fn add_event_to_listen(
        &mut self,
        event: &str,
        rules: &RawRules,
    ) -> Result<(), ConfigurationError> {
        self.rules.add_event_to_listen(event, rules)
    }

    /// Returns the registered rules.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Consumes the dispatcher and returns its transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Applies all rules registered for the event.
    ///
    /// Events without rules are ignored. If any rule requested immediate sending, the transport is
    /// flushed once after all rules ran.
    pub fn handle_event(&mut self, event: &dyn Event) -> Result<(), DispatchError> {
        let Some(rules) = self.rules.get(event.name()) else {
            return Ok(());
        };

        tally_log::debug!("handling event {} with {} rules", event.name(), rules.len());

        let mut immediate_send = false;

        for rule in rules {
            match rule {
                MetricRule::Increment(template) => {
                    let name = expand(event, template)?;
                    tally_log::trace!("increment {name}");
                    self.transport.increment(&name)?;
                }
                MetricRule::Count(template) => {
                    let value = read_number(event, VALUE_ACCESSOR)?;
                    let name = expand(event, template)?;
                    tally_log::trace!("count {name} by {value}");
                    self.transport.count(&name, value)?;
                }
                MetricRule::Gauge(template) => {
                    let value = read_number(event, VALUE_ACCESSOR)?;
                    let name = expand(event, template)?;
                    tally_log::trace!("gauge {name} at {value}");
                    self.transport.gauge(&name, value)?;
                }
                MetricRule::Set(template) => {
                    let member = read_member(event, VALUE_ACCESSOR)?;
                    let name = expand(event, template)?;
                    tally_log::trace!("set {name} with {member}");
                    self.transport.set(&name, &member)?;
                }
                MetricRule::Timing(template) => {
                    Self::timing(&mut self.transport, event, template, TIMING_ACCESSOR)?;
                }
                MetricRule::CustomTiming { template, accessor } => {
                    Self::timing(&mut self.transport, event, template, accessor)?;
                }
                MetricRule::ImmediateSend(flag) => immediate_send = *flag,
            }
        }

        if immediate_send {
            tally_log::trace!("flushing metrics of event {}", event.name());
            self.transport.flush()?;
        }

        Ok(())
    }

    /// Sends all buffered metrics.
    pub fn flush(&mut self) -> Result<(), DispatchError> {
        Ok(self.transport.flush()?)
    }

    fn timing(
        transport: &mut T,
        event: &dyn Event,
        template: &Template,
        accessor: &str,
    ) -> Result<(), DispatchError> {
        let duration = read_number(event, accessor)?;
        if duration <= 0.0 {
            return Ok(());
        }

        let millis = duration.round() as u64;
        let name = expand(event, template)?;
        tally_log::trace!("timing {name} took {millis}ms");
        transport.timing(&name, millis)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;
    use tally_protocol::{Getter, JsonEvent};

    use super::*;
    use crate::testutils::{Call, RecordingTransport};

    fn dispatcher(event: &str, rules: Vec<MetricRule>) -> Dispatcher<RecordingTransport> {
        let mut rule_set = RuleSet::new();
        rule_set.insert(event, rules);
        Dispatcher::with_rules(rule_set, RecordingTransport::default())
    }

    fn t(template: &str) -> Template {
        Template::parse(template)
    }

    /// An event with accessor-style methods, such as a typed application event.
    struct OrderCreated {
        quantity: u32,
    }

    impl Getter for OrderCreated {
        fn get_value(&self, path: &str) -> Option<Val<'_>> {
            match path {
                "getValue" => Some(self.quantity.into()),
                _ => None,
            }
        }
    }

    impl Event for OrderCreated {
        fn name(&self) -> &str {
            "order.created"
        }
    }

    #[test]
    fn test_unregistered_event_is_ignored() {
        tally_log::init_test!();

        let mut dispatcher = dispatcher("order.created", vec![MetricRule::Increment(t("a"))]);
        let event = JsonEvent::new("order.deleted", json!({}));

        dispatcher.handle_event(&event).unwrap();
        assert!(dispatcher.transport().calls.is_empty());
    }

    #[test]
    fn test_count_from_accessor() {
        let mut dispatcher = dispatcher("order.created", vec![MetricRule::Count(t("orders.count"))]);

        dispatcher
            .handle_event(&OrderCreated { quantity: 1 })
            .unwrap();

        assert_eq!(
            dispatcher.transport().calls,
            [Call::Count("orders.count".to_owned(), 1.0)]
        );
    }

    #[test]
    fn test_timing_with_immediate_send() {
        let mut dispatcher = dispatcher(
            "request.completed",
            vec![
                MetricRule::Timing(t("http.<route>.time")),
                MetricRule::ImmediateSend(true),
            ],
        );

        let event = JsonEvent::new(
            "request.completed",
            json!({"timing": 120, "route": "checkout"}),
        );
        dispatcher.handle_event(&event).unwrap();

        assert_eq!(
            dispatcher.transport().calls,
            [
                Call::Timing("http.checkout.time".to_owned(), 120),
                Call::Flush,
            ]
        );
    }

    #[test]
    fn test_non_positive_timing_is_skipped() {
        let mut dispatcher = dispatcher(
            "request.completed",
            vec![
                MetricRule::Timing(t("http.time")),
                MetricRule::CustomTiming {
                    template: t("db.time"),
                    accessor: "getDbTime".to_owned(),
                },
            ],
        );

        for (timing, db_time) in [(0, -5), (-1, 0)] {
            let event = JsonEvent::new(
                "request.completed",
                json!({"timing": timing, "db_time": db_time}),
            );
            dispatcher.handle_event(&event).unwrap();
        }
        assert!(dispatcher.transport().calls.is_empty());

        let event = JsonEvent::new("request.completed", json!({"timing": 0.6, "db_time": 7}));
        dispatcher.handle_event(&event).unwrap();
        assert_eq!(
            dispatcher.transport().calls,
            [
                Call::Timing("http.time".to_owned(), 1),
                Call::Timing("db.time".to_owned(), 7),
            ]
        );
    }

    #[test]
    fn test_immediate_send_applies_after_all_rules() {
        let mut dispatcher = dispatcher(
            "user.login",
            vec![
                MetricRule::Increment(t("a")),
                MetricRule::ImmediateSend(true),
                MetricRule::Increment(t("b")),
            ],
        );

        dispatcher
            .handle_event(&JsonEvent::new("user.login", json!({})))
            .unwrap();

        assert_eq!(
            dispatcher.transport().calls,
            [
                Call::Increment("a".to_owned()),
                Call::Increment("b".to_owned()),
                Call::Flush,
            ]
        );
    }

    #[test]
    fn test_immediate_send_last_declaration_wins() {
        let mut dispatcher = dispatcher(
            "user.login",
            vec![
                MetricRule::ImmediateSend(true),
                MetricRule::Increment(t("a")),
                MetricRule::ImmediateSend(false),
            ],
        );

        dispatcher
            .handle_event(&JsonEvent::new("user.login", json!({})))
            .unwrap();

        assert_eq!(
            dispatcher.transport().calls,
            [Call::Increment("a".to_owned())]
        );
    }

    #[test]
    fn test_gauge_and_set() {
        let mut dispatcher = dispatcher(
            "cart.updated",
            vec![
                MetricRule::Gauge(t("cart.total")),
                MetricRule::Set(t("cart.unique")),
            ],
        );

        let event = JsonEvent::new("cart.updated", json!({"value": "12"}));
        dispatcher.handle_event(&event).unwrap();

        assert_eq!(
            dispatcher.transport().calls,
            [
                Call::Gauge("cart.total".to_owned(), 12.0),
                Call::Set("cart.unique".to_owned(), "12".to_owned()),
            ]
        );
    }

    #[test]
    fn test_set_with_string_member() {
        let mut dispatcher = dispatcher("user.seen", vec![MetricRule::Set(t("users.unique"))]);

        for value in [json!("user-abc"), json!(42), json!(1.5)] {
            let event = JsonEvent::new("user.seen", json!({ "value": value }));
            dispatcher.handle_event(&event).unwrap();
        }

        assert_eq!(
            dispatcher.transport().calls,
            [
                Call::Set("users.unique".to_owned(), "user-abc".to_owned()),
                Call::Set("users.unique".to_owned(), "42".to_owned()),
                Call::Set("users.unique".to_owned(), "1.5".to_owned()),
            ]
        );
    }

    #[test]
    fn test_set_rejects_boolean() {
        let mut dispatcher = dispatcher("user.seen", vec![MetricRule::Set(t("users.unique"))]);

        let event = JsonEvent::new("user.seen", json!({"value": true}));
        let error = dispatcher.handle_event(&event).unwrap_err();

        assert_eq!(
            error.to_string(),
            "the value of getValue on event user.seen is boolean, expected a string or number"
        );
        assert!(dispatcher.transport().calls.is_empty());
    }

    #[test]
    fn test_count_with_fractional_value() {
        let mut dispatcher = dispatcher("user.seen", vec![MetricRule::Count(t("bytes"))]);

        let event = JsonEvent::new("user.seen", json!({"value": 2.5}));
        dispatcher.handle_event(&event).unwrap();

        assert_eq!(
            dispatcher.transport().calls,
            [Call::Count("bytes".to_owned(), 2.5)]
        );
    }

    #[test]
    fn test_count_rejects_non_numeric_value() {
        let mut dispatcher = dispatcher("user.seen", vec![MetricRule::Count(t("bytes"))]);

        let event = JsonEvent::new("user.seen", json!({"value": "many"}));
        let error = dispatcher.handle_event(&event).unwrap_err();

        assert!(matches!(
            error,
            DispatchError::InvalidValue {
                expected: "a number",
                found: "string",
                ..
            }
        ));
        assert!(dispatcher.transport().calls.is_empty());
    }

    #[test]
    fn test_missing_accessor_keeps_earlier_metrics() {
        let mut dispatcher = dispatcher(
            "order.created",
            vec![
                MetricRule::Increment(t("orders.created")),
                MetricRule::Count(t("orders.count")),
                MetricRule::Increment(t("orders.after")),
                MetricRule::ImmediateSend(true),
            ],
        );

        let event = JsonEvent::new("order.created", json!({}));
        let error = dispatcher.handle_event(&event).unwrap_err();

        match error {
            DispatchError::MissingAccessor {
                event,
                event_type,
                path,
            } => {
                assert_eq!(event, "order.created");
                assert_eq!(event_type, std::any::type_name::<JsonEvent>());
                assert_eq!(path, "getValue");
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(
            dispatcher.transport().calls,
            [Call::Increment("orders.created".to_owned())]
        );
    }

    #[test]
    fn test_missing_placeholder() {
        let mut dispatcher = dispatcher("user.login", vec![MetricRule::Increment(t("app.<user.id>"))]);

        let event = JsonEvent::new("user.login", json!({"user": {}}));
        let error = dispatcher.handle_event(&event).unwrap_err();

        assert_eq!(
            error.to_string(),
            format!(
                "the event class {} (user.login) must have a user.id method or field",
                std::any::type_name::<JsonEvent>()
            )
        );
    }

    #[test]
    fn test_value_acquired_before_template() {
        let mut dispatcher = dispatcher("user.login", vec![MetricRule::Count(t("app.<missing>"))]);

        let event = JsonEvent::new("user.login", json!({}));
        let error = dispatcher.handle_event(&event).unwrap_err();

        assert!(matches!(
            error,
            DispatchError::MissingAccessor { ref path, .. } if path == VALUE_ACCESSOR
        ));
    }

    #[test]
    fn test_transport_error_aborts() {
        let mut dispatcher = dispatcher(
            "user.login",
            vec![MetricRule::Increment(t("a")), MetricRule::Increment(t("b"))],
        );
        dispatcher.transport.fail = true;

        let error = dispatcher
            .handle_event(&JsonEvent::new("user.login", json!({})))
            .unwrap_err();

        assert!(matches!(error, DispatchError::Transport(_)));
        assert_eq!(dispatcher.transport().calls, [Call::Increment("a".to_owned())]);
    }

    #[test]
    fn test_registration_through_dispatcher() {
        let mut dispatcher = Dispatcher::new(RecordingTransport::default());
        let rules: RawRules =
            serde_json::from_str(r#"{"increment": "users.<action>", "immediate_send": true}"#)
                .unwrap();

        dispatcher.add_event_to_listen("user.login", &rules).unwrap();
        dispatcher
            .handle_event(&JsonEvent::new("user.login", json!({"action": "login"})))
            .unwrap();

        assert_eq!(
            dispatcher.into_transport().calls,
            [Call::Increment("users.login".to_owned()), Call::Flush]
        );
    }

    #[test]
    fn test_wire_output() {
        let (client, rx) = tally_statsd::MetricsClient::capturing("shop");
        let mut rule_set = RuleSet::new();
        rule_set.insert(
            "order.created",
            vec![
                MetricRule::Increment(t("orders.<status>")),
                MetricRule::Count(t("orders.items")),
            ],
        );
        let mut dispatcher = Dispatcher::with_rules(rule_set, client);

        let event = JsonEvent::new("order.created", json!({"status": "paid", "value": 3}));
        dispatcher.handle_event(&event).unwrap();

        let lines: Vec<_> = rx
            .try_iter()
            .map(|line| String::from_utf8(line).unwrap())
            .collect();
        assert_eq!(lines, ["shop.orders.paid:1|c", "shop.orders.items:3|c"]);
    }

    #[test]
    fn test_wire_output_for_sets_and_fractional_counts() {
        let (client, rx) = tally_statsd::MetricsClient::capturing("");
        let mut rule_set = RuleSet::new();
        rule_set.insert(
            "user.seen",
            vec![
                MetricRule::Set(t("users.unique")),
                MetricRule::Count(t("users.score")),
            ],
        );
        let mut dispatcher = Dispatcher::with_rules(rule_set, client);

        dispatcher
            .handle_event(&JsonEvent::new("user.seen", json!({"value": "2.5"})))
            .unwrap();

        let lines: Vec<_> = rx
            .try_iter()
            .map(|line| String::from_utf8(line).unwrap())
            .collect();
        assert_eq!(lines, ["users.unique:2.5|s", "users.score:2.5|c"]);
    }
}
