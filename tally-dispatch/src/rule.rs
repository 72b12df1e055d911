use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::template::Template;

/// The kind of a metric rule as it is written in configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RuleKind {
    /// `increment`
    Increment,
    /// `count`
    Count,
    /// `gauge`
    Gauge,
    /// `set`
    Set,
    /// `timing`
    Timing,
    /// `custom_timing`
    CustomTiming,
    /// `immediate_send`
    ImmediateSend,
}

impl RuleKind {
    /// All rule kinds in their canonical order.
    pub const ALL: [Self; 7] = [
        Self::Increment,
        Self::Count,
        Self::Gauge,
        Self::Set,
        Self::Timing,
        Self::CustomTiming,
        Self::ImmediateSend,
    ];

    /// Returns the configuration name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Increment => "increment",
            Self::Count => "count",
            Self::Gauge => "gauge",
            Self::Set => "set",
            Self::Timing => "timing",
            Self::CustomTiming => "custom_timing",
            Self::ImmediateSend => "immediate_send",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown [`RuleKind`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParseRuleKindError;

impl FromStr for RuleKind {
    type Err = ParseRuleKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or(ParseRuleKindError)
    }
}

/// A single instruction that turns an event into a metric, or modifies how metrics are sent.
///
/// Rules of one event run in declaration order.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricRule {
    /// Increments the counter by one.
    Increment(Template),
    /// Adds the event's value to the counter.
    Count(Template),
    /// Sets the gauge to the event's value.
    Gauge(Template),
    /// Adds the event's value to the set.
    Set(Template),
    /// Records the event's timing in milliseconds.
    Timing(Template),
    /// Records a timing read from a custom accessor.
    CustomTiming {
        /// The metric name.
        template: Template,
        /// The path of the accessor that provides the duration.
        accessor: String,
    },
    /// Flushes the transport after all rules of the event ran.
    ImmediateSend(bool),
}

impl MetricRule {
    /// Parses a rule from its kind and configuration parameters.
    ///
    /// `event` is used for error reporting only.
    pub fn parse(event: &str, kind: &str, params: &Value) -> Result<Self, ConfigurationError> {
        let kind = kind
            .parse::<RuleKind>()
            .map_err(|_| ConfigurationError::UnknownKind {
                event: event.to_owned(),
                kind: kind.to_owned(),
            })?;

        let invalid = |reason: &str| ConfigurationError::InvalidParams {
            event: event.to_owned(),
            kind,
            reason: reason.to_owned(),
        };

        let template = |value: Option<&Value>| match value {
            Some(Value::String(s)) if !s.is_empty() => Ok(Template::parse(s)),
            _ => Err(invalid("expected a non-empty metric name")),
        };

        Ok(match kind {
            RuleKind::Increment => Self::Increment(template(Some(params))?),
            RuleKind::Count => Self::Count(template(Some(params))?),
            RuleKind::Gauge => Self::Gauge(template(Some(params))?),
            RuleKind::Set => Self::Set(template(Some(params))?),
            RuleKind::Timing => Self::Timing(template(Some(params))?),
            RuleKind::CustomTiming => {
                let Value::Object(params) = params else {
                    return Err(invalid("expected a mapping with 'method' and 'node'"));
                };

                if let Some(key) = params
                    .keys()
                    .find(|key| !matches!(key.as_str(), "method" | "node" | "template"))
                {
                    return Err(invalid(&format!("unexpected key '{key}'")));
                }

                let accessor = match params.get("method") {
                    Some(Value::String(method)) if !method.is_empty() => method.clone(),
                    _ => return Err(invalid("expected a non-empty 'method'")),
                };

                let node = match (params.get("node"), params.get("template")) {
                    (Some(_), Some(_)) => {
                        return Err(invalid("'node' and 'template' are mutually exclusive"));
                    }
                    (node, alias) => node.or(alias),
                };

                Self::CustomTiming {
                    template: template(node)?,
                    accessor,
                }
            }
            RuleKind::ImmediateSend => match params {
                Value::Bool(flag) => Self::ImmediateSend(*flag),
                _ => return Err(invalid("expected a boolean")),
            },
        })
    }

    /// Returns the kind of this rule.
    pub fn kind(&self) -> RuleKind {
        match self {
            Self::Increment(_) => RuleKind::Increment,
            Self::Count(_) => RuleKind::Count,
            Self::Gauge(_) => RuleKind::Gauge,
            Self::Set(_) => RuleKind::Set,
            Self::Timing(_) => RuleKind::Timing,
            Self::CustomTiming { .. } => RuleKind::CustomTiming,
            Self::ImmediateSend(_) => RuleKind::ImmediateSend,
        }
    }

    /// Returns the configuration parameters of this rule.
    pub fn params(&self) -> Value {
        match self {
            Self::Increment(t) | Self::Count(t) | Self::Gauge(t) | Self::Set(t) | Self::Timing(t) => {
                Value::String(t.as_str().to_owned())
            }
            Self::CustomTiming { template, accessor } => serde_json::json!({
                "method": accessor,
                "node": template.as_str(),
            }),
            Self::ImmediateSend(flag) => Value::Bool(*flag),
        }
    }
}

/// Error returned when registering invalid metric rules.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    /// The rule kind is not one of the known [`RuleKind`]s.
    #[error("the metric kind '{kind}' used by event '{event}' is not allowed")]
    UnknownKind {
        /// The event the rule was registered for.
        event: String,
        /// The unknown kind.
        kind: String,
    },

    /// The parameters of a rule have the wrong shape.
    #[error("invalid parameters for '{kind}' on event '{event}': {reason}")]
    InvalidParams {
        /// The event the rule was registered for.
        event: String,
        /// The kind of the rule.
        kind: RuleKind,
        /// Describes the expected parameters.
        reason: String,
    },
}

/// Unvalidated rules of one event as `(kind, params)` pairs in declaration order.
///
/// Deserializes from a mapping of kinds to parameters:
///
/// ```yaml
/// timing: http.<route>.time
/// immediate_send: true
/// ```
///
/// or from a sequence of single-entry mappings, which allows repeating a kind:
///
/// ```yaml
/// - increment: orders.created
/// - increment: orders.<status>
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawRules(Vec<(String, Value)>);

impl RawRules {
    /// Creates an empty list of rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rule.
    pub fn push(&mut self, kind: impl Into<String>, params: Value) {
        self.0.push((kind.into(), params));
    }

    /// Returns the number of rules.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no rules.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(kind, params)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(kind, params)| (kind.as_str(), params))
    }

    /// Validates all rules.
    pub fn parse(&self, event: &str) -> Result<Vec<MetricRule>, ConfigurationError> {
        self.iter()
            .map(|(kind, params)| MetricRule::parse(event, kind, params))
            .collect()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for RawRules {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(kind, params)| (kind.into(), params))
                .collect(),
        )
    }
}

impl From<&[MetricRule]> for RawRules {
    fn from(rules: &[MetricRule]) -> Self {
        rules
            .iter()
            .map(|rule| (rule.kind().as_str(), rule.params()))
            .collect()
    }
}

impl Serialize for RawRules {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut kinds = HashSet::new();
        let unique = self.0.iter().all(|(kind, _)| kinds.insert(kind));

        if unique {
            let mut map = serializer.serialize_map(Some(self.0.len()))?;
            for (kind, params) in &self.0 {
                map.serialize_entry(kind, params)?;
            }
            map.end()
        } else {
            let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
            for (kind, params) in &self.0 {
                seq.serialize_element(&BTreeMap::from([(kind, params)]))?;
            }
            seq.end()
        }
    }
}

struct SingleEntry(String, Value);

impl<'de> Deserialize<'de> for SingleEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SingleEntryVisitor;

        impl<'de> Visitor<'de> for SingleEntryVisitor {
            type Value = SingleEntry;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a mapping with a single metric rule")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let Some((kind, params)) = map.next_entry::<String, Value>()? else {
                    return Err(de::Error::invalid_length(0, &self));
                };

                if map.next_key::<de::IgnoredAny>()?.is_some() {
                    return Err(de::Error::invalid_length(2, &self));
                }

                Ok(SingleEntry(kind, params))
            }
        }

        deserializer.deserialize_map(SingleEntryVisitor)
    }
}

impl<'de> Deserialize<'de> for RawRules {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RawRulesVisitor;

        impl<'de> Visitor<'de> for RawRulesVisitor {
            type Value = RawRules;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a mapping or sequence of metric rules")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(RawRules::new())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut rules = RawRules::new();
                while let Some((kind, params)) = map.next_entry::<String, Value>()? {
                    rules.push(kind, params);
                }
                Ok(rules)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut rules = RawRules::new();
                while let Some(SingleEntry(kind, params)) = seq.next_element()? {
                    rules.push(kind, params);
                }
                Ok(rules)
            }
        }

        deserializer.deserialize_any(RawRulesVisitor)
    }
}

/// Metric rules by event name.
///
/// Registering rules for an event replaces its previous rules.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleSet {
    events: BTreeMap<String, Vec<MetricRule>>,
}

impl RuleSet {
    /// Creates an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers the rules of an event.
    ///
    /// If any rule is invalid, nothing is registered and the previous rules of the event are kept.
    ///
    /// # Example
    ///
    /// ```
    /// use serde_json::json;
    /// use tally_dispatch::{RawRules, RuleSet};
    ///
    /// let rules: RawRules = serde_json::from_value(json!({
    ///     "count": "orders.count",
    ///     "immediate_send": true,
    /// }))
    /// .unwrap();
    ///
    /// let mut rule_set = RuleSet::new();
    /// rule_set.add_event_to_listen("order.created", &rules).unwrap();
    /// assert_eq!(rule_set.get("order.created").map(<[_]>::len), Some(2));
    /// ```
    pub fn add_event_to_listen(
        &mut self,
        event: &str,
        rules: &RawRules,
    ) -> Result<(), ConfigurationError> {
        let rules = rules.parse(event)?;
        self.insert(event, rules);
        Ok(())
    }

    /// Registers already validated rules of an event.
    pub fn insert(&mut self, event: impl Into<String>, rules: Vec<MetricRule>) {
        self.events.insert(event.into(), rules);
    }

    /// Returns the rules registered for an event.
    pub fn get(&self, event: &str) -> Option<&[MetricRule]> {
        self.events.get(event).map(Vec::as_slice)
    }

    /// Returns the number of events with registered rules.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` if no event has rules.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns the names of all events with registered rules in lexicographic order.
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }

    /// Iterates over all events and their rules.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[MetricRule])> {
        self.events
            .iter()
            .map(|(event, rules)| (event.as_str(), rules.as_slice()))
    }
}
