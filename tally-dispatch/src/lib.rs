//! The event dispatch engine of Tally.
//!
//! Applications describe which metrics an event produces with a list of rules per event name:
//!
//! ```yaml
//! order.created:
//!   increment: orders.<status>
//!   count: orders.items
//! request.completed:
//!   timing: http.<route>.time
//!   immediate_send: true
//! ```
//!
//! Rules are validated into a [`RuleSet`] when they are registered. A [`Dispatcher`] owns a rule
//! set and a [`MetricsTransport`](tally_statsd::MetricsTransport). For every event, it looks up the
//! rules by the event's name and runs them in order:
//!
//!  - metric names are [`Template`]s whose `<path>` placeholders are filled from the event,
//!  - `count`, `gauge` and `set` read their value from the [`VALUE_ACCESSOR`],
//!  - `timing` reads a duration in milliseconds from the [`TIMING_ACCESSOR`] and only emits
//!    positive durations,
//!  - `immediate_send` flushes the transport once all rules ran.
//!
//! A [`Router`] fans events out to several independently configured dispatchers.

#![warn(missing_docs)]

mod dispatcher;
mod router;
mod rule;
mod template;

#[cfg(test)]
mod testutils;

pub use self::dispatcher::*;
pub use self::router::*;
pub use self::rule::*;
pub use self::template::*;
