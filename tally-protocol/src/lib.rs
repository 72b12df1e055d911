//! Events, values and path-based field access.
//!
//! Metric rules refer to data inside events by string paths such as `user.id` or
//! `items[0].price`. This crate defines the capability an event type implements to answer such
//! lookups ([`Getter`]), the borrowed scalar that a lookup returns ([`Val`]), and the resolution
//! algorithm that walks nested structures ([`resolve`]).
//!
//! Events are identified by name through the [`Event`] trait. For dynamically shaped payloads,
//! [`JsonEvent`] wraps an arbitrary JSON document.

#![warn(missing_docs)]

mod json;
mod path;
mod traits;
mod value;

pub use self::json::*;
pub use self::path::*;
pub use self::traits::*;
pub use self::value::*;
