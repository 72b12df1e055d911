//! Configuration for the Tally CLI.
//!
//! The configuration lives in a `config.yml` inside a config folder (`.tally` by default):
//!
//! ```yaml
//! logging:
//!   level: info
//! metrics:
//!   prefix: shop
//!   default_tags:
//!     env: prod
//! servers:
//!   local:
//!     address: 127.0.0.1
//!     port: 8125
//! clients:
//!   default:
//!     servers: [all]
//!     events:
//!       order.created:
//!         count: orders.count
//! ```
//!
//! Each client selects its servers by name, by glob pattern, or with `all`, and declares metric
//! rules per event. Servers and rules are resolved and validated when the configuration is loaded,
//! so an invalid configuration never reaches dispatch.

#![warn(missing_docs)]

mod config;

pub use self::config::*;
