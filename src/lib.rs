//! portfwd - TCP port-forwarding relay
//!
//! Listens on local ports and relays every accepted connection to a remote
//! `host:port`, directly or through an HTTP CONNECT proxy:
//! - One listener per enabled forwarding rule
//! - One relay task per accepted connection, ended by the first direction to finish
//! - Optional per-rule admission limit
//! - Prometheus metrics

pub mod config;
pub mod frontend;
pub mod metrics;
pub mod proxy;
pub mod scheduler;
pub mod util;

pub use config::{Config, ForwardRule};
pub use scheduler::{RuleScheduler, RunningForwards};
