//! Local listeners.
//!
//! One listener per enabled forwarding rule; each accepted connection gets
//! its own relay task.

mod listener;

pub use listener::ForwardListener;
