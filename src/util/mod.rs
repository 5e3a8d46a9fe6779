//! Utility functions and helpers.

mod logging;
mod session_id;
mod shutdown;

pub use logging::init_logging;
pub use session_id::{generate_session_id, SessionId};
pub use shutdown::{wait_for_signal, ShutdownSignal};
