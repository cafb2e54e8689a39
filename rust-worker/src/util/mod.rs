//! Utility modules.

pub mod shutdown;
pub mod time;

pub use shutdown::{shutdown_channel, shutdown_signal};
