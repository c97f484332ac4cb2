//! Host-facing command contract and transports for the application shell.

pub mod channel;
pub mod contract;
pub mod stdio;
