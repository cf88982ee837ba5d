//! Shared helpers for the integration test binaries.

pub mod range_server;
pub mod socket_guard;
