//! Domain types and the ports the application layer talks through.
//!
//! Nothing here performs I/O; adapters live in `infrastructure`.

pub mod gateway;
pub mod message;
pub mod payment;
pub mod ports;
