//! Adapters for the domain ports.

pub mod connector;
pub mod in_memory;
pub mod in_memory_broker;
pub mod nats_broker;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
