//! Application layer: payment orchestration and the event pipeline.
//!
//! `PaymentOrchestrator` drives payments through the gateway, `MessageBroker`
//! owns the broker connection, and `DlqManager` administers the dead-letter
//! queue. The resilience policies guard every remote call.

pub mod broker;
pub mod dlq;
pub mod orchestrator;
pub mod resilience;
