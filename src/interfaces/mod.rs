//! Operator-facing surfaces: the admin CLI, its audit log and report writers.

pub mod audit;
pub mod cli;
pub mod csv;
