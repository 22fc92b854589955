//! Scanner agent drivers and daemon wiring for scanhive
//!
//! The orchestration library defines the pipeline; this crate supplies the
//! pieces a deployment configures: external-command agent drivers speaking
//! the canonical findings JSON, runtime configuration, and the assembly of
//! registry + queue + dispatcher the binary runs.

pub mod config;
pub mod drivers;
pub mod runtime;
