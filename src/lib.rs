//! Conductor
//!
//! A graph + runtime engine that drives a multi-turn AI conversation through
//! retrieval, direct response, tool-augmented response, and iterative
//! plan/execute/replan cycles, paired with a durable, versioned checkpoint
//! store so a run can suspend and resume across failure-prone execution
//! boundaries.

pub mod checkpoint;
pub mod engine;
