//! Codecrow Engine - Branch health and incremental-indexing orchestration
//!
//! The engine decides, per project/branch, whether the next analysis
//! pass is a full scan or a delta scan, degrades and recovers branch
//! health from analysis outcomes, keeps the per-project RAG index status
//! honest (including the incremental-failure escalation to full
//! rebuilds), and publishes correlation-tagged events at every
//! transition so downstream consumers can react without coupling.
//!
//! The engine is built once at process start from ordinary constructor
//! parameters; every external concern (the actual scan, the actual index
//! build, durable storage, the freshness signal) arrives as a trait
//! object from `codecrow-core`.

#![warn(missing_docs)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod engine;

pub use engine::*;
