//! Codecrow Protocol - Shared domain models
//!
//! This crate is the single source of truth for the domain types shared
//! across the orchestration engine: VCS connection configurations, branch
//! health records, RAG index status records, issues and their summaries.
//!
//! # Modules
//!
//! - [`models`] - Core domain models for branch health, indexing, and issues

#![warn(missing_docs)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod models;

pub use models::*;
