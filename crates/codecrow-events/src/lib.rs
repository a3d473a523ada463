//! Codecrow Events - Correlated in-process event bus
//!
//! Domain events (analysis lifecycle, indexing lifecycle, project
//! lifecycle, notification) travel in a single [`EventEnvelope`] tagged
//! with a correlation id, so a health-check failure, the re-index it
//! triggers, and the notification it produces can all be traced back to
//! one originating cause from logged events alone.
//!
//! # Modules
//!
//! - [`envelope`] - The event envelope, kinds, and payload variants
//! - [`bus`] - Publish/subscribe with subscriber isolation

#![warn(missing_docs)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod bus;
pub mod envelope;

pub use bus::*;
pub use envelope::*;
