//! Error handling for Cutover
//!
//! Every error maps onto one of four operator-facing categories:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │  Validation          │ precondition unmet, nothing was touched │
//! │  TransientPlatform   │ timeout / unreachable, retry is safe    │
//! │  Conflict            │ job already active, account mismatch    │
//! │  Irrecoverable       │ platform state unexpected after commit; │
//! │                      │ carries every created id for recovery   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! `NotFound` and `Internal` are reported separately and never retried.

pub mod constructors;
pub mod conversions;
pub mod types;

pub use types::{CreatedResources, CutoverError, CutoverResult, ErrorCategory, Result};

#[cfg(test)]
mod tests;
