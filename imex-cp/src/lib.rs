//! imex-cp (Cohort Packager) - Extraction job completion tracking
//!
//! Consumes extraction-request announcements and per-file status reports
//! into a persistent job store, and runs the job watcher that decides when
//! an extraction job has finished, drives its terminal transition, and
//! notifies completion.

pub mod config;
pub mod consumers;
pub mod error;
pub mod jobs;

pub use error::{Error, Result};
