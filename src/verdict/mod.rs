//! Outcome classification
//!
//! Derives the outcome class and learner-facing errors from a finished
//! boundary run.

pub mod classifier;

pub use classifier::{Classification, VerdictCause, VerdictClassifier};
