//! Execution control
//!
//! Child-side isolation applied between fork and exec, and host capability probes.

pub mod preexec;
