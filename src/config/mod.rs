//! Configuration
//!
//! Shared types, config loading, and startup validation.

pub mod config;
pub mod types;
pub mod validator;
