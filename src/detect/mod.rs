//! Fast-path error detection
//!
//! - [`lexer`]: lenient Python tokenizer
//! - [`detector`]: structural syntax errors with exact positions
//! - [`signature`]: deterministic error signatures used as cache keys

pub mod detector;
pub mod lexer;
pub mod signature;

pub use detector::detect;
pub use signature::derive_signature;
