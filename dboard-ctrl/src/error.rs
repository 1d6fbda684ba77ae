//! Common error types for dboard-ctrl.
//!
//! This module provides a centralized Error enum using thiserror for the
//! daemon and tooling plumbing around the control contract. Errors raised by
//! contract operations themselves live in [`crate::hw_trait::Error`].

use thiserror::Error;

/// Main error type for dboard-ctrl plumbing.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors surfaced by a contract operation
    #[error("Hardware error: {0}")]
    Hardware(#[from] crate::hw_trait::Error),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
