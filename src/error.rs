//! Error types for the admission gate.
//!
//! Rejected connections are not errors; they are reported through
//! [`Admission`](crate::admission::Admission).

use crate::config::ConfigError;
use std::io;
use thiserror::Error;

/// Errors that can occur while running the gate.
#[derive(Error, Debug)]
pub enum GateError {
    /// Failed to bind to the listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    AcceptConnection(#[source] io::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for gate operations.
pub type Result<T> = std::result::Result<T, GateError>;
