//! Error types for llmhost
//!
//! This module defines all error types used throughout the crate,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for llmhost operations
///
/// This enum encompasses all possible errors that can occur while
/// acquiring and supervising inference engines, talking to them over
/// either wire protocol, scheduling requests and persisting memory.
#[derive(Error, Debug)]
pub enum LlmHostError {
    /// Configuration-related errors (never retried)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The requested model does not match any configured known model
    #[error("Unknown model {0:?}, add it to the known_llms section first")]
    UnknownModel(String),

    /// The model identifier lacks a recognized quantization suffix
    #[error("Quantization suffix error: {0}")]
    QuantizationSuffix(String),

    /// Engine binary or model file could not be obtained
    #[error("Acquisition error: {0}")]
    Acquisition(String),

    /// The engine failed to become ready
    #[error("Startup error: {0}")]
    Startup(String),

    /// The engine process exited on its own
    #[error("Process exited unexpectedly: {0}")]
    ProcessExited(String),

    /// Wire protocol violation or failed request; does not kill the session
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Message roles are in an order the native prompt encoding rejects
    #[error("Invalid prompt sequence: {0}")]
    InvalidPromptSequence(String),

    /// Conversation memory load/save errors
    #[error("Memory error: {0}")]
    Memory(String),

    /// The operation observed cancellation
    #[error("Operation cancelled")]
    Cancelled,

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for llmhost operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
