/// Error types for each stage of the gateway pipeline
use std::num::ParseIntError;
use std::time::Duration;

use thiserror::Error;

/// Failure to obtain one well-formed line from the serial device
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial channel closed")]
    Closed,

    #[error("no frame received within {0:?}")]
    Timeout(Duration),

    #[error("unexpected frame length: {actual} bytes (expected {expected})")]
    FrameLength { actual: usize, expected: usize },

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed decoder input
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too short: {actual} bytes (need at least {required})")]
    TooShort { actual: usize, required: usize },

    #[error("byte {index} could not be reparsed from hex: {source}")]
    HexDigit {
        index: usize,
        #[source]
        source: ParseIntError,
    },
}

/// Channel table refers to bytes outside the decoded frame
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("channel '{channel}' refers to byte {index} but frame has {len} bytes")]
    IndexOutOfRange {
        channel: &'static str,
        index: usize,
        len: usize,
    },
}

/// Failure to hand one message to the telemetry sink
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("publish to '{topic}' rejected: {reason}")]
    Rejected { topic: String, reason: String },

    #[error("could not encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure to append to the durable log
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log write error: {0}")]
    Csv(#[from] csv::Error),
}

/// Invalid or missing configuration value
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Conditions that stop the pipeline loop
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("channel table misconfigured: {0}")]
    Configuration(#[from] ResolveError),

    #[error("giving up after {failures} consecutive storage failures: {source}")]
    Storage {
        failures: u32,
        #[source]
        source: StorageError,
    },
}
