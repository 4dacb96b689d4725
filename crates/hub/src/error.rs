//! Error taxonomy shared by the ingestion pipeline, the command dispatcher
//! and the history store.

use thiserror::Error;

/// Why an inbound telemetry message was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("payload is not valid json: {0}")]
    Malformed(String),
    #[error("payload is not a json object")]
    NotAnObject,
    #[error("missing required field '{0}'")]
    Missing(&'static str),
    #[error("field '{0}' is not numeric")]
    NotNumeric(&'static str),
    #[error("field '{0}' is not a recognised boolean")]
    NotBoolean(&'static str),
    #[error("field '{field}' value {value} out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Failure of an operator command.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("invalid action '{0}' (use ON/OFF/AUTO)")]
    InvalidAction(String),
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
}

/// Failure talking to the history store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out after {0} ms")]
    Timeout(u64),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Failure fanning an event out to live viewers.
#[derive(Debug, Error)]
#[error("broadcast failed: {0}")]
pub struct BroadcastError(pub String);
