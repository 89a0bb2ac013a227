use std::io;

use thiserror::Error;

/// Rejected settings. Returned synchronously by the configuration calls; the
/// collector keeps its previous settings.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("{name} must be between 0 and 1 (got {value})")]
    RateOutOfRange { name: &'static str, value: f64 },
    #[error("unrecognised backtrace method {0:?} (expected one of: fast, slow)")]
    UnknownBacktraceMethod(String),
}

/// Failure while turning collected samples into a compressed pprof profile.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("failed to encode pprof protobuf: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("failed to gzip pprof protobuf: {0}")]
    Compress(#[from] io::Error),
    #[error("non-interned string {value:?} passed for {field}")]
    NonInternedString { field: &'static str, value: String },
}

/// An error raised by the host runtime while the collector was calling into it
/// (e.g. an exception thrown while walking the stack).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("host runtime error: {message}")]
pub struct HostError {
    pub message: String,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    Host(#[from] HostError),
}
