//! Error types for the Kite client.
//!
//! One enum covers every kind the client surfaces: transport faults,
//! protocol faults, lifecycle transitions, authentication failures, and the
//! caller-facing kinds the producer and consumer surfaces reuse. Callers
//! compare by variant; whether an error is worth retrying or skipping is
//! decided by the predicates in [`crate::classify`], never by string
//! matching.

use std::io;

use thiserror::Error;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The network operation a transport error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetOp {
    /// Resolving and connecting to the broker.
    Dial,
    /// Reading from an established connection.
    Read,
    /// Writing to an established connection.
    Write,
}

impl std::fmt::Display for NetOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dial => write!(f, "dial"),
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Errors that can occur in client operations.
#[derive(Debug, Error)]
pub enum Error {
    // Transport.
    /// A network operation against the broker failed.
    #[error("{op} failed: {source}")]
    Network {
        /// Which operation failed.
        op: NetOp,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The broker dropped the connection: end of stream or reset while a
    /// reply was still owed.
    #[error("network connection closed unexpectedly")]
    ConnectionClosed,

    // Protocol.
    /// The broker replied with a correlation ID no in-flight request owns.
    /// Terminal for the connection: the stream is desynchronized.
    #[error("correlation ID mismatch: broker replied to {observed} with nothing in flight")]
    CorrelationMismatch {
        /// The correlation ID observed on the wire.
        observed: i32,
    },

    /// The request key is outside what this client's codec knows.
    #[error("request key {key} is unknown")]
    UnknownRequestKey {
        /// The offending key.
        key: i16,
    },

    /// The broker has already indicated (via ApiVersions) that it cannot
    /// handle this request.
    #[error("broker is too old: it cannot handle key {key} v{version}")]
    BrokerTooOld {
        /// Request key.
        key: i16,
        /// Requested version.
        version: i16,
    },

    /// The broker answered a request with a protocol-level error code.
    #[error("broker rejected {context} with error code {code}")]
    ErrorCode {
        /// Numeric Kafka error code.
        code: i16,
        /// Which exchange was rejected.
        context: &'static str,
    },

    /// Error decoding a protocol message.
    #[error("protocol decode error: {message}")]
    Decode {
        /// What went wrong.
        message: String,
    },

    /// Error encoding a protocol message.
    #[error("protocol encode error: {message}")]
    Encode {
        /// What went wrong.
        message: String,
    },

    // Lifecycle.
    /// The client's close function has been called.
    #[error("client closed")]
    ClientClosed,

    /// The broker chosen for this request was removed by a concurrent
    /// metadata update. Retriable: refresh metadata and pick again.
    #[error("the broker chosen for this request has died: its ID is migrating or no longer exists")]
    ChosenBrokerDead,

    /// A request was issued to a broker the client does not know about.
    #[error("unknown broker")]
    UnknownBroker,

    /// Invalid client configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] kite_core::Error),

    // Auth.
    /// The SASL exchange itself failed.
    #[error("SASL {mechanism} authentication failed: {message}")]
    Authentication {
        /// Mechanism name.
        mechanism: String,
        /// Broker- or mechanism-supplied detail.
        message: String,
    },

    /// The broker repeatedly granted SASL session lifetimes too short to
    /// write a request, so the connection killed itself.
    #[error("the broker is repeatedly granting SASL session lifetimes too short to make progress")]
    SaslReauthLoop,

    // Caller.
    /// The per-request deadline fired before the reply arrived.
    #[error("request timed out after {waited_ms}ms")]
    RequestTimeout {
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The caller abandoned the request.
    #[error("request cancelled")]
    Cancelled,

    /// The correlation ID counter wrapped all the way around onto an ID
    /// that is still in flight.
    #[error("correlation IDs wrapped around onto one still in flight")]
    CorrelationIdExhausted,

    /// The maximum amount of requests or records are buffered, and nothing
    /// more can be accepted.
    #[error("the maximum amount of requests are buffered, cannot buffer more")]
    MaxBuffered,

    /// A producer ID could not be initialized after request failures.
    #[error("unable to initialize a producer ID due to request failures")]
    ProducerIdLoadFail,

    /// A buffered record's topic was purged before the record was written.
    #[error("topic purged while buffered")]
    Purged,

    /// A record failed after exhausting its retry budget.
    #[error("record failed after being retried too many times")]
    RecordRetries,

    /// Records timed out before they could be produced.
    #[error("records timed out before they were able to be produced")]
    RecordTimeout,

    /// The consumer detected data loss and reset to the last valid offset.
    #[error(
        "topic {topic} partition {partition} lost records: consumed to offset \
         {consumed_to} but was reset to offset {reset_to}"
    )]
    DataLoss {
        /// Topic data loss was detected on.
        topic: String,
        /// Partition data loss was detected on.
        partition: i32,
        /// What had been consumed before loss was detected.
        consumed_to: i64,
        /// The offset the client reset to; everything between was lost.
        reset_to: i64,
    },
}

impl Error {
    /// Create a decode error from any displayable error.
    pub fn decode<E: std::fmt::Display>(err: E) -> Self {
        Self::Decode {
            message: err.to_string(),
        }
    }

    /// Create an encode error from any displayable error.
    pub fn encode<E: std::fmt::Display>(err: E) -> Self {
        Self::Encode {
            message: err.to_string(),
        }
    }

    /// True if `other` is the same kind of error, ignoring payloads.
    #[must_use]
    pub fn same_kind(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}
