//! Error taxonomy shared across the transport, diagnostic, monitor and config layers.

use thiserror::Error;

/// Failure of the raw CAN frame transport (SocketCAN socket, loopback double, ...).
#[derive(Debug, Error)]
pub enum IoError {
    /// The underlying OS call failed.
    #[error("CAN I/O error: {0}")]
    Os(#[from] std::io::Error),
    /// The bus reported a bus-off condition.
    #[error("CAN bus is off")]
    BusOff,
    /// The interface is not open.
    #[error("CAN interface not open")]
    NotOpen,
}

/// Failure during ISO-TP segmentation, reassembly or flow control.
#[derive(Debug, Error)]
pub enum IsoTpError {
    /// No flow-control frame was received at all before the deadline.
    #[error("no flow control frame received")]
    NoFlowControl,
    /// The peer responded with flow status OVERFLOW.
    #[error("peer flow control reported overflow")]
    FlowControlOverflow,
    /// A flow-control WAIT state was never resolved before the deadline.
    #[error("flow control wait timed out")]
    FlowControlTimeout,
    /// A consecutive frame arrived with the wrong sequence number.
    #[error("consecutive frame sequence mismatch: expected {expected}, got {got}")]
    SequenceMismatch {
        /// Sequence number the session expected next.
        expected: u8,
        /// Sequence number actually observed.
        got: u8,
    },
    /// An incoming First Frame declared a length larger than `max_rx_size`.
    #[error("incoming payload ({declared} bytes) exceeds configured maximum ({limit} bytes)")]
    Overflow {
        /// Length declared by the peer's First Frame.
        declared: usize,
        /// Configured ceiling.
        limit: usize,
    },
    /// The overall deadline for the operation elapsed.
    #[error("ISO-TP operation timed out")]
    Timeout,
    /// A fresh Single Frame or First Frame arrived while a multi-frame reassembly was still in
    /// progress, aborting it.
    #[error("reassembly aborted by a new incoming message")]
    Aborted,
    /// Underlying frame I/O failed.
    #[error(transparent)]
    Io(#[from] IoError),
}

/// Failure decoding a raw CAN payload against a signal database.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// No entry in the database matches the given arbitration ID.
    #[error("no signal definition for CAN ID 0x{0:X}")]
    NotFound(u32),
    /// The entry was found but the payload bytes could not be parsed.
    #[error("failed to parse payload for CAN ID 0x{id:X}: {reason}")]
    ParseError {
        /// The offending arbitration ID.
        id: u32,
        /// Human-readable parse failure reason.
        reason: String,
    },
}

/// Failure of an outbound transport attempt (after retries are exhausted).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport-specific send attempt failed.
    #[error("transport send failed: {0}")]
    SendFailed(String),
    /// All configured retries were exhausted.
    #[error("transport send failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last error observed.
        source: String,
    },
}

/// Failure loading or validating a JSON configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read from disk.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was attempted.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file content was not valid JSON, or did not match the expected schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    /// A value was present but semantically invalid (e.g. block_size out of range).
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Top-level error for a UDS diagnostic call.
#[derive(Debug, Error)]
pub enum DiagError {
    /// Underlying ISO-TP transport error.
    #[error(transparent)]
    IsoTp(#[from] IsoTpError),
    /// The ECU replied with a negative response (SID 0x7F).
    #[error("ECU negative response 0x{code:02X}{}", def.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    EcuError {
        /// Raw negative response code.
        code: u8,
        /// Human readable definition, if known.
        def: Option<String>,
    },
    /// The ECU replied with a zero-length payload.
    #[error("ECU provided an empty response")]
    EmptyResponse,
    /// The response payload was shorter than required for the service.
    #[error("ECU response was of invalid length")]
    InvalidResponseLength,
    /// The response service ID did not match the request (request SID + 0x40).
    #[error("ECU response did not match the request service")]
    WrongMessage,
}
