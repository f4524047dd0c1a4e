//! Error types for flowpacket.

use thiserror::Error;

/// Main error type for all flowpacket operations.
#[derive(Debug, Error)]
pub enum FlowPacketError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Legacy framing: route width outside {1, 2, 4}.
    #[error("invalid route width: {0}, must be 1, 2, or 4")]
    InvalidRouteBytes(usize),

    /// Legacy framing: seq width outside {0, 1, 2, 4}.
    #[error("invalid seq width: {0}, must be 0, 1, 2, or 4")]
    InvalidSeqBytes(usize),

    /// Field-driven framing declared without a size/len field.
    #[error("field-driven framing: no size/len field found")]
    NoSizeField,

    /// Route 0 is reserved and cannot be mapped.
    #[error("route cannot be 0")]
    InvalidRoute,

    /// Frame shorter than the fixed header portion.
    #[error("frame too short: {have} < {need}")]
    ShortHeader { have: usize, need: usize },

    /// Declared payload size exceeds the available bytes.
    #[error("incomplete frame: need {need} bytes, have {have}")]
    Incomplete { need: usize, have: usize },

    /// A legacy frame declared a zero-length payload.
    #[error("invalid frame: payload size is 0")]
    ZeroSize,

    /// Payload too small to carry the declared route/seq fields.
    #[error("invalid data packet: payload size {size} < minimum {min}")]
    InvalidDataPacket { size: usize, min: usize },

    /// Schema compilation failed.
    #[error("schema compile error: {0}")]
    SchemaCompile(#[from] protox::Error),

    /// Descriptor pool construction failed.
    #[error("descriptor error: {0}")]
    Descriptor(#[from] prost_reflect::DescriptorError),

    /// Protobuf wire decoding failed.
    #[error("protobuf decode error: {0}")]
    ProtoDecode(#[from] prost::DecodeError),

    /// A request field does not exist on the target message.
    #[error("unknown field {field:?} in {message}")]
    UnknownField { field: String, message: String },

    /// A request field value cannot be coerced to the declared kind.
    #[error("field {field:?}: cannot convert {got} to {expected}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        got: String,
    },

    /// A bytes field carried a string that is not valid hex.
    #[error("field {field:?}: invalid hex string")]
    InvalidHex { field: String },

    /// The catalog has no message under the requested name.
    #[error("message {0:?} not found")]
    MessageNotFound(String),

    /// Flow graph: no nodes given.
    #[error("empty node list")]
    EmptyFlow,

    /// Flow graph: every node has an inbound edge.
    #[error("no start node found (cycle detected)")]
    NoStartNode,

    /// Flow graph: more than one node without an inbound edge.
    #[error("multiple start nodes: {0:?}")]
    MultipleStartNodes(Vec<String>),

    /// Flow graph: chain walk revisited a node.
    #[error("cycle detected at node {0}")]
    CycleDetected(String),

    /// Flow graph: the chain does not reach every node.
    #[error("disconnected graph: resolved {resolved} of {total} nodes")]
    DisconnectedGraph { resolved: usize, total: usize },

    /// A correlator wait elapsed without a reply.
    #[error("response timeout")]
    Timeout,

    /// A wait was interrupted by stop/reset.
    #[error("operation cancelled")]
    Cancelled,

    /// Send attempted while the connection is down.
    #[error("connection closed")]
    Closed,

    /// Non-blocking send found the queue full.
    #[error("send queue full")]
    Backpressure,

    /// A flow is already executing.
    #[error("flow already running")]
    AlreadyRunning,

    /// A node failed and aborted the flow.
    #[error("node {node_id} failed: {message}")]
    NodeFailed { node_id: String, message: String },
}

/// Result type alias using FlowPacketError.
pub type Result<T> = std::result::Result<T, FlowPacketError>;
