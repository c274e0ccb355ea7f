//! Error taxonomy for buffer operations
//!
//! One enum covers validation, protocol and transport failures so that every
//! operation (and every awaited reply) has a single result-or-error channel.

use crate::message::MatchKey;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The value does not name a live buffer of this manager
    #[error("invalid buffer handle: {0}")]
    InvalidHandle(i32),

    /// An index, range or size does not fit the buffer or the protocol's integers
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// The buffer was already freed; no further operations are accepted
    #[error("buffer {0} is already freed")]
    AlreadyFreed(i32),

    /// The transport is not connected to the server
    #[error("not connected to the server")]
    NotConnected,

    /// The transport went away while a reply was outstanding
    #[error("transport lost while waiting for a reply")]
    TransportLost,

    /// The reply payload does not fit the request it answers
    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// The id allocator has no free id left in this class
    #[error("no free id left in resource class '{class}'")]
    AllocationExhausted { class: &'static str },

    /// A single-slot expectation for this key is already registered
    #[error("a reply is already expected for {0:?}")]
    ExpectationPending(MatchKey),

    /// The caller-supplied timeout elapsed
    #[error("timed out waiting for the server")]
    Timeout,

    /// The configuration is unusable
    #[error("invalid configuration: {0}")]
    Config(String),
}
