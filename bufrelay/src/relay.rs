//! Command Relay
//!
//! Single round-trip buffer commands. Fire-and-forget commands return once the
//! message is handed to the transport: success means "sent", not "applied".
//! Commands with a reply register their expectation before sending.
//!
//! The relay works on raw ids; handle validation happens in the manager.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::buffer::BufferMetadata;
use crate::correlator::{Expectation, ReplyCorrelator};
use crate::error::Error;
use crate::message::{float_arg, int_arg, Address, MatchKey, Message};
use crate::transport::Transport;

/// Sound file header format for `save_to_file`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderFormat {
    #[default]
    Wav,
    Aiff,
    Next,
    Ircam,
    Raw,
}

impl HeaderFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Aiff => "aiff",
            Self::Next => "next",
            Self::Ircam => "ircam",
            Self::Raw => "raw",
        }
    }
}

/// Sample encoding for `save_to_file`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleEncoding {
    Int8,
    Int16,
    Int24,
    Int32,
    #[default]
    Float,
    Double,
    Mulaw,
    Alaw,
}

impl SampleEncoding {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int24 => "int24",
            Self::Int32 => "int32",
            Self::Float => "float",
            Self::Double => "double",
            Self::Mulaw => "mulaw",
            Self::Alaw => "alaw",
        }
    }
}

/// Options for writing a buffer to a file on the server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SaveOptions {
    pub header: HeaderFormat,
    pub encoding: SampleEncoding,
    /// `-1` writes every frame
    pub frame_count: i32,
    pub start_frame: i32,
    pub leave_open: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            header: HeaderFormat::Wav,
            encoding: SampleEncoding::Float,
            frame_count: -1,
            start_frame: 0,
            leave_open: false,
        }
    }
}

/// Sends single-message commands and awaits single replies
pub struct CommandRelay<T: Transport> {
    transport: Arc<T>,
    correlator: ReplyCorrelator,
    reply_timeout: Option<Duration>,
}

impl<T: Transport> CommandRelay<T> {
    #[must_use]
    pub fn new(transport: Arc<T>, correlator: ReplyCorrelator, reply_timeout: Option<Duration>) -> Self {
        Self {
            transport,
            correlator,
            reply_timeout,
        }
    }

    /// Register a reply expectation, then send the request
    ///
    /// On send failure the expectation is dropped, which releases its slot.
    fn request(&self, key: MatchKey, message: Message, hint: &str) -> Result<Expectation, Error> {
        let expectation = self.correlator.expect(key, hint)?;
        trace!(key = ?key, message = %message, "request");
        self.transport.send(message)?;
        Ok(expectation)
    }

    /// Ask the server to allocate a buffer; the returned expectation resolves on confirmation
    ///
    /// # Errors
    ///
    /// `ExpectationPending` if an allocation of this id is still unconfirmed,
    /// or the transport's send error.
    pub fn alloc(&self, id: i32, frames: i32, channels: i32) -> Result<Expectation, Error> {
        debug!(buffer = id, frames, channels, "alloc");
        self.request(
            MatchKey::new(Address::AllocConfirm, id),
            Message::alloc_buffer(id, frames, channels),
            "alloc confirm",
        )
    }

    /// # Errors
    ///
    /// The transport's send error.
    pub fn free(&self, id: i32) -> Result<(), Error> {
        debug!(buffer = id, "free");
        self.transport.send(Message::free_buffer(id))
    }

    /// Fresh metadata round-trip
    ///
    /// # Errors
    ///
    /// Send, transport-loss or timeout errors, or `MalformedReply`.
    pub async fn query(&self, id: i32) -> Result<BufferMetadata, Error> {
        let reply = self
            .request(
                MatchKey::new(Address::MetadataReply, id),
                Message::query_metadata(id),
                "query",
            )?
            .with_timeout(self.reply_timeout)
            .await?;
        let metadata = BufferMetadata::from_reply(&reply)?;
        if metadata.id() != id {
            return Err(Error::MalformedReply(format!(
                "metadata for buffer {} answers a query for {id}",
                metadata.id()
            )));
        }
        Ok(metadata)
    }

    /// # Errors
    ///
    /// The transport's send error.
    pub fn fill(&self, id: i32, start: i32, length: i32, value: f32) -> Result<(), Error> {
        trace!(buffer = id, start, length, value, "fill");
        self.transport.send(Message::fill_range(id, start, length, value))
    }

    /// # Errors
    ///
    /// The transport's send error.
    pub fn set_one(&self, id: i32, index: i32, value: f32) -> Result<(), Error> {
        trace!(buffer = id, index, value, "set");
        self.transport.send(Message::set_one(id, index, value))
    }

    /// Read a single sample
    ///
    /// # Errors
    ///
    /// `ExpectationPending` if the same sample is already being fetched, send,
    /// transport-loss or timeout errors, or `MalformedReply`.
    pub async fn get_one(&self, id: i32, index: i32) -> Result<f32, Error> {
        let reply = self
            .request(
                MatchKey::new(Address::GetOneReply, id).with_offset(index),
                Message::get_one(id, index),
                "get",
            )?
            .with_timeout(self.reply_timeout)
            .await?;
        if int_arg(&reply, 0)? != id || int_arg(&reply, 1)? != index {
            return Err(Error::MalformedReply(format!(
                "get reply does not answer buffer {id} index {index}"
            )));
        }
        float_arg(&reply, 2)
    }

    /// Ask the server to write the buffer to `path`; completion is not awaited
    ///
    /// # Errors
    ///
    /// The transport's send error.
    pub fn save_to_file(&self, id: i32, path: &str, options: &SaveOptions) -> Result<(), Error> {
        debug!(buffer = id, path, ?options, "save to file");
        self.transport.send(Message::save_to_file(
            id,
            path,
            options.header.as_str(),
            options.encoding.as_str(),
            options.frame_count,
            options.start_frame,
            options.leave_open,
        ))
    }
}
