//! Protocol messages exchanged with the audio server
//!
//! Only the shape of a message is modelled here: an address plus a positional
//! argument list. Encoding to bytes belongs to the transport.
//!
//! | Address             | Direction | Args                                        |
//! |---------------------|-----------|---------------------------------------------|
//! | `AllocBuffer`       | request   | id, size, channels                          |
//! | `AllocConfirm`      | reply     | id                                          |
//! | `FreeBuffer`        | request   | id                                          |
//! | `QueryMetadata`     | request   | id                                          |
//! | `MetadataReply`     | reply     | id, frameCount, channelCount, sampleRate    |
//! | `ReadChunk`         | request   | id, start, length                           |
//! | `ReadChunkReply`    | reply     | id, start, length, samples...               |
//! | `WriteChunk`        | request   | id, start, length, samples...               |
//! | `FillRange`         | request   | id, start, length, value                    |
//! | `SetOne`            | request   | id, index, value                            |
//! | `GetOne`            | request   | id, index                                   |
//! | `GetOneReply`       | reply     | id, index, value                            |
//! | `SaveToFile`        | request   | id, path, header, encoding, frames, start, leaveOpen |

use std::fmt;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    AllocBuffer,
    AllocConfirm,
    FreeBuffer,
    QueryMetadata,
    MetadataReply,
    ReadChunk,
    ReadChunkReply,
    WriteChunk,
    FillRange,
    SetOne,
    GetOne,
    GetOneReply,
    SaveToFile,
}

/// How the correlator treats several expectations registered under one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// At most one outstanding expectation; an unsolicited reply is a protocol error
    Single,
    /// Any number of expectations, resolved first-registered first
    Multi,
}

impl Address {
    /// Server-side command name, used for logging
    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Self::AllocBuffer => "/b_alloc",
            Self::AllocConfirm => "/done",
            Self::FreeBuffer => "/b_free",
            Self::QueryMetadata => "/b_query",
            Self::MetadataReply => "/b_info",
            Self::ReadChunk => "/b_getn",
            Self::ReadChunkReply | Self::WriteChunk => "/b_setn",
            Self::FillRange => "/b_fill",
            Self::SetOne | Self::GetOneReply => "/b_set",
            Self::GetOne => "/b_get",
            Self::SaveToFile => "/b_write",
        }
    }

    #[must_use]
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            Self::AllocConfirm | Self::MetadataReply | Self::ReadChunkReply | Self::GetOneReply
        )
    }

    /// Whether a reply that matches no key exactly goes to the oldest waiter
    /// of its address instead of being dropped
    ///
    /// Only for replies whose consumer validates the payload (chunk replies
    /// carry id, start and length), so a stray reply fails a transfer
    /// instead of leaving it waiting.
    #[must_use]
    pub fn reroutes_unmatched(self) -> bool {
        matches!(self, Self::ReadChunkReply)
    }

    #[must_use]
    pub fn reply_mode(self) -> ReplyMode {
        match self {
            Self::AllocConfirm | Self::GetOneReply => ReplyMode::Single,
            _ => ReplyMode::Multi,
        }
    }
}

/// A single positional argument
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(i32),
    Float(f32),
    Str(String),
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<f32> for Arg {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v:?}"),
        }
    }
}

/// Key under which a reply is matched to the request that caused it
///
/// Besides the address and the buffer id, the key holds every argument the
/// reply echoes back (index, start, length), so that two replies landing on
/// the same key are interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchKey {
    pub address: Address,
    pub id: i32,
    pub offset: Option<i32>,
    pub length: Option<i32>,
}

impl MatchKey {
    #[must_use]
    pub fn new(address: Address, id: i32) -> Self {
        Self {
            address,
            id,
            offset: None,
            length: None,
        }
    }

    #[must_use]
    pub fn with_offset(mut self, offset: i32) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn with_length(mut self, length: i32) -> Self {
        self.length = Some(length);
        self
    }

    #[must_use]
    pub fn mode(&self) -> ReplyMode {
        self.address.reply_mode()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub address: Address,
    pub args: Vec<Arg>,
}

impl Message {
    #[must_use]
    pub fn new(address: Address, args: Vec<Arg>) -> Self {
        Self { address, args }
    }

    #[must_use]
    pub fn alloc_buffer(id: i32, size: i32, channels: i32) -> Self {
        Self::new(Address::AllocBuffer, vec![id.into(), size.into(), channels.into()])
    }

    #[must_use]
    pub fn alloc_confirm(id: i32) -> Self {
        Self::new(Address::AllocConfirm, vec![id.into()])
    }

    #[must_use]
    pub fn free_buffer(id: i32) -> Self {
        Self::new(Address::FreeBuffer, vec![id.into()])
    }

    #[must_use]
    pub fn query_metadata(id: i32) -> Self {
        Self::new(Address::QueryMetadata, vec![id.into()])
    }

    #[must_use]
    pub fn metadata_reply(id: i32, frames: i32, channels: i32, sample_rate: f32) -> Self {
        Self::new(
            Address::MetadataReply,
            vec![id.into(), frames.into(), channels.into(), sample_rate.into()],
        )
    }

    #[must_use]
    pub fn read_chunk(id: i32, start: i32, length: i32) -> Self {
        Self::new(Address::ReadChunk, vec![id.into(), start.into(), length.into()])
    }

    #[must_use]
    pub fn read_chunk_reply(id: i32, start: i32, samples: &[f32]) -> Self {
        Self::with_samples(Address::ReadChunkReply, id, start, samples)
    }

    #[must_use]
    pub fn write_chunk(id: i32, start: i32, samples: &[f32]) -> Self {
        Self::with_samples(Address::WriteChunk, id, start, samples)
    }

    #[must_use]
    pub fn fill_range(id: i32, start: i32, length: i32, value: f32) -> Self {
        Self::new(
            Address::FillRange,
            vec![id.into(), start.into(), length.into(), value.into()],
        )
    }

    #[must_use]
    pub fn set_one(id: i32, index: i32, value: f32) -> Self {
        Self::new(Address::SetOne, vec![id.into(), index.into(), value.into()])
    }

    #[must_use]
    pub fn get_one(id: i32, index: i32) -> Self {
        Self::new(Address::GetOne, vec![id.into(), index.into()])
    }

    #[must_use]
    pub fn get_one_reply(id: i32, index: i32, value: f32) -> Self {
        Self::new(Address::GetOneReply, vec![id.into(), index.into(), value.into()])
    }

    #[must_use]
    pub fn save_to_file(
        id: i32,
        path: &str,
        header: &str,
        encoding: &str,
        frame_count: i32,
        start_frame: i32,
        leave_open: bool,
    ) -> Self {
        Self::new(
            Address::SaveToFile,
            vec![
                id.into(),
                path.into(),
                header.into(),
                encoding.into(),
                frame_count.into(),
                start_frame.into(),
                Arg::Int(i32::from(leave_open)),
            ],
        )
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn with_samples(address: Address, id: i32, start: i32, samples: &[f32]) -> Self {
        let mut args = Vec::with_capacity(samples.len() + 3);
        args.push(Arg::Int(id));
        args.push(Arg::Int(start));
        args.push(Arg::Int(samples.len() as i32));
        args.extend(samples.iter().copied().map(Arg::Float));
        Self::new(address, args)
    }

    /// Key this message resolves, if it is a reply carrying enough arguments
    #[must_use]
    pub fn match_key(&self) -> Option<MatchKey> {
        if !self.address.is_reply() {
            return None;
        }
        let id = int_arg(&self.args, 0).ok()?;
        let key = MatchKey::new(self.address, id);
        match self.address {
            Address::GetOneReply => Some(key.with_offset(int_arg(&self.args, 1).ok()?)),
            Address::ReadChunkReply => Some(
                key.with_offset(int_arg(&self.args, 1).ok()?)
                    .with_length(int_arg(&self.args, 2).ok()?),
            ),
            _ => Some(key),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address.path())?;
        for arg in self.args.iter().take(8) {
            write!(f, " {arg}")?;
        }
        if self.args.len() > 8 {
            write!(f, " ... ({} args)", self.args.len())?;
        }
        Ok(())
    }
}

/// Integer argument at `pos`, or `MalformedReply`
pub fn int_arg(args: &[Arg], pos: usize) -> Result<i32, Error> {
    match args.get(pos) {
        Some(Arg::Int(v)) => Ok(*v),
        other => Err(Error::MalformedReply(format!(
            "expected integer at position {pos}, got {other:?}"
        ))),
    }
}

/// Numeric argument at `pos` as a float; integers are widened
#[allow(clippy::cast_precision_loss)]
pub fn float_arg(args: &[Arg], pos: usize) -> Result<f32, Error> {
    match args.get(pos) {
        Some(Arg::Float(v)) => Ok(*v),
        Some(Arg::Int(v)) => Ok(*v as f32),
        other => Err(Error::MalformedReply(format!(
            "expected number at position {pos}, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_reply_key_carries_offset_and_length() {
        let msg = Message::read_chunk_reply(3, 1000, &[0.5; 4]);
        let key = msg.match_key().unwrap();
        assert_eq!(
            key,
            MatchKey::new(Address::ReadChunkReply, 3)
                .with_offset(1000)
                .with_length(4)
        );
    }

    #[test]
    fn test_only_chunk_replies_are_rerouted() {
        assert!(Address::ReadChunkReply.reroutes_unmatched());
        assert!(!Address::AllocConfirm.reroutes_unmatched());
        assert!(!Address::MetadataReply.reroutes_unmatched());
        assert!(!Address::GetOneReply.reroutes_unmatched());
    }

    #[test]
    fn test_requests_have_no_match_key() {
        assert!(Message::read_chunk(3, 0, 10).match_key().is_none());
        assert!(Message::free_buffer(3).match_key().is_none());
    }

    #[test]
    fn test_reply_without_id_has_no_match_key() {
        let msg = Message::new(Address::AllocConfirm, vec![Arg::Str("x".into())]);
        assert!(msg.match_key().is_none());
    }

    #[test]
    fn test_float_arg_widens_int() {
        let args = vec![Arg::Int(2), Arg::Float(0.25)];
        assert_eq!(float_arg(&args, 0).unwrap(), 2.0);
        assert_eq!(float_arg(&args, 1).unwrap(), 0.25);
        assert!(matches!(float_arg(&args, 2), Err(Error::MalformedReply(_))));
    }
}
