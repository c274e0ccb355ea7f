//! Chunked Transfer Engine
//!
//! Bulk reads are split into sub-ranges of at most `max_samples_per_message`
//! samples. All sub-requests are sent back to back (pipelined). Each reply
//! carries its own start offset, so reassembly does not depend on arrival
//! order. The result is returned only once every requested sample arrived,
//! and a malformed or failed chunk aborts the read as soon as it arrives.
//!
//! Writes go out as one message per call.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, trace};

use crate::correlator::ReplyCorrelator;
use crate::error::Error;
use crate::message::{float_arg, int_arg, Address, Arg, MatchKey, Message};
use crate::transport::Transport;

/// Consecutive `(start, length)` pieces covering `[start, start + length)`
pub fn chunk_ranges(start: usize, length: usize, max: usize) -> impl Iterator<Item = (usize, usize)> {
    let max = max.max(1);
    let end = start + length;
    (start..end)
        .step_by(max)
        .map(move |chunk_start| (chunk_start, max.min(end - chunk_start)))
}

/// Progress of one bulk read
///
/// Invariant: `received <= requested <= samples.len()`.
#[derive(Debug)]
pub struct TransferState {
    buffer_id: i32,
    start: usize,
    samples: Vec<f32>,
    requested: usize,
    received: usize,
}

impl TransferState {
    #[must_use]
    pub fn new(buffer_id: i32, start: usize, length: usize) -> Self {
        Self {
            buffer_id,
            start,
            samples: vec![0.0; length],
            requested: 0,
            received: 0,
        }
    }

    /// Account for a sub-request that was just sent
    pub fn requested_more(&mut self, count: usize) {
        debug_assert!(self.requested + count <= self.samples.len());
        self.requested = (self.requested + count).min(self.samples.len());
    }

    #[must_use]
    pub fn requested(&self) -> usize {
        self.requested
    }

    #[must_use]
    pub fn received(&self) -> usize {
        self.received
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received == self.samples.len()
    }

    /// Copy one chunk reply (`id, start, length, samples...`) into place
    ///
    /// # Errors
    ///
    /// `MalformedReply` if the reply names another buffer, its sample count
    /// disagrees with its length, it falls outside the destination region, or
    /// it would push `received` past `requested`.
    pub fn absorb(&mut self, reply: &[Arg]) -> Result<(), Error> {
        let id = int_arg(reply, 0)?;
        let reply_start = int_arg(reply, 1)?;
        let reply_length = int_arg(reply, 2)?;
        if id != self.buffer_id {
            return Err(Error::MalformedReply(format!(
                "chunk for buffer {id} in a transfer of buffer {}",
                self.buffer_id
            )));
        }

        let (Ok(reply_start), Ok(reply_length)) =
            (usize::try_from(reply_start), usize::try_from(reply_length))
        else {
            return Err(Error::MalformedReply(format!(
                "negative chunk range {reply_start}+{reply_length}"
            )));
        };
        let values = reply.get(3..).unwrap_or_default();
        if values.len() != reply_length {
            return Err(Error::MalformedReply(format!(
                "chunk declares {reply_length} samples but carries {}",
                values.len()
            )));
        }

        let offset = reply_start.checked_sub(self.start).ok_or_else(|| {
            Error::MalformedReply(format!(
                "chunk start {reply_start} is before transfer start {}",
                self.start
            ))
        })?;
        let end = offset + reply_length;
        if end > self.samples.len() {
            return Err(Error::MalformedReply(format!(
                "chunk {reply_start}+{reply_length} overflows the destination of {} samples",
                self.samples.len()
            )));
        }
        if self.received + reply_length > self.requested {
            return Err(Error::MalformedReply(format!(
                "chunk {reply_start}+{reply_length} exceeds the requested sample count"
            )));
        }

        let parsed = (3..reply.len())
            .map(|pos| float_arg(reply, pos))
            .collect::<Result<Vec<f32>, Error>>()?;
        if let Some(dst) = self.samples.get_mut(offset..end) {
            dst.copy_from_slice(&parsed);
        }
        self.received += reply_length;
        trace!(
            buffer = self.buffer_id,
            start = reply_start,
            length = reply_length,
            received = self.received,
            "chunk absorbed"
        );
        Ok(())
    }

    /// The reassembled samples
    ///
    /// # Errors
    ///
    /// `MalformedReply` if the transfer is not complete.
    pub fn into_samples(self) -> Result<Vec<f32>, Error> {
        if !self.is_complete() {
            return Err(Error::MalformedReply(format!(
                "transfer ended with {} of {} samples",
                self.received,
                self.samples.len()
            )));
        }
        Ok(self.samples)
    }
}

/// Splits bulk reads into transport-sized requests and reassembles the replies
pub struct TransferEngine<T: Transport> {
    transport: Arc<T>,
    correlator: ReplyCorrelator,
    max_samples_per_message: usize,
    reply_timeout: Option<Duration>,
}

impl<T: Transport> TransferEngine<T> {
    #[must_use]
    pub fn new(
        transport: Arc<T>,
        correlator: ReplyCorrelator,
        max_samples_per_message: usize,
        reply_timeout: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            correlator,
            max_samples_per_message: max_samples_per_message.max(1),
            reply_timeout,
        }
    }

    /// Read `length` samples starting at `start`
    ///
    /// Dropping the returned future, or any error, releases the expectations
    /// of chunks not yet received.
    ///
    /// # Errors
    ///
    /// Send, transport-loss or timeout errors, `MalformedReply`, or
    /// `OutOfRange` if the range does not fit the protocol's integer arguments.
    pub async fn read(&self, buffer_id: i32, start: usize, length: usize) -> Result<Vec<f32>, Error> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let out_of_range = || Error::OutOfRange(format!("read {start}+{length}"));
        if !start
            .checked_add(length)
            .is_some_and(|end| i32::try_from(end).is_ok())
        {
            return Err(out_of_range());
        }

        let mut state = TransferState::new(buffer_id, start, length);
        let mut pending = Vec::new();
        for (chunk_start, chunk_len) in chunk_ranges(start, length, self.max_samples_per_message) {
            let wire_start = i32::try_from(chunk_start).map_err(|_| out_of_range())?;
            let wire_len = i32::try_from(chunk_len).map_err(|_| out_of_range())?;
            let key = MatchKey::new(Address::ReadChunkReply, buffer_id)
                .with_offset(wire_start)
                .with_length(wire_len);
            let expectation = self.correlator.expect(key, "read chunk")?;
            self.transport
                .send(Message::read_chunk(buffer_id, wire_start, wire_len))?;
            state.requested_more(chunk_len);
            pending.push(expectation);
        }
        debug!(
            buffer = buffer_id,
            start,
            length,
            chunks = pending.len(),
            "read requested"
        );

        // Replies are absorbed as they arrive; the first failure drops the rest
        let mut pending: FuturesUnordered<_> = pending
            .into_iter()
            .map(|expectation| expectation.with_timeout(self.reply_timeout))
            .collect();
        while let Some(reply) = pending.next().await {
            state.absorb(&reply?)?;
        }
        state.into_samples()
    }

    /// Write `samples` starting at `start`, as a single message
    ///
    /// An empty slice sends nothing.
    ///
    /// # Errors
    ///
    /// The transport's send error, or `OutOfRange` if the range does not
    /// fit the protocol's integer arguments.
    pub fn write(&self, buffer_id: i32, start: usize, samples: &[f32]) -> Result<(), Error> {
        if samples.is_empty() {
            return Ok(());
        }
        let fits = start
            .checked_add(samples.len())
            .is_some_and(|end| i32::try_from(end).is_ok());
        let wire_start = i32::try_from(start)
            .ok()
            .filter(|_| fits)
            .ok_or_else(|| Error::OutOfRange(format!("write {start}+{}", samples.len())))?;
        debug!(buffer = buffer_id, start, length = samples.len(), "write");
        self.transport
            .send(Message::write_chunk(buffer_id, wire_start, samples))
    }
}
