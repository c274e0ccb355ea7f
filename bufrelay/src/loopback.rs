//! In-process stand-in for the audio server
//!
//! `LoopbackServer` implements `Transport` by executing buffer commands
//! against an in-memory table and delivering the replies straight into a
//! `ReplyCorrelator`. Replies can be held back and released later (in order
//! or reversed), and the connection can be dropped, which makes it the
//! driver for protocol tests and demos.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;

use tokio::sync::watch;

use crate::correlator::ReplyCorrelator;
use crate::error::Error;
use crate::message::{float_arg, int_arg, Address, Message};
use crate::transport::Transport;

#[derive(Debug)]
struct ServerBuffer {
    frames: i32,
    channels: i32,
    samples: Vec<f32>,
}

#[derive(Debug)]
struct ServerState {
    buffers: HashMap<i32, ServerBuffer>,
    sent: Vec<Message>,
    held: Vec<Message>,
    hold_replies: bool,
    sample_rate: f32,
}

pub struct LoopbackServer {
    correlator: ReplyCorrelator,
    state: Mutex<ServerState>,
    connected: watch::Sender<bool>,
}

impl LoopbackServer {
    /// Connected server answering at 44.1 kHz
    #[must_use]
    pub fn new(correlator: ReplyCorrelator) -> Self {
        let (connected, _) = watch::channel(true);
        Self {
            correlator,
            state: Mutex::new(ServerState {
                buffers: HashMap::new(),
                sent: Vec::new(),
                held: Vec::new(),
                hold_replies: false,
                sample_rate: 44100.0,
            }),
            connected,
        }
    }

    #[must_use]
    pub fn with_sample_rate(self, sample_rate: f32) -> Self {
        self.state.lock().sample_rate = sample_rate;
        self
    }

    /// Queue replies instead of delivering them immediately
    pub fn hold_replies(&self, hold: bool) {
        self.state.lock().hold_replies = hold;
    }

    #[must_use]
    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Deliver held replies in the order they were produced
    pub fn release_replies(&self) -> usize {
        let held = std::mem::take(&mut self.state.lock().held);
        self.deliver_all(held)
    }

    /// Deliver held replies newest first
    pub fn release_replies_reversed(&self) -> usize {
        let mut held = std::mem::take(&mut self.state.lock().held);
        held.reverse();
        self.deliver_all(held)
    }

    /// Simulate losing the connection: held replies vanish, waiters fail
    pub fn disconnect(&self) {
        self.connected.send_replace(false);
        self.state.lock().held.clear();
        self.correlator.fail_all(&Error::TransportLost);
    }

    pub fn reconnect(&self) {
        self.connected.send_replace(true);
    }

    /// Every message received so far
    #[must_use]
    pub fn sent(&self) -> Vec<Message> {
        self.state.lock().sent.clone()
    }

    #[must_use]
    pub fn sent_to(&self, address: Address) -> Vec<Message> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|m| m.address == address)
            .cloned()
            .collect()
    }

    /// Server-side contents of buffer `id`
    #[must_use]
    pub fn samples(&self, id: i32) -> Option<Vec<f32>> {
        self.state.lock().buffers.get(&id).map(|b| b.samples.clone())
    }

    fn deliver_all(&self, replies: Vec<Message>) -> usize {
        replies
            .into_iter()
            .map(|reply| self.correlator.deliver(reply))
            .filter(|taken| *taken)
            .count()
    }
}

impl ServerState {
    /// Apply one command; returns the reply, if the command has one
    fn execute(&mut self, message: &Message) -> Result<Option<Message>, Error> {
        let args = &message.args;
        let id = int_arg(args, 0)?;
        match message.address {
            Address::AllocBuffer => {
                let frames = int_arg(args, 1)?;
                let channels = int_arg(args, 2)?;
                let len = usize::try_from(frames.max(0))
                    .unwrap_or(0)
                    .saturating_mul(usize::try_from(channels.max(0)).unwrap_or(0));
                self.buffers.insert(
                    id,
                    ServerBuffer {
                        frames,
                        channels,
                        samples: vec![0.0; len],
                    },
                );
                Ok(Some(Message::alloc_confirm(id)))
            }
            Address::FreeBuffer => {
                self.buffers.remove(&id);
                Ok(None)
            }
            Address::QueryMetadata => {
                let buffer = self.buffer(id)?;
                Ok(Some(Message::metadata_reply(
                    id,
                    buffer.frames,
                    buffer.channels,
                    self.sample_rate,
                )))
            }
            Address::ReadChunk => {
                let start = int_arg(args, 1)?;
                let length = int_arg(args, 2)?;
                let samples = self.buffer(id)?.samples.get(span(start, length)?);
                let samples = samples.ok_or_else(|| out_of_range(id, start, length))?;
                Ok(Some(Message::read_chunk_reply(id, start, samples)))
            }
            Address::WriteChunk => {
                let start = int_arg(args, 1)?;
                let length = int_arg(args, 2)?;
                let values = (3..args.len())
                    .map(|pos| float_arg(args, pos))
                    .collect::<Result<Vec<f32>, Error>>()?;
                let dst = self.buffer_mut(id)?.samples.get_mut(span(start, length)?);
                match dst {
                    Some(dst) if dst.len() == values.len() => dst.copy_from_slice(&values),
                    _ => return Err(out_of_range(id, start, length)),
                }
                Ok(None)
            }
            Address::FillRange => {
                let start = int_arg(args, 1)?;
                let length = int_arg(args, 2)?;
                let value = float_arg(args, 3)?;
                let dst = self.buffer_mut(id)?.samples.get_mut(span(start, length)?);
                dst.ok_or_else(|| out_of_range(id, start, length))?
                    .fill(value);
                Ok(None)
            }
            Address::SetOne => {
                let index = int_arg(args, 1)?;
                let value = float_arg(args, 2)?;
                let slot = self.buffer_mut(id)?.samples.get_mut(span(index, 1)?);
                *slot
                    .and_then(|s| s.first_mut())
                    .ok_or_else(|| out_of_range(id, index, 1))? = value;
                Ok(None)
            }
            Address::GetOne => {
                let index = int_arg(args, 1)?;
                let value = self
                    .buffer(id)?
                    .samples
                    .get(span(index, 1)?)
                    .and_then(|s| s.first().copied())
                    .ok_or_else(|| out_of_range(id, index, 1))?;
                Ok(Some(Message::get_one_reply(id, index, value)))
            }
            Address::SaveToFile => {
                self.buffer(id)?;
                Ok(None)
            }
            Address::AllocConfirm
            | Address::MetadataReply
            | Address::ReadChunkReply
            | Address::GetOneReply => Err(Error::MalformedReply(format!(
                "reply sent to the server: {message}"
            ))),
        }
    }

    fn buffer(&self, id: i32) -> Result<&ServerBuffer, Error> {
        self.buffers.get(&id).ok_or(Error::InvalidHandle(id))
    }

    fn buffer_mut(&mut self, id: i32) -> Result<&mut ServerBuffer, Error> {
        self.buffers.get_mut(&id).ok_or(Error::InvalidHandle(id))
    }
}

fn span(start: i32, length: i32) -> Result<std::ops::Range<usize>, Error> {
    let (Ok(from), Ok(len)) = (usize::try_from(start), usize::try_from(length)) else {
        return Err(Error::OutOfRange(format!("{start}+{length}")));
    };
    Ok(from..from + len)
}

fn out_of_range(id: i32, start: i32, length: i32) -> Error {
    Error::OutOfRange(format!("{start}+{length} in server buffer {id}"))
}

impl Transport for LoopbackServer {
    fn send(&self, message: Message) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let reply = {
            let mut state = self.state.lock();
            let reply = match state.execute(&message) {
                Ok(reply) => reply,
                Err(e) => {
                    // The server reports command errors on its own console only
                    log::warn!("loopback: {message} failed: {e}");
                    None
                }
            };
            state.sent.push(message);
            match reply {
                Some(reply) if state.hold_replies => {
                    state.held.push(reply);
                    None
                }
                other => other,
            }
        };
        if let Some(reply) = reply {
            self.correlator.deliver(reply);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn wait_connected(&self) -> impl Future<Output = ()> + Send {
        let mut rx = self.connected.subscribe();
        async move {
            let _ = rx.wait_for(|up| *up).await;
        }
    }
}

impl std::fmt::Debug for LoopbackServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackServer")
            .field("buffers", &state.buffers.len())
            .field("sent", &state.sent.len())
            .field("held", &state.held.len())
            .field("connected", &*self.connected.borrow())
            .finish()
    }
}
