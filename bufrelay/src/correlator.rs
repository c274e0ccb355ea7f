//! Reply Correlator
//!
//! Matches asynchronous reply messages to the requests waiting for them.
//!
//! # 1) Expecting a reply
//!
//! The workflow for a request/reply pair is:
//!
//! 10. Client: call `expect(key)`, which registers a waiter
//! 20. Client: send the request through the transport
//! 30. Client: await the returned `Expectation`
//!
//! 40. Inbound path: call `deliver(message)`
//! 50. Correlator: pop the oldest waiter registered for the message's key
//! 60. Correlator: hand it the message arguments
//!
//! The order of 10 and 20 matters. The server can answer before the sending
//! call even returns, so if the waiter were registered after sending, the
//! reply would find nobody and be dropped.
//!
//! # 2) Reply modes
//!
//! A key in `ReplyMode::Single` accepts one outstanding waiter. A second
//! `expect` fails with `ExpectationPending`, and a reply that finds no waiter
//! is logged as a protocol error. A key in `ReplyMode::Multi` queues waiters
//! first-in first-out.
//!
//! A chunk reply (`Address::reroutes_unmatched`) that matches no key exactly
//! is not dropped. It goes to the oldest waiter of the same address,
//! preferring the same buffer id, and that transfer rejects it as
//! `MalformedReply`. Exact matches always win, so concurrent transfers never
//! take each other's chunks.
//!
//! # 3) Cancellation and transport loss
//!
//! Dropping an unresolved `Expectation` removes its waiter from the table.
//! `fail_all` resolves every waiter with the given error, so no future is
//! left hanging when the transport goes away.
//!
//! The table lock is held only for the lookup/update, never across an await.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::message::{Arg, MatchKey, Message, ReplyMode};

/// Payload handed to a resolved expectation
pub type ReplyResult = Result<Vec<Arg>, Error>;

/// A client waiting for a reply
struct Waiter {
    ticket: u64,
    sender: oneshot::Sender<ReplyResult>,
    debug_hint: String,
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("ticket", &self.ticket)
            .field("debug_hint", &self.debug_hint)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct InnerState {
    waiting: HashMap<MatchKey, VecDeque<Waiter>>,
    next_ticket: u64,
}

impl InnerState {
    fn pop_front(&mut self, key: &MatchKey) -> Option<Waiter> {
        let queue = self.waiting.get_mut(key)?;
        let waiter = queue.pop_front();
        if queue.is_empty() {
            self.waiting.remove(key);
        }
        waiter
    }

    /// Oldest waiter of `key.address` under any key, same buffer id first
    fn pop_oldest_of_address(&mut self, key: &MatchKey) -> Option<Waiter> {
        let oldest = self
            .waiting
            .iter()
            .filter(|(k, _)| k.address == key.address)
            .filter_map(|(k, q)| q.front().map(|w| (k.id != key.id, w.ticket, *k)))
            .min_by_key(|(other_id, ticket, _)| (*other_id, *ticket))
            .map(|(_, _, k)| k)?;
        self.pop_front(&oldest)
    }

    fn remove_ticket(&mut self, key: &MatchKey, ticket: u64) {
        if let Some(queue) = self.waiting.get_mut(key) {
            queue.retain(|w| w.ticket != ticket);
            if queue.is_empty() {
                self.waiting.remove(key);
            }
        }
    }
}

/// Thread-safe table of outstanding reply expectations
#[derive(Clone, Default)]
pub struct ReplyCorrelator {
    inner: Arc<Mutex<InnerState>>,
}

impl ReplyCorrelator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `key`
    ///
    /// Must be called before the request is sent.
    ///
    /// # Errors
    ///
    /// `ExpectationPending` if the key is single-slot and already has a waiter.
    pub fn expect(&self, key: MatchKey, debug_hint: &str) -> Result<Expectation, Error> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        let queue = state.waiting.entry(key).or_default();
        if key.mode() == ReplyMode::Single && !queue.is_empty() {
            return Err(Error::ExpectationPending(key));
        }
        queue.push_back(Waiter {
            ticket,
            sender: tx,
            debug_hint: debug_hint.to_string(),
        });
        drop(state);

        Ok(Expectation {
            key,
            ticket,
            receiver: rx,
            table: Arc::clone(&self.inner),
            resolved: false,
        })
    }

    /// Route an inbound message to the oldest waiter for its key
    ///
    /// Returns `true` if a waiter took the message.
    pub fn deliver(&self, message: Message) -> bool {
        let Some(key) = message.match_key() else {
            log::warn!("correlator.deliver: not a reply: {message}");
            return false;
        };

        let mut args = message.args;
        loop {
            let waiter = {
                let mut state = self.inner.lock();
                match state.pop_front(&key) {
                    Some(waiter) => Some(waiter),
                    None if key.address.reroutes_unmatched() => {
                        let waiter = state.pop_oldest_of_address(&key);
                        if let Some(w) = &waiter {
                            log::warn!(
                                "correlator.deliver: no waiter for {key:?}, handing it to ticket {} ({})",
                                w.ticket,
                                w.debug_hint
                            );
                        }
                        waiter
                    }
                    None => None,
                }
            };

            let Some(waiter) = waiter else {
                match key.mode() {
                    ReplyMode::Single => {
                        log::warn!("correlator.deliver: protocol error, unsolicited reply for {key:?}");
                    }
                    ReplyMode::Multi => {
                        log::debug!("correlator.deliver: no waiter for {key:?}, reply dropped");
                    }
                }
                return false;
            };

            log::debug!(
                "correlator.deliver: {key:?} -> ticket {} ({})",
                waiter.ticket,
                waiter.debug_hint
            );
            match waiter.sender.send(Ok(args)) {
                Ok(()) => return true,
                Err(Ok(returned)) => {
                    // Receiver vanished without deregistering; try the next one
                    args = returned;
                }
                Err(Err(_)) => return false,
            }
        }
    }

    /// Resolve every outstanding waiter with `error`
    pub fn fail_all(&self, error: &Error) {
        let waiting = std::mem::take(&mut self.inner.lock().waiting);
        let count: usize = waiting.values().map(VecDeque::len).sum();
        if count > 0 {
            log::warn!("correlator.fail_all: failing {count} waiter(s): {error}");
        }
        for waiter in waiting.into_values().flatten() {
            if waiter.sender.send(Err(error.clone())).is_err() {
                log::debug!(
                    "correlator.fail_all: receiver dropped (hint: {})",
                    waiter.debug_hint
                );
            }
        }
    }

    /// Drop every waiter for `key`; returns how many were removed
    ///
    /// The dropped waiters observe `TransportLost` if they are still polled.
    pub fn cancel(&self, key: &MatchKey) -> usize {
        let removed = self.inner.lock().waiting.remove(key).map_or(0, |q| q.len());
        if removed > 0 {
            log::debug!("correlator.cancel: {removed} waiter(s) for {key:?}");
        }
        removed
    }

    /// Number of waiters registered for `key`
    #[must_use]
    pub fn outstanding(&self, key: &MatchKey) -> usize {
        self.inner.lock().waiting.get(key).map_or(0, VecDeque::len)
    }

    /// Number of waiters across all keys
    #[must_use]
    pub fn total_outstanding(&self) -> usize {
        self.inner.lock().waiting.values().map(VecDeque::len).sum()
    }

    /// Drain an inbound stream into `deliver`
    ///
    /// When the stream ends the connection is considered lost and every
    /// outstanding waiter fails with `TransportLost`.
    pub async fn run_inbound(&self, mut inbound: mpsc::UnboundedReceiver<Message>) {
        while let Some(message) = inbound.recv().await {
            self.deliver(message);
        }
        log::debug!("correlator.run_inbound: inbound stream closed");
        self.fail_all(&Error::TransportLost);
    }
}

impl std::fmt::Debug for ReplyCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyCorrelator")
            .field("outstanding", &self.total_outstanding())
            .finish()
    }
}

/// One-shot future for a single reply
///
/// Resolves at most once; polling it again yields `TransportLost`.
/// Dropping it unresolved releases its slot.
#[must_use = "an expectation does nothing unless awaited"]
pub struct Expectation {
    key: MatchKey,
    ticket: u64,
    receiver: oneshot::Receiver<ReplyResult>,
    table: Arc<Mutex<InnerState>>,
    resolved: bool,
}

impl Expectation {
    #[must_use]
    pub fn key(&self) -> &MatchKey {
        &self.key
    }

    /// Non-blocking poll: `None` while the reply is still outstanding
    pub fn try_take(&mut self) -> Option<ReplyResult> {
        if self.resolved {
            return None;
        }
        match self.receiver.try_recv() {
            Ok(result) => {
                self.resolved = true;
                Some(result)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.resolved = true;
                Some(Err(Error::TransportLost))
            }
        }
    }

    /// Block the current thread until the reply arrives
    ///
    /// For synchronous callers only; never call this from inside an async task.
    pub fn wait_blocking(self) -> ReplyResult {
        futures::executor::block_on(self)
    }

    /// Await the reply, failing with `Timeout` if `timeout` elapses first
    ///
    /// # Errors
    ///
    /// The reply error, or `Timeout`.
    pub async fn with_timeout(self, timeout: Option<Duration>) -> ReplyResult {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self)
                .await
                .unwrap_or(Err(Error::Timeout)),
            None => self.await,
        }
    }
}

impl Future for Expectation {
    type Output = ReplyResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.resolved {
            return Poll::Ready(Err(Error::TransportLost));
        }
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(result) => {
                this.resolved = true;
                // A dropped sender means the correlator itself went away
                Poll::Ready(result.unwrap_or(Err(Error::TransportLost)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Expectation {
    fn drop(&mut self) {
        if !self.resolved {
            self.table.lock().remove_ticket(&self.key, self.ticket);
        }
    }
}

impl std::fmt::Debug for Expectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Expectation")
            .field("key", &self.key)
            .field("ticket", &self.ticket)
            .field("resolved", &self.resolved)
            .finish_non_exhaustive()
    }
}
