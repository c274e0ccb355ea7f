//! Buffer Resource Manager
//!
//! Owns the lifecycle of buffer handles and is the public entry point for
//! every buffer operation. It validates the target buffer, then delegates
//! to the command relay or the transfer engine.
//!
//! Allocation is asynchronous. `create` returns a `Pending` handle at once,
//! and a background continuation flips it to `Ready` when the server
//! confirms. `create_blocking` waits for that flip. The flip wakes waiters
//! through the handle's watch channel, so nothing polls.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::buffer::{BufferHandle, BufferMetadata, Identifier, Readiness};
use crate::config::ClientConfig;
use crate::correlator::{Expectation, ReplyCorrelator};
use crate::error::Error;
use crate::idgen::{BitmapIdAllocator, IdAllocator, ResourceClass};
use crate::message::{Address, MatchKey};
use crate::relay::{CommandRelay, SaveOptions};
use crate::transfer::TransferEngine;
use crate::transport::Transport;

struct ManagerInner<T: Transport> {
    transport: Arc<T>,
    correlator: ReplyCorrelator,
    relay: CommandRelay<T>,
    engine: TransferEngine<T>,
    allocator: Arc<dyn IdAllocator>,
    config: ClientConfig,
    /// Live (Pending or Ready) handles by id
    live: Mutex<HashMap<i32, BufferHandle>>,
}

/// Client-side manager of server buffers
///
/// Cheap to clone; clones share the same registry.
pub struct BufferManager<T: Transport> {
    inner: Arc<ManagerInner<T>>,
}

impl<T: Transport> Clone for BufferManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Aborts a handle's confirmation continuation unless disarmed
struct ContinuationGuard {
    handle: Option<BufferHandle>,
    correlator: ReplyCorrelator,
}

impl ContinuationGuard {
    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for ContinuationGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.readiness() == Readiness::Pending {
                debug!(buffer = handle.id(), "blocking create cancelled");
                handle.abort_continuation();
                self.correlator
                    .cancel(&MatchKey::new(Address::AllocConfirm, handle.id()));
            }
        }
    }
}

impl<T: Transport> BufferManager<T> {
    /// Manager with the bundled bitmap id allocator
    ///
    /// # Errors
    ///
    /// `Config` if the configuration does not validate.
    pub fn new(transport: Arc<T>, correlator: ReplyCorrelator, config: ClientConfig) -> Result<Self, Error> {
        let allocator = Arc::new(BitmapIdAllocator::new(config.buffer_id_capacity));
        Self::with_allocator(transport, correlator, allocator, config)
    }

    /// Manager sharing an existing id allocator
    ///
    /// # Errors
    ///
    /// `Config` if the configuration does not validate.
    pub fn with_allocator(
        transport: Arc<T>,
        correlator: ReplyCorrelator,
        allocator: Arc<dyn IdAllocator>,
        config: ClientConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        let reply_timeout = config.reply_timeout();
        Ok(Self {
            inner: Arc::new(ManagerInner {
                relay: CommandRelay::new(Arc::clone(&transport), correlator.clone(), reply_timeout),
                engine: TransferEngine::new(
                    Arc::clone(&transport),
                    correlator.clone(),
                    config.max_samples_per_message,
                    reply_timeout,
                ),
                transport,
                correlator,
                allocator,
                config,
                live: Mutex::new(HashMap::new()),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Live handle registered under `id`
    #[must_use]
    pub fn handle(&self, id: i32) -> Option<BufferHandle> {
        self.inner.live.lock().get(&id).cloned()
    }

    /// Ids of every Pending or Ready buffer, ascending
    #[must_use]
    pub fn live_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.inner.live.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Request a buffer of `size` frames × `channels`; returns a Pending handle at once
    ///
    /// # Errors
    ///
    /// `OutOfRange` for sizes beyond the protocol's integers,
    /// `AllocationExhausted` from the allocator, or the transport's send error.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime (the confirmation is awaited by a spawned task).
    pub fn create(&self, size: usize, channels: usize) -> Result<BufferHandle, Error> {
        let (Ok(frames), Ok(chans)) = (i32::try_from(size), i32::try_from(channels)) else {
            return Err(Error::OutOfRange(format!("buffer of {size} frames x {channels} channels")));
        };

        let id = self.inner.allocator.allocate(ResourceClass::BUFFER)?;
        let expectation = match self.inner.relay.alloc(id, frames, chans) {
            Ok(expectation) => expectation,
            Err(e) => {
                self.inner.allocator.release(ResourceClass::BUFFER, id);
                return Err(e);
            }
        };

        let handle = BufferHandle::new(id, size, channels);
        self.inner.live.lock().insert(id, handle.clone());

        let task = tokio::spawn(self.clone().confirm(handle.clone(), expectation));
        handle.set_continuation(task.abort_handle());
        debug!(buffer = id, size, channels, "created, pending confirmation");
        Ok(handle)
    }

    /// Request a buffer and wait until the server confirms it
    ///
    /// If the returned future is dropped early, the confirmation continuation
    /// is aborted and the Pending handle stays registered for an explicit `free`.
    ///
    /// # Errors
    ///
    /// `NotConnected` if the transport is down (after `connect_timeout_ms`, if set),
    /// any `create` error, or the confirmation failure (`TransportLost`, `Timeout`).
    pub async fn create_blocking(&self, size: usize, channels: usize) -> Result<BufferHandle, Error> {
        self.ensure_connected().await?;
        let handle = self.create(size, channels)?;
        let guard = ContinuationGuard {
            handle: Some(handle.clone()),
            correlator: self.inner.correlator.clone(),
        };
        let ready = handle.wait_ready().await;
        guard.disarm();
        ready.map(|()| handle)
    }

    async fn ensure_connected(&self) -> Result<(), Error> {
        if self.inner.transport.is_connected() {
            return Ok(());
        }
        match self.inner.config.connect_timeout() {
            Some(limit) => {
                debug!(?limit, "waiting for the transport to connect");
                tokio::time::timeout(limit, self.inner.transport.wait_connected())
                    .await
                    .map_err(|_| Error::NotConnected)
            }
            None => Err(Error::NotConnected),
        }
    }

    /// Background half of `create`
    async fn confirm(self, handle: BufferHandle, expectation: Expectation) {
        let id = handle.id();
        if let Err(e) = expectation
            .with_timeout(self.inner.config.reply_timeout())
            .await
        {
            warn!(buffer = id, error = %e, "allocation not confirmed");
            handle.record_failure(e);
            return;
        }
        if !handle.advance(Readiness::Ready) {
            debug!(buffer = id, "confirmation arrived after free");
            return;
        }
        debug!(buffer = id, "ready");

        if self.inner.config.fetch_metadata_on_create {
            match self.inner.relay.query(id).await {
                Ok(metadata) => handle.store_metadata(metadata),
                Err(e) => warn!(buffer = id, error = %e, "metadata fetch after allocation failed"),
            }
        }
    }

    /// Release a buffer: send the free command and return its id to the allocator
    ///
    /// Freeing an already freed handle does nothing and succeeds.
    ///
    /// # Errors
    ///
    /// `InvalidHandle` if the value names no live buffer, or the transport's
    /// send error. The handle is Freed and the id released even when sending fails.
    pub fn free(&self, buffer: impl Into<Identifier>) -> Result<(), Error> {
        let handle = match buffer.into() {
            Identifier::Handle(handle) if handle.is_freed() => {
                trace!(buffer = handle.id(), "free: already freed");
                return Ok(());
            }
            other => self.resolve(other)?,
        };
        let id = handle.id();
        if !handle.advance(Readiness::Freed) {
            trace!(buffer = id, "free: already freed");
            return Ok(());
        }

        handle.abort_continuation();
        self.inner
            .correlator
            .cancel(&MatchKey::new(Address::AllocConfirm, id));
        self.inner.live.lock().remove(&id);
        let sent = self.inner.relay.free(id);
        self.inner.allocator.release(ResourceClass::BUFFER, id);
        debug!(buffer = id, "freed");
        sent
    }

    /// Non-blocking readiness check; `false` for anything that is not a live buffer
    #[must_use]
    pub fn is_ready(&self, buffer: impl Into<Identifier>) -> bool {
        self.resolve(buffer.into())
            .is_ok_and(|handle| handle.is_ready())
    }

    /// Fresh metadata snapshot from the server
    ///
    /// # Errors
    ///
    /// Validation, send, transport-loss or timeout errors, or `MalformedReply`.
    pub async fn query_metadata(&self, buffer: impl Into<Identifier>) -> Result<BufferMetadata, Error> {
        let handle = self.resolve(buffer.into())?;
        self.inner.relay.query(handle.id()).await
    }

    /// Set `length` samples from `start` to `value` (fire-and-forget)
    ///
    /// # Errors
    ///
    /// Validation errors, `OutOfRange`, or the transport's send error.
    pub fn fill(&self, buffer: impl Into<Identifier>, start: usize, length: usize, value: f32) -> Result<(), Error> {
        let handle = self.resolve(buffer.into())?;
        let (start, length) = wire_range(&handle, start, length)?;
        self.inner.relay.fill(handle.id(), start, length, value)
    }

    /// Set one sample (fire-and-forget)
    ///
    /// # Errors
    ///
    /// Validation errors, `OutOfRange`, or the transport's send error.
    pub fn set_one(&self, buffer: impl Into<Identifier>, index: usize, value: f32) -> Result<(), Error> {
        let handle = self.resolve(buffer.into())?;
        let (index, _) = wire_range(&handle, index, 1)?;
        self.inner.relay.set_one(handle.id(), index, value)
    }

    /// Read one sample
    ///
    /// # Errors
    ///
    /// Validation errors, `OutOfRange`, `ExpectationPending`, send,
    /// transport-loss or timeout errors, or `MalformedReply`.
    pub async fn get_one(&self, buffer: impl Into<Identifier>, index: usize) -> Result<f32, Error> {
        let handle = self.resolve(buffer.into())?;
        let (index, _) = wire_range(&handle, index, 1)?;
        self.inner.relay.get_one(handle.id(), index).await
    }

    /// Ask the server to write the buffer to a file (fire-and-forget)
    ///
    /// # Errors
    ///
    /// Validation errors or the transport's send error.
    pub fn save_to_file(&self, buffer: impl Into<Identifier>, path: &str, options: &SaveOptions) -> Result<(), Error> {
        let handle = self.resolve(buffer.into())?;
        self.inner.relay.save_to_file(handle.id(), path, options)
    }

    /// Read `length` samples from `start`, chunked to the transport limit
    ///
    /// # Errors
    ///
    /// Validation errors, `OutOfRange`, send, transport-loss or timeout
    /// errors, or `MalformedReply`.
    pub async fn buffer_read(&self, buffer: impl Into<Identifier>, start: usize, length: usize) -> Result<Vec<f32>, Error> {
        let handle = self.resolve(buffer.into())?;
        wire_range(&handle, start, length)?;
        self.inner.engine.read(handle.id(), start, length).await
    }

    /// Write `samples` from `start` in one message
    ///
    /// # Errors
    ///
    /// Validation errors, `OutOfRange`, or the transport's send error.
    pub fn buffer_write(&self, buffer: impl Into<Identifier>, start: usize, samples: &[f32]) -> Result<(), Error> {
        let handle = self.resolve(buffer.into())?;
        wire_range(&handle, start, samples.len())?;
        self.inner.engine.write(handle.id(), start, samples)
    }

    /// Map any identifier onto a live handle of this manager
    fn resolve(&self, buffer: Identifier) -> Result<BufferHandle, Error> {
        let id = buffer.buffer_id();
        if id < 0 {
            return Err(Error::InvalidHandle(id));
        }
        let live = self.inner.live.lock().get(&id).cloned();
        match (buffer, live) {
            (Identifier::Handle(handle), _) if handle.is_freed() => Err(Error::AlreadyFreed(id)),
            (Identifier::Handle(handle), Some(live)) if handle.same_as(&live) => Ok(live),
            (Identifier::Handle(_), _) | (_, None) => Err(Error::InvalidHandle(id)),
            (_, Some(live)) => Ok(live),
        }
    }
}

/// Check `[start, start + length)` against the handle and convert to protocol integers
fn wire_range(handle: &BufferHandle, start: usize, length: usize) -> Result<(i32, i32), Error> {
    let capacity = handle.sample_capacity();
    let out_of_range = || {
        Error::OutOfRange(format!(
            "{start}+{length} in buffer {} of {capacity} samples",
            handle.id()
        ))
    };
    match start.checked_add(length) {
        Some(end) if end <= capacity => {}
        _ => return Err(out_of_range()),
    }
    let start = i32::try_from(start).map_err(|_| out_of_range())?;
    let length = i32::try_from(length).map_err(|_| out_of_range())?;
    Ok((start, length))
}
