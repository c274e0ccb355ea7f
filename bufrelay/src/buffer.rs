//! Buffer handles, readiness and metadata
//!
//! A `BufferHandle` is the caller-facing identity of a server-side buffer.
//! Clones share one state cell. Readiness only moves forward:
//!
//! ```text
//! Pending --(alloc confirmed)--> Ready --(free)--> Freed
//!    └----------------------(free)-----------------^
//! ```
//!
//! Transitions are `pub(crate)`: only the buffer manager drives them.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::error::Error;
use crate::message::{float_arg, int_arg, Arg};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Readiness {
    Pending,
    Ready,
    Freed,
}

/// Snapshot of the server's view of a buffer
///
/// Immutable: a new query produces a new snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferMetadata {
    id: i32,
    frame_count: i32,
    channel_count: i32,
    sample_rate: f32,
}

impl BufferMetadata {
    #[must_use]
    pub fn new(id: i32, frame_count: i32, channel_count: i32, sample_rate: f32) -> Self {
        Self {
            id,
            frame_count,
            channel_count,
            sample_rate,
        }
    }

    /// Parse the arguments of a metadata reply: id, frames, channels, sample rate
    ///
    /// # Errors
    ///
    /// `MalformedReply` if an argument is missing or of the wrong type.
    pub fn from_reply(args: &[Arg]) -> Result<Self, Error> {
        Ok(Self::new(
            int_arg(args, 0)?,
            int_arg(args, 1)?,
            int_arg(args, 2)?,
            float_arg(args, 3)?,
        ))
    }

    #[must_use]
    pub fn id(&self) -> i32 {
        self.id
    }

    #[must_use]
    pub fn frame_count(&self) -> i32 {
        self.frame_count
    }

    #[must_use]
    pub fn channel_count(&self) -> i32 {
        self.channel_count
    }

    #[must_use]
    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }
}

#[derive(Debug, Clone)]
struct Status {
    readiness: Readiness,
    /// Set when the allocation confirmation failed; readiness stays Pending
    failure: Option<Error>,
}

struct HandleInner {
    id: i32,
    size: usize,
    channels: usize,
    status: watch::Sender<Status>,
    metadata: Mutex<Option<BufferMetadata>>,
    continuation: Mutex<Option<AbortHandle>>,
}

#[derive(Clone)]
pub struct BufferHandle {
    inner: Arc<HandleInner>,
}

impl BufferHandle {
    pub(crate) fn new(id: i32, size: usize, channels: usize) -> Self {
        let (status, _) = watch::channel(Status {
            readiness: Readiness::Pending,
            failure: None,
        });
        Self {
            inner: Arc::new(HandleInner {
                id,
                size,
                channels,
                status,
                metadata: Mutex::new(None),
                continuation: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> i32 {
        self.inner.id
    }

    /// Requested frame count (the server's metadata is authoritative)
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.inner.channels
    }

    /// Number of flat sample slots: frames × channels
    #[must_use]
    pub fn sample_capacity(&self) -> usize {
        self.inner.size.saturating_mul(self.inner.channels)
    }

    #[must_use]
    pub fn readiness(&self) -> Readiness {
        self.inner.status.borrow().readiness
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.readiness() == Readiness::Ready
    }

    #[must_use]
    pub fn is_freed(&self) -> bool {
        self.readiness() == Readiness::Freed
    }

    /// Metadata captured when the allocation was confirmed, if any
    #[must_use]
    pub fn cached_metadata(&self) -> Option<BufferMetadata> {
        *self.inner.metadata.lock()
    }

    /// Wait until the handle leaves `Pending`
    ///
    /// # Errors
    ///
    /// - `AlreadyFreed` if the handle was freed before it became ready
    /// - the allocation failure (e.g. `TransportLost`) if confirmation failed
    pub async fn wait_ready(&self) -> Result<(), Error> {
        let mut rx = self.inner.status.subscribe();
        let status = match rx
            .wait_for(|s| s.readiness != Readiness::Pending || s.failure.is_some())
            .await
        {
            Ok(status) => status.clone(),
            Err(_) => return Err(Error::TransportLost),
        };
        match (status.readiness, status.failure) {
            (Readiness::Ready, _) => Ok(()),
            (Readiness::Freed, _) => Err(Error::AlreadyFreed(self.id())),
            (Readiness::Pending, Some(failure)) => Err(failure),
            (Readiness::Pending, None) => Err(Error::TransportLost),
        }
    }

    /// Whether both values are clones of the same handle
    pub(crate) fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Move readiness forward; returns `false` if `to` is not ahead of the current state
    pub(crate) fn advance(&self, to: Readiness) -> bool {
        self.inner.status.send_if_modified(|status| {
            if to > status.readiness {
                status.readiness = to;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn record_failure(&self, error: Error) {
        self.inner.status.send_if_modified(|status| {
            if status.readiness == Readiness::Pending && status.failure.is_none() {
                status.failure = Some(error);
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn store_metadata(&self, metadata: BufferMetadata) {
        *self.inner.metadata.lock() = Some(metadata);
    }

    pub(crate) fn set_continuation(&self, task: AbortHandle) {
        *self.inner.continuation.lock() = Some(task);
    }

    /// Stop the confirmation continuation, which drops its reply expectation
    pub(crate) fn abort_continuation(&self) {
        if let Some(task) = self.inner.continuation.lock().take() {
            task.abort();
        }
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Buffer(id={}, size={}, channels={}, {:?})",
            self.inner.id,
            self.inner.size,
            self.inner.channels,
            self.readiness()
        )
    }
}

/// Anything that names a buffer
#[derive(Debug, Clone)]
pub enum Identifier {
    Raw(i32),
    Handle(BufferHandle),
    Metadata(BufferMetadata),
}

impl Identifier {
    #[must_use]
    pub fn buffer_id(&self) -> i32 {
        match self {
            Self::Raw(id) => *id,
            Self::Handle(handle) => handle.id(),
            Self::Metadata(metadata) => metadata.id(),
        }
    }
}

impl From<i32> for Identifier {
    fn from(id: i32) -> Self {
        Self::Raw(id)
    }
}

impl From<BufferHandle> for Identifier {
    fn from(handle: BufferHandle) -> Self {
        Self::Handle(handle)
    }
}

impl From<&BufferHandle> for Identifier {
    fn from(handle: &BufferHandle) -> Self {
        Self::Handle(handle.clone())
    }
}

impl From<BufferMetadata> for Identifier {
    fn from(metadata: BufferMetadata) -> Self {
        Self::Metadata(metadata)
    }
}

impl From<&BufferMetadata> for Identifier {
    fn from(metadata: &BufferMetadata) -> Self {
        Self::Metadata(*metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_only_moves_forward() {
        let handle = BufferHandle::new(1, 64, 1);
        assert_eq!(handle.readiness(), Readiness::Pending);

        assert!(handle.advance(Readiness::Ready));
        assert!(!handle.advance(Readiness::Pending));
        assert!(!handle.advance(Readiness::Ready));
        assert!(handle.advance(Readiness::Freed));
        assert!(!handle.advance(Readiness::Ready));
        assert_eq!(handle.readiness(), Readiness::Freed);
    }

    #[test]
    fn test_clones_share_state() {
        let handle = BufferHandle::new(1, 64, 2);
        let other = handle.clone();
        handle.advance(Readiness::Ready);
        assert!(other.is_ready());
        assert_eq!(other.sample_capacity(), 128);
    }

    #[test]
    fn test_failure_ignored_once_ready() {
        let handle = BufferHandle::new(1, 64, 1);
        handle.advance(Readiness::Ready);
        handle.record_failure(Error::TransportLost);
        assert!(handle.is_ready());
    }

    #[tokio::test]
    async fn test_wait_ready_reports_failure() {
        let handle = BufferHandle::new(5, 64, 1);
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_ready().await })
        };
        handle.record_failure(Error::TransportLost);
        assert_eq!(waiter.await.unwrap(), Err(Error::TransportLost));
    }

    #[tokio::test]
    async fn test_wait_ready_after_free() {
        let handle = BufferHandle::new(5, 64, 1);
        handle.advance(Readiness::Freed);
        assert_eq!(handle.wait_ready().await, Err(Error::AlreadyFreed(5)));
    }

    #[test]
    fn test_identifier_conversion() {
        let handle = BufferHandle::new(9, 16, 1);
        let metadata = BufferMetadata::new(4, 16, 1, 44100.0);
        assert_eq!(Identifier::from(3).buffer_id(), 3);
        assert_eq!(Identifier::from(&handle).buffer_id(), 9);
        assert_eq!(Identifier::from(metadata).buffer_id(), 4);
    }

    #[test]
    fn test_metadata_from_reply() {
        let args = vec![Arg::Int(2), Arg::Int(4096), Arg::Int(1), Arg::Float(48000.0)];
        let metadata = BufferMetadata::from_reply(&args).unwrap();
        assert_eq!(metadata, BufferMetadata::new(2, 4096, 1, 48000.0));

        let short = vec![Arg::Int(2), Arg::Int(4096)];
        assert!(matches!(
            BufferMetadata::from_reply(&short),
            Err(Error::MalformedReply(_))
        ));
    }
}
