pub mod buffer;
pub mod config;
pub mod correlator;
pub mod error;
pub mod idgen;
pub mod loopback;
pub mod manager;
pub mod message;
pub mod relay;
pub mod transfer;
pub mod transport;

// Re-export the error type for convenience
pub use error::Error;

// Re-export message types for convenience
pub use message::{Address, Arg, MatchKey, Message, ReplyMode};

// Re-export idgen types for convenience
pub use idgen::{BitmapIdAllocator, IdAllocator, ResourceClass};

// Re-export correlator types
pub use correlator::{Expectation, ReplyCorrelator, ReplyResult};

// Re-export buffer and manager types
pub use buffer::{BufferHandle, BufferMetadata, Identifier, Readiness};
pub use config::ClientConfig;
pub use manager::BufferManager;
pub use relay::{CommandRelay, HeaderFormat, SampleEncoding, SaveOptions};
pub use transfer::{chunk_ranges, TransferEngine, TransferState};

// Re-export transports
pub use loopback::LoopbackServer;
pub use transport::{ChannelTransport, Transport};
