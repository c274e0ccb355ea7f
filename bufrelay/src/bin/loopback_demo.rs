//! Loopback Demo
//!
//! Allocates a buffer on the in-process loopback server, writes a ramp,
//! reads it back in chunks and frees it.
//!
//! Usage: `loopback_demo [config.json]`

use std::sync::Arc;

use bufrelay::{BufferManager, ClientConfig, LoopbackServer, ReplyCorrelator, SaveOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => ClientConfig::from_reader(std::fs::File::open(path)?)?,
        None => ClientConfig {
            max_samples_per_message: 256,
            ..ClientConfig::default()
        },
    };

    let correlator = ReplyCorrelator::new();
    let server = Arc::new(LoopbackServer::new(correlator.clone()));
    let manager = BufferManager::new(Arc::clone(&server), correlator, config)?;

    let handle = manager.create_blocking(1000, 1).await?;
    println!("allocated {handle:?}");

    #[allow(clippy::cast_precision_loss)]
    let ramp: Vec<f32> = (0..1000).map(|i| i as f32 / 1000.0).collect();
    manager.buffer_write(&handle, 0, &ramp)?;

    let back = manager.buffer_read(&handle, 0, ramp.len()).await?;
    println!(
        "read {} samples in {} chunk request(s), round trip {}",
        back.len(),
        server.sent_to(bufrelay::Address::ReadChunk).len(),
        if back == ramp { "ok" } else { "MISMATCH" }
    );

    println!("sample 500 = {}", manager.get_one(&handle, 500).await?);
    let metadata = manager.query_metadata(&handle).await?;
    println!(
        "metadata: {} frames, {} channel(s) at {} Hz",
        metadata.frame_count(),
        metadata.channel_count(),
        metadata.sample_rate()
    );

    manager.save_to_file(&handle, "/tmp/ramp.wav", &SaveOptions::default())?;
    manager.free(&handle)?;
    println!("freed, live buffers: {:?}", manager.live_ids());
    Ok(())
}
