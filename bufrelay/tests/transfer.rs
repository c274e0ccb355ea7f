use std::sync::Arc;
use std::time::Duration;

use bufrelay::{
    Address, Arg, Error, LoopbackServer, Message, ReplyCorrelator, TransferEngine, Transport,
};

const BUFFER: i32 = 0;

#[allow(clippy::cast_precision_loss)]
fn ramp(len: usize) -> Vec<f32> {
    (0..len).map(|i| i as f32).collect()
}

/// Server with buffer 0 holding a ramp of `len` samples, and an engine on top
fn setup(len: usize, max_chunk: usize) -> (Arc<LoopbackServer>, ReplyCorrelator, Arc<TransferEngine<LoopbackServer>>) {
    let correlator = ReplyCorrelator::new();
    let server = Arc::new(LoopbackServer::new(correlator.clone()));
    let frames = i32::try_from(len).unwrap();
    server.send(Message::alloc_buffer(BUFFER, frames, 1)).unwrap();
    server.send(Message::write_chunk(BUFFER, 0, &ramp(len))).unwrap();
    let engine = Arc::new(TransferEngine::new(
        Arc::clone(&server),
        correlator.clone(),
        max_chunk,
        None,
    ));
    (server, correlator, engine)
}

async fn until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn read_requests(server: &LoopbackServer) -> Vec<Vec<Arg>> {
    server
        .sent_to(Address::ReadChunk)
        .into_iter()
        .map(|m| m.args)
        .collect()
}

#[tokio::test]
async fn test_read_splits_into_chunks() {
    let (server, correlator, engine) = setup(2500, 1000);

    let samples = engine.read(BUFFER, 0, 2500).await.unwrap();

    assert_eq!(samples, ramp(2500));
    assert_eq!(
        read_requests(&server),
        vec![
            vec![Arg::Int(0), Arg::Int(0), Arg::Int(1000)],
            vec![Arg::Int(0), Arg::Int(1000), Arg::Int(1000)],
            vec![Arg::Int(0), Arg::Int(2000), Arg::Int(500)],
        ]
    );
    assert_eq!(correlator.total_outstanding(), 0);
}

#[tokio::test]
async fn test_read_from_offset() {
    let (_server, _correlator, engine) = setup(100, 16);
    let samples = engine.read(BUFFER, 40, 50).await.unwrap();
    assert_eq!(samples, ramp(100)[40..90].to_vec());
}

#[tokio::test]
async fn test_read_of_zero_samples_sends_nothing() {
    let (server, _correlator, engine) = setup(10, 4);
    assert_eq!(engine.read(BUFFER, 3, 0).await.unwrap(), Vec::<f32>::new());
    assert!(read_requests(&server).is_empty());
}

#[tokio::test]
async fn test_reassembly_ignores_arrival_order() {
    let (server, _correlator, engine) = setup(2500, 1000);
    server.hold_replies(true);

    let forward = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.read(BUFFER, 0, 2500).await })
    };
    until(|| server.held_count() == 3).await;
    assert_eq!(server.release_replies(), 3);
    let forward = forward.await.unwrap().unwrap();

    let reversed = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.read(BUFFER, 0, 2500).await })
    };
    until(|| server.held_count() == 3).await;
    assert_eq!(server.release_replies_reversed(), 3);
    let reversed = reversed.await.unwrap().unwrap();

    assert_eq!(forward, ramp(2500));
    assert_eq!(reversed, forward);
}

#[tokio::test]
async fn test_no_partial_result_while_chunks_missing() {
    let (server, correlator, engine) = setup(20, 10);
    server.hold_replies(true);

    let read = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.read(BUFFER, 0, 20).await })
    };
    until(|| server.held_count() == 2).await;

    // Deliver only the second chunk by hand
    assert!(correlator.deliver(Message::read_chunk_reply(BUFFER, 10, &ramp(20)[10..])));
    tokio::task::yield_now().await;
    assert!(!read.is_finished());

    assert!(correlator.deliver(Message::read_chunk_reply(BUFFER, 0, &ramp(20)[..10])));
    assert_eq!(read.await.unwrap().unwrap(), ramp(20));
}

#[tokio::test]
async fn test_transport_loss_fails_outstanding_chunks() {
    let (server, correlator, engine) = setup(2000, 1000);
    server.hold_replies(true);

    let read = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.read(BUFFER, 0, 2000).await })
    };
    until(|| server.held_count() == 2).await;
    assert_eq!(correlator.total_outstanding(), 2);

    server.disconnect();

    assert_eq!(read.await.unwrap(), Err(Error::TransportLost));
    assert_eq!(correlator.total_outstanding(), 0);
}

#[tokio::test]
async fn test_read_while_disconnected_fails_to_send() {
    let (server, correlator, engine) = setup(100, 10);
    server.disconnect();
    assert_eq!(engine.read(BUFFER, 0, 100).await, Err(Error::NotConnected));
    assert_eq!(correlator.total_outstanding(), 0);
}

#[tokio::test]
async fn test_chunk_with_wrong_sample_count_aborts_transfer() {
    let (server, correlator, engine) = setup(4, 2);
    server.hold_replies(true);

    let read = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.read(BUFFER, 0, 4).await })
    };
    until(|| server.held_count() == 2).await;

    // Matches the first chunk's key but carries three samples for a length of two
    let bogus = Message::new(
        Address::ReadChunkReply,
        vec![
            Arg::Int(BUFFER),
            Arg::Int(0),
            Arg::Int(2),
            Arg::Float(0.0),
            Arg::Float(0.0),
            Arg::Float(0.0),
        ],
    );
    assert!(correlator.deliver(bogus));

    assert!(matches!(read.await.unwrap(), Err(Error::MalformedReply(_))));
    assert_eq!(correlator.total_outstanding(), 0);
}

/// Start `read(0, 4)` with two-sample chunks and hold both replies
async fn held_four_sample_read(
) -> (Arc<LoopbackServer>, ReplyCorrelator, tokio::task::JoinHandle<Result<Vec<f32>, Error>>) {
    let (server, correlator, engine) = setup(4, 2);
    server.hold_replies(true);
    let read = tokio::spawn(async move { engine.read(BUFFER, 0, 4).await });
    until(|| server.held_count() == 2).await;
    (server, correlator, read)
}

#[tokio::test]
async fn test_chunk_overflowing_destination_aborts_transfer() {
    let (_server, correlator, read) = held_four_sample_read().await;

    // Three samples from offset 2 run past the four-sample destination
    let overflow = Message::read_chunk_reply(BUFFER, 2, &[0.0, 0.0, 0.0]);
    assert!(correlator.deliver(overflow));

    assert!(matches!(read.await.unwrap(), Err(Error::MalformedReply(_))));
    assert_eq!(correlator.total_outstanding(), 0);
}

#[tokio::test]
async fn test_chunk_for_wrong_buffer_aborts_transfer() {
    let (_server, correlator, read) = held_four_sample_read().await;

    assert!(correlator.deliver(Message::read_chunk_reply(7, 0, &[0.0, 0.0])));

    assert!(matches!(read.await.unwrap(), Err(Error::MalformedReply(_))));
    assert_eq!(correlator.total_outstanding(), 0);
}

#[tokio::test]
async fn test_failure_of_later_chunk_aborts_without_waiting_for_earlier() {
    let (_server, correlator, read) = held_four_sample_read().await;

    // Second chunk's key, but one sample short; the first chunk never arrives
    let short = Message::new(
        Address::ReadChunkReply,
        vec![Arg::Int(BUFFER), Arg::Int(2), Arg::Int(2), Arg::Float(0.0)],
    );
    assert!(correlator.deliver(short));

    assert!(matches!(read.await.unwrap(), Err(Error::MalformedReply(_))));
    assert_eq!(correlator.total_outstanding(), 0);
}

#[tokio::test]
async fn test_cancelled_read_releases_expectations() {
    let (server, correlator, engine) = setup(3000, 1000);
    server.hold_replies(true);

    let read = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.read(BUFFER, 0, 3000).await })
    };
    until(|| server.held_count() == 3).await;
    assert_eq!(correlator.total_outstanding(), 3);

    read.abort();
    assert!(read.await.unwrap_err().is_cancelled());
    assert_eq!(correlator.total_outstanding(), 0);

    // Late replies find nobody and are dropped
    assert_eq!(server.release_replies(), 0);
}

#[tokio::test]
async fn test_read_timeout() {
    let correlator = ReplyCorrelator::new();
    let server = Arc::new(LoopbackServer::new(correlator.clone()));
    server.send(Message::alloc_buffer(BUFFER, 8, 1)).unwrap();
    server.hold_replies(true);
    let engine = TransferEngine::new(
        Arc::clone(&server),
        correlator.clone(),
        4,
        Some(Duration::from_millis(20)),
    );

    assert_eq!(engine.read(BUFFER, 0, 8).await, Err(Error::Timeout));
    assert_eq!(correlator.total_outstanding(), 0);
}

#[tokio::test]
async fn test_write_goes_out_as_one_message() {
    let (server, _correlator, engine) = setup(5000, 1000);
    let values = vec![0.5; 3000];

    engine.write(BUFFER, 1000, &values).unwrap();

    let writes = server.sent_to(Address::WriteChunk);
    // The first write is the ramp from setup
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].args.len(), 3 + 3000);
    assert_eq!(writes[1].args[1], Arg::Int(1000));
    assert_eq!(writes[1].args[2], Arg::Int(3000));

    let stored = server.samples(BUFFER).unwrap();
    assert_eq!(stored[999], 999.0);
    assert!(stored[1000..4000].iter().all(|v| *v == 0.5));
    assert_eq!(stored[4000], 4000.0);
}

#[tokio::test]
async fn test_empty_write_sends_nothing() {
    let (server, _correlator, engine) = setup(10, 4);
    let before = server.sent().len();
    engine.write(BUFFER, 3, &[]).unwrap();
    assert_eq!(server.sent().len(), before);
}

#[tokio::test]
async fn test_write_beyond_protocol_integers() {
    let (server, _correlator, engine) = setup(10, 4);
    let start = usize::try_from(i32::MAX).unwrap();
    assert!(matches!(
        engine.write(BUFFER, start, &[1.0]),
        Err(Error::OutOfRange(_))
    ));
    assert!(matches!(
        engine.read(BUFFER, start, 1).await,
        Err(Error::OutOfRange(_))
    ));
    assert!(read_requests(&server).is_empty());
}
