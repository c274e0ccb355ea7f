use std::sync::Arc;

use bufrelay::{
    Address, BufferManager, ChannelTransport, ClientConfig, Error, Message, ReplyCorrelator,
    Transport,
};

#[tokio::test]
async fn test_channel_transport_connection_state() {
    let (transport, mut outbound) = ChannelTransport::new();
    assert!(!transport.is_connected());
    assert_eq!(transport.send(Message::free_buffer(1)), Err(Error::NotConnected));

    transport.set_connected(true);
    transport.wait_connected().await;
    transport.send(Message::free_buffer(1)).unwrap();
    assert_eq!(outbound.recv().await, Some(Message::free_buffer(1)));

    drop(outbound);
    assert_eq!(transport.send(Message::free_buffer(2)), Err(Error::TransportLost));
}

/// Socket-task stand-in: answers allocations and metadata queries
async fn fake_server(
    mut requests: tokio::sync::mpsc::UnboundedReceiver<Message>,
    replies: tokio::sync::mpsc::UnboundedSender<Message>,
) {
    while let Some(request) = requests.recv().await {
        let reply = match request.address {
            Address::AllocBuffer => Some(Message::alloc_confirm(
                bufrelay::message::int_arg(&request.args, 0).unwrap(),
            )),
            Address::QueryMetadata => Some(Message::metadata_reply(
                bufrelay::message::int_arg(&request.args, 0).unwrap(),
                128,
                1,
                22050.0,
            )),
            _ => None,
        };
        if let Some(reply) = reply {
            if replies.send(reply).is_err() {
                break;
            }
        }
    }
}

#[tokio::test]
async fn test_manager_over_channel_transport() {
    let correlator = ReplyCorrelator::new();
    let (transport, requests) = ChannelTransport::new();
    let transport = Arc::new(transport);
    let (replies_tx, replies_rx) = tokio::sync::mpsc::unbounded_channel();

    let server = tokio::spawn(fake_server(requests, replies_tx));
    let pump = {
        let correlator = correlator.clone();
        tokio::spawn(async move { correlator.run_inbound(replies_rx).await })
    };

    let manager = BufferManager::new(
        Arc::clone(&transport),
        correlator.clone(),
        ClientConfig {
            fetch_metadata_on_create: false,
            ..ClientConfig::default()
        },
    )
    .unwrap();
    assert_eq!(
        manager.create_blocking(128, 1).await.unwrap_err(),
        Error::NotConnected
    );

    transport.set_connected(true);
    let handle = manager.create_blocking(128, 1).await.unwrap();
    let metadata = manager.query_metadata(&handle).await.unwrap();
    assert_eq!(metadata.frame_count(), 128);
    assert_eq!(metadata.sample_rate(), 22050.0);

    // Dropping the sending side ends the server, which closes the inbound stream
    drop(manager);
    drop(transport);
    server.await.unwrap();
    pump.await.unwrap();
    assert_eq!(correlator.total_outstanding(), 0);
}
