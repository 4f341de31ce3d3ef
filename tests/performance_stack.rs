//! The performance subsystems working together behind the façade: a
//! shared context feeding real traffic through the serialization cache
//! and the string pool.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use skyberry_core::{
    CommContext, CommunicationMessage, DeviceCommunicator, MemoryPoolConfig,
    SerializationOptimizerConfig, TcpCommunicator, TcpConnectionConfig,
};

async fn context() -> Arc<CommContext> {
    CommContext::initialize(
        MemoryPoolConfig::small(4, 32),
        SerializationOptimizerConfig {
            enable_async_serialization: false,
            ..Default::default()
        },
    )
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_sends_hit_the_serialization_cache() {
    let context = context().await;

    let server = TcpCommunicator::with_context(TcpConnectionConfig::default(), &context);
    assert!(
        server
            .connect(&TcpConnectionConfig::server(0).bind_interface("127.0.0.1"))
            .await
    );
    let port = server.local_port().unwrap();

    let client = TcpCommunicator::with_context(TcpConnectionConfig::default(), &context);
    assert!(client.connect(&TcpConnectionConfig::client("127.0.0.1", port)).await);

    // Identical envelopes (fixed id and timestamp) serialize once and
    // hit the cache afterwards.
    let template = CommunicationMessage {
        message_id: String::from("status_1"),
        device_id: String::new(),
        command: String::from("weather"),
        payload: json!({"cloud_cover": 0.1, "wind_kph": 12}),
        timestamp: 1_735_689_600_000,
        priority: 0,
    };
    for _ in 0..5 {
        let response = client.send_message(template.clone()).await;
        assert!(response.success);
    }

    let metrics = context.optimizer().metrics();
    assert!(metrics.cache_hits >= 4, "cache hits: {}", metrics.cache_hits);

    // The wire buffers came out of the shared string pool.
    assert!(context.string_pool().hit_ratio() > 0.0);

    client.disconnect().await;
    server.disconnect().await;
    context.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn burst_through_shared_context_keeps_stats_consistent() {
    let context = context().await;

    let server = TcpCommunicator::with_context(TcpConnectionConfig::default(), &context);
    assert!(
        server
            .connect(&TcpConnectionConfig::server(0).bind_interface("127.0.0.1"))
            .await
    );
    let port = server.local_port().unwrap();

    let received = Arc::new(Mutex::new(0usize));
    {
        let received = Arc::clone(&received);
        server.set_message_callback(Arc::new(move |_| {
            *received.lock().unwrap() += 1;
        }));
    }

    let client = TcpCommunicator::with_context(TcpConnectionConfig::default(), &context);
    assert!(client.connect(&TcpConnectionConfig::client("127.0.0.1", port)).await);

    for i in 0..20 {
        let message = CommunicationMessage::new("", "frame", json!({"seq": i}));
        assert!(client.send_message(message).await.success);
    }

    for _ in 0..500 {
        if *received.lock().unwrap() >= 20 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*received.lock().unwrap(), 20);
    assert_eq!(server.statistics().messages_received, 20);
    assert_eq!(client.statistics().messages_sent, 20);

    client.disconnect().await;
    server.disconnect().await;
    context.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn global_context_handle_lifecycle() {
    assert!(skyberry_core::context::global().is_none());

    let context = context().await;
    skyberry_core::context::init_global(Arc::clone(&context));
    let fetched = skyberry_core::context::global().expect("installed");
    assert!(Arc::ptr_eq(&fetched, &context));

    skyberry_core::context::shutdown_global().await;
    assert!(skyberry_core::context::global().is_none());
    assert!(context.string_pool().acquire().is_none());
}
