//! Round-trip demo: an instrument server and a client exchanging JSON
//! envelopes on localhost, with the shared performance stack reporting
//! its metrics at the end.
//!
//! Run with `cargo run --example tcp_demo`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use skyberry_core::{
    CommContext, CommunicationMessage, DeviceCommunicator, TcpCommunicator, TcpConnectionConfig,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    let context = CommContext::with_defaults().await;

    // Observatory-side server.
    let server = TcpCommunicator::with_context(TcpConnectionConfig::default(), &context);
    let server_config = TcpConnectionConfig::server(8002).bind_interface("127.0.0.1");
    if !server.connect(&server_config).await {
        eprintln!("failed to start the server on port 8002");
        return;
    }
    let port = server.local_port().unwrap_or(8002);

    // The server answers every command with an ack broadcast.
    {
        let responder = Arc::downgrade(&server);
        server.set_message_callback(Arc::new(move |message| {
            println!("server <- {} ({})", message.command, message.message_id);
            let Some(responder) = responder.upgrade() else { return };
            let ack = CommunicationMessage::new(
                "",
                "ack",
                json!({ "acked": message.message_id, "command": message.command }),
            );
            tokio::spawn(async move {
                responder.send_message(ack).await;
            });
        }));
    }

    // Instrument client.
    let client = TcpCommunicator::with_context(TcpConnectionConfig::default(), &context);
    client.set_message_callback(Arc::new(|message| {
        println!("client <- {} {}", message.command, message.payload);
    }));
    if !client.connect(&TcpConnectionConfig::client("127.0.0.1", port)).await {
        eprintln!("failed to connect the client");
        return;
    }

    for (command, payload) in [
        ("slew", json!({"ra": 5.58, "dec": -5.39})),
        ("expose", json!({"seconds": 120, "filter": "Ha"})),
        ("park", json!({})),
    ] {
        let response = client
            .send_message(CommunicationMessage::new("", command, payload))
            .await;
        println!(
            "client -> {} accepted={} in {}ms",
            command, response.success, response.response_time
        );
    }

    // Let the batches flush and the acks come back.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let stats = client.statistics();
    println!(
        "client stats: sent={} received={} avg_response={:.2}ms",
        stats.messages_sent, stats.messages_received, stats.average_response_time
    );
    let optimizer = context.optimizer().metrics();
    println!(
        "serializer: {} serializations, {} cache hits",
        optimizer.total_serializations, optimizer.cache_hits
    );
    println!("string pool hit ratio: {:.2}", context.string_pool().hit_ratio());

    client.disconnect().await;
    server.disconnect().await;
    context.shutdown().await;
}
