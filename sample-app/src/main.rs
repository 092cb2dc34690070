use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rabbitmq_client::config::{ConnectionConfig, ConsumerConfig, ExchangeKind, ExchangeSpec, QueueSpec};
use rabbitmq_client::{start_workers, Consumer, ConnectionManager, Handler, Message, PublishOptions, Publisher};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;

#[derive(Serialize, Deserialize, Debug)]
struct ExampleEvent {
    id: i32,
    message: String,
    timestamp: DateTime<Utc>,
}

struct PrintHandler;

#[async_trait]
impl Handler<Message> for PrintHandler {
    async fn handle(&self, message: Message) {
        match serde_json::from_slice::<ExampleEvent>(message.body()) {
            Ok(event) => println!(
                "received event id={} message={} routing_key={}",
                event.id,
                event.message,
                message.routing_key()
            ),
            Err(e) => println!("received undecodable body: {}", e),
        }

        if let Err(e) = message.ack().await {
            eprintln!("failed to ack: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let connection = ConnectionConfig::from_env();
    let manager = Arc::new(ConnectionManager::new(connection.clone()));

    let exchange = ExchangeSpec::new("sample-events", ExchangeKind::Fanout, "sample-app", 5_000);
    let queue = QueueSpec::new("sample-events", "sample-app", 5_000).with_retry_limit(3);
    let consumer_config = ConsumerConfig::new(connection, exchange, queue, "sample-app");

    let publisher_config = consumer_config.publisher_config(true);

    let consumer = Consumer::start(manager.clone(), consumer_config).await;
    let messages = ReceiverStream::new(consumer.into_receiver());

    tokio::spawn(start_workers(messages, Arc::new(PrintHandler), 5));

    let publisher = Publisher::start(manager, publisher_config).await?;
    let startup_event = ExampleEvent {
        id: 1,
        message: "sample-app started".to_string(),
        timestamp: Utc::now(),
    };
    publisher
        .publish(&serde_json::to_vec(&startup_event)?, PublishOptions::default())
        .await?;

    println!("sample-app running, press Ctrl+C to stop...");
    tokio::signal::ctrl_c().await?;
    println!("shutting down...");

    Ok(())
}
