use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use tokio::sync::watch;

use crate::config::PublisherConfig;
use crate::connection::ConnectionManager;
use crate::error::PublisherError;

const READY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub priority: u8,
    pub pattern: String,
    pub publish_to_queue: Option<String>,
}

/// Publishes to a configured exchange (or directly to a queue), gated on
/// readiness so a mid-reconnect publish fails fast instead of hanging. Wires
/// mandatory delivery (so unroutable messages come back as returns, logged
/// rather than silently dropped) and, when `confirmable` is set, publisher
/// confirms.
pub struct Publisher {
    channel: watch::Receiver<Option<Channel>>,
    ready: watch::Receiver<bool>,
    exchange: String,
    confirmable: bool,
}

impl Publisher {
    pub async fn start(manager: Arc<ConnectionManager>, config: PublisherConfig) -> Result<Self, PublisherError> {
        let description = format!("publisher for {}", config.exchange.name);
        let channel_conn = manager.open_channel(description).await;

        let (channel_tx, channel_rx) = watch::channel(None);
        let (ready_tx, mut ready_rx_for_wait) = watch::channel(false);
        let ready_rx = ready_rx_for_wait.clone();

        let exchange = config.exchange.clone();
        let confirmable = config.confirmable;
        let channel_conn_for_task = channel_conn.clone();
        tokio::spawn(async move {
            loop {
                let Some(channel) = channel_conn_for_task.channels().await else {
                    let _ = ready_tx.send(false);
                    return;
                };
                let _ = ready_tx.send(false);

                if let Err(err) = prepare_channel(&channel, &exchange.name, exchange.kind.as_lapin(), confirmable).await {
                    log::error!("rabbitmq-client: publisher setup failed: {}", err);
                    continue;
                }

                register_return_listener(&channel);

                let _ = channel_tx.send(Some(channel));
                let _ = ready_tx.send(true);
            }
        });

        tokio::time::timeout(READY_TIMEOUT, ready_rx_for_wait.wait_for(|ready| *ready))
            .await
            .map_err(|_| PublisherError::ReadyTimeout)?
            .map_err(|_| PublisherError::ReadyTimeout)?;

        Ok(Self {
            channel: channel_rx,
            ready: ready_rx,
            exchange: config.exchange.name.clone(),
            confirmable,
        })
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Publishes `body`. Fails immediately without touching the broker if the
    /// publisher is not currently ready.
    pub async fn publish(&self, body: &[u8], options: PublishOptions) -> Result<(), PublisherError> {
        if !self.is_ready() {
            return Err(PublisherError::NotReady);
        }
        let channel = self.channel.borrow().clone().ok_or(PublisherError::NotReady)?;

        let (exchange, routing_key) = match &options.publish_to_queue {
            Some(queue) => (String::new(), queue.clone()),
            None => (self.exchange.clone(), options.pattern.clone()),
        };

        let properties = BasicProperties::default().with_priority(options.priority);

        let confirm = channel
            .basic_publish(
                &exchange,
                &routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                body,
                properties,
            )
            .await
            .map_err(|e| PublisherError::PublishFailed(e.to_string()))?;

        if self.confirmable {
            confirm
                .await
                .map_err(|e| PublisherError::NotConfirmed(e.to_string()))?;
        }

        Ok(())
    }
}

async fn prepare_channel(
    channel: &Channel,
    exchange_name: &str,
    kind: lapin::ExchangeKind,
    confirmable: bool,
) -> Result<(), PublisherError> {
    channel
        .exchange_declare(
            exchange_name,
            kind,
            ExchangeDeclareOptions {
                durable: true,
                auto_delete: false,
                internal: false,
                nowait: false,
                passive: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| PublisherError::PublishFailed(format!("exchange declare: {}", e)))?;

    if confirmable {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| PublisherError::PublishFailed(format!("confirm_select: {}", e)))?;
    }

    Ok(())
}

fn register_return_listener(channel: &Channel) {
    let logged_once = Arc::new(AtomicBool::new(false));
    channel.on_return(move |ret| {
        logged_once.store(true, Ordering::SeqCst);
        log::warn!(
            "rabbitmq-client: publish returned (unroutable): exchange={} routing_key={} reply_text={}",
            ret.exchange,
            ret.routing_key,
            ret.reply_text
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_publish_options_are_unprioritized_fanout() {
        let options = PublishOptions::default();
        assert_eq!(options.priority, 0);
        assert!(options.publish_to_queue.is_none());
    }
}
