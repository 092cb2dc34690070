use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::Channel;

use crate::config::{ExchangeSpec, QueueSpec};
use crate::error::TopologyError;

const EXCHANGE_OPTIONS: ExchangeDeclareOptions = ExchangeDeclareOptions {
    durable: true,
    auto_delete: false,
    internal: false,
    nowait: false,
    passive: false,
};

const QUEUE_OPTIONS: QueueDeclareOptions = QueueDeclareOptions {
    durable: true,
    exclusive: false,
    auto_delete: false,
    nowait: false,
    passive: false,
};

/// Declares the four exchanges and three queues that implement bounded delayed
/// retry and dead-lettering for one consumer, and performs all bindings.
pub struct TopologyOrchestrator;

impl TopologyOrchestrator {
    /// Declares the main exchange and main queue, and binds the queue to the
    /// main exchange (one binding per routing pattern) and to the retry-now
    /// exchange (pattern `#`, the path by which retried messages return).
    pub async fn setup_main(channel: &Channel, exchange: &ExchangeSpec, queue: &QueueSpec) -> Result<(), TopologyError> {
        declare_exchange(channel, &exchange.name, exchange.kind.as_lapin()).await?;
        declare_exchange(channel, &exchange.retry_now(), exchange.kind.as_lapin()).await?;

        let mut args = FieldTable::default();
        if queue.max_priority > 0 {
            args.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(queue.max_priority));
        }
        declare_queue(channel, &queue.name, args).await?;

        for pattern in &queue.patterns {
            bind_queue(channel, &queue.name, &exchange.name, pattern).await?;
        }
        bind_queue(channel, &queue.name, &exchange.retry_now(), "#").await?;

        channel
            .basic_qos(queue.prefetch_count, Default::default())
            .await
            .map_err(|e| TopologyError::QueueDeclarationFailed {
                name: queue.name.clone(),
                source: format!("basic_qos: {}", e),
            })?;

        Ok(())
    }

    /// Declares the dead-letter exchange and DLQ, and binds them.
    pub async fn setup_dead_letter(channel: &Channel, exchange: &ExchangeSpec, queue: &QueueSpec) -> Result<(), TopologyError> {
        let dle = exchange.dead_letter();
        declare_exchange(channel, &dle, exchange.kind.as_lapin()).await?;
        let dlq = queue.dlq();
        declare_queue(channel, &dlq, FieldTable::default()).await?;
        bind_queue(channel, &dlq, &dle, "#").await?;
        Ok(())
    }

    /// Declares the retry-later exchange and queue. The queue's arguments make
    /// the broker dead-letter expired messages onto the retry-now exchange,
    /// which is already bound back into the main queue by `setup_main`.
    pub async fn setup_retry_later(channel: &Channel, exchange: &ExchangeSpec, queue: &QueueSpec) -> Result<(), TopologyError> {
        let retry_later_exchange = exchange.retry_later();
        declare_exchange(channel, &retry_later_exchange, exchange.kind.as_lapin()).await?;

        let mut args = FieldTable::default();
        args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString(exchange.retry_now().into()));
        args.insert("x-message-ttl".into(), AMQPValue::LongInt(queue.requeue_ttl_ms));
        args.insert("x-dead-letter-routing-key".into(), AMQPValue::LongString("#".into()));

        let retry_later_queue = queue.retry_later_queue();
        declare_queue(channel, &retry_later_queue, args).await?;
        bind_queue(channel, &retry_later_queue, &retry_later_exchange, "#").await?;
        Ok(())
    }
}

async fn declare_exchange(channel: &Channel, name: &str, kind: lapin::ExchangeKind) -> Result<(), TopologyError> {
    channel
        .exchange_declare(name, kind, EXCHANGE_OPTIONS, FieldTable::default())
        .await
        .map_err(|e| TopologyError::ExchangeDeclarationFailed {
            name: name.to_string(),
            source: e.to_string(),
        })
}

async fn declare_queue(channel: &Channel, name: &str, args: FieldTable) -> Result<(), TopologyError> {
    channel
        .queue_declare(name, QUEUE_OPTIONS, args)
        .await
        .map_err(|e| TopologyError::QueueDeclarationFailed {
            name: name.to_string(),
            source: e.to_string(),
        })?;
    Ok(())
}

async fn bind_queue(channel: &Channel, queue: &str, exchange: &str, pattern: &str) -> Result<(), TopologyError> {
    channel
        .queue_bind(queue, exchange, pattern, QueueBindOptions::default(), FieldTable::default())
        .await
        .map_err(|e| TopologyError::QueueBindFailed {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            source: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExchangeKind;

    #[test]
    fn derived_names_match_spec_convention() {
        let exchange = ExchangeSpec::new("orders", ExchangeKind::Fanout, "svc", 1000);
        assert_eq!(exchange.retry_now(), "orders-for-svc-retry-now");
        assert_eq!(exchange.dead_letter(), "orders-for-svc-dle");
    }
}
