use std::sync::Arc;

use futures_util::stream::StreamExt;
use lapin::options::BasicConsumeOptions;
use lapin::types::FieldTable;
use lapin::Channel;
use tokio::sync::{mpsc, watch};

use crate::config::ConsumerConfig;
use crate::connection::{ChannelConnection, ConnectionManager};
use crate::error::ConsumerError;
use crate::message::Message;
use crate::topology::TopologyOrchestrator;

/// Subscribes to a service's main queue and wraps each broker delivery as a
/// `Message`. Uses three dedicated channels (consume, dead-letter publish,
/// retry publish) so that acking or publishing a retry is never blocked by
/// the main channel's own prefetch/flow-control state.
pub struct Consumer {
    messages_rx: mpsc::Receiver<Message>,
    ready_rx: watch::Receiver<bool>,
}

impl Consumer {
    pub async fn start(manager: Arc<ConnectionManager>, config: ConsumerConfig) -> Self {
        let (messages_tx, messages_rx) = mpsc::channel(128);
        let (ready_tx, ready_rx) = watch::channel(false);

        let main_channel_conn = manager.open_channel(format!("{} main queue", config.service)).await;
        let dle_channel_conn = manager.open_channel(format!("{} dead-letter publish", config.service)).await;
        let retry_channel_conn = manager.open_channel(format!("{} retry publish", config.service)).await;

        let (dle_tx, dle_rx) = watch::channel(None);
        let (retry_tx, retry_rx) = watch::channel(None);

        let dle_exchange = config.exchange.dead_letter();
        let retry_exchange = config.exchange.retry_later();
        tokio::spawn(track_dead_letter_channel(
            dle_channel_conn,
            config.exchange.clone(),
            config.queue.clone(),
            dle_tx,
        ));
        tokio::spawn(track_retry_later_channel(
            retry_channel_conn,
            config.exchange.clone(),
            config.queue.clone(),
            retry_tx,
        ));

        tokio::spawn(run(
            config,
            main_channel_conn,
            dle_rx,
            retry_rx,
            dle_exchange,
            retry_exchange,
            messages_tx,
            ready_tx,
        ));

        Self { messages_rx, ready_rx }
    }

    pub async fn next_message(&mut self) -> Option<Message> {
        self.messages_rx.recv().await
    }

    pub fn into_receiver(self) -> mpsc::Receiver<Message> {
        self.messages_rx
    }

    /// Resolves once the main/dead-letter/retry-later topology has been
    /// declared and bound and consumption has begun.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }
}

/// Redeclares the dead-letter exchange/queue each time the dedicated
/// dead-letter channel (re)opens, independent of the main channel's lifecycle,
/// and publishes the resulting channel handle for `run` to read.
async fn track_dead_letter_channel(
    channel_conn: Arc<ChannelConnection>,
    exchange: crate::config::ExchangeSpec,
    queue: crate::config::QueueSpec,
    tx: watch::Sender<Option<Channel>>,
) {
    while let Some(channel) = channel_conn.channels().await {
        if let Err(err) = TopologyOrchestrator::setup_dead_letter(&channel, &exchange, &queue).await {
            log::error!("rabbitmq-client: dead-letter topology setup failed: {}", err);
            continue;
        }
        let _ = tx.send(Some(channel));
    }
}

/// Mirror of `track_dead_letter_channel` for the retry-later topology.
async fn track_retry_later_channel(
    channel_conn: Arc<ChannelConnection>,
    exchange: crate::config::ExchangeSpec,
    queue: crate::config::QueueSpec,
    tx: watch::Sender<Option<Channel>>,
) {
    while let Some(channel) = channel_conn.channels().await {
        if let Err(err) = TopologyOrchestrator::setup_retry_later(&channel, &exchange, &queue).await {
            log::error!("rabbitmq-client: retry-later topology setup failed: {}", err);
            continue;
        }
        let _ = tx.send(Some(channel));
    }
}

/// Driven solely by the main channel's stream: a channel-level exception that
/// closes only the main channel (connection otherwise alive) re-emits here
/// without requiring the DLE/retry channels to reopen. Each delivery reads
/// the latest known DLE/retry channel independently, so those can rotate
/// mid-stream without interrupting main-queue consumption.
async fn run(
    config: ConsumerConfig,
    main_channel_conn: Arc<ChannelConnection>,
    mut dle_rx: watch::Receiver<Option<Channel>>,
    mut retry_rx: watch::Receiver<Option<Channel>>,
    dle_exchange: String,
    retry_later_exchange: String,
    messages_tx: mpsc::Sender<Message>,
    ready_tx: watch::Sender<bool>,
) {
    while let Some(main_channel) = main_channel_conn.channels().await {
        let _ = ready_tx.send(false);

        if dle_rx.borrow().is_none() && dle_rx.wait_for(|c| c.is_some()).await.is_err() {
            log::error!("rabbitmq-client: consumer '{}' lost its dead-letter channel source", config.service);
            return;
        }
        if retry_rx.borrow().is_none() && retry_rx.wait_for(|c| c.is_some()).await.is_err() {
            log::error!("rabbitmq-client: consumer '{}' lost its retry channel source", config.service);
            return;
        }

        if let Err(err) = setup_and_consume(
            &config,
            &main_channel,
            &dle_rx,
            &retry_rx,
            &dle_exchange,
            &retry_later_exchange,
            &messages_tx,
            &ready_tx,
        )
        .await
        {
            log::error!("rabbitmq-client: consumer '{}' topology setup failed: {}", config.service, err);
            let _ = ready_tx.send(false);
        }
    }
}

async fn setup_and_consume(
    config: &ConsumerConfig,
    main_channel: &Channel,
    dle_rx: &watch::Receiver<Option<Channel>>,
    retry_rx: &watch::Receiver<Option<Channel>>,
    dle_exchange: &str,
    retry_later_exchange: &str,
    messages_tx: &mpsc::Sender<Message>,
    ready_tx: &watch::Sender<bool>,
) -> Result<(), ConsumerError> {
    TopologyOrchestrator::setup_main(main_channel, &config.exchange, &config.queue).await?;

    let mut consumer = main_channel
        .basic_consume(
            &config.queue.name,
            &format!("{}-consumer", config.service),
            BasicConsumeOptions {
                no_ack: false,
                exclusive: false,
                no_local: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| ConsumerError::ConsumerRegistrationFailed(e.to_string()))?;

    let _ = ready_tx.send(true);
    log::info!(
        "rabbitmq-client: consumer '{}' bound to queue '{}'",
        config.service,
        config.queue.name
    );

    let retry_limit = config.queue.retry_limit;

    while let Some(delivery_res) = consumer.next().await {
        let delivery = match delivery_res {
            Ok(d) => d,
            Err(e) => {
                log::error!("rabbitmq-client: consumer '{}' delivery error: {}", config.service, e);
                break;
            }
        };

        let Some(dle_channel) = dle_rx.borrow().clone() else {
            log::error!("rabbitmq-client: consumer '{}' has no dead-letter channel, dropping delivery", config.service);
            continue;
        };
        let Some(retry_channel) = retry_rx.borrow().clone() else {
            log::error!("rabbitmq-client: consumer '{}' has no retry channel, dropping delivery", config.service);
            continue;
        };

        let message = Message::new(
            delivery,
            main_channel.clone(),
            dle_channel,
            retry_channel,
            dle_exchange.to_string(),
            retry_later_exchange.to_string(),
            retry_limit,
        );

        if messages_tx.send(message).await.is_err() {
            return Ok(());
        }
    }

    Ok(())
}
