use lapin::{Channel, Connection};
use tokio::sync::mpsc;

use crate::error::ConnectionError;

/// Opens and re-opens a single named channel on top of whatever connection is
/// currently live. Each successfully opened channel is pushed onto `channels()`.
pub struct ChannelConnection {
    description: String,
    channels_tx: mpsc::Sender<Channel>,
    channels_rx: tokio::sync::Mutex<mpsc::Receiver<Channel>>,
}

impl ChannelConnection {
    pub fn new(description: impl Into<String>) -> Self {
        let (channels_tx, channels_rx) = mpsc::channel(1);
        Self {
            description: description.into(),
            channels_tx,
            channels_rx: tokio::sync::Mutex::new(channels_rx),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Awaits the next channel to become ready. Shared via `Arc` and guarded
    /// by an internal lock so the owning `Consumer`/`Publisher` can hold the
    /// `ChannelConnection` without exclusive access.
    pub async fn channels(&self) -> Option<Channel> {
        self.channels_rx.lock().await.recv().await
    }

    /// Opens a channel on `connection` and spawns a watcher that re-opens it
    /// whenever the broker closes it. Returns once the first channel is ready,
    /// or a `ConnectionError` if the initial open fails.
    pub async fn open(&self, connection: &Connection) -> Result<(), ConnectionError> {
        let description = self.description.clone();
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ConnectionError::ChannelFailed(format!("{} channel: {}", description, e)))?;

        let tx = self.channels_tx.clone();
        let reopen_description = description.clone();
        let reopen_connection = connection.clone();
        channel.on_error(move |err| {
            log::warn!(
                "rabbitmq-client: channel '{}' closed: {}",
                reopen_description,
                err
            );
            let tx = tx.clone();
            let description = reopen_description.clone();
            let connection = reopen_connection.clone();
            tokio::spawn(async move {
                reopen(&connection, &description, &tx).await;
            });
        });

        log::info!("rabbitmq-client: channel '{}' opened", description);
        self.channels_tx
            .send(channel)
            .await
            .map_err(|_| ConnectionError::ChannelFailed(format!("{} channel: receiver dropped", description)))
    }
}

async fn reopen(connection: &Connection, description: &str, tx: &mpsc::Sender<Channel>) {
    match connection.create_channel().await {
        Ok(channel) => {
            log::info!("rabbitmq-client: channel '{}' reopened", description);
            let tx2 = tx.clone();
            let description2 = description.to_string();
            let connection2 = connection.clone();
            channel.on_error(move |err| {
                log::warn!(
                    "rabbitmq-client: channel '{}' closed: {}",
                    description2,
                    err
                );
                let tx2 = tx2.clone();
                let description2 = description2.clone();
                let connection2 = connection2.clone();
                tokio::spawn(async move {
                    reopen(&connection2, &description2, &tx2).await;
                });
            });
            let _ = tx.send(channel).await;
        }
        Err(err) => {
            log::error!(
                "rabbitmq-client: failed to reopen channel '{}': {}",
                description,
                err
            );
        }
    }
}
