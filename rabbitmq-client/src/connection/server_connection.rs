use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use lapin::{Connection, ConnectionProperties};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;

const HEARTBEAT_SECS: u16 = 900;

/// Owns at most one live broker connection at a time, dialing with exponential
/// backoff and re-dialing transparently whenever the current connection closes.
pub struct ServerConnection {
    connections: mpsc::Receiver<Connection>,
    blocked: watch::Receiver<bool>,
}

impl ServerConnection {
    pub fn start(config: ConnectionConfig, shutdown: CancellationToken) -> Self {
        let (conn_tx, conn_rx) = mpsc::channel(1);
        let (blocked_tx, blocked_rx) = watch::channel(false);

        tokio::spawn(dial_loop(config, conn_tx, blocked_tx, shutdown));

        Self {
            connections: conn_rx,
            blocked: blocked_rx,
        }
    }

    /// Yields a new live connection each time one becomes available (after the
    /// initial dial and after every reconnect).
    pub async fn next_connection(&mut self) -> Option<Connection> {
        self.connections.recv().await
    }

    pub fn blocked(&self) -> watch::Receiver<bool> {
        self.blocked.clone()
    }
}

async fn dial_loop(
    config: ConnectionConfig,
    conn_tx: mpsc::Sender<Connection>,
    blocked_tx: watch::Sender<bool>,
    shutdown: CancellationToken,
) {
    let backoff_builder = ExponentialBuilder::default()
        .with_factor(2.0)
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(60))
        .without_max_times();
    let mut backoff = backoff_builder.build();

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let props = ConnectionProperties::default()
            .with_heartbeat(HEARTBEAT_SECS);

        match Connection::connect(config.url(), props).await {
            Ok(connection) => {
                log::info!(
                    "rabbitmq-client: connected to {}",
                    config.masked_url()
                );
                backoff = backoff_builder.build();

                let (closed_tx, mut closed_rx) = mpsc::channel::<()>(1);
                connection.on_error(move |err| {
                    log::warn!("rabbitmq-client: connection error: {}", err);
                    let _ = closed_tx.try_send(());
                });

                if conn_tx.send(connection.clone()).await.is_err() {
                    return;
                }

                register_blocked_listener(&connection, blocked_tx.clone());

                tokio::select! {
                    _ = closed_rx.recv() => {
                        log::warn!("rabbitmq-client: connection closed, reconnecting");
                    }
                    _ = shutdown.cancelled() => {
                        let _ = connection.close(0, "shutdown").await;
                        return;
                    }
                }
            }
            Err(err) => {
                let delay = backoff.next().unwrap_or(Duration::from_secs(60));
                log::warn!(
                    "rabbitmq-client: failed to connect to {}: {} (retrying in {:?})",
                    config.masked_url(),
                    err,
                    delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }
}

fn register_blocked_listener(connection: &Connection, blocked_tx: watch::Sender<bool>) {
    let tx_blocked = blocked_tx.clone();
    connection.on_blocked(move |reason| {
        log::warn!("rabbitmq-client: connection blocked: {}", reason);
        let _ = tx_blocked.send(true);
    });
    connection.on_unblocked(move || {
        let _ = blocked_tx.send(false);
    });
}
