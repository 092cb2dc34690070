use std::sync::Arc;

use lapin::Connection;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;

use super::channel_connection::ChannelConnection;
use super::server_connection::ServerConnection;

/// Owns one `ServerConnection` and fans every new live connection out to every
/// registered `ChannelConnection`, so each named channel reopens automatically
/// whenever the underlying broker connection is rebuilt. This is the
/// one-directional "connections flow into channels" shape: channels never
/// reach back into the connection, avoiding a cyclic supervision graph.
pub struct ConnectionManager {
    shutdown: CancellationToken,
    registered: Arc<Mutex<Vec<Arc<ChannelConnection>>>>,
    current_connection: Arc<Mutex<Option<Connection>>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        let shutdown = CancellationToken::new();
        let mut server_connection = ServerConnection::start(config, shutdown.clone());
        let registered: Arc<Mutex<Vec<Arc<ChannelConnection>>>> = Arc::new(Mutex::new(Vec::new()));
        let current_connection: Arc<Mutex<Option<Connection>>> = Arc::new(Mutex::new(None));

        let registered_for_task = registered.clone();
        let current_connection_for_task = current_connection.clone();
        tokio::spawn(async move {
            while let Some(connection) = server_connection.next_connection().await {
                *current_connection_for_task.lock().await = Some(connection.clone());
                for channel_connection in registered_for_task.lock().await.iter() {
                    if let Err(err) = channel_connection.open(&connection).await {
                        log::error!(
                            "rabbitmq-client: failed to open channel '{}' on new connection: {}",
                            channel_connection.description(),
                            err
                        );
                    }
                }
            }
        });

        Self {
            shutdown,
            registered,
            current_connection,
        }
    }

    /// Registers a new named channel. If a connection is already live, the
    /// channel is opened against it immediately; otherwise it opens as soon
    /// as the next connection arrives (handled by the fan-out task above).
    pub async fn open_channel(&self, description: impl Into<String>) -> Arc<ChannelConnection> {
        let channel_connection = Arc::new(ChannelConnection::new(description));
        self.registered.lock().await.push(channel_connection.clone());

        if let Some(connection) = self.current_connection.lock().await.clone() {
            if let Err(err) = channel_connection.open(&connection).await {
                log::error!(
                    "rabbitmq-client: failed to open channel '{}' on registration: {}",
                    channel_connection.description(),
                    err
                );
            }
        }

        channel_connection
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
