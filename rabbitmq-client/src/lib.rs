pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod message;
pub mod publisher;
pub mod stub;
pub mod topology;
pub mod url;
pub mod worker_pool;

pub use config::{ConnectionConfig, ConsumerConfig, ExchangeKind, ExchangeSpec, PublisherConfig, QueueSpec};
pub use connection::{ChannelConnection, ConnectionManager, ServerConnection};
pub use consumer::Consumer;
pub use message::Message;
pub use publisher::{PublishOptions, Publisher};
pub use stub::StubMessage;
pub use worker_pool::{start_workers, Handler, Nackable};
