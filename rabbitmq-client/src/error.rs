use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("failed to connect to RabbitMQ: {0}")]
    DialFailed(String),
    #[error("failed to open channel: {0}")]
    ChannelFailed(String),
}

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("failed to declare exchange {name}: {source}")]
    ExchangeDeclarationFailed { name: String, source: String },
    #[error("failed to declare queue {name}: {source}")]
    QueueDeclarationFailed { name: String, source: String },
    #[error("failed to bind queue {queue} to exchange {exchange}: {source}")]
    QueueBindFailed {
        queue: String,
        exchange: String,
        source: String,
    },
    #[error("unrecognised exchange kind: {0}")]
    UnrecognisedExchangeKind(String),
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("failed to set QoS: {0}")]
    QosFailed(String),
    #[error("failed to register consumer: {0}")]
    ConsumerRegistrationFailed(String),
    #[error("topology was not ready within the timeout")]
    NotReady,
}

#[derive(Error, Debug)]
pub enum PublisherError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("publisher is not ready")]
    NotReady,
    #[error("timed out waiting for the publisher to become ready")]
    ReadyTimeout,
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("publish was not confirmed: {0}")]
    NotConfirmed(String),
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("ack failed: {0}")]
    AckFailed(String),
    #[error("nack failed: {0}")]
    NackFailed(String),
    #[error("dead-letter publish failed: {0}")]
    DeadLetterPublishFailed(String),
    #[error("retry publish failed: {0}")]
    RetryPublishFailed(String),
    #[error("x-retry-count header had an unexpected AMQP field type: {0}")]
    UnexpectedRetryCountType(String),
    #[error("message was already finalized")]
    AlreadyFinalized,
}
