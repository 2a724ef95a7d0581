use thiserror::Error;

/// Broker adapter errors. Several variants are sentinels surfaced to
/// applications that manage connections and publishers themselves and are
/// not produced by every code path in this crate.
#[derive(Error, Debug)]
pub enum Error {
    #[error("missed amqp connection")]
    MissedConnection,

    #[error("connection for amqp already established")]
    AlreadyConnected,

    #[error("closed amqp connection")]
    ConnectionClosed,

    #[error("create channel requires connection")]
    ConnectionRequired,

    #[error("missed amqp connection config")]
    MissedConnectionConfig,

    #[error("missed amqp exchange config")]
    MissedExchangeConfig,

    #[error("missed amqp queue config")]
    MissedQueueConfig,

    #[error("missed amqp binding config")]
    MissedBindingConfig,

    #[error("such publisher does not exist")]
    UnavailablePublisher,

    #[error("publisher has no exchange to push to")]
    MissedPublisherExchange,

    #[error("message failed to send")]
    MessageNotSent,

    #[error("messages limit reached")]
    MessagesLimit,

    #[error("unsupported field-table value for key {0:?}")]
    InvalidArgs(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] lapin::Error),
}
