//! Message publishing.

use std::sync::Arc;

use cv_config::{ConnectionConfig, PublisherConfig};
use lapin::options::BasicPublishOptions;
use lapin::publisher_confirm::Confirmation;
use lapin::{BasicProperties, Channel};
use tracing::debug;

use crate::{ChannelSource, Connection, Error};

pub const DEFAULT_MESSAGE_CONTENT_TYPE: &str = "text/plain";

/// A message that knows its own routing key and wire encoding.
pub trait PublishMessage {
    fn build_routing_key(&self) -> String;
    fn encode_push_message(&self) -> Vec<u8>;
    /// Returns the message attributed to the named actor.
    #[must_use]
    fn with_actor(self, name: &str) -> Self
    where
        Self: Sized;
}

/// Per-publish overrides of the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub routing_key: Option<String>,
    pub mandatory: Option<bool>,
    pub immediate: Option<bool>,
    pub content_type: Option<String>,
}

impl PublishOptions {
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = Some(mandatory);
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = Some(immediate);
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Publishes message bodies to the configured exchange over a lazily opened
/// channel.
pub struct Publisher {
    config: PublisherConfig,
    source: ChannelSource,
}

impl Publisher {
    pub fn new(connection: ConnectionConfig, config: PublisherConfig) -> Self {
        Self {
            config,
            source: ChannelSource::new(connection),
        }
    }

    pub fn with_connection(mut self, connection: Arc<Connection>) -> Self {
        self.source.bind_connection(connection);
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.source.bind_channel(channel);
        self
    }

    /// Publish `body` with the configured defaults.
    pub async fn publish(&self, body: &[u8]) -> Result<(), Error> {
        self.publish_with(body, PublishOptions::default()).await
    }

    /// Publish `body`, overriding configured defaults per `opts`.
    pub async fn publish_with(&self, body: &[u8], opts: PublishOptions) -> Result<(), Error> {
        let routing_key = opts
            .routing_key
            .unwrap_or_else(|| self.config.routing_key.clone());
        if self.config.exchange.is_empty() && routing_key.is_empty() {
            return Err(Error::MissedPublisherExchange);
        }

        let channel = self.source.channel().await?;
        let content_type = opts
            .content_type
            .unwrap_or_else(|| DEFAULT_MESSAGE_CONTENT_TYPE.to_string());
        let confirm = channel
            .basic_publish(
                &self.config.exchange,
                &routing_key,
                BasicPublishOptions {
                    mandatory: opts.mandatory.unwrap_or(self.config.mandatory),
                    immediate: opts.immediate.unwrap_or(self.config.immediate),
                },
                body,
                BasicProperties::default().with_content_type(content_type.into()),
            )
            .await?;

        // Nack only arrives when the channel is in confirm mode.
        if let Confirmation::Nack(_) = confirm.await? {
            return Err(Error::MessageNotSent);
        }

        debug!(
            exchange = %self.config.exchange,
            routing_key = %routing_key,
            bytes = body.len(),
            "Message published"
        );
        Ok(())
    }

    /// Publish a [`PublishMessage`], deriving routing key and body from the
    /// message itself.
    pub async fn publish_message(&self, message: &impl PublishMessage) -> Result<(), Error> {
        let body = message.encode_push_message();
        self.publish_with(
            &body,
            PublishOptions::default().routing_key(message.build_routing_key()),
        )
        .await
    }

    /// Whether `error` indicates the underlying channel or connection died;
    /// callers use this to decide on re-establishing the publisher.
    pub fn disconnected(error: &Error) -> bool {
        matches!(
            error,
            Error::Protocol(lapin::Error::InvalidChannelState(_))
                | Error::Protocol(lapin::Error::InvalidConnectionState(_))
        )
    }
}
