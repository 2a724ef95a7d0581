//! Queue declaration, inspection and purging.

use std::sync::Arc;

use cv_config::{ConnectionConfig, QueueConfig};
use lapin::options::{QueueDeclareOptions, QueuePurgeOptions};
use lapin::Channel;
use tracing::debug;

use crate::args::field_table;
use crate::{ChannelSource, Connection, Error};

/// Configuration-driven queue helper.
pub struct Queue {
    config: QueueConfig,
    source: ChannelSource,
}

impl Queue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            source: ChannelSource::new(ConnectionConfig::default()),
        }
    }

    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.source = ChannelSource::new(config);
        self
    }

    pub fn with_connection(mut self, connection: Arc<Connection>) -> Self {
        self.source.bind_connection(connection);
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.source.bind_channel(channel);
        self
    }

    /// Declare the queue with the configured parameters.
    pub async fn declare(&self) -> Result<lapin::Queue, Error> {
        let channel = self.source.channel().await?;
        let args = field_table(&self.config.args)?;
        let queue = channel
            .queue_declare(
                &self.config.name,
                QueueDeclareOptions {
                    passive: self.config.passive,
                    durable: self.config.durable,
                    exclusive: self.config.exclusive,
                    auto_delete: self.config.auto_delete,
                    nowait: self.config.no_wait,
                },
                args,
            )
            .await?;
        debug!(queue = %queue.name().as_str(), "Queue declared");
        Ok(queue)
    }

    /// Passive declare: returns the queue's current message and consumer
    /// counts without changing anything on the broker.
    pub async fn inspect(&self) -> Result<lapin::Queue, Error> {
        let channel = self.source.channel().await?;
        let queue = channel
            .queue_declare(
                &self.config.name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                Default::default(),
            )
            .await?;
        Ok(queue)
    }

    /// Drop all ready messages; returns the number of purged messages.
    pub async fn purge(&self) -> Result<u32, Error> {
        let channel = self.source.channel().await?;
        let count = channel
            .queue_purge(
                &self.config.name,
                QueuePurgeOptions {
                    nowait: self.config.no_wait,
                },
            )
            .await?;
        Ok(count)
    }
}
