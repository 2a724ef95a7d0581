//! Queue-to-exchange binding.

use std::sync::Arc;

use cv_config::{BindingConfig, ConnectionConfig};
use lapin::options::QueueBindOptions;
use lapin::Channel;
use tracing::debug;

use crate::args::field_table;
use crate::{ChannelSource, Connection, Error};

/// Configuration-driven binding helper.
pub struct Binding {
    config: BindingConfig,
    source: ChannelSource,
}

impl Binding {
    pub fn new(config: BindingConfig) -> Self {
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

    /// Bind the configured queue to the configured exchange.
    pub async fn declare(&self) -> Result<(), Error> {
        if self.config.queue.is_empty() && self.config.exchange.is_empty() {
            return Err(Error::MissedBindingConfig);
        }
        if self.config.queue.is_empty() {
            return Err(Error::MissedQueueConfig);
        }
        if self.config.exchange.is_empty() {
            return Err(Error::MissedExchangeConfig);
        }

        let channel = self.source.channel().await?;
        let args = field_table(&self.config.args)?;
        channel
            .queue_bind(
                &self.config.queue,
                &self.config.exchange,
                &self.config.routing_key,
                QueueBindOptions {
                    nowait: self.config.no_wait,
                },
                args,
            )
            .await?;
        debug!(
            queue = %self.config.queue,
            exchange = %self.config.exchange,
            routing_key = %self.config.routing_key,
            "Binding declared"
        );
        Ok(())
    }
}
