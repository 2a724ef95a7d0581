//! Exchange declaration.

use std::sync::Arc;

use cv_config::{ConnectionConfig, ExchangeConfig};
use lapin::options::ExchangeDeclareOptions;
use lapin::{Channel, ExchangeKind};
use tracing::debug;

use crate::args::field_table;
use crate::{ChannelSource, Connection, Error};

/// Configuration-driven exchange helper.
pub struct Exchange {
    config: ExchangeConfig,
    source: ChannelSource,
}

impl Exchange {
    pub fn new(config: ExchangeConfig) -> Self {
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

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Declare the exchange with the configured parameters.
    ///
    /// Declaring the default (nameless) exchange is rejected.
    pub async fn declare(&self) -> Result<(), Error> {
        if self.config.name.is_empty() {
            return Err(Error::MissedExchangeConfig);
        }
        let channel = self.source.channel().await?;
        let args = field_table(&self.config.args)?;
        channel
            .exchange_declare(
                &self.config.name,
                exchange_kind(&self.config.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: self.config.durable,
                    auto_delete: self.config.auto_delete,
                    internal: self.config.internal,
                    nowait: self.config.no_wait,
                },
                args,
            )
            .await?;
        debug!(exchange = %self.config.name, kind = %self.config.kind, "Exchange declared");
        Ok(())
    }
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_exchange_kinds_map() {
        assert!(matches!(exchange_kind("topic"), ExchangeKind::Topic));
        assert!(matches!(exchange_kind("direct"), ExchangeKind::Direct));
        assert!(matches!(exchange_kind("fanout"), ExchangeKind::Fanout));
        assert!(matches!(exchange_kind("headers"), ExchangeKind::Headers));
    }

    #[test]
    fn unknown_exchange_kind_is_custom() {
        assert!(
            matches!(exchange_kind("x-delayed-message"), ExchangeKind::Custom(kind) if kind == "x-delayed-message")
        );
    }
}
