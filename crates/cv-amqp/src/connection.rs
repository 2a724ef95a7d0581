//! Broker connection wrapper and lazy channel acquisition.

use std::sync::Arc;

use cv_config::{ConnectionConfig, QosConfig};
use lapin::options::BasicQosOptions;
use lapin::{Channel, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::Error;

const CLOSE_REPLY_SUCCESS: u16 = 200;

/// A broker connection that tracks every channel it hands out.
///
/// The connection is dialed lazily on first [`Connection::channel`] call and
/// can be shared by several facades (subscriber, publisher, declaration
/// helpers) behind an `Arc`.
pub struct Connection {
    config: ConnectionConfig,
    state: Mutex<ConnState>,
}

#[derive(Default)]
struct ConnState {
    connection: Option<lapin::Connection>,
    channels: Vec<Channel>,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ConnState::default()),
        }
    }

    /// Establish the broker connection eagerly.
    ///
    /// Returns [`Error::AlreadyConnected`] when a connection is already
    /// established.
    pub async fn connect(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if state.connection.is_some() {
            return Err(Error::AlreadyConnected);
        }
        state.connection = Some(self.dial().await?);
        Ok(())
    }

    /// Open a new channel, dialing the broker first when necessary.
    pub async fn channel(&self) -> Result<Channel, Error> {
        let mut state = self.state.lock().await;
        self.ensure_connected(&mut state).await?;
        let connection = state
            .connection
            .as_ref()
            .ok_or(Error::ConnectionRequired)?;
        let channel = connection.create_channel().await?;
        debug!(channel_id = channel.id(), "Opened channel");
        state.channels.push(channel.clone());
        Ok(channel)
    }

    /// Close a channel previously handed out by [`Connection::channel`] and
    /// stop tracking it. Closing an untracked channel is a no-op.
    pub async fn close_channel(&self, channel: &Channel) {
        let tracked = {
            let mut state = self.state.lock().await;
            match state.channels.iter().position(|c| c.id() == channel.id()) {
                Some(pos) => Some(state.channels.remove(pos)),
                None => None,
            }
        };
        if let Some(channel) = tracked {
            if let Err(error) = channel.close(CLOSE_REPLY_SUCCESS, "").await {
                warn!(channel_id = channel.id(), %error, "Channel close failed");
            }
        }
    }

    /// Close every tracked channel, then the connection. Channels are closed
    /// explicitly and in order.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        for channel in state.channels.drain(..) {
            if let Err(error) = channel.close(CLOSE_REPLY_SUCCESS, "").await {
                warn!(channel_id = channel.id(), %error, "Channel close failed");
            }
        }
        if let Some(connection) = state.connection.take() {
            connection.close(CLOSE_REPLY_SUCCESS, "").await?;
            info!(host = %self.config.host, "Disconnected from broker");
        }
        Ok(())
    }

    async fn ensure_connected(&self, state: &mut ConnState) -> Result<(), Error> {
        if let Some(connection) = &state.connection {
            if connection.status().connected() {
                return Ok(());
            }
            return Err(Error::ConnectionClosed);
        }
        state.connection = Some(self.dial().await?);
        Ok(())
    }

    async fn dial(&self) -> Result<lapin::Connection, Error> {
        if self.config.host.is_empty() {
            return Err(Error::MissedConnectionConfig);
        }
        info!(host = %self.config.host, port = self.config.port, vhost = %self.config.vhost, "Connecting to broker");
        let connection =
            lapin::Connection::connect(&self.config.url(), ConnectionProperties::default())
                .await?;
        Ok(connection)
    }
}

/// A lazily opened channel slot shared by one facade.
///
/// Mirrors the acquisition discipline every facade follows: reuse an
/// externally supplied channel if one was bound, otherwise open one from the
/// bound (or lazily created) connection, applying QoS when configured. A QoS
/// failure closes the fresh channel and propagates.
pub struct ChannelSource {
    config: ConnectionConfig,
    qos: Option<QosConfig>,
    state: Mutex<SourceState>,
}

#[derive(Default)]
struct SourceState {
    connection: Option<Arc<Connection>>,
    channel: Option<Channel>,
}

impl ChannelSource {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            qos: None,
            state: Mutex::new(SourceState::default()),
        }
    }

    /// Apply this QoS to every channel the source opens.
    pub fn with_qos(mut self, qos: QosConfig) -> Self {
        self.qos = Some(qos);
        self
    }

    /// Bind an externally owned connection instead of creating one lazily.
    pub fn bind_connection(&mut self, connection: Arc<Connection>) {
        self.state.get_mut().connection = Some(connection);
    }

    /// Bind an externally owned channel; QoS is assumed to be the caller's
    /// responsibility for bound channels.
    pub fn bind_channel(&mut self, channel: Channel) {
        self.state.get_mut().channel = Some(channel);
    }

    /// The channel for this facade, opened on first use.
    pub async fn channel(&self) -> Result<Channel, Error> {
        let mut state = self.state.lock().await;
        if let Some(channel) = &state.channel {
            return Ok(channel.clone());
        }

        let connection = match &state.connection {
            Some(connection) => connection.clone(),
            None => {
                let connection = Arc::new(Connection::new(self.config.clone()));
                state.connection = Some(connection.clone());
                connection
            }
        };

        let channel = connection.channel().await?;
        if let Some(qos) = &self.qos {
            // prefetch_size is not sent: RabbitMQ does not implement it and
            // lapin does not expose it.
            let options = BasicQosOptions { global: qos.global };
            if let Err(error) = channel.basic_qos(qos.prefetch_count, options).await {
                connection.close_channel(&channel).await;
                return Err(error.into());
            }
        }

        state.channel = Some(channel.clone());
        Ok(channel)
    }
}
