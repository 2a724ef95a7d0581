//! Subscriber facade: owns the channel, the resolver and the worker fleet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cv_amqp::args::field_table;
use cv_amqp::{ChannelSource, Connection};
use cv_config::{AppConfig, ConflictsConfig, ConnectionConfig, ConsumerConfig, QosConfig};
use futures::StreamExt;
use lapin::options::BasicConsumeOptions;
use lapin::Channel;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::registry::{Parser, ParserRegistry};
use crate::resolver::{ConflictResolver, LockCallback};
use crate::worker::{InboundDelivery, ProcessingCallback, Worker};
use crate::Error;

/// Capacity of the terminal error channel; a full channel blocks the
/// reporting worker.
const ERRORS_CAPACITY: usize = 1024;

/// Everything a subscriber needs to know, fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct SubscriberConfig {
    pub connection: ConnectionConfig,
    pub qos: QosConfig,
    pub consumer: ConsumerConfig,
    pub conflicts: ConflictsConfig,
}

impl From<&AppConfig> for SubscriberConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            connection: config.connection.clone(),
            qos: config.qos.clone(),
            consumer: config.consumer.clone(),
            conflicts: config.conflicts.clone(),
        }
    }
}

/// Consumes one queue with a fleet of workers sharing a single channel,
/// gated by a per-entity [`ConflictResolver`].
pub struct Subscriber {
    config: SubscriberConfig,
    source: ChannelSource,
    resolver: ConflictResolver,
    callback: Option<ProcessingCallback>,
    errors_tx: mpsc::Sender<Error>,
    errors_rx: parking_lot::Mutex<Option<mpsc::Receiver<Error>>>,
    reaper_started: AtomicBool,
}

impl Subscriber {
    pub fn new(config: SubscriberConfig) -> Self {
        let (errors_tx, errors_rx) = mpsc::channel(ERRORS_CAPACITY);
        let source =
            ChannelSource::new(config.connection.clone()).with_qos(config.qos.clone());
        Self {
            config,
            source,
            resolver: ConflictResolver::new(),
            callback: None,
            errors_tx,
            errors_rx: parking_lot::Mutex::new(Some(errors_rx)),
            reaper_started: AtomicBool::new(false),
        }
    }

    /// Consume over an externally owned connection instead of dialing one.
    pub fn set_connection(&mut self, connection: Arc<Connection>) {
        self.source.bind_connection(connection);
    }

    /// Consume over an externally owned channel; QoS is the caller's
    /// responsibility for bound channels.
    pub fn set_channel(&mut self, channel: Channel) {
        self.source.bind_channel(channel);
    }

    /// Hook invoked after every delivery's pipeline with
    /// `(routing_key, body, error, elapsed)`.
    pub fn post_processing_callback(
        mut self,
        callback: impl Fn(&str, &[u8], Option<&Error>, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// The subscriber's channel, opened on first use with QoS applied. On a
    /// QoS failure the channel is closed and the error propagated.
    pub async fn channel(&self) -> Result<Channel, Error> {
        Ok(self.source.channel().await?)
    }

    /// Reconfigure the resolver reaper with the configured TTL and tick
    /// interval, wiring the given diagnostic callbacks.
    pub fn check_locks(
        &self,
        err_fn: Option<LockCallback>,
        info_fn: Option<LockCallback>,
    ) -> Result<(), Error> {
        let (interval, ttl) = self.reaper_durations()?;
        self.reaper_started.store(true, Ordering::SeqCst);
        self.resolver.check_locks(interval, ttl, err_fn, info_fn);
        Ok(())
    }

    fn reaper_durations(&self) -> Result<(Duration, Duration), Error> {
        let interval = self.config.conflicts.idle_interval().map_err(|source| {
            Error::InvalidDuration {
                name: "check-idle-interval",
                source,
            }
        })?;
        let ttl = self
            .config
            .conflicts
            .idle_ttl()
            .map_err(|source| Error::InvalidDuration {
                name: "check-idle-ttl",
                source,
            })?;
        Ok((interval, ttl))
    }

    /// Receive a diagnostic message for every lease the reaper expires.
    pub fn unresolved_locks_callback(&self, callback: LockCallback) -> Result<(), Error> {
        self.check_locks(Some(callback), None)
    }

    /// Start the configured number of workers, each consuming the queue
    /// under its own consumer tag. The first setup error is returned
    /// synchronously; afterwards workers only report through [`Self::wait`].
    pub async fn listen(&self, parsers: Vec<Arc<dyn Parser>>) -> Result<(), Error> {
        if parsers.is_empty() {
            return Err(Error::MissedParsers);
        }
        let registry = Arc::new(ParserRegistry::new(parsers));

        if self.config.conflicts.enabled {
            let (interval, ttl) = self.reaper_durations()?;
            if !self.reaper_started.swap(true, Ordering::SeqCst) {
                self.resolver.check_locks(interval, ttl, None, None);
            }
        }

        let channel = self.channel().await?;
        let consumer_config = &self.config.consumer;
        let args = field_table(&consumer_config.args).map_err(Error::Amqp)?;

        for index in 0..consumer_config.count {
            let tag = consumer_config.enum_consumer_tag(index);
            let consumer = channel
                .basic_consume(
                    &consumer_config.queue,
                    &tag,
                    BasicConsumeOptions {
                        no_local: consumer_config.no_local,
                        no_ack: consumer_config.auto_ack,
                        exclusive: consumer_config.exclusive,
                        nowait: consumer_config.no_wait,
                    },
                    args.clone(),
                )
                .await
                .map_err(cv_amqp::Error::from)?;

            let worker = Worker::new(
                registry.clone(),
                self.resolver.clone(),
                self.errors_tx.clone(),
            )
            .with_conflicts(self.config.conflicts.enabled)
            .with_auto_ack(consumer_config.auto_ack)
            .with_callback(self.callback.clone());

            let stream_tag = tag.clone();
            let stream = consumer.filter_map(move |result| {
                let tag = stream_tag.clone();
                async move {
                    match result {
                        Ok(delivery) => Some(InboundDelivery::from(delivery)),
                        Err(error) => {
                            warn!(consumer = %tag, %error, "Consumer stream error");
                            None
                        }
                    }
                }
            });

            info!(consumer = %tag, queue = %consumer_config.queue, "Consumer listening");
            tokio::spawn(worker.run(tag, stream));
        }

        Ok(())
    }

    /// Stream of terminal worker events (one [`Error::ConsumerFinished`]
    /// per dead worker). Single-consumer: the first call takes the stream,
    /// later calls return `None`.
    pub fn wait(&self) -> Option<mpsc::Receiver<Error>> {
        self.errors_rx.lock().take()
    }
}
