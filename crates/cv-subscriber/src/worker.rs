//! Delivery workers.
//!
//! One worker per configured consumer slot. A worker drains its delivery
//! stream until the stream closes, running each delivery through the
//! pipeline: parser dispatch, conflict gating, entity processing,
//! post-processing callback, acknowledgement.
//!
//! Acknowledgement is unconditional once the pipeline has run, errors
//! included: redelivery on application failure is explicitly refused, and
//! applications that need to reject must do so inside `Entity::process`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use lapin::message::Delivery;
use lapin::options::BasicAckOptions;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::registry::ParserRegistry;
use crate::resolver::ConflictResolver;
use crate::Error;

/// Successful processing slower than this is reported as
/// [`Error::ProcessingDurationExceeded`] through the callback.
pub const WARNING_DURATION: Duration = Duration::from_millis(100);

/// Application hook invoked after every delivery's pipeline with the
/// routing key, body, pipeline error and elapsed processing time.
pub type ProcessingCallback =
    Arc<dyn Fn(&str, &[u8], Option<&Error>, Duration) + Send + Sync>;

/// Acknowledgement seam between the worker and the broker client.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self, multiple: bool) -> Result<(), Error>;
}

#[async_trait]
impl Acknowledge for lapin::acker::Acker {
    async fn ack(&self, multiple: bool) -> Result<(), Error> {
        lapin::acker::Acker::ack(self, BasicAckOptions { multiple })
            .await
            .map_err(|error| Error::Amqp(error.into()))
    }
}

/// A delivery decoupled from the broker client.
pub struct InboundDelivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    acker: Box<dyn Acknowledge>,
}

impl InboundDelivery {
    pub fn new(
        routing_key: impl Into<String>,
        body: Vec<u8>,
        delivery_tag: u64,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            delivery_tag,
            acker,
        }
    }

    async fn ack(&self) -> Result<(), Error> {
        self.acker.ack(false).await
    }
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        Self {
            routing_key: delivery.routing_key.as_str().to_string(),
            body: delivery.data,
            delivery_tag: delivery.delivery_tag,
            acker: Box::new(delivery.acker),
        }
    }
}

/// Processes the deliveries of one consumer slot.
pub struct Worker {
    registry: Arc<ParserRegistry>,
    resolver: ConflictResolver,
    conflicts_enabled: bool,
    auto_ack: bool,
    callback: Option<ProcessingCallback>,
    errors: mpsc::Sender<Error>,
}

impl Worker {
    pub fn new(
        registry: Arc<ParserRegistry>,
        resolver: ConflictResolver,
        errors: mpsc::Sender<Error>,
    ) -> Self {
        Self {
            registry,
            resolver,
            conflicts_enabled: true,
            auto_ack: false,
            callback: None,
            errors,
        }
    }

    pub fn with_conflicts(mut self, enabled: bool) -> Self {
        self.conflicts_enabled = enabled;
        self
    }

    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn with_callback(mut self, callback: Option<ProcessingCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Drain `stream` under consumer tag `tag` until it closes, then report
    /// the termination on the subscriber error channel.
    pub async fn run<S>(self, tag: String, stream: S)
    where
        S: Stream<Item = InboundDelivery>,
    {
        futures::pin_mut!(stream);
        debug!(consumer = %tag, "Consumer started");

        while let Some(delivery) = stream.next().await {
            let started = Instant::now();
            let mut result = self.process(&delivery).await;
            let elapsed = started.elapsed();

            if result.is_ok() && elapsed > WARNING_DURATION {
                result = Err(Error::ProcessingDurationExceeded);
            }

            if let Some(callback) = &self.callback {
                callback(
                    &delivery.routing_key,
                    &delivery.body,
                    result.as_ref().err(),
                    elapsed,
                );
            }

            if !self.auto_ack {
                if let Err(error) = delivery.ack().await {
                    warn!(
                        consumer = %tag,
                        delivery_tag = delivery.delivery_tag,
                        %error,
                        "Acknowledge failed"
                    );
                }
            }
        }

        // Stream closed: the sole hard signal that this consumer stopped.
        // The error channel is bounded; a full channel blocks here.
        let _ = self.errors.send(Error::ConsumerFinished(tag)).await;
    }

    async fn process(&self, delivery: &InboundDelivery) -> Result<(), Error> {
        let entity = self
            .registry
            .dispatch(&delivery.routing_key, &delivery.body)?;

        if !self.conflicts_enabled {
            return entity.process().await.map_err(Error::Entity);
        }

        let key = entity.entity_id();
        let (id, conflict) = self.resolver.enter(&key, delivery.delivery_tag).await;

        let result = async {
            if conflict {
                debug!(key = %key, id, "Conflicting work detected");
                entity.mark_conflict().await.map_err(Error::Entity)?;
            }
            entity.process().await.map_err(Error::Entity)
        }
        .await;

        // Released on every exit path; the reaper may have been here first.
        if let Err(error) = self.resolver.leave(&key, id) {
            debug!(key = %key, id, %error, "Lease release skipped");
        }

        result
    }
}
