//! Subscriber runtime.
//!
//! Consumes deliveries from broker queues, dispatches each one to the first
//! matching application [`Parser`], and processes the parsed [`Entity`]
//! under a per-entity-id conflict-resolution discipline: work targeting the
//! same entity is serialized FIFO, work arriving behind equal-or-higher
//! priority work is flagged as conflicting, and hung head-of-line work is
//! expired by a background reaper.
//!
//! Delivery semantics are at-least-once with best-effort processing: every
//! delivery is acknowledged after its pipeline runs, including on pipeline
//! errors. Applications observe failures through the post-processing
//! callback; a worker's death surfaces on the error stream from
//! [`Subscriber::wait`].

mod error;
pub mod registry;
pub mod resolver;
pub mod routing;
pub mod subscriber;
pub mod worker;

pub use error::Error;
pub use registry::{Entity, Parser, ParserRegistry};
pub use resolver::{ConflictResolver, LockCallback};
pub use routing::match_key;
pub use subscriber::{Subscriber, SubscriberConfig};
pub use worker::{
    Acknowledge, InboundDelivery, ProcessingCallback, Worker, WARNING_DURATION,
};

pub type Result<T> = std::result::Result<T, Error>;
