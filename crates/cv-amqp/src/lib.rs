//! AMQP 0-9-1 broker adapter.
//!
//! Thin wrappers over lapin: a tracked [`Connection`], lazily opened
//! channels via [`ChannelSource`], queue/exchange/binding declaration from
//! configuration records, and a [`Publisher`]. The subscriber runtime in
//! `cv-subscriber` builds on these.

pub mod args;
mod binding;
mod connection;
mod error;
mod exchange;
mod publisher;
mod queue;

pub use binding::Binding;
pub use connection::{ChannelSource, Connection};
pub use error::Error;
pub use exchange::Exchange;
pub use publisher::{PublishMessage, PublishOptions, Publisher, DEFAULT_MESSAGE_CONTENT_TYPE};
pub use queue::Queue;

pub type Result<T> = std::result::Result<T, Error>;
