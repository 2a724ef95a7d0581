//! Application parser registry and the entity/parser seams.

use std::sync::Arc;

use async_trait::async_trait;

use crate::Error;

/// A parsed message ready for processing.
#[async_trait]
pub trait Entity: Send + Sync {
    /// Perform the work carried by this message.
    async fn process(&self) -> anyhow::Result<()>;

    /// Stable key scoping conflict resolution (e.g. a domain object id).
    fn entity_id(&self) -> String;

    /// Invoked before processing when the resolver flagged this work as
    /// conflicting with earlier in-flight work on the same entity.
    async fn mark_conflict(&self) -> anyhow::Result<()>;
}

/// Turns matching deliveries into entities.
pub trait Parser: Send + Sync {
    fn matches(&self, routing_key: &str) -> bool;

    fn parse(&self, routing_key: &str, body: &[u8]) -> anyhow::Result<Box<dyn Entity>>;
}

/// Ordered parser list; registration order is the precedence contract, the
/// first parser whose `matches` returns true wins.
pub struct ParserRegistry {
    parsers: Vec<Arc<dyn Parser>>,
}

impl ParserRegistry {
    pub fn new(parsers: Vec<Arc<dyn Parser>>) -> Self {
        Self { parsers }
    }

    /// Parse a delivery through the first matching parser.
    pub fn dispatch(&self, routing_key: &str, body: &[u8]) -> Result<Box<dyn Entity>, Error> {
        for parser in &self.parsers {
            if parser.matches(routing_key) {
                return parser.parse(routing_key, body).map_err(Error::Entity);
            }
        }
        Err(Error::Unprocessable)
    }
}
