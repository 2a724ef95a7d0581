//! Conveyor development harness.
//!
//! Drives the full consumption path against a local broker:
//! - `--declare` declares the configured exchange, queue and binding
//! - `--publish N` publishes N demo change messages and exits
//! - default: consumes with a demo parser until interrupted

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tracing::{error, info, warn};

use cv_amqp::{Binding, Connection, Exchange, PublishMessage, Publisher, Queue};
use cv_config::{AppConfig, ConfigLoader};
use cv_subscriber::{Entity, Subscriber, SubscriberConfig};

#[derive(Parser, Debug)]
#[command(name = "conveyor-dev", about = "Conveyor development harness")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "CONVEYOR_CONFIG")]
    config: Option<PathBuf>,

    /// Declare the configured exchange, queue and binding before anything else
    #[arg(long)]
    declare: bool,

    /// Publish this many demo messages and exit
    #[arg(long)]
    publish: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cv_common::logging::init_default_logging();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ConfigLoader::with_path(path).load()?,
        None => ConfigLoader::new().load()?,
    };

    if cli.declare {
        declare_topology(&config).await?;
    }

    if let Some(count) = cli.publish {
        publish_demo(&config, count).await?;
        return Ok(());
    }

    listen(&config).await
}

async fn declare_topology(config: &AppConfig) -> anyhow::Result<()> {
    let connection = Arc::new(Connection::new(config.connection.clone()));

    Exchange::new(config.exchange.clone())
        .with_connection(connection.clone())
        .declare()
        .await
        .context("exchange declaration failed")?;

    let queue = Queue::new(config.queue.clone())
        .with_connection(connection.clone())
        .declare()
        .await
        .context("queue declaration failed")?;

    Binding::new(config.binding.clone())
        .with_connection(connection.clone())
        .declare()
        .await
        .context("binding declaration failed")?;

    info!(
        exchange = %config.exchange.name,
        queue = %queue.name().as_str(),
        routing_key = %config.binding.routing_key,
        "Topology declared"
    );

    connection.disconnect().await?;
    Ok(())
}

struct DemoChange {
    user_id: u64,
    actor: String,
}

impl PublishMessage for DemoChange {
    fn build_routing_key(&self) -> String {
        format!("change.user.{}", self.user_id)
    }

    fn encode_push_message(&self) -> Vec<u8> {
        serde_json::json!({
            "user_id": self.user_id,
            "actor": self.actor,
        })
        .to_string()
        .into_bytes()
    }

    fn with_actor(mut self, name: &str) -> Self {
        self.actor = name.to_string();
        self
    }
}

async fn publish_demo(config: &AppConfig, count: u64) -> anyhow::Result<()> {
    let publisher = Publisher::new(config.connection.clone(), config.publisher.clone());

    for user_id in 0..count {
        let message = DemoChange {
            user_id,
            actor: String::new(),
        }
        .with_actor("conveyor-dev");
        publisher.publish_message(&message).await?;
    }

    info!(count, "Demo messages published");
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    user_id: u64,
    #[serde(default)]
    actor: String,
}

struct ChangeEntity {
    payload: ChangePayload,
}

#[async_trait::async_trait]
impl Entity for ChangeEntity {
    async fn process(&self) -> anyhow::Result<()> {
        info!(user_id = self.payload.user_id, actor = %self.payload.actor, "Applying change");
        Ok(())
    }

    fn entity_id(&self) -> String {
        format!("user-{}", self.payload.user_id)
    }

    async fn mark_conflict(&self) -> anyhow::Result<()> {
        warn!(user_id = self.payload.user_id, "Change raced an in-flight change");
        Ok(())
    }
}

struct ChangeParser;

impl cv_subscriber::Parser for ChangeParser {
    fn matches(&self, routing_key: &str) -> bool {
        cv_subscriber::match_key("change.user.*", routing_key)
    }

    fn parse(
        &self,
        _routing_key: &str,
        body: &[u8],
    ) -> anyhow::Result<Box<dyn Entity>> {
        let payload: ChangePayload = serde_json::from_slice(body)?;
        Ok(Box::new(ChangeEntity { payload }))
    }
}

async fn listen(config: &AppConfig) -> anyhow::Result<()> {
    let subscriber = Subscriber::new(SubscriberConfig::from(config))
        .post_processing_callback(|routing_key, _body, error, elapsed| match error {
            Some(error) => warn!(%routing_key, %error, ?elapsed, "Delivery failed"),
            None => info!(%routing_key, ?elapsed, "Delivery processed"),
        });

    subscriber.unresolved_locks_callback(Arc::new(|message| {
        warn!(%message, "Unresolved lock expired");
    }))?;

    subscriber
        .listen(vec![Arc::new(ChangeParser)])
        .await
        .context("listen failed")?;
    info!(
        queue = %config.consumer.queue,
        consumers = config.consumer.count,
        "Consuming; press Ctrl-C to stop"
    );

    let mut errors = subscriber
        .wait()
        .context("error stream already taken")?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
            event = errors.recv() => match event {
                Some(error) => error!(%error, "Consumer terminated"),
                None => return Ok(()),
            },
        }
    }
}
