//! Queue, exchange and QoS declaration.
//!
//! The topology is derived from the configuration and installed on a fresh
//! channel before consumption starts: QoS first, then the queue (unless
//! declaration is suppressed), then the exchange and its bindings (only when
//! an exchange is configured — an empty name means the default exchange,
//! which must not be declared).

use lapin::options::{
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::Channel;
use tracing::info;

use crate::config::Config;

/// Queue argument for the message TTL in milliseconds.
const X_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument naming the dead letter exchange.
const X_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the dead letter routing key.
const X_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument capping message priorities.
const X_MAX_PRIORITY: &str = "x-max-priority";

/// Fallback applied when the prefetch count is zero.
const DEFAULT_PREFETCH_COUNT: u16 = 3;

/// Errors raised while installing the topology, naming the failing AMQP
/// operation.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("failed to set QoS: {0}")]
    Qos(#[source] lapin::Error),

    #[error("failed to declare queue `{queue}`: {source}")]
    DeclareQueue {
        queue: String,
        source: lapin::Error,
    },

    #[error("failed to declare exchange `{exchange}`: {source}")]
    DeclareExchange {
        exchange: String,
        source: lapin::Error,
    },

    #[error("failed to bind queue `{queue}` to exchange `{exchange}`: {source}")]
    Bind {
        queue: String,
        exchange: String,
        source: lapin::Error,
    },
}

/// Exchange part of the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeTopology {
    pub name: String,
    pub kind: String,
    pub durable: bool,
    pub auto_delete: bool,
}

/// Everything declared on the channel before consuming.
#[derive(Debug, Clone)]
pub struct Topology {
    pub queue: String,
    pub declare_queue: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub no_wait: bool,
    pub message_ttl: Option<i32>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub max_priority: Option<i32>,
    pub exchange: Option<ExchangeTopology>,
    pub routing_keys: Vec<String>,
    pub prefetch_count: u16,
    pub prefetch_global: bool,
}

impl Topology {
    pub fn from_config(cfg: &Config) -> Self {
        let exchange = cfg.has_exchange().then(|| ExchangeTopology {
            name: cfg.exchange_name(),
            kind: cfg.exchange_type(),
            durable: cfg.exchange.durable,
            auto_delete: cfg.exchange.auto_delete,
        });

        Topology {
            queue: cfg.queue_name().to_owned(),
            declare_queue: cfg.must_declare_queue(),
            durable: cfg.queuesettings.durable,
            exclusive: cfg.queuesettings.exclusive,
            auto_delete: cfg.queuesettings.auto_delete,
            no_wait: cfg.queuesettings.no_wait,
            message_ttl: cfg.message_ttl(),
            dead_letter_exchange: cfg.dead_letter_exchange(),
            dead_letter_routing_key: cfg.dead_letter_routing_key(),
            max_priority: cfg.priority(),
            exchange,
            routing_keys: cfg.routing_keys(),
            prefetch_count: cfg.prefetch_count(),
            prefetch_global: cfg.prefetch.global,
        }
    }
}

/// Install the topology on the channel.
pub async fn setup(channel: &Channel, topology: &Topology) -> Result<(), TopologyError> {
    let prefetch = match topology.prefetch_count {
        0 => DEFAULT_PREFETCH_COUNT,
        count => count,
    };

    info!("Setting QoS...");
    channel
        .basic_qos(
            prefetch,
            BasicQosOptions {
                global: topology.prefetch_global,
            },
        )
        .await
        .map_err(TopologyError::Qos)?;
    info!("Succeeded setting QoS.");

    if topology.declare_queue {
        info!(queue = %topology.queue, "Declaring queue...");
        channel
            .queue_declare(
                &topology.queue,
                QueueDeclareOptions {
                    passive: false,
                    durable: topology.durable,
                    exclusive: topology.exclusive,
                    auto_delete: topology.auto_delete,
                    nowait: topology.no_wait,
                },
                queue_arguments(topology),
            )
            .await
            .map_err(|source| TopologyError::DeclareQueue {
                queue: topology.queue.clone(),
                source,
            })?;
    }

    if let Some(exchange) = &topology.exchange {
        info!(exchange = %exchange.name, "Declaring exchange...");
        channel
            .exchange_declare(
                &exchange.name,
                exchange_kind(&exchange.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| TopologyError::DeclareExchange {
                exchange: exchange.name.clone(),
                source,
            })?;

        for routing_key in &topology.routing_keys {
            info!(
                queue = %topology.queue,
                exchange = %exchange.name,
                routing_key = %routing_key,
                "Binding queue...",
            );
            channel
                .queue_bind(
                    &topology.queue,
                    &exchange.name,
                    routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
                .map_err(|source| TopologyError::Bind {
                    queue: topology.queue.clone(),
                    exchange: exchange.name.clone(),
                    source,
                })?;
        }
    }

    Ok(())
}

/// The conditional queue arguments table.
fn queue_arguments(topology: &Topology) -> FieldTable {
    let mut args = FieldTable::default();

    if let Some(ttl) = topology.message_ttl {
        args.insert(X_MESSAGE_TTL.into(), AMQPValue::LongInt(ttl));
    }

    if let Some(exchange) = &topology.dead_letter_exchange {
        args.insert(
            X_DEAD_LETTER_EXCHANGE.into(),
            AMQPValue::LongString(exchange.as_str().into()),
        );

        if let Some(routing_key) = &topology.dead_letter_routing_key {
            args.insert(
                X_DEAD_LETTER_ROUTING_KEY.into(),
                AMQPValue::LongString(routing_key.as_str().into()),
            );
        }
    }

    if let Some(priority) = topology.max_priority {
        args.insert(X_MAX_PRIORITY.into(), AMQPValue::LongInt(priority));
    }

    args
}

fn exchange_kind(kind: &str) -> lapin::ExchangeKind {
    match kind {
        "" | "direct" => lapin::ExchangeKind::Direct,
        "fanout" => lapin::ExchangeKind::Fanout,
        "topic" => lapin::ExchangeKind::Topic,
        "headers" => lapin::ExchangeKind::Headers,
        custom => lapin::ExchangeKind::Custom(custom.to_owned()),
    }
}
