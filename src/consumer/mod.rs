//! AMQP connection ownership and the consume loop.
//!
//! The consumer owns one connection and one channel, subscribes to the
//! configured queue and funnels three termination causes into a single
//! result: a broker-initiated close, cooperative cancellation (SIGTERM) and
//! fatal processing errors. In-flight children finish before the loop
//! returns; deliveries observed after cancellation are handed back to the
//! broker with requeue.

pub mod setup;

pub use setup::{setup, Topology, TopologyError};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use lapin::options::{BasicCancelOptions, BasicConsumeOptions, BasicRejectOptions};
use lapin::tcp::OwnedTLSConfig;
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::delivery::AmqpDelivery;
use crate::processor::{ProcessError, Processor};

/// Errors terminating consumption, classified for the process exit code.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error("failed connecting RabbitMQ: {0}")]
    Connect(#[source] lapin::Error),

    #[error("failed to open a channel: {0}")]
    Channel(#[source] lapin::Error),

    #[error("failed reading TLS material from {path}: {source}")]
    Tls {
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("failed to register a consumer: {0}")]
    Register(#[source] lapin::Error),

    #[error("failed to cancel the consumer: {0}")]
    Cancel(#[source] lapin::Error),

    /// The broker closed the connection; delivered verbatim from the
    /// close-notification.
    #[error("connection closed by broker: {0}")]
    BrokerClosed(#[source] lapin::Error),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("consumer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ConsumeError {
    /// Map the termination cause to the bridge's process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConsumeError::BrokerClosed(_) => 10,
            ConsumeError::Process(ProcessError::Acknowledgment(_)) => 11,
            _ => 1,
        }
    }
}

/// Consumes one queue, one message at a time.
pub struct Consumer {
    connection: Option<Connection>,
    channel: Channel,
    queue: String,
    tag: String,
    processor: Arc<dyn Processor>,
}

impl Consumer {
    /// Build a consumer on a pre-opened channel. Connection setup and
    /// topology declaration are the caller's business.
    pub fn new(
        channel: Channel,
        queue: impl Into<String>,
        tag: impl Into<String>,
        processor: Arc<dyn Processor>,
    ) -> Self {
        Consumer {
            connection: None,
            channel,
            queue: queue.into(),
            tag: tag.into(),
            processor,
        }
    }

    /// Dial the broker, open a channel and install the topology according
    /// to the configuration.
    pub async fn from_config(
        cfg: &Config,
        processor: Arc<dyn Processor>,
    ) -> Result<Self, ConsumeError> {
        let uri = cfg.amqp_url();
        let options = ConnectionProperties::default().with_connection_name("rabbitrun".into());

        info!("Connecting RabbitMQ...");
        let connection = match tls_config(cfg)? {
            Some(tls) => Connection::connect_with_config(&uri, options, tls).await,
            None => Connection::connect(&uri, options).await,
        }
        .map_err(ConsumeError::Connect)?;
        info!("Connected.");

        info!("Opening channel...");
        let channel = connection
            .create_channel()
            .await
            .map_err(ConsumeError::Channel)?;
        info!("Done.");

        setup(&channel, &Topology::from_config(cfg)).await?;

        Ok(Consumer {
            connection: Some(connection),
            channel,
            queue: cfg.queue_name().to_owned(),
            tag: cfg.consumer_tag(),
            processor,
        })
    }

    /// Subscribe to the queue and process deliveries until the broker
    /// closes, the token is cancelled, or processing fails fatally.
    pub async fn consume(&self, token: CancellationToken) -> Result<(), ConsumeError> {
        info!("Registering consumer...");
        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &self.tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(ConsumeError::Register)?;
        info!("Succeeded registering consumer.");
        info!("Waiting for messages...");

        // Broker-initiated closes arrive through the connection error
        // callback; without an owned connection the delivery stream is the
        // only close signal.
        let (close_tx, mut close_rx) = mpsc::channel::<lapin::Error>(1);
        if let Some(connection) = &self.connection {
            connection.on_error(move |err| {
                let _ = close_tx.try_send(err);
            });
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let mut worker = tokio::spawn(dispatch(
            consumer,
            Arc::clone(&self.processor),
            Arc::clone(&cancelled),
            self.tag.clone(),
        ));

        tokio::select! {
            Some(err) = close_rx.recv() => Err(ConsumeError::BrokerClosed(err)),

            () = token.cancelled() => {
                info!("Cancel consumption of messages.");
                cancelled.store(true, Ordering::SeqCst);
                self.channel
                    .basic_cancel(&self.tag, BasicCancelOptions { nowait: false })
                    .await
                    .map_err(ConsumeError::Cancel)?;
                worker.await?
            }

            result = &mut worker => result?,
        }
    }

    /// Tear the connection down, taking the channel with it.
    pub async fn close(&self) {
        if let Some(connection) = &self.connection {
            debug!("Closing AMQP connection.");
            if let Err(e) = connection.close(200, "OK").await {
                debug!(error = %e, "Connection close failed");
            }
        }
    }
}

/// Read deliveries from the broker stream and hand each to the processor.
///
/// After cancellation the remaining buffered deliveries are rejected with
/// requeue so the broker hands them to another consumer. A command-creation
/// failure is logged and the loop keeps going; every other processing error
/// ends consumption.
async fn dispatch(
    mut consumer: lapin::Consumer,
    processor: Arc<dyn Processor>,
    cancelled: Arc<AtomicBool>,
    tag: String,
) -> Result<(), ConsumeError> {
    while let Some(result) = consumer.next().await {
        let delivery = match result {
            Ok(delivery) => delivery,
            Err(e) => return Err(ConsumeError::BrokerClosed(e)),
        };

        if cancelled.load(Ordering::SeqCst) {
            if let Err(e) = delivery.reject(BasicRejectOptions { requeue: true }).await {
                warn!(error = %e, "Failed to hand a delivery back after cancellation");
            }
            continue;
        }

        let delivery = AmqpDelivery::new(delivery, tag.clone());
        match processor.process(&delivery).await {
            Ok(()) => {}
            Err(err @ ProcessError::CreateCommand(_)) => {
                error!(error = %err, "Failed to process message");
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

/// TLS material for the dial: the CA file becomes the trusted chain. The
/// certificate file only selects the `amqps` scheme (see `Config::amqp_url`).
fn tls_config(cfg: &Config) -> Result<Option<OwnedTLSConfig>, ConsumeError> {
    if cfg.rabbitmq.tls_ca_file.is_empty() {
        return Ok(None);
    }

    let cert_chain = std::fs::read_to_string(&cfg.rabbitmq.tls_ca_file).map_err(|source| {
        ConsumeError::Tls {
            path: cfg.rabbitmq.tls_ca_file.clone(),
            source,
        }
    })?;

    Ok(Some(OwnedTLSConfig {
        identity: None,
        cert_chain: Some(cert_chain),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acknowledger::AckError;
    use crate::command::BuildError;
    use crate::delivery::DeliveryError;

    fn transport_error() -> lapin::Error {
        lapin::Error::IOError(Arc::new(std::io::Error::other("broken")))
    }

    #[test]
    fn broker_close_maps_to_exit_ten() {
        let err = ConsumeError::BrokerClosed(transport_error());
        assert_eq!(err.exit_code(), 10);
    }

    #[test]
    fn acknowledgment_failure_maps_to_exit_eleven() {
        let err = ConsumeError::Process(ProcessError::Acknowledgment(AckError::Delivery(
            DeliveryError::Transport(transport_error()),
        )));
        assert_eq!(err.exit_code(), 11);

        let err = ConsumeError::Process(ProcessError::Acknowledgment(
            AckError::UnexpectedExitCode(42),
        ));
        assert_eq!(err.exit_code(), 11);
    }

    #[test]
    fn other_failures_map_to_exit_one() {
        let err = ConsumeError::Register(transport_error());
        assert_eq!(err.exit_code(), 1);

        let err = ConsumeError::Process(ProcessError::CreateCommand(BuildError::Pipe(
            std::io::Error::other("no fds"),
        )));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn tls_config_requires_a_ca_file() {
        let cfg = Config::default();
        assert!(tls_config(&cfg).unwrap().is_none());

        let mut cfg = Config::default();
        cfg.rabbitmq.tls_ca_file = "/nonexistent/ca.pem".to_owned();
        assert!(matches!(
            tls_config(&cfg),
            Err(ConsumeError::Tls { .. })
        ));
    }
}
