//! Per-message execution pipeline.
//!
//! The processor turns one delivery into one child process invocation:
//! build the command spec, run the child, observe the exit code, emit
//! metrics and hand the code to the acknowledger. A mutex keeps at most one
//! child in flight per processor instance; concurrency comes from running
//! multiple processors, each on its own channel.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::acknowledger::{AckError, Acknowledger};
use crate::command::{Builder, CommandSpec};
use crate::delivery::Delivery;
use crate::metrics;

/// Runtime after which a still-running child gets reported.
const LONG_RUN_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Interval of the still-running report.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// Errors raised while processing one delivery.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The builder could not produce a command spec. The delivery has been
    /// nacked with requeue; the consumer keeps going.
    #[error("failed to create command: {0}")]
    CreateCommand(#[source] crate::command::BuildError),

    /// Emitting the acknowledgment verb failed. Fatal: the delivery's fate
    /// is unknown to the broker.
    #[error("failed to acknowledge message: {0}")]
    Acknowledgment(#[source] AckError),
}

/// Processes one delivery at a time.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, delivery: &dyn Delivery) -> Result<(), ProcessError>;
}

/// Processor backed by an operator-supplied executable.
pub struct ExecProcessor {
    builder: Box<dyn Builder>,
    acknowledger: Acknowledger,
    running: Mutex<()>,
}

impl ExecProcessor {
    pub fn new(builder: Box<dyn Builder>, acknowledger: Acknowledger) -> Self {
        ExecProcessor {
            builder,
            acknowledger,
            running: Mutex::new(()),
        }
    }

    /// Run the child to completion, reporting every 30 seconds once it has
    /// been running for more than five minutes. No signal is ever sent; a
    /// slow child is the operator's business.
    async fn run(&self, spec: CommandSpec) -> i32 {
        let start = Instant::now();
        info!("Processing message...");

        let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
        watchdog.tick().await;

        let run = spec.run();
        tokio::pin!(run);

        let code = loop {
            tokio::select! {
                result = &mut run => {
                    break match result {
                        Ok(code) => code,
                        Err(e) => {
                            error!(error = %e, "Failed to run command");
                            1
                        }
                    };
                }
                _ = watchdog.tick() => {
                    if start.elapsed() > LONG_RUN_THRESHOLD {
                        info!("Command still running after {:?}", start.elapsed());
                    }
                }
            }
        };

        info!("Processed ({:?})!", start.elapsed());

        code
    }
}

#[async_trait]
impl Processor for ExecProcessor {
    async fn process(&self, delivery: &dyn Delivery) -> Result<(), ProcessError> {
        let _guard = self.running.lock().await;

        let properties = delivery.properties();
        let spec = match self
            .builder
            .build(&properties, &delivery.info(), delivery.body())
        {
            Ok(spec) => spec,
            Err(e) => {
                delivery
                    .nack(true)
                    .await
                    .map_err(|e| ProcessError::Acknowledgment(e.into()))?;
                return Err(ProcessError::CreateCommand(e));
            }
        };

        let start = Instant::now();
        let code = self.run(spec).await;

        metrics::PROCESS_COUNTER
            .with_label_values(&[code.to_string().as_str()])
            .inc();
        metrics::PROCESS_DURATION.observe(start.elapsed().as_secs_f64());
        if properties.timestamp != 0 {
            let published = UNIX_EPOCH + Duration::from_secs(properties.timestamp);
            if let Ok(age) = SystemTime::now().duration_since(published) {
                metrics::MESSAGE_DURATION.observe(age.as_secs_f64());
            }
        }

        self.acknowledger
            .ack(delivery, code)
            .await
            .map_err(ProcessError::Acknowledgment)
    }
}
