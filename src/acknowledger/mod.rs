//! Exit code to acknowledgment mapping.
//!
//! The child's exit code selects the acknowledgment verb emitted for the
//! message that spawned it:
//!
//! | code | verb                  |
//! |------|-----------------------|
//! | 0    | ack                   |
//! | 3    | reject                |
//! | 4    | reject, requeue       |
//! | 5    | nack                  |
//! | 6    | nack, requeue         |
//!
//! Any other code is handled by the configured policy: the strict policy
//! treats it as a protocol violation, the default policy falls back to the
//! configured on-failure code.

use crate::delivery::{Delivery, DeliveryError};

pub const EXIT_ACK: i32 = 0;
pub const EXIT_REJECT: i32 = 3;
pub const EXIT_REJECT_REQUEUE: i32 = 4;
pub const EXIT_NACK: i32 = 5;
pub const EXIT_NACK_REQUEUE: i32 = 6;

/// Errors raised while acknowledging a message.
#[derive(Debug, thiserror::Error)]
pub enum AckError {
    /// The child exited with a code outside the mapping table under the
    /// strict policy. The message has been nacked with requeue.
    #[error("unexpected exit code {0}")]
    UnexpectedExitCode(i32),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Maps exit codes to acknowledgment verbs under one of two policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledger {
    /// Only codes from the mapping table are accepted. Anything else nacks
    /// the message with requeue and raises an error.
    Strict,

    /// Code 0 acknowledges; any other code applies the mapping table to the
    /// configured fallback code. Never raises beyond transport failures.
    Default { on_failure: i32 },
}

impl Acknowledger {
    /// Select the policy: strict when requested, otherwise the default
    /// policy with the given on-failure code.
    pub fn new(strict: bool, on_failure: i32) -> Self {
        if strict {
            return Acknowledger::Strict;
        }

        Acknowledger::Default { on_failure }
    }

    /// Emit the acknowledgment verb for the given exit code.
    pub async fn ack(&self, delivery: &dyn Delivery, code: i32) -> Result<(), AckError> {
        match self {
            Acknowledger::Strict => Self::strict(delivery, code).await,
            Acknowledger::Default { on_failure } => {
                Self::with_fallback(delivery, code, *on_failure).await
            }
        }
    }

    async fn strict(delivery: &dyn Delivery, code: i32) -> Result<(), AckError> {
        match code {
            EXIT_ACK => delivery.ack().await?,
            EXIT_REJECT => delivery.reject(false).await?,
            EXIT_REJECT_REQUEUE => delivery.reject(true).await?,
            EXIT_NACK => delivery.nack(false).await?,
            EXIT_NACK_REQUEUE => delivery.nack(true).await?,
            _ => {
                delivery.nack(true).await?;
                return Err(AckError::UnexpectedExitCode(code));
            }
        }

        Ok(())
    }

    async fn with_fallback(
        delivery: &dyn Delivery,
        code: i32,
        on_failure: i32,
    ) -> Result<(), AckError> {
        if code == EXIT_ACK {
            delivery.ack().await?;
            return Ok(());
        }

        match on_failure {
            EXIT_REJECT => delivery.reject(false).await?,
            EXIT_REJECT_REQUEUE => delivery.reject(true).await?,
            EXIT_NACK => delivery.nack(false).await?,
            _ => delivery.nack(true).await?,
        }

        Ok(())
    }
}
