//! Test utilities and mock implementations.

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::delivery::{Delivery, DeliveryError, DeliveryInfo, Properties};

/// An acknowledgment verb observed by a [`RecordingDelivery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
}

/// Mock delivery recording the verbs emitted against it.
#[derive(Default)]
pub struct RecordingDelivery {
    body: Vec<u8>,
    properties: Properties,
    info: DeliveryInfo,
    fail: bool,
    verbs: Arc<Mutex<Vec<Verb>>>,
}

impl RecordingDelivery {
    pub fn with_body(body: impl Into<Vec<u8>>) -> Self {
        RecordingDelivery {
            body: body.into(),
            ..RecordingDelivery::default()
        }
    }

    pub fn with_properties(properties: Properties) -> Self {
        RecordingDelivery {
            properties,
            ..RecordingDelivery::default()
        }
    }

    /// A delivery whose verbs all fail with a transport error.
    pub fn failing() -> Self {
        RecordingDelivery {
            fail: true,
            ..RecordingDelivery::default()
        }
    }

    /// The verbs emitted so far, in order.
    pub fn verbs(&self) -> Vec<Verb> {
        self.verbs.lock().unwrap().clone()
    }

    fn record(&self, verb: Verb) -> Result<(), DeliveryError> {
        if self.fail {
            return Err(DeliveryError::Transport(lapin::Error::IOError(Arc::new(
                io::Error::other("transport down"),
            ))));
        }

        self.verbs.lock().unwrap().push(verb);
        Ok(())
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn ack(&self) -> Result<(), DeliveryError> {
        self.record(Verb::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), DeliveryError> {
        self.record(Verb::Nack { requeue })
    }

    async fn reject(&self, requeue: bool) -> Result<(), DeliveryError> {
        self.record(Verb::Reject { requeue })
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    fn properties(&self) -> Properties {
        self.properties.clone()
    }

    fn info(&self) -> DeliveryInfo {
        self.info.clone()
    }
}
