//! One received message and its terminal acknowledgment verbs.
//!
//! A [`Delivery`] is an immutable snapshot of a single broker delivery. The
//! consumer owns it until exactly one of the three verbs has been emitted;
//! emitting a verb twice surfaces the transport's protocol error.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions};
use lapin::types::{AMQPValue, FieldTable};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// RFC 3339 rendering of an unset AMQP timestamp.
const ZERO_TIMESTAMP: &str = "0001-01-01T00:00:00Z";

/// Errors raised while emitting an acknowledgment verb.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("transport failure: {0}")]
    Transport(#[from] lapin::Error),
}

/// A single broker delivery with its acknowledgment verbs.
///
/// The verbs map bit-for-bit onto AMQP 0-9-1 basic.ack (single message),
/// basic.nack (single message, requeue flag) and basic.reject (requeue
/// flag). Multi-acknowledgment is out of scope.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Acknowledge the message.
    async fn ack(&self) -> Result<(), DeliveryError>;

    /// Negatively acknowledge the message.
    async fn nack(&self, requeue: bool) -> Result<(), DeliveryError>;

    /// Reject the message.
    async fn reject(&self, requeue: bool) -> Result<(), DeliveryError>;

    /// The message body.
    fn body(&self) -> &[u8];

    /// The AMQP properties of the message.
    fn properties(&self) -> Properties;

    /// The delivery info of the message.
    fn info(&self) -> DeliveryInfo;
}

/// The AMQP properties of a message, in the stable wire order of the JSON
/// metadata envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    pub application_headers: Option<serde_json::Value>,
    pub content_type: String,
    pub content_encoding: String,
    pub delivery_mode: u8,
    pub priority: u8,
    pub correlation_id: String,
    pub reply_to: String,
    pub expiration: String,
    pub message_id: String,
    /// Seconds since the Unix epoch; zero means unset.
    #[serde(
        serialize_with = "serialize_timestamp",
        deserialize_with = "deserialize_timestamp"
    )]
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub user_id: String,
    pub app_id: String,
}

/// The delivery info of a message, in the stable wire order of the JSON
/// metadata envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    pub message_count: u32,
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// Adapter exposing a lapin delivery through the [`Delivery`] trait.
pub struct AmqpDelivery {
    inner: lapin::message::Delivery,
    consumer_tag: String,
}

impl AmqpDelivery {
    pub fn new(inner: lapin::message::Delivery, consumer_tag: impl Into<String>) -> Self {
        AmqpDelivery {
            inner,
            consumer_tag: consumer_tag.into(),
        }
    }
}

#[async_trait]
impl Delivery for AmqpDelivery {
    async fn ack(&self) -> Result<(), DeliveryError> {
        Ok(self.inner.ack(BasicAckOptions { multiple: false }).await?)
    }

    async fn nack(&self, requeue: bool) -> Result<(), DeliveryError> {
        Ok(self
            .inner
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?)
    }

    async fn reject(&self, requeue: bool) -> Result<(), DeliveryError> {
        Ok(self.inner.reject(BasicRejectOptions { requeue }).await?)
    }

    fn body(&self) -> &[u8] {
        &self.inner.data
    }

    fn properties(&self) -> Properties {
        let props = &self.inner.properties;

        Properties {
            application_headers: props.headers().as_ref().map(field_table_value),
            content_type: short_string(props.content_type()),
            content_encoding: short_string(props.content_encoding()),
            delivery_mode: (*props.delivery_mode()).unwrap_or(0),
            priority: (*props.priority()).unwrap_or(0),
            correlation_id: short_string(props.correlation_id()),
            reply_to: short_string(props.reply_to()),
            expiration: short_string(props.expiration()),
            message_id: short_string(props.message_id()),
            timestamp: (*props.timestamp()).unwrap_or(0),
            kind: short_string(props.kind()),
            user_id: short_string(props.user_id()),
            app_id: short_string(props.app_id()),
        }
    }

    fn info(&self) -> DeliveryInfo {
        DeliveryInfo {
            // basic.consume deliveries carry no message count; only
            // basic.get responses do.
            message_count: 0,
            consumer_tag: self.consumer_tag.clone(),
            delivery_tag: self.inner.delivery_tag,
            redelivered: self.inner.redelivered,
            exchange: self.inner.exchange.to_string(),
            routing_key: self.inner.routing_key.to_string(),
        }
    }
}

fn short_string(value: &Option<lapin::types::ShortString>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

/// Render an AMQP field table as plain JSON.
fn field_table_value(table: &FieldTable) -> serde_json::Value {
    let map = table
        .inner()
        .iter()
        .map(|(k, v)| (k.to_string(), amqp_value(v)))
        .collect();

    serde_json::Value::Object(map)
}

fn amqp_value(value: &AMQPValue) -> serde_json::Value {
    use serde_json::{json, Value};

    match value {
        AMQPValue::Boolean(v) => json!(v),
        AMQPValue::ShortShortInt(v) => json!(v),
        AMQPValue::ShortShortUInt(v) => json!(v),
        AMQPValue::ShortInt(v) => json!(v),
        AMQPValue::ShortUInt(v) => json!(v),
        AMQPValue::LongInt(v) => json!(v),
        AMQPValue::LongUInt(v) => json!(v),
        AMQPValue::LongLongInt(v) => json!(v),
        AMQPValue::Float(v) => json!(v),
        AMQPValue::Double(v) => json!(v),
        AMQPValue::DecimalValue(v) => {
            json!(f64::from(v.value) / 10f64.powi(i32::from(v.scale)))
        }
        AMQPValue::LongString(v) => json!(String::from_utf8_lossy(v.as_bytes())),
        AMQPValue::FieldArray(v) => {
            Value::Array(v.as_slice().iter().map(amqp_value).collect())
        }
        AMQPValue::Timestamp(v) => json!(v),
        AMQPValue::FieldTable(v) => field_table_value(v),
        AMQPValue::ByteArray(v) => Value::Array(
            v.as_slice().iter().map(|b| json!(b)).collect(),
        ),
        // Void, plus value kinds RabbitMQ never puts in a field table.
        _ => Value::Null,
    }
}

fn serialize_timestamp<S: Serializer>(timestamp: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    if *timestamp == 0 {
        return serializer.serialize_str(ZERO_TIMESTAMP);
    }

    match DateTime::from_timestamp(*timestamp as i64, 0) {
        Some(dt) => serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, true)),
        None => serializer.serialize_str(ZERO_TIMESTAMP),
    }
}

fn deserialize_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let raw = String::deserialize(deserializer)?;
    if raw == ZERO_TIMESTAMP {
        return Ok(0);
    }

    let dt = DateTime::parse_from_rfc3339(&raw).map_err(serde::de::Error::custom)?;
    Ok(dt.timestamp().max(0) as u64)
}
