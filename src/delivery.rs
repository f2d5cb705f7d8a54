// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deliveries
//!
//! A [`Delivery`] is one message handed to the application by a consumer. It keeps
//! the body and metadata received from the broker plus the capability to settle
//! the message, which stays tied to the channel the message arrived on.

use crate::{errors::AmqpError, otel};
use async_trait::async_trait;
use lapin::{protocol::basic::AMQPProperties, types::FieldTable};
#[cfg(test)]
use mockall::automock;
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    Context,
};
use serde::de::DeserializeOwned;
use std::{fmt, sync::Arc};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Settles a delivery on the channel that received it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError>;

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// One message received from a subscription.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: AMQPProperties,
    pub data: Vec<u8>,
    pub(crate) acker: Arc<dyn Acknowledger>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("data", &self.data)
            .finish()
    }
}

impl Delivery {
    /// Creates a delivery with empty metadata; the public fields can be filled in afterwards.
    pub fn new(delivery_tag: u64, data: Vec<u8>, acker: Arc<dyn Acknowledger>) -> Self {
        Delivery {
            delivery_tag,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            properties: AMQPProperties::default(),
            data,
            acker,
        }
    }

    /// Acknowledges the delivery.
    ///
    /// # Parameters
    /// * `multiple` - Also acknowledge every earlier unsettled delivery of the channel
    ///
    /// # Returns
    /// [`AmqpError::AckMessageError`] if the broker client refuses, e.g. because
    /// the channel the message arrived on is gone
    pub async fn ack(&self, multiple: bool) -> Result<(), AmqpError> {
        self.acker.ack(multiple).await
    }

    /// Negatively acknowledges the delivery.
    ///
    /// # Parameters
    /// * `multiple` - Also nack every earlier unsettled delivery of the channel
    /// * `requeue` - Put the message back on the queue instead of dead-lettering it
    ///
    /// # Returns
    /// [`AmqpError::NackMessageError`] if the broker client refuses
    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(multiple, requeue).await
    }

    /// Rejects the delivery.
    ///
    /// # Parameters
    /// * `requeue` - Put the message back on the queue instead of dead-lettering it
    ///
    /// # Returns
    /// [`AmqpError::RejectMessageError`] if the broker client refuses
    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.reject(requeue).await
    }

    /// The message type set by the publisher, or an empty string.
    pub fn msg_type(&self) -> String {
        match self.properties.kind() {
            Some(value) => value.to_string(),
            _ => "".to_owned(),
        }
    }

    /// How many times the message went through dead-lettering, read from the x-death header.
    pub fn retry_count(&self) -> i64 {
        let headers = match self.properties.headers() {
            Some(val) => val.to_owned(),
            None => FieldTable::default(),
        };

        headers
            .inner()
            .get(AMQP_HEADERS_X_DEATH)
            .and_then(|value| value.as_array())
            .and_then(|arr| arr.as_slice().first())
            .and_then(|value| value.as_field_table())
            .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
            .and_then(|value| value.as_long_long_int())
            .unwrap_or_default()
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.data)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    /// Starts a consumer span that continues the trace propagated in the headers.
    pub fn span(&self, tracer: &BoxedTracer) -> (Context, BoxedSpan) {
        otel::new_span(&self.properties, tracer, &self.msg_type())
    }
}
