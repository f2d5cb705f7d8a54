// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Outgoing Messages
//!
//! This module describes a message handed to [`crate::channel::Channel::publish`]
//! and how it becomes AMQP properties: JSON content type, the message type, a
//! fresh message id, the caller's headers and the propagated trace context.

use crate::{errors::AmqpError, otel};
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Typed header value of an outgoing message.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    LongUint(u32),
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> Self {
        match value {
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
        }
    }
}

/// A message to publish on a supervised channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishMessage {
    pub exchange: String,
    pub routing_key: String,
    pub msg_type: Option<String>,
    pub data: Vec<u8>,
    pub headers: HashMap<String, HeaderValue>,
}

impl PublishMessage {
    /// Creates a message with a raw body.
    ///
    /// # Parameters
    /// * `exchange` - Exchange to publish to; empty for the default exchange
    /// * `routing_key` - Routing key, or the queue name on the default exchange
    /// * `data` - Message body
    pub fn new(exchange: &str, routing_key: &str, data: Vec<u8>) -> Self {
        PublishMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data,
            ..PublishMessage::default()
        }
    }

    /// Serializes `payload` as the message body.
    pub fn json<T: Serialize>(
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<Self, AmqpError> {
        let data = serde_json::to_vec(payload)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;

        Ok(PublishMessage::new(exchange, routing_key, data))
    }

    /// Sets the AMQP `type` property, read back by [`crate::delivery::Delivery::msg_type`].
    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    /// Adds an application header, replacing any previous value for `key`.
    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    /// Builds the AMQP properties, injecting the trace context of `ctx`.
    pub(crate) fn properties(&self, ctx: &Context) -> BasicProperties {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

        otel::inject(ctx, &mut headers);

        for (key, value) in &self.headers {
            headers.insert(ShortString::from(key.clone()), value.clone().into());
        }

        BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_type(ShortString::from(self.msg_type.clone().unwrap_or_default()))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers))
    }
}
