// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Broker Client
//!
//! Implements the broker seams over `lapin`. Failure notifications come from the
//! `on_error` hooks of the lapin connection and channel, so each handle must be
//! watched by a single supervisor.

use crate::{
    broker::{ChannelHandle, CloseNotification, ConnectionHandle, DeliveryStream, Dialer},
    delivery::{Acknowledger, Delivery},
    errors::AmqpError,
    queue::{QueueInfo, QueueSettings},
    settings::ConsumerSettings,
};
use async_trait::async_trait;
use futures_util::{future, StreamExt};
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, QueueDeclareOptions,
    },
    types::LongString,
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Reply code sent to the broker when a handle is released on purpose
const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with lapin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LapinDialer {
    connection_name: Option<String>,
}

impl LapinDialer {
    /// Names the connections in the broker's management UI.
    pub fn with_connection_name(name: &str) -> Self {
        LapinDialer {
            connection_name: Some(name.to_owned()),
        }
    }
}

#[async_trait]
impl Dialer for LapinDialer {
    async fn dial(
        &self,
        uri: &str,
        heartbeat: Duration,
    ) -> Result<Arc<dyn ConnectionHandle>, AmqpError> {
        let mut amqp_uri: AMQPUri = uri.parse().map_err(|err: String| {
            error!(error = err, "invalid amqp uri");
            AmqpError::ConnectionError(err)
        })?;
        amqp_uri.query.heartbeat = Some(heartbeat_secs(heartbeat));

        let mut options = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        match Connection::connect_uri(amqp_uri, options).await {
            Ok(conn) => Ok(Arc::new(conn)),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

/// Heartbeat timeout in whole seconds, rounded up so that a sub-second value
/// does not turn heartbeats off. Zero stays zero.
fn heartbeat_secs(heartbeat: Duration) -> u16 {
    let secs = heartbeat.as_secs() + u64::from(heartbeat.subsec_nanos() > 0);
    u16::try_from(secs).unwrap_or(u16::MAX)
}

/// Bridges a lapin `on_error` hook to a one-shot close notification.
fn close_notification<F>(register: F, wrap: fn(String) -> AmqpError) -> CloseNotification
where
    F: FnOnce(Box<dyn FnMut(lapin::Error) + Send>),
{
    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);

    register(Box::new(move |err: lapin::Error| {
        if let Some(tx) = tx.take() {
            let _ = tx.send(wrap(err.to_string()));
        }
    }));

    rx
}

#[async_trait]
impl ConnectionHandle for Connection {
    async fn open_channel(&self) -> Result<Arc<dyn ChannelHandle>, AmqpError> {
        match self.create_channel().await {
            Ok(channel) => {
                debug!(id = channel.id(), "channel created");
                Ok(Arc::new(channel))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn watch_close(&self) -> CloseNotification {
        close_notification(|handler| self.on_error(handler), AmqpError::ConnectionError)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        Connection::close(self, REPLY_SUCCESS, "closing connection")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

#[async_trait]
impl ChannelHandle for Channel {
    async fn set_qos(
        &self,
        prefetch_count: u16,
        prefetch_size: u32,
        global: bool,
    ) -> Result<(), AmqpError> {
        if prefetch_size != 0 {
            warn!(prefetch_size, "prefetch size is not supported by lapin, ignoring");
        }

        self.basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn declare_queue(&self, queue: &QueueSettings) -> Result<QueueInfo, AmqpError> {
        debug!("declaring queue: {}", queue.name);

        match self
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    passive: queue.passive,
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    nowait: queue.no_wait,
                },
                queue.declare_args(),
            )
            .await
        {
            Ok(declared) => Ok(QueueInfo {
                name: declared.name().to_string(),
                message_count: declared.message_count(),
                consumer_count: declared.consumer_count(),
            }),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = queue.name,
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(queue.name.clone()))
            }
        }
    }

    async fn subscribe(&self, consumer: &ConsumerSettings) -> Result<DeliveryStream, AmqpError> {
        let subscription = self
            .basic_consume(
                &consumer.queue.name,
                &consumer.consumer_tag,
                BasicConsumeOptions {
                    no_local: consumer.no_local,
                    no_ack: consumer.auto_ack,
                    exclusive: consumer.exclusive,
                    nowait: false,
                },
                consumer.args.clone(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(err.to_string())
            })?;

        Ok(subscription
            .filter_map(|result| {
                future::ready(match result {
                    Ok(delivery) => Some(Delivery {
                        delivery_tag: delivery.delivery_tag,
                        exchange: delivery.exchange.to_string(),
                        routing_key: delivery.routing_key.to_string(),
                        redelivered: delivery.redelivered,
                        properties: delivery.properties,
                        data: delivery.data,
                        acker: Arc::new(LapinAcker(delivery.acker)),
                    }),
                    Err(err) => {
                        error!(error = err.to_string(), "errors consume msg");
                        None
                    }
                })
            })
            .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn watch_close(&self) -> CloseNotification {
        close_notification(|handler| self.on_error(handler), AmqpError::ChannelError)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        Channel::close(self, REPLY_SUCCESS, "closing channel")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self, multiple: bool) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|err| AmqpError::RejectMessageError(err.to_string()))
    }
}
