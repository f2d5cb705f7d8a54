// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Seams
//!
//! The supervisors never speak the wire protocol themselves. They drive a broker
//! client through the traits in this module, which `lapin_client` implements for
//! `lapin` and which the tests implement with mocks and an in-memory fake.

use crate::{
    delivery::Delivery,
    errors::AmqpError,
    queue::{QueueInfo, QueueSettings},
    settings::ConsumerSettings,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::BasicProperties;
#[cfg(test)]
use mockall::automock;
use std::{sync::Arc, time::Duration};
use tokio::sync::oneshot;

/// Fires once when a handle becomes unusable.
///
/// A received error means the handle failed. A dropped sender means the handle
/// was released on purpose and nothing is left to watch.
pub type CloseNotification = oneshot::Receiver<AmqpError>;

/// Deliveries of one subscription, ending when the subscription dies.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Opens physical connections to a broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        uri: &str,
        heartbeat: Duration,
    ) -> Result<Arc<dyn ConnectionHandle>, AmqpError>;
}

/// A live broker connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn ChannelHandle>, AmqpError>;

    /// Subscribes to the failure of this connection.
    fn watch_close(&self) -> CloseNotification;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A live channel multiplexed over a connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    async fn set_qos(
        &self,
        prefetch_count: u16,
        prefetch_size: u32,
        global: bool,
    ) -> Result<(), AmqpError>;

    async fn declare_queue(&self, queue: &QueueSettings) -> Result<QueueInfo, AmqpError>;

    /// Starts consuming the settings' queue with the settings' subscription flags.
    async fn subscribe(&self, consumer: &ConsumerSettings) -> Result<DeliveryStream, AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Subscribes to the failure of this channel.
    fn watch_close(&self) -> CloseNotification;

    async fn close(&self) -> Result<(), AmqpError>;
}
