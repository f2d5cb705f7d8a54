// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Self-Healing AMQP Channel
//!
//! A [`Channel`] owns one channel of a supervised [`Connection`]. When the channel
//! fails, its recovery task opens a new one on the same connection and applies
//! the QoS settings again before reporting the channel open. Attempts made while
//! the connection itself is down are skipped, leaving the reconnect to the
//! connection's own task.

use crate::{
    broker::{ChannelHandle, CloseNotification, DeliveryStream},
    connection::Connection,
    errors::AmqpError,
    publisher::PublishMessage,
    queue::{QueueInfo, QueueSettings},
    retry::retry,
    settings::{ChannelOption, ChannelSettings, ConsumerSettings},
};
use opentelemetry::Context;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const CLOSE_EVENTS_CAPACITY: usize = 16;

/// A channel that is reopened, with its QoS, after a failure.
pub struct Channel {
    connection: Arc<Connection>,
    settings: ChannelSettings,
    handle: RwLock<Arc<dyn ChannelHandle>>,
    is_closed: AtomicBool,
    generation: AtomicU64,
    close_events: broadcast::Sender<AmqpError>,
    token: CancellationToken,
}

async fn apply_qos(handle: &dyn ChannelHandle, settings: &ChannelSettings) -> Result<(), AmqpError> {
    handle
        .set_qos(
            settings.qos_prefetch_count,
            settings.qos_prefetch_size,
            settings.qos_global,
        )
        .await
}

impl Channel {
    /// Opens a channel on `connection`, applies QoS and starts supervising it.
    ///
    /// Fails if the connection is down or QoS cannot be applied; in the latter
    /// case the freshly opened channel is released.
    ///
    /// # Parameters
    /// * `token` - Governs the lifetime of the recovery task
    /// * `connection` - The supervised connection the channel lives on
    /// * `options` - Channel options, applied over the defaults in order
    ///
    /// # Returns
    /// The supervised channel or the construction error
    pub async fn new<I>(
        token: &CancellationToken,
        connection: &Arc<Connection>,
        options: I,
    ) -> Result<Arc<Channel>, AmqpError>
    where
        I: IntoIterator<Item = ChannelOption>,
    {
        let settings = ChannelSettings::resolve(options);

        debug!("creating amqp channel...");
        let handle = connection.open_channel_handle().await.map_err(|err| {
            error!(error = err.to_string(), "failure to create a channel");
            AmqpError::ChannelError(err.to_string())
        })?;

        if let Err(err) = apply_qos(handle.as_ref(), &settings).await {
            error!(error = err.to_string(), "failure to apply channel settings");
            if let Err(close_err) = handle.close().await {
                warn!(error = close_err.to_string(), "failure to release channel");
            }
            return Err(err);
        }

        let notify_close = handle.watch_close();
        let (close_events, _) = broadcast::channel(CLOSE_EVENTS_CAPACITY);
        let channel = Arc::new(Channel {
            connection: connection.clone(),
            settings,
            handle: RwLock::new(handle),
            is_closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            close_events,
            token: token.child_token(),
        });

        tokio::spawn(channel.clone().handle_reconnect(notify_close));
        debug!("channel created");

        Ok(channel)
    }

    /// Whether the channel is currently unusable.
    ///
    /// # Returns
    /// `true` while it is being recreated, after [`Channel::close`] and once
    /// recovery has given up
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::SeqCst)
    }

    /// The settings resolved at construction.
    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    /// The connection this channel was opened on.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// The current underlying channel, for operations the supervisor does not cover.
    pub async fn handle(&self) -> Arc<dyn ChannelHandle> {
        self.handle.read().await.clone()
    }

    /// Counts how many times the underlying channel has been replaced.
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Subscribes to the failures of this channel.
    ///
    /// An event is sent every time the underlying channel dies, after the
    /// channel has been marked closed and before it is recreated.
    pub fn notify_close(&self) -> broadcast::Receiver<AmqpError> {
        self.close_events.subscribe()
    }

    async fn live_handle(&self) -> Result<Arc<dyn ChannelHandle>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ClosedError);
        }

        Ok(self.handle().await)
    }

    /// Publishes `message`, propagating the trace context of `ctx`.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context injected into the message headers
    /// * `message` - Destination, body and headers of the message
    ///
    /// # Returns
    /// [`AmqpError::ClosedError`] while the channel is closed, otherwise the
    /// broker's answer
    pub async fn publish(&self, ctx: &Context, message: &PublishMessage) -> Result<(), AmqpError> {
        let handle = self.live_handle().await?;

        handle
            .publish(
                &message.exchange,
                &message.routing_key,
                &message.data,
                message.properties(ctx),
            )
            .await
    }

    /// Declares `queue` on the current channel.
    ///
    /// # Returns
    /// What the broker reports about the queue, or [`AmqpError::ClosedError`]
    /// while the channel is closed
    pub async fn declare_queue(&self, queue: &QueueSettings) -> Result<QueueInfo, AmqpError> {
        self.live_handle().await?.declare_queue(queue).await
    }

    /// Starts a raw subscription on the current channel. The stream is not recovered.
    pub async fn subscribe(&self, consumer: &ConsumerSettings) -> Result<DeliveryStream, AmqpError> {
        self.live_handle().await?.subscribe(consumer).await
    }

    /// Stops recovery and releases the underlying channel.
    ///
    /// Returns [`AmqpError::ClosedError`] when the channel is already closed,
    /// in which case the underlying channel is not touched.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let handle = self.handle.write().await;
        self.token.cancel();

        if self.is_closed.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::ClosedError);
        }

        debug!("closing amqp channel");
        handle.close().await
    }

    async fn handle_reconnect(self: Arc<Self>, mut notify_close: CloseNotification) {
        loop {
            let reason = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                reason = &mut notify_close => reason,
            };

            let Ok(reason) = reason else {
                debug!("channel released, stopping recovery");
                break;
            };

            warn!(error = reason.to_string(), "channel closed, recreating");
            self.is_closed.store(true, Ordering::SeqCst);
            let _ = self.close_events.send(reason.clone());

            match retry(
                self.connection.retry_policy(),
                &self.token,
                "channel",
                || self.reopen(),
            )
            .await
            {
                Ok(next) => notify_close = next,
                Err(AmqpError::Cancelled) => break,
                Err(err) => {
                    error!(
                        reason = reason.to_string(),
                        error = err.to_string(),
                        "fatal: failed to recreate channel"
                    );
                    return;
                }
            }
        }

        match self.close().await {
            Ok(()) | Err(AmqpError::ClosedError) => {}
            Err(err) => error!(error = err.to_string(), "failed to close channel"),
        }
    }

    async fn reopen(&self) -> Result<CloseNotification, AmqpError> {
        let handle = self.connection.open_channel_handle().await?;

        if let Err(err) = apply_qos(handle.as_ref(), &self.settings).await {
            let _ = handle.close().await;
            return Err(err);
        }

        let notify_close = handle.watch_close();

        let mut current = self.handle.write().await;
        if self.token.is_cancelled() {
            let _ = handle.close().await;
            return Err(AmqpError::Cancelled);
        }

        *current = handle;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.is_closed.store(false, Ordering::SeqCst);

        Ok(notify_close)
    }
}
