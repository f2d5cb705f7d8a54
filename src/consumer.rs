// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Self-Healing RabbitMQ Consumer
//!
//! A [`Consumer`] declares a queue on a private supervised channel, subscribes to
//! it and relays every delivery to a bounded queue the application reads from.
//! When the channel fails, the consumer waits for the channel to come back,
//! declares the queue again and resubscribes. Closure of the delivery queue is
//! the only signal that the consumer is gone for good.

use crate::{
    broker::DeliveryStream,
    channel::Channel,
    connection::Connection,
    delivery::Delivery,
    errors::AmqpError,
    retry::{retry, RetryPolicy},
    settings::{ConsumerOption, ConsumerSettings},
};
use futures_util::{stream, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Capacity of the queue between the relay loop and the application
const DELIVERIES_CAPACITY: usize = 1;

/// A queue subscription that survives channel and connection failures.
pub struct Consumer {
    channel: Arc<Channel>,
    settings: ConsumerSettings,
    messages: Option<mpsc::Receiver<Delivery>>,
    token: CancellationToken,
}

impl Consumer {
    /// Creates a channel on `connection`, declares the queue and starts consuming.
    ///
    /// Nothing is retried at this stage: the first failure is returned and the
    /// partially created channel is released.
    ///
    /// # Parameters
    /// * `token` - Governs the lifetime of the consumer and its channel
    /// * `connection` - The supervised connection to consume from
    /// * `options` - Consumer options, applied over the defaults in order
    ///
    /// # Returns
    /// A running consumer, or the channel, declaration or subscription error
    pub async fn new<I>(
        token: &CancellationToken,
        connection: &Arc<Connection>,
        options: I,
    ) -> Result<Consumer, AmqpError>
    where
        I: IntoIterator<Item = ConsumerOption>,
    {
        let settings = ConsumerSettings::resolve(options);
        let token = token.child_token();

        let channel = Channel::new(&token, connection, settings.channel.options()).await?;

        let (messages_tx, messages) = mpsc::channel(DELIVERIES_CAPACITY);
        let relay = Relay {
            notify_close: channel.notify_close(),
            channel: channel.clone(),
            settings: settings.clone(),
            policy: connection.retry_policy(),
            token: token.clone(),
            messages: messages_tx,
        };

        let (deliveries, generation) = match relay.subscribe().await {
            Ok(subscription) => subscription,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = settings.queue.name,
                    "failure to start consuming"
                );
                token.cancel();
                return Err(err);
            }
        };

        tokio::spawn(relay.run(deliveries, generation));
        debug!(queue = settings.queue.name, "consumer started");

        Ok(Consumer {
            channel,
            settings,
            messages: Some(messages),
            token,
        })
    }

    /// Takes the stream of deliveries.
    ///
    /// The stream ends when the consumer is cancelled or cannot be recovered.
    /// It can be taken once; later calls fail.
    pub fn consume(&mut self) -> Result<mpsc::Receiver<Delivery>, AmqpError> {
        self.messages
            .take()
            .ok_or_else(|| AmqpError::ConsumerError("deliveries already taken".to_owned()))
    }

    /// The private channel the consumer subscribes on.
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// The settings resolved at construction.
    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Stops consuming and releases the consumer's channel.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// The single task that relays deliveries and rebuilds the subscription.
struct Relay {
    channel: Arc<Channel>,
    settings: ConsumerSettings,
    policy: RetryPolicy,
    token: CancellationToken,
    notify_close: broadcast::Receiver<AmqpError>,
    messages: mpsc::Sender<Delivery>,
}

impl Relay {
    /// Declares the queue and subscribes, returning the channel generation used.
    async fn subscribe(&self) -> Result<(DeliveryStream, u64), AmqpError> {
        if self.channel.is_closed() {
            return Err(AmqpError::ClosedError);
        }

        let generation = self.channel.generation();
        self.channel.declare_queue(&self.settings.queue).await?;
        let deliveries = self.channel.subscribe(&self.settings).await?;

        Ok((deliveries, generation))
    }

    async fn run(mut self, mut deliveries: DeliveryStream, mut generation: u64) {
        let _release = self.token.clone().drop_guard();

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                _ = self.messages.closed() => {
                    debug!("delivery receiver dropped, stopping consumer");
                    return;
                }
                delivery = deliveries.next() => match delivery {
                    Some(delivery) => {
                        if !self.forward(delivery).await {
                            return;
                        }
                    }
                    None => {
                        debug!("subscription ended without close notification");
                        deliveries = stream::pending().boxed();
                    }
                },
                event = self.notify_close.recv() => {
                    let reason = match event {
                        Ok(reason) => reason,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            AmqpError::ChannelError(format!("missed {missed} close notifications"))
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    };

                    if !self.channel.is_closed() && self.channel.generation() == generation {
                        debug!("close notification for a replaced channel, ignoring");
                        continue;
                    }

                    warn!(error = reason.to_string(), "consumer channel closed, resubscribing");
                    match retry(self.policy, &self.token, "consumer", || self.subscribe()).await {
                        Ok((next, next_generation)) => {
                            deliveries = next;
                            generation = next_generation;
                        }
                        Err(AmqpError::Cancelled) => return,
                        Err(err) => {
                            error!(
                                reason = reason.to_string(),
                                error = err.to_string(),
                                "consumer: failed to recreate subscription"
                            );
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Hands one delivery to the application; false when nobody is listening anymore.
    async fn forward(&self, delivery: Delivery) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            sent = self.messages.send(delivery) => match sent {
                Ok(()) => true,
                Err(_) => {
                    debug!("delivery receiver dropped, stopping consumer");
                    false
                }
            },
        }
    }
}
