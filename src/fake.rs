// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker for exercising recovery without a RabbitMQ server.
//!
//! Failures are injected per operation with `fail_*` counters: the next `n`
//! calls of that operation fail, later ones succeed again.

use crate::{
    broker::{ChannelHandle, CloseNotification, ConnectionHandle, DeliveryStream, Dialer},
    delivery::{Acknowledger, Delivery},
    errors::AmqpError,
    queue::{QueueInfo, QueueSettings},
    settings::ConsumerSettings,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};

#[derive(Default)]
struct State {
    dial_calls: u32,
    failing_dials: u32,
    open_calls: u32,
    failing_opens: u32,
    failing_qos: u32,
    failing_declares: u32,
    subscribe_calls: u32,
    failing_subscribes: u32,
    connections: Vec<Arc<FakeConnection>>,
    channels: Vec<Arc<FakeChannel>>,
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<State>>,
}

impl FakeBroker {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(self.clone())
    }

    pub(crate) fn fail_dials(&self, count: u32) {
        self.state().failing_dials = count;
    }

    pub(crate) fn fail_opens(&self, count: u32) {
        self.state().failing_opens = count;
    }

    pub(crate) fn fail_qos(&self, count: u32) {
        self.state().failing_qos = count;
    }

    pub(crate) fn fail_declares(&self, count: u32) {
        self.state().failing_declares = count;
    }

    pub(crate) fn fail_subscribes(&self, count: u32) {
        self.state().failing_subscribes = count;
    }

    pub(crate) fn dial_calls(&self) -> u32 {
        self.state().dial_calls
    }

    pub(crate) fn open_calls(&self) -> u32 {
        self.state().open_calls
    }

    pub(crate) fn subscribe_calls(&self) -> u32 {
        self.state().subscribe_calls
    }

    pub(crate) fn connection(&self, index: usize) -> Arc<FakeConnection> {
        self.state().connections[index].clone()
    }

    pub(crate) fn channel(&self, index: usize) -> Arc<FakeChannel> {
        self.state().channels[index].clone()
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.state().channels.len()
    }
}

#[async_trait]
impl Dialer for FakeBroker {
    async fn dial(
        &self,
        _uri: &str,
        _heartbeat: Duration,
    ) -> Result<Arc<dyn ConnectionHandle>, AmqpError> {
        let mut state = self.state();
        state.dial_calls += 1;
        if take_failure(&mut state.failing_dials) {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let connection = Arc::new(FakeConnection {
            broker: self.clone(),
            alive: AtomicBool::new(true),
            close_tx: Mutex::new(None),
            close_calls: AtomicU32::new(0),
            channels: Mutex::new(vec![]),
        });
        state.connections.push(connection.clone());

        Ok(connection)
    }
}

pub(crate) struct FakeConnection {
    broker: FakeBroker,
    alive: AtomicBool,
    close_tx: Mutex<Option<oneshot::Sender<AmqpError>>>,
    close_calls: AtomicU32,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeConnection {
    /// Simulates a network failure: the connection and all its channels die.
    pub(crate) fn fail(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(tx) = self.close_tx.lock().unwrap().take() {
            let _ = tx.send(AmqpError::ConnectionError("connection reset".to_owned()));
        }
        for channel in self.channels.lock().unwrap().iter() {
            channel.fail();
        }
    }

    pub(crate) fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionHandle for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn ChannelHandle>, AmqpError> {
        let mut state = self.broker.state();
        state.open_calls += 1;
        if !self.alive.load(Ordering::SeqCst) || take_failure(&mut state.failing_opens) {
            return Err(AmqpError::ChannelError("channel refused".to_owned()));
        }

        let channel = Arc::new(FakeChannel {
            broker: self.broker.clone(),
            alive: AtomicBool::new(true),
            close_tx: Mutex::new(None),
            close_calls: AtomicU32::new(0),
            qos: Mutex::new(vec![]),
            declared: Mutex::new(vec![]),
            subscriptions: Mutex::new(vec![]),
            published: Mutex::new(vec![]),
        });
        state.channels.push(channel.clone());
        self.channels.lock().unwrap().push(channel.clone());

        Ok(channel)
    }

    fn watch_close(&self) -> CloseNotification {
        let (tx, rx) = oneshot::channel();
        *self.close_tx.lock().unwrap() = Some(tx);
        rx
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        self.close_tx.lock().unwrap().take();
        Ok(())
    }
}

pub(crate) struct FakeChannel {
    broker: FakeBroker,
    alive: AtomicBool,
    close_tx: Mutex<Option<oneshot::Sender<AmqpError>>>,
    close_calls: AtomicU32,
    qos: Mutex<Vec<(u16, u32, bool)>>,
    declared: Mutex<Vec<String>>,
    subscriptions: Mutex<Vec<mpsc::UnboundedSender<Delivery>>>,
    published: Mutex<Vec<(String, String, Vec<u8>)>>,
}

impl FakeChannel {
    /// Simulates a channel-level failure; live subscriptions end.
    pub(crate) fn fail(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.subscriptions.lock().unwrap().clear();
        if let Some(tx) = self.close_tx.lock().unwrap().take() {
            let _ = tx.send(AmqpError::ChannelError("channel reset".to_owned()));
        }
    }

    /// Ends live subscriptions while the channel itself stays up.
    pub(crate) fn end_subscriptions(&self) {
        self.subscriptions.lock().unwrap().clear();
    }

    /// Pushes a delivery into the most recent subscription.
    pub(crate) fn push(&self, delivery_tag: u64) {
        let subscriptions = self.subscriptions.lock().unwrap();
        let Some(tx) = subscriptions.last() else {
            panic!("channel has no subscription");
        };
        tx.send(Delivery::new(
            delivery_tag,
            delivery_tag.to_string().into_bytes(),
            Arc::new(NoopAcker),
        ))
        .unwrap();
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn qos(&self) -> Vec<(u16, u32, bool)> {
        self.qos.lock().unwrap().clone()
    }

    pub(crate) fn declared(&self) -> Vec<String> {
        self.declared.lock().unwrap().clone()
    }

    pub(crate) fn published(&self) -> Vec<(String, String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    fn check_alive(&self) -> Result<(), AmqpError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AmqpError::ChannelError("channel is dead".to_owned()))
        }
    }
}

#[async_trait]
impl ChannelHandle for FakeChannel {
    async fn set_qos(
        &self,
        prefetch_count: u16,
        prefetch_size: u32,
        global: bool,
    ) -> Result<(), AmqpError> {
        self.check_alive()?;
        if take_failure(&mut self.broker.state().failing_qos) {
            return Err(AmqpError::QoSDeclarationError("qos refused".to_owned()));
        }

        self.qos
            .lock()
            .unwrap()
            .push((prefetch_count, prefetch_size, global));
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSettings) -> Result<QueueInfo, AmqpError> {
        self.check_alive()?;
        if take_failure(&mut self.broker.state().failing_declares) {
            return Err(AmqpError::DeclareQueueError(queue.name.clone()));
        }

        self.declared.lock().unwrap().push(queue.name.clone());
        Ok(QueueInfo {
            name: queue.name.clone(),
            message_count: 0,
            consumer_count: 0,
        })
    }

    async fn subscribe(&self, consumer: &ConsumerSettings) -> Result<DeliveryStream, AmqpError> {
        self.check_alive()?;
        {
            let mut state = self.broker.state();
            state.subscribe_calls += 1;
            if take_failure(&mut state.failing_subscribes) {
                return Err(AmqpError::BindingConsumerError(
                    consumer.consumer_tag.clone(),
                ));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.lock().unwrap().push(tx);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        _properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.check_alive()?;
        self.published.lock().unwrap().push((
            exchange.to_owned(),
            routing_key.to_owned(),
            payload.to_vec(),
        ));
        Ok(())
    }

    fn watch_close(&self) -> CloseNotification {
        let (tx, rx) = oneshot::channel();
        *self.close_tx.lock().unwrap() = Some(tx);
        rx
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        self.subscriptions.lock().unwrap().clear();
        self.close_tx.lock().unwrap().take();
        Ok(())
    }
}

struct NoopAcker;

#[async_trait]
impl Acknowledger for NoopAcker {
    async fn ack(&self, _multiple: bool) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn nack(&self, _multiple: bool, _requeue: bool) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn reject(&self, _requeue: bool) -> Result<(), AmqpError> {
        Ok(())
    }
}

/// Polls `condition` until it holds, letting paused time advance in between.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("condition never became true");
}
