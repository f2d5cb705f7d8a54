// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Self-Healing AMQP Connection
//!
//! A [`Connection`] owns one physical broker connection. A background task waits
//! for the connection to fail and then redials with the bounded, fixed-interval
//! policy of the connection settings. While it is down, the connection reports
//! itself closed and refuses to open channels.

use crate::{
    broker::{ChannelHandle, CloseNotification, ConnectionHandle, Dialer},
    channel::Channel,
    errors::AmqpError,
    lapin_client::LapinDialer,
    retry::{retry, RetryPolicy},
    settings::{ChannelOption, ConnectionOption, ConnectionSettings},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// A broker connection that rebuilds itself after a failure.
pub struct Connection {
    uri: String,
    settings: ConnectionSettings,
    dialer: Arc<dyn Dialer>,
    handle: RwLock<Arc<dyn ConnectionHandle>>,
    is_closed: AtomicBool,
    token: CancellationToken,
}

impl Connection {
    /// Connects to `uri` with the lapin client and starts supervising the connection.
    ///
    /// The initial dial is not retried. Recovery runs until `token` is cancelled,
    /// [`Connection::close`] is called or the retry budget is spent.
    ///
    /// # Parameters
    /// * `token` - Governs the lifetime of the recovery task
    /// * `uri` - AMQP URI of the broker
    /// * `options` - Connection options, applied over the defaults in order
    ///
    /// # Returns
    /// The supervised connection, or the error of the initial dial
    pub async fn connect<I>(
        token: &CancellationToken,
        uri: &str,
        options: I,
    ) -> Result<Arc<Connection>, AmqpError>
    where
        I: IntoIterator<Item = ConnectionOption>,
    {
        Self::connect_with(token, Arc::new(LapinDialer::default()), uri, options).await
    }

    /// Same as [`Connection::connect`] with a caller-provided broker client.
    pub async fn connect_with<I>(
        token: &CancellationToken,
        dialer: Arc<dyn Dialer>,
        uri: &str,
        options: I,
    ) -> Result<Arc<Connection>, AmqpError>
    where
        I: IntoIterator<Item = ConnectionOption>,
    {
        if uri.is_empty() {
            return Err(AmqpError::ConnectionError("empty broker address".to_owned()));
        }

        let settings = ConnectionSettings::resolve(options);

        debug!("creating amqp connection...");
        let handle = match dialer.dial(uri, settings.heartbeat).await {
            Ok(handle) => handle,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(err);
            }
        };
        debug!("amqp connected");

        let notify_close = handle.watch_close();
        let conn = Arc::new(Connection {
            uri: uri.to_owned(),
            settings,
            dialer,
            handle: RwLock::new(handle),
            is_closed: AtomicBool::new(false),
            token: token.child_token(),
        });

        tokio::spawn(conn.clone().handle_reconnect(notify_close));

        Ok(conn)
    }

    /// Whether the connection is currently unusable.
    ///
    /// # Returns
    /// `true` while recovery is in progress, after [`Connection::close`] and
    /// once recovery has given up
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::SeqCst)
    }

    /// The settings resolved at construction.
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        self.settings.retry_policy()
    }

    /// The current underlying connection, for operations the supervisor does not cover.
    pub async fn handle(&self) -> Arc<dyn ConnectionHandle> {
        self.handle.read().await.clone()
    }

    /// Creates a supervised channel on this connection.
    ///
    /// # Parameters
    /// * `token` - Governs the lifetime of the channel's recovery task
    /// * `options` - Channel options, applied over the defaults in order
    ///
    /// # Returns
    /// The supervised channel, or [`AmqpError::ChannelError`] while the connection is down
    pub async fn channel<I>(
        self: &Arc<Self>,
        token: &CancellationToken,
        options: I,
    ) -> Result<Arc<Channel>, AmqpError>
    where
        I: IntoIterator<Item = ChannelOption>,
    {
        Channel::new(token, self, options).await
    }

    /// Opens a raw channel, failing fast while the connection is down.
    pub(crate) async fn open_channel_handle(&self) -> Result<Arc<dyn ChannelHandle>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ClosedError);
        }

        let handle = self.handle.read().await.clone();
        handle.open_channel().await
    }

    /// Stops recovery and releases the underlying connection.
    ///
    /// Returns [`AmqpError::ClosedError`] when the connection is already closed,
    /// whether by an earlier call or because it is down; recovery stops either way.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let handle = self.handle.write().await;
        self.token.cancel();

        if self.is_closed.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::ClosedError);
        }

        debug!("closing amqp connection");
        handle.close().await
    }

    async fn handle_reconnect(self: Arc<Self>, mut notify_close: CloseNotification) {
        loop {
            let reason = tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                reason = &mut notify_close => reason,
            };

            let Ok(reason) = reason else {
                debug!("connection released, stopping recovery");
                self.is_closed.store(true, Ordering::SeqCst);
                return;
            };

            warn!(error = reason.to_string(), "connection lost, reconnecting");
            self.is_closed.store(true, Ordering::SeqCst);

            match retry(self.retry_policy(), &self.token, "connection", || self.redial()).await {
                Ok(next) => notify_close = next,
                Err(AmqpError::Cancelled) => return,
                Err(err) => {
                    error!(
                        reason = reason.to_string(),
                        error = err.to_string(),
                        "failed to reconnect to rmq"
                    );
                    return;
                }
            }
        }
    }

    async fn redial(&self) -> Result<CloseNotification, AmqpError> {
        let handle = self.dialer.dial(&self.uri, self.settings.heartbeat).await?;
        let notify_close = handle.watch_close();

        let mut current = self.handle.write().await;
        if self.token.is_cancelled() {
            let _ = handle.close().await;
            return Err(AmqpError::Cancelled);
        }

        *current = handle;
        self.is_closed.store(false, Ordering::SeqCst);
        debug!("amqp reconnected");

        Ok(notify_close)
    }
}
