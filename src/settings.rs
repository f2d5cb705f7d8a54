// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Supervisor Settings
//!
//! Connections, channels and consumers are configured with a list of options.
//! Each `resolve` call starts from a fresh default value and applies the options
//! in order, so two constructions never observe each other's configuration.
//!
//! ```
//! use rabbitmq_recovery::settings::{ConnectionOption, ConnectionSettings};
//! use std::time::Duration;
//!
//! let settings = ConnectionSettings::resolve([
//!     ConnectionOption::MaxReconnectRetries(5),
//!     ConnectionOption::ReconnectInterval(Duration::from_millis(500)),
//! ]);
//!
//! assert_eq!(settings.max_reconnect_retries, 5);
//! ```

use crate::{lapin_client::LapinDialer, queue::QueueSettings, retry::RetryPolicy};
use lapin::types::FieldTable;
use serde::Deserialize;
use std::time::Duration;

/// Default number of recovery attempts after a failure
pub const DEFAULT_MAX_RECONNECT_RETRIES: u32 = 20;
/// Default wait between two failed recovery attempts
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
/// Default heartbeat negotiated with the broker
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(1);

/// Resolved configuration of a [`crate::connection::Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub max_reconnect_retries: u32,
    pub reconnect_interval: Duration,
    pub heartbeat: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            max_reconnect_retries: DEFAULT_MAX_RECONNECT_RETRIES,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }
}

/// A single connection configuration change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOption {
    /// Recovery attempts after a failure before giving up
    MaxReconnectRetries(u32),
    /// Wait between two failed recovery attempts
    ReconnectInterval(Duration),
    /// Heartbeat timeout requested from the broker, rounded up to whole seconds
    Heartbeat(Duration),
}

impl ConnectionSettings {
    /// Applies the options, in order, on top of the default settings.
    pub fn resolve<I>(options: I) -> Self
    where
        I: IntoIterator<Item = ConnectionOption>,
    {
        let mut settings = ConnectionSettings::default();
        for option in options {
            match option {
                ConnectionOption::MaxReconnectRetries(count) => {
                    settings.max_reconnect_retries = count
                }
                ConnectionOption::ReconnectInterval(interval) => {
                    settings.reconnect_interval = interval
                }
                ConnectionOption::Heartbeat(heartbeat) => settings.heartbeat = heartbeat,
            }
        }

        settings
    }

    /// The retry budget every supervisor bound to this connection uses.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_reconnect_retries,
            interval: self.reconnect_interval,
        }
    }
}

/// Resolved Quality of Service configuration of a [`crate::channel::Channel`].
///
/// A prefetch count or size of zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelSettings {
    pub qos_prefetch_count: u16,
    pub qos_prefetch_size: u32,
    pub qos_global: bool,
}

/// A single channel configuration change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOption {
    /// Unacknowledged deliveries the broker may send ahead
    QosPrefetchCount(u16),
    /// Unacknowledged bytes the broker may send ahead; not supported by lapin
    QosPrefetchSize(u32),
    /// Apply the limits to the whole connection instead of each consumer
    QosGlobal(bool),
}

impl ChannelSettings {
    /// Applies the options, in order, on top of the default settings.
    pub fn resolve<I>(options: I) -> Self
    where
        I: IntoIterator<Item = ChannelOption>,
    {
        let mut settings = ChannelSettings::default();
        for option in options {
            settings.apply(option);
        }

        settings
    }

    fn apply(&mut self, option: ChannelOption) {
        match option {
            ChannelOption::QosPrefetchCount(count) => self.qos_prefetch_count = count,
            ChannelOption::QosPrefetchSize(size) => self.qos_prefetch_size = size,
            ChannelOption::QosGlobal(global) => self.qos_global = global,
        }
    }

    /// Expresses these settings as options, for handing them to another constructor.
    pub fn options(&self) -> [ChannelOption; 3] {
        [
            ChannelOption::QosPrefetchCount(self.qos_prefetch_count),
            ChannelOption::QosPrefetchSize(self.qos_prefetch_size),
            ChannelOption::QosGlobal(self.qos_global),
        ]
    }
}

/// Resolved configuration of a [`crate::consumer::Consumer`].
///
/// `exclusive` and `args` apply to the subscription; the queue has its own
/// flags and arguments in `queue`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumerSettings {
    pub channel: ChannelSettings,
    pub queue: QueueSettings,
    pub consumer_tag: String,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub args: FieldTable,
}

/// A single consumer configuration change.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerOption {
    /// QoS of the consumer's private channel
    Channel(ChannelOption),
    QueueName(String),
    QueueDurable(bool),
    QueueAutoDelete(bool),
    QueueExclusive(bool),
    /// Declaration arguments of the queue
    QueueArgs(FieldTable),
    /// Replaces every queue setting at once
    Queue(QueueSettings),
    ConsumerTag(String),
    /// Let the broker consider deliveries settled as soon as they are sent
    AutoAck(bool),
    /// Request exclusive access to the queue for this subscription
    Exclusive(bool),
    NoLocal(bool),
    /// Subscription arguments
    Args(FieldTable),
}

impl ConsumerSettings {
    /// Applies the options, in order, on top of the default settings.
    pub fn resolve<I>(options: I) -> Self
    where
        I: IntoIterator<Item = ConsumerOption>,
    {
        let mut settings = ConsumerSettings::default();
        for option in options {
            match option {
                ConsumerOption::Channel(option) => settings.channel.apply(option),
                ConsumerOption::QueueName(name) => settings.queue.name = name,
                ConsumerOption::QueueDurable(durable) => settings.queue.durable = durable,
                ConsumerOption::QueueAutoDelete(auto_delete) => {
                    settings.queue.auto_delete = auto_delete
                }
                ConsumerOption::QueueExclusive(exclusive) => settings.queue.exclusive = exclusive,
                ConsumerOption::QueueArgs(args) => settings.queue.args = args,
                ConsumerOption::Queue(queue) => settings.queue = queue,
                ConsumerOption::ConsumerTag(tag) => settings.consumer_tag = tag,
                ConsumerOption::AutoAck(auto_ack) => settings.auto_ack = auto_ack,
                ConsumerOption::Exclusive(exclusive) => settings.exclusive = exclusive,
                ConsumerOption::NoLocal(no_local) => settings.no_local = no_local,
                ConsumerOption::Args(args) => settings.args = args,
            }
        }

        settings
    }
}

/// Broker configuration as it is usually read from the environment or a file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub vhost: String,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub max_reconnect_retries: Option<u32>,
    #[serde(default)]
    pub reconnect_interval_ms: Option<u64>,
    #[serde(default)]
    pub heartbeat_secs: Option<u64>,
}

impl RabbitMQConfigs {
    /// The AMQP URI of the configured broker.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }

    /// Connection options for the tuning values present in the configuration.
    pub fn connection_options(&self) -> Vec<ConnectionOption> {
        let mut options = vec![];

        if let Some(count) = self.max_reconnect_retries {
            options.push(ConnectionOption::MaxReconnectRetries(count));
        }

        if let Some(ms) = self.reconnect_interval_ms {
            options.push(ConnectionOption::ReconnectInterval(Duration::from_millis(ms)));
        }

        if let Some(secs) = self.heartbeat_secs {
            options.push(ConnectionOption::Heartbeat(Duration::from_secs(secs)));
        }

        options
    }

    /// A lapin dialer that names its connections after the application.
    pub fn dialer(&self) -> LapinDialer {
        match &self.app_name {
            Some(name) => LapinDialer::with_connection_name(name),
            None => LapinDialer::default(),
        }
    }
}
