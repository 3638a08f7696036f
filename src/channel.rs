// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module establishes the broker session: it connects with capped
//! exponential backoff, opens the single channel the worker uses, and
//! implements [`BrokerChannel`] on top of lapin.
//!
//! The retry loop gives up as soon as the *next* delay would reach the
//! configured maximum, without attempting the connect that delay would have
//! preceded. With the defaults (0.5 s initial, 64 s maximum) the worker
//! sleeps 1, 2, 4, 8, 16 and 32 seconds between seven attempts.

use crate::{
    broker::{BrokerChannel, DeliveryStream, InFlightMessage, OutboundMessage, PERSISTENT_DELIVERY_MODE},
    config::WorkerConfig,
    errors::AmqpError,
    telemetry,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::{collections::BTreeMap, future::Future, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Delay the backoff starts from before the first doubling.
pub const FIRST_WAIT_BEFORE_RETRY: Duration = Duration::from_millis(500);
/// Once the computed delay reaches this value the manager gives up.
pub const MAX_WAIT_BEFORE_RETRY: Duration = Duration::from_secs(64);

/// Capped exponential backoff parameters for the initial connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_delay: FIRST_WAIT_BEFORE_RETRY,
            max_delay: MAX_WAIT_BEFORE_RETRY,
        }
    }
}

impl RetryPolicy {
    /// The sequence of delays to sleep between failed attempts.
    pub fn backoff(&self) -> ConnectBackoff {
        ConnectBackoff {
            current: self.initial_delay,
            max: self.max_delay,
        }
    }
}

/// Iterator over retry delays. Each step doubles the delay and ends the
/// sequence once the doubled value meets or exceeds the maximum.
#[derive(Debug, Clone)]
pub struct ConnectBackoff {
    current: Duration,
    max: Duration,
}

impl Iterator for ConnectBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.current = self.current.checked_mul(2)?;
        if self.current >= self.max {
            return None;
        }
        Some(self.current)
    }
}

/// Runs `attempt` until it succeeds, retrying transport failures
/// ([`AmqpError::ConnectionError`]) according to `policy`.
///
/// Any other error is returned immediately. When the backoff is exhausted
/// the error of the last attempt is returned.
pub async fn connect_with_retry<T, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<T, AmqpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AmqpError>>,
{
    let mut backoff = policy.backoff();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        info!(attempt = attempts, "trying to connect to the rabbitmq server");

        let err = match attempt().await {
            Ok(conn) => return Ok(conn),
            Err(err @ AmqpError::ConnectionError(_)) => err,
            Err(err) => return Err(err),
        };

        match backoff.next() {
            Some(delay) => {
                warn!(
                    error = err.to_string(),
                    delay_secs = delay.as_secs_f64(),
                    "failure to connect to the rabbitmq, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            None => {
                error!(
                    error = err.to_string(),
                    attempts, "failure to connect to the rabbitmq, giving up"
                );
                return Err(err);
            }
        }
    }
}

/// A lapin connection together with the one channel the worker drives.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

impl AmqpChannel {
    /// Connects to the broker described by `cfg`, retrying transport
    /// failures, and opens a channel.
    pub async fn connect(cfg: &WorkerConfig) -> Result<AmqpChannel, AmqpError> {
        let uri = cfg.amqp_uri();
        let uri = &uri;
        let name = format!("{}-{}", cfg.worker_name, telemetry::hostname());
        let name = name.as_str();

        debug!(host = cfg.host, port = cfg.port, tls = cfg.use_tls, "creating amqp connection...");
        let connection = connect_with_retry(&cfg.retry, move || open_connection(uri, name)).await?;
        debug!("amqp connected");

        debug!("creating amqp channel...");
        match connection.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(AmqpChannel {
                    connection,
                    channel,
                })
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }
}

async fn open_connection(uri: &AMQPUri, name: &str) -> Result<Connection, AmqpError> {
    let options =
        ConnectionProperties::default().with_connection_name(LongString::from(name.to_owned()));

    Connection::connect_uri(uri.clone(), options)
        .await
        .map_err(|err| AmqpError::ConnectionError(err.to_string()))
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: true })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn declare_queue(&self, name: &str) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the queue");
                AmqpError::DeclareQueueError(name.to_owned())
            })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                AmqpError::BindingConsumerError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(in_flight)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn publish(&self, exchange: &str, msg: &OutboundMessage) -> Result<(), AmqpError> {
        let headers: BTreeMap<ShortString, AMQPValue> = msg
            .headers
            .iter()
            .map(|(key, value)| {
                (
                    ShortString::from(key.clone()),
                    AMQPValue::LongString(LongString::from(value.clone())),
                )
            })
            .collect();

        let mut props = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));
        if let Some(id) = &msg.correlation_id {
            props = props.with_correlation_id(ShortString::from(id.clone()));
        }

        match self
            .channel
            .basic_publish(
                exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.body,
                props,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(msg.routing_key.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError(delivery_tag)
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
                AmqpError::NackMessageError(delivery_tag)
            })
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.connection
            .close(200, "worker shutdown")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error closing the connection");
                AmqpError::CloseError(err.to_string())
            })
    }
}

fn in_flight(delivery: Delivery) -> InFlightMessage {
    let correlation_id = delivery
        .properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str().to_owned());
    let headers = string_headers(delivery.properties.headers());

    InFlightMessage {
        delivery_tag: delivery.delivery_tag,
        correlation_id,
        routing_key: delivery.routing_key.as_str().to_owned(),
        headers,
        body: delivery.data,
    }
}

/// Keeps the string-valued entries of an AMQP header table.
fn string_headers(table: &Option<FieldTable>) -> BTreeMap<String, String> {
    let Some(table) = table else {
        return BTreeMap::new();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok()?.to_owned(),
                AMQPValue::ShortString(v) => v.as_str().to_owned(),
                _ => return None,
            };
            Some((key.as_str().to_owned(), value))
        })
        .collect()
}
