// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Channel Abstraction
//!
//! The `BrokerChannel` trait is the seam between the harness and the AMQP
//! client. It describes one session owning exactly one channel; every method
//! must be called from the channel-owning task. The production
//! implementation is [`crate::channel::AmqpChannel`].

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::BTreeMap;

/// AMQP delivery mode marking a message as persistent.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A delivery received from the broker and not yet acknowledged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InFlightMessage {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub routing_key: String,
    /// String-valued headers, used for trace context propagation.
    pub headers: BTreeMap<String, String>,
}

/// A message to publish on the worker's exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// Stream of deliveries for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<InFlightMessage, AmqpError>>;

/// Operations on a single broker channel.
///
/// Implementations are not required to be safe to drive from several tasks
/// at once; the harness guarantees a single owner.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Applies a channel-global prefetch quota.
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Declares a topic exchange.
    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<(), AmqpError>;

    /// Declares a durable, non-exclusive queue.
    async fn declare_queue(&self, name: &str) -> Result<(), AmqpError>;

    /// Binds a queue to an exchange under a routing-key pattern.
    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str)
        -> Result<(), AmqpError>;

    /// Starts a consumer with explicit acknowledgements.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    /// Cancels a consumer; the broker stops delivering to it.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Publishes a persistent message.
    ///
    /// # Parameters
    /// * `exchange` - Exchange the message is routed through
    /// * `msg` - Routing key, body, correlation id and string headers
    async fn publish(&self, exchange: &str, msg: &OutboundMessage) -> Result<(), AmqpError>;

    /// Acknowledges one delivery; the broker forgets the message.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Negatively acknowledges one delivery.
    ///
    /// # Parameters
    /// * `delivery_tag` - Tag of the delivery on this channel
    /// * `requeue` - Put the message back on its queue instead of dropping
    ///   or dead-lettering it
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Whether the channel still accepts operations.
    fn is_open(&self) -> bool;

    /// Closes the channel and its connection.
    async fn close(&self) -> Result<(), AmqpError>;
}
