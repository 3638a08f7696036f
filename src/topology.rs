// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topic Topology
//!
//! Declares the worker's topic exchange and binds queues to it under
//! routing-key patterns. Declarations are idempotent on (queue, pattern):
//! a queue is declared once however many patterns it gains, and binding the
//! same pattern twice is a no-op. Bindings cannot be removed.
//!
//! All methods run on the channel-owning task during setup.

use crate::{broker::BrokerChannel, errors::AmqpError, handler::JobHandler, queue::QueueBinding};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tracks what has been declared on the channel.
#[derive(Debug, Default)]
pub struct TopicBinder {
    exchange: String,
    exchange_declared: bool,
    queues: Vec<QueueBinding>,
}

impl TopicBinder {
    /// Creates a binder for `exchange`; nothing is declared until
    /// [`TopicBinder::declare_exchange`] runs.
    ///
    /// # Parameters
    /// * `exchange` - Name of the topic exchange every binding targets
    pub fn new(exchange: &str) -> TopicBinder {
        TopicBinder {
            exchange: exchange.to_owned(),
            ..Default::default()
        }
    }

    /// Name of the exchange.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Declares the topic exchange every binding targets.
    pub async fn declare_exchange<B>(&mut self, channel: &B, durable: bool) -> Result<(), AmqpError>
    where
        B: BrokerChannel + ?Sized,
    {
        if self.exchange_declared {
            return Ok(());
        }

        debug!(exchange = self.exchange, durable, "creating exchange");
        channel.declare_exchange(&self.exchange, durable).await?;
        self.exchange_declared = true;
        debug!(exchange = self.exchange, "exchange was created");

        Ok(())
    }

    /// Declares `queue`, binds it under `pattern` and registers `handler`.
    ///
    /// # Parameters
    /// * `channel` - Channel the declarations are issued on
    /// * `queue` - Queue name, already prefixed
    /// * `pattern` - Topic routing-key pattern, already prefixed
    /// * `handler` - Consumer of the queue, or `None` for a route only
    ///
    /// # Returns
    /// `false` when the (queue, pattern) pair was already bound. A queue
    /// keeps the first handler registered for it.
    pub async fn bind<B>(
        &mut self,
        channel: &B,
        queue: &str,
        pattern: &str,
        handler: Option<Arc<dyn JobHandler>>,
    ) -> Result<bool, AmqpError>
    where
        B: BrokerChannel + ?Sized,
    {
        let idx = match self.queues.iter().position(|q| q.name == queue) {
            Some(idx) => idx,
            None => {
                debug!(queue, "creating queue");
                channel.declare_queue(queue).await?;
                self.queues.push(QueueBinding::new(queue));
                self.queues.len() - 1
            }
        };

        let already_bound = self.queues[idx].is_bound_to(pattern);
        if !already_bound {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                queue, self.exchange, pattern
            );
            channel.bind_queue(queue, &self.exchange, pattern).await?;
            self.queues[idx].patterns.push(pattern.to_owned());
        }

        let binding = &mut self.queues[idx];
        if let Some(handler) = handler {
            if binding.handler.is_none() {
                binding.handler = Some(handler);
            } else if !already_bound {
                warn!(queue, "queue already has a handler, keeping the first one");
            }
        }

        if already_bound {
            debug!(queue, pattern, "binding already declared");
        } else {
            info!("Declare::Bind, Q::RK, {}::{}", queue, pattern);
        }

        Ok(!already_bound)
    }

    /// Every declared queue, in declaration order.
    pub fn bindings(&self) -> &[QueueBinding] {
        &self.queues
    }

    /// Queues with a registered handler; these get a consumer.
    pub fn consumed(&self) -> impl Iterator<Item = &QueueBinding> {
        self.queues.iter().filter(|q| q.has_handler())
    }
}
