// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Lifecycle
//!
//! [`Worker`] owns the broker channel and is the channel-owning task: every
//! declare, bind, consume, ack, publish, cancel and close is issued from the
//! task driving it. Lifecycle:
//!
//! `Idle → Connecting → Bound → Consuming → Draining → Closed`
//!
//! The worker is `Connecting` until its first queue is bound (or until it
//! starts consuming with no binding at all).
//!
//! While consuming, a single `select!` loop services the shutdown token, the
//! [`AckQueue`], finished execution units and new deliveries. On shutdown
//! the consumers are cancelled, every running unit is awaited (their acks
//! and publishes are still applied), and only then is the connection closed.
//! Log records queued by a [`BrokerLogLayer`](crate::log_forward::BrokerLogLayer)
//! are published from the same loop.

use crate::{
    broker::{BrokerChannel, OutboundMessage},
    channel::AmqpChannel,
    config::WorkerConfig,
    coordinator::{self, ack_channel, AckQueue},
    dispatcher::Dispatcher,
    errors::AmqpError,
    handler::JobHandler,
    log_forward::{LogRecords, LOG_FORWARD_TARGET},
    queue::QueueBinding,
    topology::TopicBinder,
};
use futures_util::{stream::select_all, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Connecting,
    Bound,
    Consuming,
    Draining,
    Closed,
}

/// A worker consuming jobs from a topic exchange.
pub struct Worker<B: BrokerChannel> {
    channel: B,
    cfg: Arc<WorkerConfig>,
    binder: TopicBinder,
    state: watch::Sender<LifecycleState>,
    logs: Option<LogRecords>,
}

impl Worker<AmqpChannel> {
    /// Connects to the broker (retrying transport failures), applies the
    /// prefetch quota and declares the exchange.
    ///
    /// # Parameters
    /// * `cfg` - Broker endpoint, exchange and quota
    ///
    /// # Returns
    /// A `Connecting` worker ready for [`Worker::bind`], or the error of the
    /// last connect attempt.
    pub async fn connect(cfg: WorkerConfig) -> Result<Self, AmqpError> {
        cfg.validate()?;
        let (state, _) = watch::channel(LifecycleState::Idle);
        transition(&state, LifecycleState::Connecting);

        info!(host = cfg.host, exchange = cfg.exchange, "connecting worker");
        let channel = AmqpChannel::connect(&cfg).await?;
        Worker::setup(channel, cfg, state).await
    }
}

impl<B: BrokerChannel> Worker<B> {
    /// Sets up a worker on an already connected channel.
    ///
    /// # Parameters
    /// * `channel` - The session the worker takes ownership of
    /// * `cfg` - Exchange, quota and naming; a zero prefetch count is refused
    ///
    /// # Returns
    /// A `Connecting` worker with the quota applied and the exchange declared.
    pub async fn with_channel(channel: B, cfg: WorkerConfig) -> Result<Self, AmqpError> {
        let (state, _) = watch::channel(LifecycleState::Idle);
        transition(&state, LifecycleState::Connecting);
        Worker::setup(channel, cfg, state).await
    }

    async fn setup(
        channel: B,
        cfg: WorkerConfig,
        state: watch::Sender<LifecycleState>,
    ) -> Result<Self, AmqpError> {
        cfg.validate()?;
        channel.qos(cfg.prefetch_count).await?;
        let mut binder = TopicBinder::new(&cfg.exchange);
        binder.declare_exchange(&channel, true).await?;

        Ok(Worker {
            channel,
            cfg: Arc::new(cfg),
            binder,
            state,
            logs: None,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Observes lifecycle transitions, including after [`Worker::run`]
    /// has taken ownership of the worker.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Configuration the worker was built with.
    pub fn config(&self) -> &WorkerConfig {
        &self.cfg
    }

    /// Publishes the records of a [`BrokerLogLayer`](crate::log_forward::BrokerLogLayer)
    /// on the configured log exchange while the worker runs.
    pub fn forward_logs(&mut self, records: LogRecords) {
        self.logs = Some(records);
    }

    /// Declares `queue`, binds it under `routing_key` and consumes it with
    /// `handler` once the worker runs. Repeating a bind is a no-op.
    ///
    /// # Parameters
    /// * `queue` - Queue name, prefixed with the node name when configured
    /// * `routing_key` - Topic pattern, prefixed the same way
    /// * `handler` - Runs once per delivery on the blocking pool
    pub async fn bind<H: JobHandler>(
        &mut self,
        queue: &str,
        routing_key: &str,
        handler: H,
    ) -> Result<(), AmqpError> {
        let queue = self.cfg.queue_name(queue);
        let pattern = self.cfg.routing_key(routing_key);
        self.binder
            .bind(&self.channel, &queue, &pattern, Some(Arc::new(handler)))
            .await?;
        self.mark_bound();
        Ok(())
    }

    /// Declares and binds `queue` without consuming it, so messages chained
    /// to it are kept until another worker picks them up.
    pub async fn declare_route(&mut self, queue: &str, routing_key: &str) -> Result<(), AmqpError> {
        let queue = self.cfg.queue_name(queue);
        let pattern = self.cfg.routing_key(routing_key);
        self.binder
            .bind(&self.channel, &queue, &pattern, None)
            .await?;
        self.mark_bound();
        Ok(())
    }

    /// Every queue declared so far.
    pub fn bindings(&self) -> &[QueueBinding] {
        self.binder.bindings()
    }

    /// Publishes a persistent message on the worker's exchange.
    pub async fn queue_message(&self, routing_key: &str, body: &[u8]) -> Result<(), AmqpError> {
        let msg = OutboundMessage {
            routing_key: self.cfg.routing_key(routing_key),
            body: body.to_vec(),
            ..Default::default()
        };
        info!(routing_key = msg.routing_key, "queueing message");
        self.channel.publish(self.binder.exchange(), &msg).await
    }

    /// Runs until the process receives an interrupt.
    pub async fn start(self) -> Result<(), AmqpError> {
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();

        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received");
                    trigger.cancel();
                }
                Err(err) => error!(error = err.to_string(), "failure to listen for interrupts"),
            }
        });

        self.run(shutdown).await
    }

    /// Consumes every bound queue until `shutdown` is cancelled or the
    /// broker ends all consumers, then drains and closes.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), AmqpError> {
        self.mark_bound();
        let mut logs = self.logs.take();
        let (acks, mut ops) = ack_channel();
        let mut dispatcher = Dispatcher::new(self.cfg.clone(), acks);

        let bindings: Vec<QueueBinding> = self.binder.consumed().cloned().collect();
        let mut consumer_tags = Vec::with_capacity(bindings.len());
        let mut streams = Vec::with_capacity(bindings.len());
        for (idx, binding) in bindings.iter().enumerate() {
            let tag = format!("{}-{}", binding.name, Uuid::new_v4());
            let deliveries = self.channel.consume(&binding.name, &tag).await?;
            streams.push(deliveries.map(move |delivery| (idx, delivery)).boxed());
            consumer_tags.push(tag);
        }
        let mut deliveries = select_all(streams);

        self.transition(LifecycleState::Consuming);
        info!(queues = bindings.len(), "starting to consume messages");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("stopping consuming ...");
                    break;
                }
                Some(op) = ops.recv() => {
                    coordinator::apply(&self.channel, self.binder.exchange(), op).await;
                }
                Some(()) = dispatcher.join_next() => {}
                Some(record) = next_log(&mut logs) => self.publish_log(record).await,
                next = deliveries.next() => match next {
                    Some((idx, Ok(msg))) => {
                        debug!(delivery_tag = msg.delivery_tag, queue = bindings[idx].name, "delivery received");
                        dispatcher.dispatch(&bindings[idx], msg);
                    }
                    Some((_, Err(err))) => error!(error = err.to_string(), "errors consume msg"),
                    None => {
                        warn!("no consumer left, stopping");
                        break;
                    }
                },
            }
        }

        self.transition(LifecycleState::Draining);
        for tag in &consumer_tags {
            if let Err(err) = self.channel.cancel(tag).await {
                error!(error = err.to_string(), consumer_tag = tag, "failure to cancel consumer");
            }
        }
        drop(deliveries);
        info!(in_flight = dispatcher.in_flight(), "stopped consuming messages");

        self.drain(&mut dispatcher, &mut ops, &mut logs).await;
        self.close().await
    }

    /// Waits for every execution unit while applying what they submit.
    async fn drain(
        &self,
        dispatcher: &mut Dispatcher,
        ops: &mut AckQueue,
        logs: &mut Option<LogRecords>,
    ) {
        while !dispatcher.is_idle() {
            tokio::select! {
                Some(op) = ops.recv() => {
                    coordinator::apply(&self.channel, self.binder.exchange(), op).await;
                }
                Some(()) = dispatcher.join_next() => {}
                Some(record) = next_log(logs) => self.publish_log(record).await,
                else => break,
            }
        }

        for op in ops.drain() {
            coordinator::apply(&self.channel, self.binder.exchange(), op).await;
        }
        debug!("all execution units finished");

        if let Some(logs) = logs {
            for record in logs.drain() {
                self.publish_log(record).await;
            }
        }
    }

    async fn publish_log(&self, record: OutboundMessage) {
        if !self.channel.is_open() {
            return;
        }
        let published = self
            .channel
            .publish(&self.cfg.log_exchange, &record)
            .instrument(info_span!(target: LOG_FORWARD_TARGET, "log_forward"))
            .await;
        if let Err(err) = published {
            debug!(target: LOG_FORWARD_TARGET, error = %err, "failure to forward log record");
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let closed = self.channel.close().await;
        self.transition(LifecycleState::Closed);
        closed
    }

    fn mark_bound(&self) {
        if self.state() == LifecycleState::Connecting {
            self.transition(LifecycleState::Bound);
        }
    }

    fn transition(&self, next: LifecycleState) {
        transition(&self.state, next);
    }
}

fn transition(state: &watch::Sender<LifecycleState>, next: LifecycleState) {
    let prev = state.send_replace(next);
    info!(from = ?prev, to = ?next, "worker state changed");
}

async fn next_log(logs: &mut Option<LogRecords>) -> Option<OutboundMessage> {
    match logs {
        Some(logs) => logs.recv().await,
        None => None,
    }
}
