// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Acknowledgement Coordinator
//!
//! The only way an execution unit can reach the channel. Units submit
//! [`ChannelOp`]s through a cloneable [`AckHandle`]; the channel-owning task
//! receives them from the [`AckQueue`] and applies them in submission order.
//! A publish submitted before an ack by the same unit is therefore always
//! applied first.

use crate::{
    broker::{BrokerChannel, OutboundMessage},
    errors::AmqpError,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// An operation to run on the channel-owning task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOp {
    Publish(OutboundMessage),
    Ack(u64),
    Nack { delivery_tag: u64, requeue: bool },
}

/// Sending side, held by execution units.
#[derive(Debug, Clone)]
pub struct AckHandle {
    tx: mpsc::UnboundedSender<ChannelOp>,
}

/// Receiving side, owned by the channel-owning task.
#[derive(Debug)]
pub struct AckQueue {
    rx: mpsc::UnboundedReceiver<ChannelOp>,
}

/// Creates a connected handle/queue pair.
pub fn ack_channel() -> (AckHandle, AckQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AckHandle { tx }, AckQueue { rx })
}

impl AckHandle {
    /// Schedules an operation. Returns `false` when the owning task is gone.
    pub fn submit(&self, op: ChannelOp) -> bool {
        match self.tx.send(op) {
            Ok(_) => true,
            Err(mpsc::error::SendError(op)) => {
                error!(?op, "channel owner has stopped, dropping operation");
                false
            }
        }
    }

    /// Schedules a persistent publish on the worker's exchange.
    ///
    /// # Parameters
    /// * `msg` - The message, routing key already prefixed
    ///
    /// # Returns
    /// `false` when the owning task is gone and the publish was dropped
    pub fn publish(&self, msg: OutboundMessage) -> bool {
        self.submit(ChannelOp::Publish(msg))
    }

    /// Schedules the acknowledgement of `delivery_tag`.
    pub fn ack(&self, delivery_tag: u64) -> bool {
        self.submit(ChannelOp::Ack(delivery_tag))
    }

    /// Schedules a negative acknowledgement of `delivery_tag`.
    pub fn nack(&self, delivery_tag: u64, requeue: bool) -> bool {
        self.submit(ChannelOp::Nack {
            delivery_tag,
            requeue,
        })
    }
}

impl AckQueue {
    /// Waits for the next operation.
    pub async fn recv(&mut self) -> Option<ChannelOp> {
        self.rx.recv().await
    }

    /// Takes every operation already queued, without waiting.
    pub fn drain(&mut self) -> Vec<ChannelOp> {
        let mut ops = vec![];
        while let Ok(op) = self.rx.try_recv() {
            ops.push(op);
        }
        ops
    }
}

/// Runs `op` on `channel`. Must only be called by the channel-owning task.
///
/// A closed channel or a broker error drops the operation after logging it;
/// nothing is retried.
pub async fn apply<B>(channel: &B, exchange: &str, op: ChannelOp)
where
    B: BrokerChannel + ?Sized,
{
    if !channel.is_open() {
        match &op {
            ChannelOp::Publish(msg) => error!(
                routing_key = msg.routing_key,
                "channel is closed, cannot queue message"
            ),
            ChannelOp::Ack(tag) => error!(delivery_tag = tag, "channel is closed, cannot ack message"),
            ChannelOp::Nack { delivery_tag, .. } => error!(
                delivery_tag = delivery_tag,
                "channel is closed, cannot nack message"
            ),
        }
        return;
    }

    let result: Result<(), AmqpError> = match &op {
        ChannelOp::Publish(msg) => {
            info!(routing_key = msg.routing_key, "sending follow-up message");
            channel.publish(exchange, msg).await
        }
        ChannelOp::Ack(tag) => {
            info!(delivery_tag = tag, "acknowledging message");
            channel.ack(*tag).await
        }
        ChannelOp::Nack {
            delivery_tag,
            requeue,
        } => {
            info!(delivery_tag, requeue, "rejecting message");
            channel.nack(*delivery_tag, *requeue).await
        }
    };

    match result {
        Ok(()) => debug!(?op, "channel operation applied"),
        Err(err) => error!(error = err.to_string(), "channel operation failed, dropping"),
    }
}
