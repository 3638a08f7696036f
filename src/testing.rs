// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the worker tests. It honors the prefetch quota
//! the way RabbitMQ does: no delivery is handed out while the number of
//! unacknowledged deliveries equals the quota.

use crate::{
    broker::{BrokerChannel, DeliveryStream, InFlightMessage, OutboundMessage},
    errors::AmqpError,
};
use async_trait::async_trait;
use futures_util::stream;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

/// Everything the fake saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Qos(u16),
    DeclareExchange(String),
    DeclareQueue(String),
    Bind(String, String),
    Consume(String),
    Deliver(u64),
    Cancel(String),
    Publish(String, Vec<u8>),
    Ack(u64),
    Nack(u64, bool),
    Close,
}

#[derive(Default)]
struct State {
    prefetch: usize,
    next_tag: u64,
    pending: HashMap<String, VecDeque<Vec<u8>>>,
    unacked: HashSet<u64>,
    max_unacked: usize,
    cancelled: HashSet<String>,
    closed: bool,
    events: Vec<Event>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<State>>,
}

impl FakeBroker {
    pub(crate) fn new() -> FakeBroker {
        FakeBroker::default()
    }

    /// Queues a message for delivery on `queue`.
    pub(crate) fn push(&self, queue: &str, body: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .pending
            .entry(queue.to_owned())
            .or_default()
            .push_back(body.as_bytes().to_vec());
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub(crate) fn acked(&self) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Ack(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn max_unacked(&self) -> usize {
        self.state.lock().unwrap().max_unacked
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        !self.state.lock().unwrap().cancelled.is_empty()
    }

    fn record(&self, event: Event) {
        self.state.lock().unwrap().events.push(event);
    }

    fn next_delivery(&self, queue: &str, tag: &str) -> Option<Option<InFlightMessage>> {
        let mut state = self.state.lock().unwrap();
        if state.closed || state.cancelled.contains(tag) {
            return None;
        }
        if state.prefetch > 0 && state.unacked.len() >= state.prefetch {
            return Some(None);
        }
        let body = match state.pending.get_mut(queue).and_then(VecDeque::pop_front) {
            Some(body) => body,
            None => return Some(None),
        };

        state.next_tag += 1;
        let delivery_tag = state.next_tag;
        state.unacked.insert(delivery_tag);
        state.max_unacked = state.max_unacked.max(state.unacked.len());
        state.events.push(Event::Deliver(delivery_tag));

        Some(Some(InFlightMessage {
            delivery_tag,
            body,
            routing_key: queue.to_owned(),
            ..Default::default()
        }))
    }
}

#[async_trait]
impl BrokerChannel for FakeBroker {
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.prefetch = usize::from(prefetch_count);
        state.events.push(Event::Qos(prefetch_count));
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, _durable: bool) -> Result<(), AmqpError> {
        self.record(Event::DeclareExchange(name.to_owned()));
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<(), AmqpError> {
        self.record(Event::DeclareQueue(name.to_owned()));
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, _exchange: &str, pattern: &str) -> Result<(), AmqpError> {
        self.record(Event::Bind(queue.to_owned(), pattern.to_owned()));
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.record(Event::Consume(queue.to_owned()));

        let broker = self.clone();
        let queue = queue.to_owned();
        let tag = consumer_tag.to_owned();
        let deliveries = stream::unfold((), move |_| {
            let broker = broker.clone();
            let queue = queue.clone();
            let tag = tag.clone();
            async move {
                loop {
                    match broker.next_delivery(&queue, &tag) {
                        None => return None,
                        Some(Some(msg)) => return Some((Ok(msg), ())),
                        Some(None) => tokio::time::sleep(Duration::from_millis(2)).await,
                    }
                }
            }
        });

        Ok(Box::pin(deliveries))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.cancelled.insert(consumer_tag.to_owned());
        state.events.push(Event::Cancel(consumer_tag.to_owned()));
        Ok(())
    }

    async fn publish(&self, _exchange: &str, msg: &OutboundMessage) -> Result<(), AmqpError> {
        self.record(Event::Publish(msg.routing_key.clone(), msg.body.clone()));
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.unacked.remove(&delivery_tag);
        state.events.push(Event::Ack(delivery_tag));
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.unacked.remove(&delivery_tag);
        state.events.push(Event::Nack(delivery_tag, requeue));
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.state.lock().unwrap().closed
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.events.push(Event::Close);
        Ok(())
    }
}
