// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Job Handlers
//!
//! A handler receives the raw body of one delivery together with an explicit
//! [`JobContext`] and returns a [`HandlerResult`]: either `Done`, or the
//! routing key of a follow-up message that carries the same body. Handlers
//! run on the blocking pool and never touch the channel.

use crate::broker::InFlightMessage;
use serde::Deserialize;
use std::error::Error;

/// Correlation id used when a delivery carries none.
pub const NO_JOB_ID: &str = "NoJobId";

/// Error type handlers report failures with.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Outcome of a successful handler run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerResult {
    /// Acknowledge the delivery.
    Done,
    /// Publish the same body under this routing key, then acknowledge.
    Forward(String),
}

impl From<Option<String>> for HandlerResult {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(key) => HandlerResult::Forward(key),
            None => HandlerResult::Done,
        }
    }
}

/// Per-delivery context handed to the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub correlation_id: String,
    pub delivery_tag: u64,
    pub queue: String,
    pub routing_key: String,
    pub hostname: String,
}

impl JobContext {
    pub(crate) fn new(msg: &InFlightMessage, queue: &str, hostname: &str) -> JobContext {
        JobContext {
            correlation_id: correlation_id(msg),
            delivery_tag: msg.delivery_tag,
            queue: queue.to_owned(),
            routing_key: msg.routing_key.clone(),
            hostname: hostname.to_owned(),
        }
    }
}

/// Processes one job.
pub trait JobHandler: Send + Sync + 'static {
    fn handle(&self, ctx: &JobContext, body: &[u8]) -> Result<HandlerResult, HandlerError>;
}

impl<F> JobHandler for F
where
    F: Fn(&JobContext, &[u8]) -> Result<HandlerResult, HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, ctx: &JobContext, body: &[u8]) -> Result<HandlerResult, HandlerError> {
        self(ctx, body)
    }
}

#[derive(Deserialize)]
struct JobEnvelope {
    id: Option<serde_json::Value>,
}

/// The delivery's correlation id property, else the `id` field of a JSON
/// body, else [`NO_JOB_ID`].
pub(crate) fn correlation_id(msg: &InFlightMessage) -> String {
    if let Some(id) = msg.correlation_id.as_deref().filter(|id| !id.is_empty()) {
        return id.to_owned();
    }

    match serde_json::from_slice::<JobEnvelope>(&msg.body) {
        Ok(JobEnvelope {
            id: Some(serde_json::Value::String(id)),
        }) if !id.is_empty() => id,
        Ok(JobEnvelope {
            id: Some(serde_json::Value::Number(id)),
        }) => id.to_string(),
        _ => NO_JOB_ID.to_owned(),
    }
}
