// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
#[cfg(test)]
mod testing;

pub mod broker;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod errors;
pub mod handler;
pub mod log_forward;
pub mod queue;
pub mod telemetry;
pub mod topology;
pub mod worker;

pub use config::{FailurePolicy, WorkerConfig};
pub use errors::AmqpError;
pub use handler::{HandlerError, HandlerResult, JobContext, JobHandler};
pub use worker::{LifecycleState, Worker};
