// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Configuration
//!
//! Everything the harness consumes at construction time: broker endpoint,
//! credentials, TLS switch, exchange, prefetch quota, the optional node-name
//! prefix used for multi-tenant isolation, log forwarding, and the connect
//! retry policy.

use crate::{channel::RetryPolicy, errors::AmqpError};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use std::{env, str::FromStr};

/// Default prefetch quota; one job at a time unless configured otherwise.
pub const DEFAULT_PREFETCH_COUNT: u16 = 1;
/// Default AMQP heartbeat in seconds.
pub const DEFAULT_HEARTBEAT_SECS: u16 = 10;
/// Exchange log records are published to when forwarding is on.
pub const DEFAULT_LOG_EXCHANGE: &str = "amq.topic";

/// What the worker does with a delivery whose handler failed or panicked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Leave the delivery unacknowledged; the broker redelivers it once the
    /// connection is torn down.
    #[default]
    LeaveUnacked,
    /// Nack with requeue so the broker redelivers it immediately.
    Requeue,
    /// Nack without requeue; the queue's dead-letter exchange receives it,
    /// if one is configured.
    Reject,
}

impl FromStr for FailurePolicy {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "leave-unacked" | "leave_unacked" | "none" => Ok(FailurePolicy::LeaveUnacked),
            "requeue" => Ok(FailurePolicy::Requeue),
            "reject" | "dead-letter" => Ok(FailurePolicy::Reject),
            other => Err(AmqpError::ConfigError(format!(
                "unknown failure policy `{other}`"
            ))),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Used to name the AMQP connection (`{worker_name}-{hostname}`).
    pub worker_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Connect with `amqps://` when set.
    pub use_tls: bool,
    /// Topic exchange every binding and follow-up publish goes through.
    pub exchange: String,
    /// Global prefetch quota; also sizes the handler pool.
    pub prefetch_count: u16,
    pub heartbeat_secs: u16,
    /// Prefix applied to queue names and routing keys.
    pub node_name: Option<String>,
    pub failure_policy: FailurePolicy,
    /// Publish log records to the broker (see [`crate::telemetry::broker_log_layer`]).
    pub forward_logs: bool,
    /// Exchange the forwarded log records are published to.
    pub log_exchange: String,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            worker_name: "worker".to_owned(),
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            use_tls: false,
            exchange: "amq.topic".to_owned(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            node_name: None,
            failure_policy: FailurePolicy::default(),
            forward_logs: true,
            log_exchange: DEFAULT_LOG_EXCHANGE.to_owned(),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables, reading a `.env` file
    /// first when one exists.
    ///
    /// | Env Var                   | Default         |
    /// |---------------------------|-----------------|
    /// | `WORKER_NAME`             | `worker`        |
    /// | `RABBITMQ_HOST`           | `localhost`     |
    /// | `RABBITMQ_PORT`           | `5672`          |
    /// | `RABBITMQ_USER`           | `guest`         |
    /// | `RABBITMQ_PASSWORD`       | `guest`         |
    /// | `RABBITMQ_VHOST`          | `/`             |
    /// | `RABBITMQ_USE_TLS`        | `false`         |
    /// | `RABBITMQ_EXCHANGE`       | `amq.topic`     |
    /// | `RABBITMQ_PREFETCH_COUNT` | `1`             |
    /// | `RABBITMQ_HEARTBEAT_SECS` | `10`            |
    /// | `WORKER_NODE_NAME`        | unset           |
    /// | `WORKER_FAILURE_POLICY`   | `leave-unacked` |
    /// | `WORKER_FORWARD_LOGS`     | `true`          |
    /// | `WORKER_LOG_EXCHANGE`     | `amq.topic`     |
    ///
    /// # Returns
    /// The configuration, or [`AmqpError::ConfigError`] when a value does
    /// not parse or the prefetch count is zero.
    pub fn from_env() -> Result<Self, AmqpError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = WorkerConfig::default();

        let cfg = WorkerConfig {
            worker_name: lookup("WORKER_NAME").unwrap_or(defaults.worker_name),
            host: lookup("RABBITMQ_HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "RABBITMQ_PORT", defaults.port)?,
            user: lookup("RABBITMQ_USER").unwrap_or(defaults.user),
            password: lookup("RABBITMQ_PASSWORD").unwrap_or(defaults.password),
            vhost: lookup("RABBITMQ_VHOST").unwrap_or(defaults.vhost),
            use_tls: parse_or(&lookup, "RABBITMQ_USE_TLS", defaults.use_tls)?,
            exchange: lookup("RABBITMQ_EXCHANGE").unwrap_or(defaults.exchange),
            prefetch_count: parse_or(&lookup, "RABBITMQ_PREFETCH_COUNT", defaults.prefetch_count)?,
            heartbeat_secs: parse_or(&lookup, "RABBITMQ_HEARTBEAT_SECS", defaults.heartbeat_secs)?,
            node_name: lookup("WORKER_NODE_NAME").filter(|n| !n.trim().is_empty()),
            failure_policy: parse_or(&lookup, "WORKER_FAILURE_POLICY", defaults.failure_policy)?,
            forward_logs: parse_or(&lookup, "WORKER_FORWARD_LOGS", defaults.forward_logs)?,
            log_exchange: lookup("WORKER_LOG_EXCHANGE").unwrap_or(defaults.log_exchange),
            retry: defaults.retry,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Queue name with the node prefix applied.
    pub fn queue_name(&self, queue: &str) -> String {
        match &self.node_name {
            Some(node) => format!("{node}-{queue}"),
            None => queue.to_owned(),
        }
    }

    /// Routing key (or pattern) with the node prefix applied.
    pub fn routing_key(&self, key: &str) -> String {
        match &self.node_name {
            Some(node) => format!("{node}.{key}"),
            None => key.to_owned(),
        }
    }

    /// AMQP URI for this configuration.
    ///
    /// The URI is built field by field so credentials and vhost reach the
    /// broker verbatim, whatever characters they contain.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: if self.use_tls {
                AMQPScheme::AMQPS
            } else {
                AMQPScheme::AMQP
            },
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: Some(self.heartbeat_secs),
                ..Default::default()
            },
        }
    }

    /// Rejects settings the broker would accept but the worker cannot run
    /// with.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.prefetch_count == 0 {
            return Err(AmqpError::ConfigError(
                "prefetch count must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, AmqpError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AmqpError::ConfigError(format!("{key} has an invalid value `{raw}`"))),
    }
}
