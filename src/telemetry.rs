// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logging Setup
//!
//! Installs the `tracing` subscriber used by worker binaries. Every record a
//! handler emits is nested under the `job` span opened by the dispatcher, so
//! the correlation id and hostname travel with it without any global state.
//! [`init_logging_with`] additionally installs a [`BrokerLogLayer`] so the
//! same records are published on the broker.

use crate::log_forward::BrokerLogLayer;
use std::{env, str::FromStr, sync::OnceLock};
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter,
};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format `{other}`")),
        }
    }
}

/// Installs a global subscriber filtered by `RUST_LOG`.
///
/// # Parameters
/// * `format` - Text or JSON output on stdout
///
/// # Returns
/// An error when a global subscriber is already installed.
pub fn init_logging(format: LogFormat) -> Result<(), TryInitError> {
    init_logging_with(format, None)
}

/// Like [`init_logging`], also forwarding records through `broker` when
/// given. See [`crate::log_forward::broker_log_layer`].
pub fn init_logging_with(
    format: LogFormat,
    broker: Option<BrokerLogLayer>,
) -> Result<(), TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(broker)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(broker)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
    }
}

/// Placeholder used when no host name can be resolved.
pub const UNKNOWN_HOST: &str = "unknown-host";

/// Name of the host the worker runs on.
///
/// `HOSTNAME` (or `COMPUTERNAME`) wins when exported, which lets a container
/// report its pod name; otherwise the system host name is used.
pub fn hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| {
        let exported = env::var("HOSTNAME").or_else(|_| env::var("COMPUTERNAME")).ok();
        let system = gethostname::gethostname().into_string().ok();
        resolve_hostname(exported, system)
    })
}

fn resolve_hostname(exported: Option<String>, system: Option<String>) -> String {
    exported
        .into_iter()
        .chain(system)
        .map(|name| name.trim().to_owned())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| UNKNOWN_HOST.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_format() {
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!(" Text ".parse::<LogFormat>(), Ok(LogFormat::Text));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn hostname_is_never_empty() {
        assert!(!hostname().is_empty());
    }

    #[test]
    fn system_host_name_is_used_when_nothing_is_exported() {
        assert_eq!(resolve_hostname(None, Some("vm".to_owned())), "vm");
        assert_eq!(resolve_hostname(Some("  ".to_owned()), Some("vm".to_owned())), "vm");
        assert_eq!(resolve_hostname(Some("pod-7".to_owned()), Some("vm".to_owned())), "pod-7");
        assert_eq!(resolve_hostname(None, None), UNKNOWN_HOST);
    }
}
