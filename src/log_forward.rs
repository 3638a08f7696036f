// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Log Forwarding
//!
//! [`BrokerLogLayer`] is a `tracing` layer that turns log records into
//! persistent messages routed as `{job_id}.{source}.rust.{level}`, so the
//! progress of one job can be followed by binding `{job_id}.#`. The job id
//! comes from the enclosing `job` span; records outside a job use
//! `NoJobId`.
//!
//! The layer never touches the channel. Records are queued on an unbounded
//! channel and [`Worker`](crate::Worker) publishes them from the
//! channel-owning task (see `Worker::forward_logs`). Records of the AMQP
//! client stack and of the forwarding itself are skipped so publishing a
//! record can never produce another one.

use crate::{broker::OutboundMessage, handler::NO_JOB_ID, telemetry};
use serde_json::{json, Map, Value};
use std::{
    collections::BTreeMap,
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::mpsc;
use tracing::{
    field::{Field, Visit},
    span, Event, Level, Subscriber,
};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

/// Target of the spans and events emitted while forwarding records.
pub const LOG_FORWARD_TARGET: &str = "topic_worker::log_forward";

const SKIPPED_TARGETS: [&str; 4] = ["lapin", "amq_protocol", "pinky_swear", LOG_FORWARD_TARGET];
const RECORD_KIND: &str = "rust";

/// Creates the layer and the queue its records are read from.
///
/// # Parameters
/// * `source` - Second segment of the routing key, usually the worker name
/// * `min_level` - Least severe level forwarded
///
/// # Returns
/// The layer to install and the [`LogRecords`] to hand to the worker.
pub fn broker_log_layer(source: &str, min_level: Level) -> (BrokerLogLayer, LogRecords) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        BrokerLogLayer {
            source: source.to_owned(),
            min_level,
            records: tx,
        },
        LogRecords { rx },
    )
}

/// Forwards log records to the broker.
pub struct BrokerLogLayer {
    source: String,
    min_level: Level,
    records: mpsc::UnboundedSender<OutboundMessage>,
}

/// Receiving end of a [`BrokerLogLayer`].
///
/// Records accumulate until a worker drains them, so it should be handed to
/// the worker that runs in the same process.
pub struct LogRecords {
    rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl LogRecords {
    /// Next record, or `None` once the layer is gone and the queue empty.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        self.rx.recv().await
    }

    /// Every record currently queued.
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        let mut records = Vec::new();
        while let Ok(record) = self.rx.try_recv() {
            records.push(record);
        }
        records
    }
}

struct JobId(String);

#[derive(Default)]
struct JobIdVisitor(Option<String>);

impl Visit for JobIdVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "job_id" {
            self.0 = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "job_id" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: Map<String, Value>,
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        } else {
            self.fields.insert(field.name().to_owned(), Value::from(value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let value = format!("{value:?}");
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.insert(field.name().to_owned(), Value::from(value));
        }
    }
}

fn is_skipped(target: &str) -> bool {
    SKIPPED_TARGETS.iter().any(|skipped| target.starts_with(skipped))
}

impl<S> Layer<S> for BrokerLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = JobIdVisitor::default();
        attrs.record(&mut visitor);
        if let (Some(job_id), Some(span)) = (visitor.0, ctx.span(id)) {
            span.extensions_mut().insert(JobId(job_id));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > self.min_level || is_skipped(meta.target()) {
            return;
        }

        let mut job_id = None;
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if span.metadata().target() == LOG_FORWARD_TARGET {
                    return;
                }
                if job_id.is_none() {
                    job_id = span.extensions().get::<JobId>().map(|id| id.0.clone());
                }
            }
        }
        let job_id = job_id.unwrap_or_else(|| NO_JOB_ID.to_owned());

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let level = meta.level().to_string();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let body = json!({
            "timestamp": timestamp,
            "level": level,
            "hostname": telemetry::hostname(),
            "job_id": job_id,
            "target": meta.target(),
            "message": visitor.message,
            "fields": visitor.fields,
        });
        let Ok(body) = serde_json::to_vec(&body) else {
            return;
        };

        let headers = BTreeMap::from([
            ("hostname".to_owned(), telemetry::hostname().to_owned()),
            ("job_id".to_owned(), job_id.clone()),
        ]);
        let record = OutboundMessage {
            routing_key: format!(
                "{job_id}.{}.{RECORD_KIND}.{}",
                self.source,
                level.to_ascii_lowercase()
            ),
            body,
            correlation_id: Some(job_id).filter(|id| id != NO_JOB_ID),
            headers,
        };

        // The worker may already be gone; the record is dropped then.
        let _ = self.records.send(record);
    }
}
