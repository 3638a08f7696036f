// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! Turns each delivery into an execution unit tracked in a [`JoinSet`]. The
//! channel-owning task only spawns the unit and returns; the unit waits for
//! a slot in a semaphore sized to the prefetch quota, runs the handler on
//! the blocking pool inside a `job` span, and reports the outcome through
//! the [`AckHandle`]:
//!
//! - `Done`: ack;
//! - `Forward(key)`: persistent publish of the same body, then ack;
//! - error or panic: no ack and no publish; the configured
//!   [`FailurePolicy`] decides whether a nack is submitted.

use crate::{
    broker::{InFlightMessage, OutboundMessage},
    config::{FailurePolicy, WorkerConfig},
    coordinator::AckHandle,
    handler::{HandlerResult, JobContext, JobHandler, NO_JOB_ID},
    otel,
    queue::QueueBinding,
    telemetry,
};
use opentelemetry::{
    global,
    trace::{Status, TraceContextExt},
};
use std::sync::Arc;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{error, info, info_span, warn, Instrument};

/// Spawns and tracks execution units.
pub struct Dispatcher {
    cfg: Arc<WorkerConfig>,
    acks: AckHandle,
    permits: Arc<Semaphore>,
    registry: JoinSet<()>,
}

impl Dispatcher {
    /// Creates a dispatcher whose handler concurrency is bounded by the
    /// configured prefetch count.
    pub fn new(cfg: Arc<WorkerConfig>, acks: AckHandle) -> Dispatcher {
        let permits = Arc::new(Semaphore::new(usize::from(cfg.prefetch_count.max(1))));
        Dispatcher {
            cfg,
            acks,
            permits,
            registry: JoinSet::new(),
        }
    }

    /// Spawns an execution unit for `msg` and returns immediately.
    pub fn dispatch(&mut self, binding: &QueueBinding, msg: InFlightMessage) {
        let Some(handler) = binding.handler.clone() else {
            warn!(
                queue = binding.name,
                delivery_tag = msg.delivery_tag,
                "delivery on a queue without handler"
            );
            return;
        };

        let ctx = JobContext::new(&msg, &binding.name, telemetry::hostname());
        let span = info_span!(
            "job",
            job_id = %ctx.correlation_id,
            hostname = %ctx.hostname,
            delivery_tag = msg.delivery_tag,
            queue = %ctx.queue,
        );

        let unit = ExecutionUnit {
            handler,
            ctx,
            msg,
            cfg: self.cfg.clone(),
            acks: self.acks.clone(),
            permits: self.permits.clone(),
        };
        self.registry.spawn(unit.run().instrument(span));

        info!(in_flight = self.registry.len(), "dispatched message");
    }

    /// Number of execution units not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Whether every execution unit has been reaped.
    pub fn is_idle(&self) -> bool {
        self.registry.is_empty()
    }

    /// Waits for the next unit to finish. Returns `None` when none are
    /// tracked. Cancel safe.
    pub async fn join_next(&mut self) -> Option<()> {
        let joined = self.registry.join_next().await?;
        if let Err(err) = joined {
            error!(error = err.to_string(), "execution unit terminated abnormally");
        }
        Some(())
    }
}

struct ExecutionUnit {
    handler: Arc<dyn JobHandler>,
    ctx: JobContext,
    msg: InFlightMessage,
    cfg: Arc<WorkerConfig>,
    acks: AckHandle,
    permits: Arc<Semaphore>,
}

impl ExecutionUnit {
    async fn run(self) {
        let ExecutionUnit {
            handler,
            ctx,
            msg,
            cfg,
            acks,
            permits,
        } = self;

        // The semaphore is never closed.
        let Ok(_permit) = permits.acquire_owned().await else {
            return;
        };

        let (parent, span) = otel::new_span(&msg.headers, &global::tracer("amqp consumer"), &ctx.queue);
        let otel_cx = parent.with_span(span);

        let delivery_tag = msg.delivery_tag;
        let correlation_id = Some(ctx.correlation_id.clone()).filter(|id| id != NO_JOB_ID);
        let body = msg.body;
        let job_span = tracing::Span::current();

        info!(
            thread = ?std::thread::current().id(),
            body_len = body.len(),
            "running handler"
        );

        let outcome = tokio::task::spawn_blocking(move || {
            let result = job_span.in_scope(|| handler.handle(&ctx, &body));
            (result, body)
        })
        .await;

        match outcome {
            Ok((Ok(HandlerResult::Done), _)) => {
                otel_cx.span().set_status(Status::Ok);
                acks.ack(delivery_tag);
            }
            Ok((Ok(HandlerResult::Forward(key)), body)) => {
                let routing_key = cfg.routing_key(&key);
                info!(routing_key, "next routing key");
                otel_cx.span().set_status(Status::Ok);

                acks.publish(OutboundMessage {
                    routing_key,
                    body,
                    correlation_id,
                    headers: otel::inject(&otel_cx),
                });
                acks.ack(delivery_tag);
            }
            Ok((Err(err), _)) => {
                error!(error = %err, "handler failed");
                otel_cx.span().record_error(&*err);
                otel_cx.span().set_status(Status::error("handler failed"));
                on_failure(cfg.failure_policy, &acks, delivery_tag);
            }
            Err(err) => {
                error!(error = %err, "handler panicked");
                otel_cx.span().set_status(Status::error("handler panicked"));
                on_failure(cfg.failure_policy, &acks, delivery_tag);
            }
        }

        otel_cx.span().end();
    }
}

fn on_failure(policy: FailurePolicy, acks: &AckHandle, delivery_tag: u64) {
    match policy {
        FailurePolicy::LeaveUnacked => {
            warn!(
                delivery_tag,
                "message left unacknowledged, broker redelivers it after the connection closes"
            );
        }
        FailurePolicy::Requeue => {
            acks.nack(delivery_tag, true);
        }
        FailurePolicy::Reject => {
            acks.nack(delivery_tag, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        coordinator::{ack_channel, AckQueue, ChannelOp},
        handler::HandlerError,
    };
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    fn binding<H: JobHandler>(handler: H) -> QueueBinding {
        let mut binding = QueueBinding::new("mesh");
        binding.handler = Some(Arc::new(handler));
        binding
    }

    fn message(tag: u64, body: &str) -> InFlightMessage {
        InFlightMessage {
            delivery_tag: tag,
            body: body.as_bytes().to_vec(),
            routing_key: "job.mesh".to_owned(),
            ..Default::default()
        }
    }

    fn dispatcher(cfg: WorkerConfig) -> (Dispatcher, AckQueue) {
        let (acks, queue) = ack_channel();
        (Dispatcher::new(Arc::new(cfg), acks), queue)
    }

    async fn join_all(dispatcher: &mut Dispatcher) {
        while dispatcher.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn concurrent_deliveries_are_tracked_until_handlers_return() {
        let started = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(AtomicBool::new(false));

        let (s, r) = (started.clone(), release.clone());
        let b = binding(move |_: &JobContext, _: &[u8]| -> Result<HandlerResult, HandlerError> {
            s.fetch_add(1, Ordering::SeqCst);
            while !r.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(HandlerResult::Done)
        });

        let (mut dispatcher, mut queue) = dispatcher(WorkerConfig {
            prefetch_count: 3,
            ..WorkerConfig::default()
        });
        for tag in 1..=3 {
            dispatcher.dispatch(&b, message(tag, "{}"));
        }

        while started.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(dispatcher.in_flight(), 3);
        assert!(queue.drain().is_empty());

        release.store(true, Ordering::SeqCst);
        join_all(&mut dispatcher).await;
        assert!(dispatcher.is_idle());

        let mut acked: Vec<u64> = queue
            .drain()
            .into_iter()
            .map(|op| match op {
                ChannelOp::Ack(tag) => tag,
                other => panic!("unexpected op {other:?}"),
            })
            .collect();
        acked.sort_unstable();
        assert_eq!(acked, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn handler_concurrency_is_bounded_by_prefetch() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (r, p) = (running.clone(), peak.clone());
        let b = binding(move |_: &JobContext, _: &[u8]| -> Result<HandlerResult, HandlerError> {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            r.fetch_sub(1, Ordering::SeqCst);
            Ok(HandlerResult::Done)
        });

        let (mut dispatcher, mut queue) = dispatcher(WorkerConfig {
            prefetch_count: 2,
            ..WorkerConfig::default()
        });
        for tag in 1..=6 {
            dispatcher.dispatch(&b, message(tag, "{}"));
        }
        join_all(&mut dispatcher).await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.drain().len(), 6);
    }

    #[tokio::test]
    async fn forward_publishes_the_same_body_before_the_ack() {
        let b = binding(|_: &JobContext, _: &[u8]| -> Result<HandlerResult, HandlerError> {
            Ok(HandlerResult::Forward("job.solve".to_owned()))
        });
        let (mut dispatcher, mut queue) = dispatcher(WorkerConfig {
            node_name: Some("node1".to_owned()),
            ..WorkerConfig::default()
        });

        dispatcher.dispatch(&b, message(9, r#"{"id":"job-9"}"#));
        join_all(&mut dispatcher).await;

        let ops = queue.drain();
        assert_eq!(ops.len(), 2);
        match &ops[0] {
            ChannelOp::Publish(msg) => {
                assert_eq!(msg.routing_key, "node1.job.solve");
                assert_eq!(msg.body, br#"{"id":"job-9"}"#.to_vec());
                assert_eq!(msg.correlation_id.as_deref(), Some("job-9"));
            }
            other => panic!("expected publish, got {other:?}"),
        }
        assert_eq!(ops[1], ChannelOp::Ack(9));
    }

    #[tokio::test]
    async fn failing_handler_produces_no_ack_and_no_publish() {
        let b = binding(|_: &JobContext, _: &[u8]| -> Result<HandlerResult, HandlerError> {
            Err("mesh did not converge".into())
        });
        let (mut dispatcher, mut queue) = dispatcher(WorkerConfig::default());

        dispatcher.dispatch(&b, message(4, "{}"));
        join_all(&mut dispatcher).await;

        assert!(queue.drain().is_empty());
    }

    #[tokio::test]
    async fn panicking_handler_produces_no_ack_and_no_publish() {
        let b = binding(|_: &JobContext, _: &[u8]| -> Result<HandlerResult, HandlerError> {
            panic!("boom")
        });
        let (mut dispatcher, mut queue) = dispatcher(WorkerConfig::default());

        dispatcher.dispatch(&b, message(4, "{}"));
        join_all(&mut dispatcher).await;

        assert!(queue.drain().is_empty());
    }

    #[tokio::test]
    async fn requeue_policy_nacks_failed_deliveries() {
        let b = binding(|_: &JobContext, _: &[u8]| -> Result<HandlerResult, HandlerError> {
            Err("transient".into())
        });
        let (mut dispatcher, mut queue) = dispatcher(WorkerConfig {
            failure_policy: FailurePolicy::Requeue,
            ..WorkerConfig::default()
        });

        dispatcher.dispatch(&b, message(2, "{}"));
        join_all(&mut dispatcher).await;

        assert_eq!(
            queue.drain(),
            vec![ChannelOp::Nack {
                delivery_tag: 2,
                requeue: true
            }]
        );
    }

    #[tokio::test]
    async fn handler_receives_the_job_context() {
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let b = binding(move |ctx: &JobContext, _: &[u8]| -> Result<HandlerResult, HandlerError> {
            *s.lock().unwrap() = Some(ctx.clone());
            Ok(HandlerResult::Done)
        });
        let (mut dispatcher, _queue) = dispatcher(WorkerConfig::default());

        dispatcher.dispatch(&b, message(12, r#"{"id":"abc"}"#));
        join_all(&mut dispatcher).await;

        let ctx = seen.lock().unwrap().clone().unwrap();
        assert_eq!(ctx.correlation_id, "abc");
        assert_eq!(ctx.delivery_tag, 12);
        assert_eq!(ctx.queue, "mesh");
        assert_eq!(ctx.routing_key, "job.mesh");
    }
}
