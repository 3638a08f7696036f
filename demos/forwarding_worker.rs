// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Minimal worker: consumes `job.mesh.#`, logs the job and forwards it to
//! the solver stage. Configure with the `RABBITMQ_*` environment variables
//! (see `WorkerConfig::from_env`) and stop with Ctrl-C. Log records are
//! also published under `{job_id}.{worker_name}.rust.{level}` unless
//! `WORKER_FORWARD_LOGS=false`.

use topic_worker::{
    log_forward,
    telemetry::{self, LogFormat},
    HandlerError, HandlerResult, JobContext, Worker, WorkerConfig,
};
use tracing::{info, Level};

fn mesh(ctx: &JobContext, body: &[u8]) -> Result<HandlerResult, HandlerError> {
    let job: serde_json::Value = serde_json::from_slice(body)?;
    info!(job_id = ctx.correlation_id, title = %job["title"], "meshing");
    Ok(HandlerResult::Forward("job.solve".to_owned()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let format = std::env::var("LOG_FORMAT")
        .ok()
        .and_then(|f| f.parse().ok())
        .unwrap_or(LogFormat::Text);
    let cfg = WorkerConfig::from_env()?;

    let (layer, records) = if cfg.forward_logs {
        let (layer, records) = log_forward::broker_log_layer(&cfg.worker_name, Level::INFO);
        (Some(layer), Some(records))
    } else {
        (None, None)
    };
    telemetry::init_logging_with(format, layer)?;

    let mut worker = Worker::connect(cfg).await?;
    if let Some(records) = records {
        worker.forward_logs(records);
    }
    worker.declare_route("solve", "job.solve").await?;
    worker.bind("mesh", "job.mesh.#", mesh).await?;

    worker.start().await?;
    Ok(())
}
