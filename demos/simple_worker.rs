//! Minimal worker process: registers handlers and drains the queues.
//!
//! Run with a local Redis:
//! ```bash
//! cargo run --example simple_worker
//! ```

use anyhow::anyhow;
use devskyy_task_queue::{
    HandlerError, HandlerRegistry, QueueConfig, RedisStore, TaskQueueClient, Worker, WorkerConfig,
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = QueueConfig::default();
    let store = Arc::new(RedisStore::open_with_limits(
        &config.url,
        config.pool_size,
        config.connect_timeout,
    )?);
    let client = Arc::new(TaskQueueClient::new(store, config));

    let mut registry = HandlerRegistry::new();

    registry.register_fn("echo", |data| async move { Ok(data) })?;

    registry.register_fn("3d_generation", |data| async move {
        let prompt = data["prompt"]
            .as_str()
            .ok_or_else(|| anyhow!("missing prompt"))?
            .to_string();
        info!("Generating 3D asset for prompt: {}", prompt);
        // Real deployments call the generation API here
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        Ok(json!({
            "model_url": format!("https://assets.example.com/{}.glb", prompt.len()),
            "prompt": prompt,
        }))
    })?;

    // Stub for a feature that is not built yet; callers see a structured
    // not_implemented outcome instead of a failure
    registry.register_fn("virtual_tryon", |_| async {
        Err(HandlerError::NotImplemented)
    })?;

    let worker = Worker::new(client, registry, WorkerConfig::default())?;
    worker.install_signal_handlers();
    worker.run().await?;
    Ok(())
}
