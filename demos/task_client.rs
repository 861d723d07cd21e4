//! Submits a few tasks and waits for their results.
//!
//! Start `simple_worker` in another terminal first:
//! ```bash
//! cargo run --example simple_worker
//! cargo run --example task_client
//! ```

use devskyy_task_queue::{QueueConfig, RedisStore, TaskPriority, TaskQueueClient};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
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
    let client = TaskQueueClient::new(store, config);
    client.connect().await?;

    let echo_id = client
        .enqueue("echo", json!({"x": 1}), TaskPriority::High, 60)
        .await?;
    let gen_id = client
        .enqueue(
            "3d_generation",
            json!({"prompt": "black leather varsity jacket"}),
            TaskPriority::Normal,
            300,
        )
        .await?;

    info!(
        "Queue depth for 3d_generation: {}",
        client.get_queue_length("3d_generation").await?
    );

    // Low-latency path: subscribe for the notification
    let echo_result = client
        .get_result_pubsub(&echo_id, Duration::from_secs(30))
        .await;
    info!("echo -> {:?}: {:?}", echo_result.status, echo_result.result);

    // Fallback path: plain 1s polling
    let gen_result = client.get_result(&gen_id, Duration::from_secs(120)).await;
    info!("3d_generation -> {:?}: {:?}", gen_result.status, gen_result.result);

    info!("Client metrics: {:?}", client.get_metrics());
    client.close().await;
    Ok(())
}
