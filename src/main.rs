use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};

use redis_workqueue::config::Settings;
use redis_workqueue::queue::{
    ChronologicalWorkQueue, SequentialConfig, SequentialWorkQueue, SimpleWorkQueue,
};
use redis_workqueue::store::create_store;
use redis_workqueue::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new()?;
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!(namespace = %settings.queue.namespace, "Configuration loaded");

    let store = create_store(&settings)?;
    let namespace = &settings.queue.namespace;

    let sequential: SequentialWorkQueue<Value> = SequentialWorkQueue::new(
        store.clone(),
        format!("{}:sequential", namespace),
        SequentialConfig::from(&settings.queue),
    );
    let simple: SimpleWorkQueue<Value> =
        SimpleWorkQueue::new(store.clone(), format!("{}:simple", namespace));
    let chronological: ChronologicalWorkQueue<Value> =
        ChronologicalWorkQueue::new(store.clone(), format!("{}:chronological", namespace));

    let reclaimed = match settings.queue.reclaim_after_seconds {
        Some(seconds) => {
            let keys = sequential
                .reclaim_expired(Duration::from_secs(seconds))
                .await?;
            tracing::info!(count = keys.len(), lease_seconds = seconds, "Reclaim finished");
            keys
        }
        None => Vec::new(),
    };

    let stats = sequential.stats().await?;
    let simple_len = simple.len().await?;
    let chronological_len = chronological.len().await?;

    // Read after the queries so the connection has been attempted
    let report = json!({
        "backend": store.backend_type(),
        "healthy": store.is_healthy(),
        "connection": store.connection_health(),
        "namespace": namespace,
        "sequential": stats,
        "reclaimed": reclaimed,
        "simple": { "len": simple_len },
        "chronological": { "len": chronological_len },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
