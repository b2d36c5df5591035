//! Demo: a nested composite driven end to end over the in-memory store.
//!
//! Builds `chain([group([square(3), square(4)]), sum])`: the group squares
//! two numbers in parallel, the chain feeds the gathered results into a
//! summing leaf, and the chain's result is the final answer.

use std::sync::Arc;

use serde_json::{json, Value};

use braid_core::{MemoryStore, Queue, Store, Template, WorkerGroup};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let store = Arc::new(MemoryStore::new("braid:"));
    let queue = Queue::builder(store as Arc<dyn Store>)
        .register(Template::leaf("square").run(|args| async move {
            let n = args
                .first()
                .and_then(Value::as_i64)
                .ok_or_else(|| "square expects a number".to_string())?;
            Ok(json!(n * n))
        }))?
        .register(Template::leaf("sum").run(|args| async move {
            // The chain appended the group's gathered results as the last
            // argument.
            let parts = args
                .last()
                .and_then(Value::as_array)
                .ok_or_else(|| "sum expects a sequence".to_string())?;
            let total: i64 = parts.iter().filter_map(Value::as_i64).sum();
            Ok(json!(total))
        }))?
        .build()?;

    let squares = queue.group(vec![
        queue.task("square", vec![json!(3)])?,
        queue.task("square", vec![json!(4)])?,
    ]);
    let pipeline = queue.chain(vec![squares, queue.task("sum", vec![])?]);
    let pipeline_id = pipeline.id();

    let mut events = queue.subscribe();
    queue.submit(pipeline).await?;

    let workers = WorkerGroup::spawn(2, queue.clone(), vec![queue.default_pool().to_string()]);

    let end = queue.wait(&mut events, pipeline_id).await?;
    match end.result {
        Some(result) => println!("pipeline {pipeline_id} finished: {result}"),
        None => println!("pipeline {pipeline_id} failed: {:?}", end.error),
    }

    workers.shutdown_and_join().await;
    Ok(())
}
