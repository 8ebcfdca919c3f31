//! Two processors sharing one in-memory lease container, fed by a writer
//! task. Stops on Ctrl+C and prints the final lease state.
//!
//! Settings come from `CONFIG_PATH` (optional TOML) and `CFP__*` variables.

use std::sync::Arc;
use std::time::Duration;

use changefeed_processor::render_metrics;
use changefeed_processor::ChangeFeedProcessor;
use changefeed_processor::ChangeFeedProcessorBuilder;
use changefeed_processor::ChangeFeedProcessorContext;
use changefeed_processor::InMemoryFeedContainer;
use changefeed_processor::InMemoryLeaseContainer;
use changefeed_processor::ProcessorMetrics;
use changefeed_processor::Result;
use changefeed_processor::Settings;
use changefeed_processor::SystemClock;
use prometheus::Registry;
use serde_json::json;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    init_observability();

    let config_path = std::env::var("CONFIG_PATH").ok();
    let settings = Settings::load(config_path.as_deref())?.validate()?;
    info!("settings: {:?}", settings);

    let feed = Arc::new(InMemoryFeedContainer::with_partition_count(
        "orders",
        4,
        Arc::new(SystemClock),
    ));
    let leases = Arc::new(InMemoryLeaseContainer::new("leases"));
    let registry = Registry::new();
    let metrics = ProcessorMetrics::new(&registry)?;

    let processors: Vec<ChangeFeedProcessor> = ["host-a", "host-b"]
        .into_iter()
        .map(|host| {
            ChangeFeedProcessorBuilder::new()
                .host_name(host)
                .feed_container(feed.clone())
                .lease_container(leases.clone())
                .settings(&settings)
                .metrics(metrics.clone())
                .handle_changes(|docs: Vec<Value>, ctx: &ChangeFeedProcessorContext| {
                    info!(host = %ctx.host_name, lease_token = %ctx.lease_token, "received {} changes", docs.len());
                    Ok(())
                })
                .build()
        })
        .collect::<Result<_>>()?;

    for processor in &processors {
        processor.start().await?;
    }

    let writer_stop = CancellationToken::new();
    let writer = tokio::spawn(write_orders(feed.clone(), writer_stop.clone()));

    info!("Application started. Waiting for CTRL+C signal...");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {:?}", e);
    }
    info!("Ctrl+C detected.");

    writer_stop.cancel();
    writer.await?;

    for processor in &processors {
        if let Err(e) = processor.stop().await {
            error!("processor stop failed: {:?}", e);
        }
    }

    for state in processors[0].get_current_state().await? {
        info!(
            "lease {}: owner {:?}, continuation {:?}, lag {}",
            state.lease_token, state.host_name, state.continuation_token, state.estimated_lag
        );
    }
    println!("{}", render_metrics(&registry));
    println!("Exiting program.");
    Ok(())
}

async fn write_orders(
    feed: Arc<InMemoryFeedContainer>,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let mut order = 0u64;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                order += 1;
                let customer = format!("customer-{}", order % 17);
                if let Err(e) = feed.upsert(&customer, json!({ "id": order.to_string(), "customer": customer.clone() })) {
                    error!("write failed: {:?}", e);
                }
            }
        }
    }
}

fn init_observability() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
