use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use seawatch::config::Config;
use seawatch::feed::sensor::SensorListener;
use seawatch::feed::{FeedStatus, IngestionClient};
use seawatch::logging::{self, obj, v_str, Domain, Level};
use seawatch::pipeline::Pipeline;
use seawatch::publisher::Publisher;
use seawatch::registry::{StaticRegistry, VesselRegistry};
use seawatch::storage::{spawn_sink_worker, SqliteStore};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    cfg.validate()?;
    logging::log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("mode", v_str(if cfg.api_key.is_some() { "live" } else { "simulated" })),
            ("shards", json!(cfg.shards)),
            ("sqlite", json!(cfg.sqlite_path)),
            ("sensor_addr", json!(cfg.sensor_listen_addr)),
        ]),
    );

    // Registry is pre-fetched once; the sink gets its own connection.
    let (registry, sink) = match &cfg.sqlite_path {
        Some(path) => {
            let store = SqliteStore::open(path)?;
            let registry: StaticRegistry = store.load_identities()?.into_iter().collect();
            logging::log(
                Level::Info,
                Domain::Sink,
                "registry_loaded",
                obj(&[("vessels", json!(registry.len()))]),
            );
            let (handle, worker) = spawn_sink_worker(SqliteStore::open(path)?, cfg.sink_queue_cap);
            (registry, Some((handle, worker)))
        }
        None => (StaticRegistry::new(), None),
    };
    let registry: Arc<dyn VesselRegistry> = Arc::new(registry);
    let (sink_handle, sink_worker) = match sink {
        Some((h, w)) => (Some(h), Some(w)),
        None => (None, None),
    };

    let status = Arc::new(FeedStatus::new());
    let publisher = Arc::new(Publisher::new(cfg.subscriber_queue_cap, sink_handle));
    let pipeline = Pipeline::spawn(
        cfg.pipeline_settings(),
        registry,
        Arc::clone(&publisher),
        Arc::clone(&status),
    );

    // Stdout relay standing in for the push transport.
    let stdout_sub = publisher.subscribe("stdout");
    let relay = tokio::spawn(async move {
        while let Some(event) = stdout_sub.recv().await {
            match serde_json::to_string(&*event) {
                Ok(line) => println!("{}", line),
                Err(err) => eprintln!("[relay] encode failed: {}", err),
            }
        }
    });

    let cancel = CancellationToken::new();
    let client = IngestionClient::new(
        cfg.client_config(),
        pipeline.handle(),
        Arc::clone(&status),
        cancel.clone(),
    );

    let sensor = match &cfg.sensor_listen_addr {
        Some(addr) => {
            let listener = SensorListener::bind(addr).await?;
            Some(tokio::spawn(listener.run(client.secondary_injector(), cancel.clone())))
        }
        None => None,
    };
    let feed = tokio::spawn(client.run());

    tokio::signal::ctrl_c().await?;
    logging::log(Level::Info, Domain::System, "shutdown_requested", obj(&[]));

    cancel.cancel();
    let _ = feed.await;
    if let Some(sensor) = sensor {
        let _ = sensor.await;
    }

    let picture = pipeline.picture();
    pipeline.shutdown().await;
    let _ = relay.await;

    let snapshot = picture.feed_status();
    logging::log(
        Level::Info,
        Domain::System,
        "shutdown_complete",
        obj(&[
            ("vessels", json!(picture.len())),
            ("published", json!(publisher.published())),
            ("sink_dropped", json!(publisher.sink_dropped())),
            ("frames_received", json!(snapshot.frames_received)),
            ("frames_dropped", json!(snapshot.frames_dropped)),
        ]),
    );

    drop(publisher);
    if let Some(worker) = sink_worker {
        let _ = worker.await;
    }
    logging::flush();
    Ok(())
}
