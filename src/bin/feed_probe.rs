//! Connectivity probe: opens one live subscription, prints the first N
//! decoded observations as JSON lines and exits.
//!
//! Usage: feed_probe [count]   (AISSTREAM_API_KEY must be set)

use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;

use seawatch::config::Config;
use seawatch::feed::aisstream::{decode_frame, subscription_message, WsConnector};
use seawatch::feed::FeedConnector;
use seawatch::model::Observation;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    cfg.validate()?;
    let Some(api_key) = cfg.api_key.as_deref() else {
        bail!("AISSTREAM_API_KEY is not set");
    };
    let wanted: usize = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PROBE_COUNT").ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(10);
    let timeout_secs: u64 = std::env::var("PROBE_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60);

    let connector = WsConnector::new(cfg.feed_url.clone());
    let mut session = connector.connect().await?;
    session.send_text(subscription_message(api_key)?).await?;
    eprintln!("[probe] subscribed to {}, waiting for {} observations", cfg.feed_url, wanted);

    let mut seen = 0usize;
    let mut frames = 0usize;
    let mut dropped = 0usize;
    let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
        while seen < wanted {
            let Some(text) = session.next_text().await? else {
                bail!("feed closed after {} frames", frames);
            };
            frames += 1;
            match decode_frame(&text, Utc::now()) {
                Ok(observations) => {
                    for obs in observations.into_iter().take(wanted - seen) {
                        let line = match &obs {
                            Observation::Position(p) => serde_json::to_string(p),
                            Observation::Identity(i) => serde_json::to_string(i),
                        };
                        println!("{}", line.context("encode observation")?);
                        seen += 1;
                    }
                }
                Err(err) => {
                    dropped += 1;
                    eprintln!("[probe] dropped frame: {}", err.reason());
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    })
    .await;
    session.close().await;

    eprintln!("[probe] frames={} dropped={} observations={}", frames, dropped, seen);
    match outcome {
        Ok(result) => result,
        Err(_) => bail!("timed out after {}s with {} of {} observations", timeout_secs, seen, wanted),
    }
}
