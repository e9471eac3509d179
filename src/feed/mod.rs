//! Ingestion: the live AISStream client, the simulator fallback and the
//! secondary (local sensor) entry point.

pub mod aisstream;
pub mod backoff;
pub mod client;
pub mod sensor;
pub mod simulator;
pub mod status;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::model::Observation;

pub use client::{ClientConfig, IngestionClient, InjectError, SecondaryInjector};
pub use status::{FeedState, FeedStatus, FeedStatusSnapshot};

/// Opens transport sessions to the upstream feed.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FeedSession>>;
}

/// One open connection. `next_text` yields `Ok(None)` on a clean close.
#[async_trait]
pub trait FeedSession: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;
    async fn next_text(&mut self) -> Result<Option<String>>;
    async fn close(&mut self);
}

/// Where ingestion hands observations. Returns false once the receiving
/// side has shut down.
#[async_trait]
pub trait ObservationSink: Send + Sync {
    async fn submit(&self, observation: Observation) -> bool;
}

#[async_trait]
impl ObservationSink for mpsc::Sender<Observation> {
    async fn submit(&self, observation: Observation) -> bool {
        self.send(observation).await.is_ok()
    }
}
