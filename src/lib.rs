//! Real-time vessel tracking: ingestion, two-source fusion, integrity and
//! behavior checks, and live fan-out of the results.

pub mod behavior;
pub mod config;
pub mod feed;
pub mod fusion;
pub mod geo;
pub mod integrity;
pub mod interference;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod publisher;
pub mod registry;
pub mod storage;
