//! Newline-delimited JSON listener for local radar tracks.
//!
//! Each line is one track; each line gets one reply line. Invalid tracks
//! are answered with an error and the connection stays open.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use super::client::SecondaryInjector;
use super::ObservationSink;
use crate::logging::{self, obj, v_str, Domain, Level};

const MAX_LINE_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RadarTrack {
    pub mmsi: u64,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub heading: f64,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl RadarTrack {
    pub fn parse(line: &str) -> Result<Self, String> {
        let track: RadarTrack =
            serde_json::from_str(line).map_err(|_| "invalid radar track payload".to_string())?;
        let finite = [track.latitude, track.longitude, track.speed, track.heading]
            .iter()
            .all(|v| v.is_finite())
            && track.confidence.map_or(true, f64::is_finite);
        if !finite {
            return Err("invalid radar track payload".to_string());
        }
        Ok(track)
    }
}

pub struct SensorListener {
    listener: TcpListener,
}

impl SensorListener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding sensor listener on {}", addr))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run<S: ObservationSink + Clone + 'static>(
        self,
        injector: SecondaryInjector<S>,
        cancel: CancellationToken,
    ) {
        if let Ok(addr) = self.listener.local_addr() {
            logging::log(
                Level::Info,
                Domain::Feed,
                "sensor_listening",
                obj(&[("addr", v_str(&addr.to_string()))]),
            );
        }
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.listener.accept() => r,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let injector = injector.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(stream, injector, cancel).await {
                            logging::log(
                                Level::Warn,
                                Domain::Feed,
                                "sensor_connection_error",
                                obj(&[
                                    ("peer", v_str(&peer.to_string())),
                                    ("error", v_str(&format!("{:#}", err))),
                                ]),
                            );
                        }
                    });
                }
                Err(err) => logging::log(
                    Level::Warn,
                    Domain::Feed,
                    "sensor_accept_failed",
                    obj(&[("error", v_str(&err.to_string()))]),
                ),
            }
        }
    }
}

async fn serve_connection<S: ObservationSink + Clone + 'static>(
    stream: TcpStream,
    injector: SecondaryInjector<S>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            n = lines.next() => n,
        };
        let line = match next {
            Some(line) => line.context("reading sensor line")?,
            None => return Ok(()),
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match RadarTrack::parse(&line) {
            Ok(track) => match injector
                .inject(
                    track.mmsi,
                    track.latitude,
                    track.longitude,
                    Some(track.speed),
                    Some(track.heading),
                    Utc::now(),
                )
                .await
            {
                Ok(()) => json!({ "status": "accepted" }),
                Err(err) => json!({ "status": "error", "error": err.to_string() }),
            },
            Err(reason) => {
                injector.reject();
                json!({ "status": "error", "error": reason })
            }
        };
        lines.send(reply.to_string()).await.context("writing sensor reply")?;
    }
}
