use anyhow::Result;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{
    codec::{Framed, LinesCodec},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

use crate::{
    daemon::tracker::TrackerHandle,
    protocol::{ClientMessage, Request, ResetAck},
};

/// Keeps a malicious or broken producer from ballooning memory with an endless line.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Accepts local connections from event producers and presentation clients. Every line
/// funnels into the tracker's command channel, so no matter how many connections are
/// open, state transitions stay serialized.
pub struct QueryServer {
    listener: TcpListener,
    tracker: TrackerHandle,
    shutdown: CancellationToken,
}

impl QueryServer {
    pub fn new(listener: TcpListener, tracker: TrackerHandle, shutdown: CancellationToken) -> Self {
        Self {
            listener,
            tracker,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<()> {
        info!("Accepting connections on {}", self.listener.local_addr()?);
        loop {
            tokio::select! {
                // Cancelation stops the listener. Dropping it together with the tracker
                // handles is what lets the tracker run its final flush.
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = self.listener.accept() => {
                    let (socket, peer) = accepted?;
                    debug!("Accepted connection from {peer}");
                    let tracker = self.tracker.clone();
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, tracker, shutdown).await {
                            debug!("Connection from {peer} ended with an error {e:?}");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    tracker: TrackerHandle,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            line = framed.next() => match line {
                Some(line) => line?,
                None => return Ok(()),
            },
        };

        match serde_json::from_str::<ClientMessage>(&line) {
            Ok(ClientMessage::Event(event)) => {
                tracker.event(event).await?;
            }
            Ok(ClientMessage::Request(Request::GetSiteTime)) => {
                let snapshot = tracker.snapshot().await?;
                framed.send(serde_json::to_string(&snapshot)?).await?;
            }
            Ok(ClientMessage::Request(Request::ResetStats)) => {
                tracker.reset().await?;
                framed
                    .send(serde_json::to_string(&ResetAck { success: true })?)
                    .await?;
            }
            // The connection survives garbage lines, only the line is dropped.
            Err(e) => warn!("Skipping malformed line {line:?}: {e}"),
        }
    }
}
