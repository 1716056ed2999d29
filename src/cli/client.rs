use std::net::SocketAddr;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

use crate::protocol::{DomainTimeMap, Request, ResetAck, TabEvent};

/// Connection to a running daemon. One line out per request, one line back per response.
pub struct DaemonClient {
    framed: Framed<TcpStream, LinesCodec>,
}

impl DaemonClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let socket = TcpStream::connect(addr)
            .await
            .with_context(|| format!("No daemon reachable at {addr}, run `tabtally init` first"))?;
        Ok(Self {
            framed: Framed::new(socket, LinesCodec::new()),
        })
    }

    pub async fn site_time(&mut self) -> Result<DomainTimeMap> {
        self.request(Request::GetSiteTime).await
    }

    pub async fn reset_stats(&mut self) -> Result<ResetAck> {
        self.request(Request::ResetStats).await
    }

    /// Events are fire and forget, the daemon never answers them.
    pub async fn send_event(&mut self, event: TabEvent) -> Result<()> {
        self.framed.send(serde_json::to_string(&event)?).await?;
        Ok(())
    }

    async fn request<T: DeserializeOwned>(&mut self, request: Request) -> Result<T> {
        self.framed.send(serde_json::to_string(&request)?).await?;
        let line = self
            .framed
            .next()
            .await
            .context("Daemon closed the connection")??;
        Ok(serde_json::from_str(&line)?)
    }
}
