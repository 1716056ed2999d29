//! Wire contract between the daemon, the browser-side event producer and presentation
//! clients. Everything travels as newline-delimited json over a localhost socket.
//! Event lines get no response, request lines get exactly one response line.

use std::{collections::HashMap, net::SocketAddr};

use serde::{Deserialize, Serialize};

/// Accumulated seconds per domain. This is the whole durable state of the tracker and
/// the response body of [Request::GetSiteTime].
pub type DomainTimeMap = HashMap<String, f64>;

pub const DEFAULT_PORT: u16 = 17788;

pub fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT))
}

/// Tab lifecycle events produced by the browser side. `url` is optional because the
/// producer may fail to look the tab up before it disappears; such events still count
/// as a focus change, just to nothing trackable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum TabEvent {
    TabActivated {
        tab: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    TabUpdated {
        tab: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    TabRemoved {
        tab: u64,
    },
}

/// Requests issued by presentation clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    GetSiteTime,
    ResetStats,
}

/// Any single line a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Event(TabEvent),
    Request(Request),
}

/// Response to [Request::ResetStats].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetAck {
    pub success: bool,
}
