use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::time::Duration;

use serde::Deserialize;
use tokio::net::TcpStream;
use tracing::debug;

/// Port ranges the service is observed to allocate debug ports from,
/// highest priority first.
pub const PRIMARY_PORT_RANGE: RangeInclusive<u16> = 52000..=53200;
pub const SECONDARY_PORT_RANGE: RangeInclusive<u16> = 9222..=9350;

pub fn default_scan_ports() -> Vec<u16> {
    PRIMARY_PORT_RANGE.chain(SECONDARY_PORT_RANGE).collect()
}

#[derive(Debug, Deserialize)]
struct JsonVersion {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: Option<String>,
}

/// Read-only liveness checks against local DevTools endpoints. Never talks
/// to the control API.
#[derive(Debug, Clone)]
pub struct PortProbe {
    http: reqwest::Client,
    connect_timeout: Duration,
}

impl PortProbe {
    pub fn new(connect_timeout: Duration, http_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(http_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            connect_timeout,
        }
    }

    /// Ask the DevTools endpoint on a local port for its websocket address.
    pub async fn fetch_ws_endpoint(&self, port: u16) -> Option<String> {
        let url = format!("http://127.0.0.1:{port}/json/version");
        let resp = self.http.get(&url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let version: JsonVersion = resp.json().await.ok()?;
        version
            .web_socket_debugger_url
            .filter(|ws| !ws.trim().is_empty())
    }

    /// Cheap TCP pre-check followed by the DevTools handshake.
    pub async fn is_live(&self, port: u16) -> bool {
        if !self.tcp_open(port).await {
            return false;
        }
        self.fetch_ws_endpoint(port).await.is_some()
    }

    /// Walk the candidate list in order and return the first port answering
    /// the DevTools handshake. Stops at the first hit.
    pub async fn scan(&self, ports: impl IntoIterator<Item = u16>) -> Option<(u16, String)> {
        for port in ports {
            if !self.tcp_open(port).await {
                continue;
            }
            if let Some(ws) = self.fetch_ws_endpoint(port).await {
                debug!("live debug endpoint on port {port}");
                return Some((port, ws));
            }
        }
        None
    }

    async fn tcp_open(&self, port: u16) -> bool {
        let addr = (Ipv4Addr::LOCALHOST, port);
        matches!(
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}
