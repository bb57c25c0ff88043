//! Read-only connectivity diagnostics: which API surface answers, whether
//! the cloud is reachable, and which local ports carry a live DevTools
//! socket. Backs the doctor binary.

use std::ops::RangeInclusive;

use reqwest::Method;
use tracing::debug;
use tracing::info;

use crate::OctoError;
use crate::client::OctoClient;
use crate::probe::PortProbe;
use crate::transport::ApiBase;

/// Local read paths probed in order; the first that answers names the
/// working surface.
const LOCAL_HEALTH_PATHS: [&str; 3] = [
    "/api/profiles",
    "/api/v2/automation/profiles",
    "/api/profiles/active",
];

const CLOUD_HEALTH_PATH: &str = "/api/v2/automation/profiles";

/// Narrow slices of the known debug-port ranges, so the sweep finishes in
/// seconds rather than minutes.
const QUICK_SCAN_PRIMARY: RangeInclusive<u16> = 52000..=52100;
const QUICK_SCAN_SECONDARY: RangeInclusive<u16> = 9222..=9232;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticsReport {
    /// First local path that answered, when any did.
    pub local_api: Option<String>,
    /// Whether the cloud base answered over HTTP at all. An auth rejection
    /// still counts as reachable.
    pub cloud_api: bool,
    /// Every port in the quick-scan slices with a live DevTools socket.
    pub live_debug_ports: Vec<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    CloudUnreachable,
    LocalUnreachable,
}

impl DiagnosticsReport {
    /// The local API is the one that starts browsers, so losing it outranks
    /// losing the cloud.
    pub fn verdict(&self) -> HealthVerdict {
        if self.local_api.is_none() {
            HealthVerdict::LocalUnreachable
        } else if !self.cloud_api {
            HealthVerdict::CloudUnreachable
        } else {
            HealthVerdict::Healthy
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.verdict() {
            HealthVerdict::Healthy => 0,
            HealthVerdict::CloudUnreachable => 1,
            HealthVerdict::LocalUnreachable => 2,
        }
    }
}

impl OctoClient {
    /// Probe both API bases and the local debug-port ranges without
    /// mutating any profile state.
    pub async fn diagnose(&self) -> DiagnosticsReport {
        let mut local_api = None;
        for path in LOCAL_HEALTH_PATHS {
            let answered = self
                .transport
                .send_allow_list(Method::GET, ApiBase::Local, path, None)
                .await;
            match answered {
                Ok(_) => {
                    info!("local API answers via {path}");
                    local_api = Some(path.to_string());
                    break;
                }
                Err(err) => debug!("local probe {path} failed: {err}"),
            }
        }

        let cloud = self
            .transport
            .send_allow_list(Method::GET, ApiBase::Cloud, CLOUD_HEALTH_PATH, None)
            .await;
        let cloud_api = match cloud {
            Ok(_) => true,
            // any classified HTTP answer proves the host is reachable
            Err(err) => {
                debug!("cloud probe failed: {err}");
                !matches!(err, OctoError::Network { .. })
            }
        };

        let probe = PortProbe::new(
            self.policy.probe_connect_timeout,
            self.policy.probe_http_timeout,
        );
        let mut live_debug_ports = Vec::new();
        for port in QUICK_SCAN_PRIMARY.chain(QUICK_SCAN_SECONDARY) {
            if probe.is_live(port).await {
                info!("live DevTools socket on port {port}");
                live_debug_ports.push(port);
            }
        }

        DiagnosticsReport {
            local_api,
            cloud_api,
            live_debug_ports,
        }
    }
}
