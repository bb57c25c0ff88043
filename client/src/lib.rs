//! Client for the Octo Browser control API: profile lifecycle plus the
//! retry, polling, and port-probing machinery needed to turn "start this
//! profile" into a confirmed remote-debugging endpoint.

pub mod client;
pub mod config;
pub mod diag;
pub mod probe;
pub mod resolve;
pub mod shape;
pub mod transport;

pub use client::OctoClient;
pub use client::OsFamily;
pub use client::ProfileSpec;
pub use client::ProxySpec;
pub use client::StopAllSummary;
pub use config::OctoConfig;
pub use diag::DiagnosticsReport;
pub use diag::HealthVerdict;
pub use probe::PortProbe;
pub use resolve::ResolutionAttempt;
pub use resolve::ResolvePolicy;
pub use resolve::ResolvedEndpoint;
pub use resolve::StartOptions;
pub use shape::EndpointFields;
pub use transport::ApiBase;

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OctoError {
    /// Transport-level failure after the retry budget was exhausted.
    #[error("network error calling {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// HTTP 429 that survived the retry budget.
    #[error("rate limited by {url} (retry-after {retry_after:?}): {body}")]
    RateLimited {
        url: String,
        retry_after: Option<Duration>,
        body: String,
    },

    /// Terminal 4xx answer.
    #[error("HTTP {status} from {url}: {body}")]
    Client {
        status: StatusCode,
        url: String,
        body: String,
    },

    /// Terminal 5xx answer.
    #[error("HTTP {status} from {url}: {body}")]
    Server {
        status: StatusCode,
        url: String,
        body: String,
    },

    /// The service answered, but not with anything we can use.
    #[error("unexpected response shape from {url}: {detail}")]
    Schema { url: String, detail: String },

    /// Start was accepted but no debugging address could be confirmed.
    /// Callers can recover by supplying a port or allowing a port scan.
    #[error("no debug endpoint for profile {uuid}: {detail}")]
    NoEndpoint { uuid: String, detail: String },

    /// The profile keeps reporting as running while exposing no endpoint,
    /// even after force-stop recovery.
    #[error(
        "profile {uuid} is stuck running without a debug endpoint \
         ({starts} start attempts, {polls} polls, {force_stops} force stops, \
         waited {waited:?}; last error: {last_error:?})"
    )]
    ZombieUnrecoverable {
        uuid: String,
        starts: u32,
        polls: u32,
        force_stops: u32,
        waited: Duration,
        last_error: Option<String>,
    },

    /// An external cancellation signal fired.
    #[error("cancelled")]
    Cancelled,
}

impl OctoError {
    /// Status code for HTTP-level failures.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            OctoError::Client { status, .. } | OctoError::Server { status, .. } => Some(*status),
            OctoError::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, OctoError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, OctoError>;
