//! Turns "start this profile" into a confirmed debug endpoint. The start
//! call rarely tells the whole story: fresh profiles 404 until the local
//! store syncs, starts get acknowledged with no data, and a profile can
//! report as running while exposing no endpoint at all. Each of those paths
//! is an explicit transition here, with every deliberate wait drawn from
//! [`ResolvePolicy`].

use std::future::Future;
use std::time::Duration;
use std::time::Instant;

use reqwest::Method;
use reqwest::StatusCode;
use serde_json::Value;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::OctoError;
use crate::Result;
use crate::client::OctoClient;
use crate::probe;
use crate::probe::PortProbe;
use crate::shape;
use crate::shape::EndpointFields;
use crate::transport::ApiBase;
use crate::transport::Transport;

pub(crate) const START_PATH: &str = "/api/profiles/start";
const V2_START_PATH: &str = "/api/v2/automation/profiles/{uuid}/start";

const ALREADY_STARTED_MARKERS: [&str; 2] = ["already_started", "already started"];

/// How a profile should be started.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub headless: bool,
    /// Extra browser flags forwarded in the start payload.
    pub flags: Vec<String>,
    /// Operator-supplied port. When set, scanning is skipped and this port
    /// is validated directly if polling comes up empty.
    pub debug_port_override: Option<u16>,
    /// Permission to fall back to scanning the well-known local port ranges.
    pub allow_port_scan: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            headless: false,
            flags: Vec::new(),
            debug_port_override: None,
            allow_port_scan: true,
        }
    }
}

/// Every deliberate wait in the resolution flow, as data.
#[derive(Debug, Clone)]
pub struct ResolvePolicy {
    /// Server-side readiness timeout sent in the start payload, seconds.
    pub start_timeout: Duration,
    /// Re-issues of the start call while the local store catches up with a
    /// freshly created profile (404s), at a fixed delay.
    pub sync_attempts: u32,
    pub sync_delay: Duration,
    /// Poll rounds after an accepted-but-empty start; round N waits
    /// `poll_delay * N`.
    pub poll_attempts: u32,
    pub poll_delay: Duration,
    /// Full start attempts before a running-without-endpoint profile is
    /// declared unrecoverable.
    pub outer_attempts: u32,
    /// Settle wait after force-stop N is `settle_base + settle_step * (N-1)`.
    pub settle_base: Duration,
    pub settle_step: Duration,
    pub force_stop_retries: u32,
    pub force_stop_initial_wait: Duration,
    pub probe_connect_timeout: Duration,
    pub probe_http_timeout: Duration,
}

impl Default for ResolvePolicy {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(120),
            sync_attempts: 5,
            sync_delay: Duration::from_secs(2),
            poll_attempts: 5,
            poll_delay: Duration::from_secs(2),
            outer_attempts: 3,
            settle_base: Duration::from_secs(12),
            settle_step: Duration::from_secs(3),
            force_stop_retries: 3,
            force_stop_initial_wait: Duration::from_secs(3),
            probe_connect_timeout: Duration::from_millis(500),
            probe_http_timeout: Duration::from_secs(2),
        }
    }
}

/// A confirmed debugging endpoint for a running profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub uuid: String,
    pub debug_port: u16,
    pub ws_endpoint: Option<String>,
}

/// Running tally for one resolution pass. Terminal failures carry it so the
/// operator can see what was tried.
#[derive(Debug, Clone)]
pub struct ResolutionAttempt {
    pub started_at: Instant,
    pub starts: u32,
    pub polls: u32,
    pub force_stops: u32,
    /// Deliberate waiting only, excluding request time.
    pub waited: Duration,
    pub last_error: Option<String>,
}

impl ResolutionAttempt {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            starts: 0,
            polls: 0,
            force_stops: 0,
            waited: Duration::ZERO,
            last_error: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn note_error(&mut self, err: &OctoError) {
        self.last_error = Some(err.to_string());
    }
}

/// Read endpoints that can confirm a running profile's endpoint, in the
/// order they historically succeed. Info lookups go first (cheapest), then
/// the listings, with the cloud store covered along the way.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ReadSource {
    Info { base: ApiBase, path: &'static str },
    Listing { base: ApiBase, path: &'static str },
}

pub(crate) const READ_SOURCES: &[ReadSource] = &[
    ReadSource::Info {
        base: ApiBase::Local,
        path: "/api/profiles/{uuid}",
    },
    ReadSource::Info {
        base: ApiBase::Local,
        path: "/api/v2/profiles/{uuid}",
    },
    ReadSource::Info {
        base: ApiBase::Local,
        path: "/api/v2/automation/profiles/{uuid}",
    },
    ReadSource::Info {
        base: ApiBase::Cloud,
        path: "/api/v2/automation/profiles/{uuid}",
    },
    ReadSource::Listing {
        base: ApiBase::Local,
        path: "/api/profiles/active",
    },
    ReadSource::Listing {
        base: ApiBase::Local,
        path: "/api/profiles",
    },
    ReadSource::Listing {
        base: ApiBase::Local,
        path: "/api/v2/automation/profiles/active",
    },
    ReadSource::Listing {
        base: ApiBase::Local,
        path: "/api/v2/automation/profiles",
    },
];

impl ReadSource {
    pub(crate) async fn fetch(&self, transport: &Transport, uuid: &str) -> Result<Value> {
        match self {
            ReadSource::Info { base, path } => {
                let path = path.replace("{uuid}", uuid);
                transport.send(Method::GET, *base, &path, None).await
            }
            ReadSource::Listing { base, path } => {
                transport.send_allow_list(Method::GET, *base, path, None).await
            }
        }
    }
}

enum StartOutcome {
    Resolved(ResolvedEndpoint),
    RunningWithoutEndpoint,
}

pub(crate) struct Resolver<'a> {
    client: &'a OctoClient,
    policy: &'a ResolvePolicy,
    probe: PortProbe,
    cancel: &'a CancellationToken,
    attempt: ResolutionAttempt,
}

impl<'a> Resolver<'a> {
    pub(crate) fn new(client: &'a OctoClient, cancel: &'a CancellationToken) -> Self {
        let policy = &client.policy;
        Self {
            client,
            policy,
            probe: PortProbe::new(policy.probe_connect_timeout, policy.probe_http_timeout),
            cancel,
            attempt: ResolutionAttempt::new(),
        }
    }

    pub(crate) async fn run(
        mut self,
        uuid: &str,
        opts: &StartOptions,
    ) -> Result<ResolvedEndpoint> {
        let outer_attempts = self.policy.outer_attempts.max(1);
        for outer in 1..=outer_attempts {
            let outcome = self.try_start(uuid, opts).await?;
            match outcome {
                StartOutcome::Resolved(endpoint) => {
                    info!(
                        "profile {uuid} resolved to port {} after {:?} ({} start attempts)",
                        endpoint.debug_port,
                        self.attempt.elapsed(),
                        self.attempt.starts,
                    );
                    return Ok(endpoint);
                }
                StartOutcome::RunningWithoutEndpoint => {
                    if outer == outer_attempts {
                        break;
                    }
                    warn!(
                        "profile {uuid} is running without a debug endpoint \
                         (start attempt {outer}/{outer_attempts}); force-stopping"
                    );
                    self.attempt.force_stops += 1;
                    // the lifecycle lock is already held here
                    let stopped = self
                        .guarded(async {
                            Ok(self
                                .client
                                .force_stop_locked(
                                    uuid,
                                    self.policy.force_stop_retries,
                                    self.policy.force_stop_initial_wait,
                                )
                                .await)
                        })
                        .await?;
                    if !stopped {
                        warn!("force-stop did not confirm for {uuid}; retrying the start anyway");
                    }
                    let settle = self.policy.settle_base + self.policy.settle_step * (outer - 1);
                    debug!("waiting {settle:?} for {uuid} to settle");
                    self.sleep(settle).await?;
                }
            }
        }
        Err(OctoError::ZombieUnrecoverable {
            uuid: uuid.to_string(),
            starts: self.attempt.starts,
            polls: self.attempt.polls,
            force_stops: self.attempt.force_stops,
            waited: self.attempt.waited,
            last_error: self.attempt.last_error.take(),
        })
    }

    async fn try_start(&mut self, uuid: &str, opts: &StartOptions) -> Result<StartOutcome> {
        let payload = start_payload(uuid, opts, self.policy);
        let started = self.start_with_sync_retry(uuid, &payload).await;
        let response = match started {
            Ok(value) => value,
            Err(err) if is_already_started(&err) => {
                info!("profile {uuid} reports already started; checking read endpoints");
                self.attempt.note_error(&err);
                let found = self.sweep_read_sources(uuid).await?;
                return match found {
                    Some(found) => Ok(StartOutcome::Resolved(self.finalize(uuid, found).await?)),
                    None => Ok(StartOutcome::RunningWithoutEndpoint),
                };
            }
            Err(err) => return Err(err),
        };

        if let Some(found) = shape::endpoint_from_record(&response) {
            return Ok(StartOutcome::Resolved(self.finalize(uuid, found).await?));
        }

        if shape::is_accepted_without_data(&response) {
            debug!("start of {uuid} was accepted without endpoint data; polling");
            let polled = self.poll_for_endpoint(uuid, &payload).await?;
            if let Some(found) = polled {
                return Ok(StartOutcome::Resolved(self.finalize(uuid, found).await?));
            }
            return Ok(StartOutcome::Resolved(self.probe_fallback(uuid, opts).await?));
        }

        let base = self.client.transport.base_url(ApiBase::Local);
        Err(OctoError::Schema {
            url: format!("{base}{START_PATH}"),
            detail: format!(
                "start response carries neither a debug port nor an acknowledgment: {}",
                crate::transport::truncate_chars(&response.to_string(), 200),
            ),
        })
    }

    /// A profile created moments ago can 404 here until the local store
    /// syncs with the cloud record.
    async fn start_with_sync_retry(&mut self, uuid: &str, payload: &Value) -> Result<Value> {
        let mut sync_try: u32 = 0;
        loop {
            self.attempt.starts += 1;
            let sent = self
                .guarded(self.client.transport.send(
                    Method::POST,
                    ApiBase::Local,
                    START_PATH,
                    Some(payload),
                ))
                .await;
            match sent {
                Ok(value) => return Ok(value),
                Err(err) if is_not_found(&err) && sync_try < self.policy.sync_attempts => {
                    sync_try += 1;
                    self.attempt.note_error(&err);
                    debug!(
                        "start of {uuid} returned 404; local store may still be syncing \
                         (retry {sync_try}/{})",
                        self.policy.sync_attempts
                    );
                    self.sleep(self.policy.sync_delay).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Bounded poll loop for the accepted-but-empty case: re-issue the
    /// start, then sweep the read catalog; on the last round also try the
    /// historical v2 start path. First confirmed port wins.
    async fn poll_for_endpoint(
        &mut self,
        uuid: &str,
        payload: &Value,
    ) -> Result<Option<EndpointFields>> {
        for round in 1..=self.policy.poll_attempts {
            self.attempt.polls += 1;
            self.sleep(self.policy.poll_delay * round).await?;
            debug!("poll round {round}/{} for {uuid}", self.policy.poll_attempts);

            let restarted = self
                .guarded(self.client.transport.send(
                    Method::POST,
                    ApiBase::Local,
                    START_PATH,
                    Some(payload),
                ))
                .await;
            match restarted {
                Ok(value) => {
                    if let Some(found) = shape::endpoint_from_record(&value) {
                        return Ok(Some(found));
                    }
                }
                Err(OctoError::Cancelled) => return Err(OctoError::Cancelled),
                Err(err) => self.attempt.note_error(&err),
            }

            if let Some(found) = self.sweep_read_sources(uuid).await? {
                return Ok(Some(found));
            }

            if round == self.policy.poll_attempts
                && let Some(found) = self.try_v2_start(uuid, payload).await?
            {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Historical start path, local first, cloud as the very last resort.
    async fn try_v2_start(&mut self, uuid: &str, payload: &Value) -> Result<Option<EndpointFields>> {
        let path = V2_START_PATH.replace("{uuid}", uuid);
        for base in [ApiBase::Local, ApiBase::Cloud] {
            let sent = self
                .guarded(
                    self.client
                        .transport
                        .send(Method::POST, base, &path, Some(payload)),
                )
                .await;
            match sent {
                Ok(value) => {
                    if let Some(found) = shape::endpoint_from_record(&value) {
                        debug!("v2 start path answered with an endpoint for {uuid} via {base:?}");
                        return Ok(Some(found));
                    }
                }
                Err(OctoError::Cancelled) => return Err(OctoError::Cancelled),
                Err(err) => self.attempt.note_error(&err),
            }
        }
        Ok(None)
    }

    /// Walk the read catalog until one source confirms an endpoint.
    async fn sweep_read_sources(&mut self, uuid: &str) -> Result<Option<EndpointFields>> {
        for source in READ_SOURCES {
            let fetched = self
                .guarded(source.fetch(&self.client.transport, uuid))
                .await;
            let found = match fetched {
                Ok(value) => match source {
                    ReadSource::Info { .. } => shape::endpoint_from_record(&value),
                    ReadSource::Listing { .. } => {
                        shape::find_profile(&value, uuid).and_then(shape::endpoint_from_record)
                    }
                },
                Err(OctoError::Cancelled) => return Err(OctoError::Cancelled),
                Err(err) => {
                    self.attempt.note_error(&err);
                    None
                }
            };
            if let Some(found) = found {
                debug!("endpoint for {uuid} confirmed via {source:?}");
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Last line after polling: an operator-supplied port is validated
    /// directly; otherwise scan the known ranges if permitted.
    async fn probe_fallback(&mut self, uuid: &str, opts: &StartOptions) -> Result<ResolvedEndpoint> {
        if let Some(port) = opts.debug_port_override {
            info!("validating operator-supplied debug port {port} for {uuid}");
            let ws = self
                .guarded(async { Ok(self.probe.fetch_ws_endpoint(port).await) })
                .await?;
            return match ws {
                Some(ws) => Ok(ResolvedEndpoint {
                    uuid: uuid.to_string(),
                    debug_port: port,
                    ws_endpoint: Some(ws),
                }),
                None => Err(OctoError::NoEndpoint {
                    uuid: uuid.to_string(),
                    detail: format!(
                        "supplied debug port {port} is not answering the DevTools handshake"
                    ),
                }),
            };
        }

        if opts.allow_port_scan {
            info!("scanning the local debug-port ranges for {uuid}");
            let hit = self
                .guarded(async { Ok(self.probe.scan(probe::default_scan_ports()).await) })
                .await?;
            return match hit {
                Some((port, ws)) => Ok(ResolvedEndpoint {
                    uuid: uuid.to_string(),
                    debug_port: port,
                    ws_endpoint: Some(ws),
                }),
                None => Err(OctoError::NoEndpoint {
                    uuid: uuid.to_string(),
                    detail: "start was accepted but no endpoint appeared, and the port scan \
                             found no live DevTools socket"
                        .to_string(),
                }),
            };
        }

        Err(OctoError::NoEndpoint {
            uuid: uuid.to_string(),
            detail: "start was accepted but no endpoint appeared; supply a debug port or \
                     allow port scanning"
                .to_string(),
        })
    }

    /// The service often omits the websocket address; derive it from the
    /// port when we can, keep going without it when we cannot.
    async fn finalize(&self, uuid: &str, found: EndpointFields) -> Result<ResolvedEndpoint> {
        let EndpointFields {
            debug_port,
            ws_endpoint,
        } = found;
        let ws_endpoint = match ws_endpoint {
            Some(ws) => Some(ws),
            None => {
                self.guarded(async { Ok(self.probe.fetch_ws_endpoint(debug_port).await) })
                    .await?
            }
        };
        if ws_endpoint.is_none() {
            debug!("no websocket address for {uuid} on port {debug_port}; continuing with the port only");
        }
        Ok(ResolvedEndpoint {
            uuid: uuid.to_string(),
            debug_port,
            ws_endpoint,
        })
    }

    /// Race a unit of work against the cancellation signal.
    async fn guarded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(OctoError::Cancelled),
            result = fut => result,
        }
    }

    /// Cancellation-aware sleep; every deliberate wait goes through here.
    async fn sleep(&mut self, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return Ok(());
        }
        self.attempt.waited += duration;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(OctoError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

fn start_payload(uuid: &str, opts: &StartOptions, policy: &ResolvePolicy) -> Value {
    let debug_port = match opts.debug_port_override {
        Some(port) => json!(port),
        None => json!(true),
    };
    json!({
        "uuid": uuid,
        "headless": opts.headless,
        "debug_port": debug_port,
        "timeout": policy.start_timeout.as_secs(),
        "only_local": true,
        "flags": opts.flags,
    })
}

fn is_already_started(err: &OctoError) -> bool {
    let body = match err {
        OctoError::Client { body, .. } | OctoError::Server { body, .. } => body,
        _ => return false,
    };
    let text = body.to_ascii_lowercase();
    ALREADY_STARTED_MARKERS
        .iter()
        .any(|marker| text.contains(marker))
}

fn is_not_found(err: &OctoError) -> bool {
    matches!(err, OctoError::Client { status, .. } if *status == StatusCode::NOT_FOUND)
}
