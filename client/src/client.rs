use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::OctoError;
use crate::Result;
use crate::config::OctoConfig;
use crate::resolve::READ_SOURCES;
use crate::resolve::ReadSource;
use crate::resolve::ResolvePolicy;
use crate::resolve::ResolvedEndpoint;
use crate::resolve::Resolver;
use crate::resolve::StartOptions;
use crate::shape;
use crate::transport::ApiBase;
use crate::transport::Transport;

pub(crate) const CREATE_PATH: &str = "/api/v2/automation/profiles";
const PROXY_PATH: &str = "/api/v2/automation/proxies";
const ACTIVE_LISTING_PATH: &str = "/api/profiles/active";
const FULL_LISTING_PATH: &str = "/api/profiles";

/// Stop variants across service versions, ordered by observed success rate.
const STOP_PATHS: [&str; 4] = [
    "/api/profiles/stop",
    "/api/profiles/force_stop",
    "/api/v2/automation/profiles/{uuid}/stop",
    "/api/profiles/{uuid}/stop",
];

const FORCE_STOP_PATHS: [&str; 3] = [
    "/api/profiles/force_stop",
    "/api/profiles/stop",
    "/api/v2/automation/profiles/{uuid}/stop",
];

const FORCE_STOP_CLOUD_PATH: &str = "/api/v2/automation/profiles/{uuid}/stop";

/// Dedicated one-time endpoints; not every service version has them.
const ONE_TIME_PATHS: [&str; 3] = [
    "/api/v2/automation/profiles/one-time",
    "/api/v2/automation/one-time-profile",
    "/api/v2/profiles/one-time",
];

const STOP_ALL_RETRIES: u32 = 3;
const STOP_ALL_INITIAL_WAIT: Duration = Duration::from_secs(2);

fn default_create_retry_waits() -> Vec<Duration> {
    vec![
        Duration::from_secs(3),
        Duration::from_secs(6),
        Duration::from_secs(10),
    ]
}

/// Fingerprint OS family, in the service's wire spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Android,
    Ios,
    #[serde(rename = "win")]
    Windows,
    #[serde(rename = "mac")]
    Macos,
}

/// What to create. `overrides` is merged over the generated payload last,
/// recursively, so callers can reach any field the service understands.
#[derive(Debug, Clone)]
pub struct ProfileSpec {
    pub title: String,
    pub os: OsFamily,
    pub os_version: Option<String>,
    pub user_agent: Option<String>,
    pub tags: Vec<String>,
    pub overrides: Option<Value>,
}

impl ProfileSpec {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            os: OsFamily::Android,
            os_version: None,
            user_agent: None,
            tags: Vec::new(),
            overrides: None,
        }
    }

    fn to_payload(&self) -> Value {
        let mut fingerprint = json!({ "os": self.os });
        if let Some(version) = &self.os_version {
            fingerprint["os_version"] = json!(version);
        }
        let mut payload = json!({
            "title": self.title,
            "fingerprint": fingerprint,
        });
        if let Some(user_agent) = &self.user_agent {
            payload["userAgent"] = json!(user_agent);
        }
        if !self.tags.is_empty() {
            payload["tags"] = json!(self.tags);
        }
        if let Some(overrides) = &self.overrides {
            shape::deep_merge(&mut payload, overrides);
        }
        payload
    }
}

/// A proxy record for the cloud store.
#[derive(Debug, Clone)]
pub struct ProxySpec {
    pub title: Option<String>,
    pub host: String,
    pub port: u16,
    /// Proxy protocol, e.g. "http" or "socks5".
    pub kind: String,
    pub login: Option<String>,
    pub password: Option<String>,
}

impl ProxySpec {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            title: None,
            host: host.into(),
            port,
            kind: "http".to_string(),
            login: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopAllSummary {
    /// Profiles the listings reported as running.
    pub running: usize,
    pub stopped: Vec<String>,
    pub failed: Vec<String>,
}

enum CreationRetry {
    DropUserAgent,
    TransientLimit,
}

/// Coordinator for the profile lifecycle. One instance serves any number of
/// concurrent resolutions; mutations for the same profile identifier are
/// serialized through a per-identifier lock, evicted once its last user
/// finishes.
pub struct OctoClient {
    pub(crate) transport: Transport,
    pub(crate) policy: ResolvePolicy,
    create_retry_waits: Vec<Duration>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl OctoClient {
    pub fn new(config: OctoConfig) -> Self {
        Self {
            transport: Transport::new(&config),
            policy: ResolvePolicy::default(),
            create_retry_waits: default_create_retry_waits(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(OctoConfig::from_env())
    }

    pub fn with_policy(mut self, policy: ResolvePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Waits between cloud creation retries; exposed so callers with tight
    /// budgets can shrink them.
    pub fn with_create_retry_waits(mut self, waits: Vec<Duration>) -> Self {
        self.create_retry_waits = waits;
        self
    }

    /// Create a profile, local API first, cloud as the fallback. Returns the
    /// new profile's identifier.
    pub async fn create_profile(&self, spec: &ProfileSpec) -> Result<String> {
        let payload = spec.to_payload();
        debug!("creating profile: {}", shape::redact_secrets(&payload));

        let local = self
            .transport
            .send(Method::POST, ApiBase::Local, CREATE_PATH, Some(&payload))
            .await;
        match local {
            Ok(value) => {
                if let Some(uuid) = shape::extract_uuid(&value) {
                    info!("created profile {uuid} via the local API");
                    return Ok(uuid.to_string());
                }
                warn!("local create answered without a uuid; falling back to the cloud API");
            }
            Err(err) => {
                warn!("local create failed ({err}); falling back to the cloud API");
            }
        }
        self.create_profile_cloud(payload).await
    }

    /// Cloud creation with bounded retries on the known transient
    /// signatures. The service rejects `userAgent` on some plans; that field
    /// is dropped once and the request retried.
    async fn create_profile_cloud(&self, mut payload: Value) -> Result<String> {
        let total = self.create_retry_waits.len() + 1;
        let mut last_error: Option<OctoError> = None;
        let waits: Vec<Duration> = std::iter::once(Duration::ZERO)
            .chain(self.create_retry_waits.iter().copied())
            .collect();

        for (index, wait) in waits.into_iter().enumerate() {
            if !wait.is_zero() {
                debug!("waiting {wait:?} before cloud create attempt {}/{total}", index + 1);
                tokio::time::sleep(wait).await;
            }
            let sent = self
                .transport
                .send(Method::POST, ApiBase::Cloud, CREATE_PATH, Some(&payload))
                .await;
            match sent {
                Ok(value) => {
                    let Some(uuid) = shape::extract_uuid(&value) else {
                        let base = self.transport.base_url(ApiBase::Cloud);
                        return Err(OctoError::Schema {
                            url: format!("{base}{CREATE_PATH}"),
                            detail: "create response carries no uuid".to_string(),
                        });
                    };
                    info!("created profile {uuid} via the cloud API");
                    return Ok(uuid.to_string());
                }
                Err(err) => match creation_signature(&err) {
                    Some(CreationRetry::DropUserAgent)
                        if payload.get("userAgent").is_some() =>
                    {
                        warn!("service rejected the userAgent field; dropping it and retrying");
                        if let Some(map) = payload.as_object_mut() {
                            map.remove("userAgent");
                        }
                        last_error = Some(err);
                    }
                    Some(CreationRetry::TransientLimit) => {
                        warn!(
                            "cloud create hit a transient limit (attempt {}/{total}): {err}",
                            index + 1
                        );
                        last_error = Some(err);
                    }
                    _ => return Err(err),
                },
            }
        }

        Err(last_error.unwrap_or_else(|| {
            let base = self.transport.base_url(ApiBase::Cloud);
            OctoError::Schema {
                url: format!("{base}{CREATE_PATH}"),
                detail: "cloud create retries exhausted without a response".to_string(),
            }
        }))
    }

    /// Try the dedicated one-time endpoints; fall back to a durable
    /// create-and-start when this service version has none.
    pub async fn create_one_time_profile(
        &self,
        spec: &ProfileSpec,
        options: &StartOptions,
    ) -> Result<ResolvedEndpoint> {
        let mut payload = spec.to_payload();
        payload["headless"] = json!(options.headless);
        if !options.flags.is_empty() {
            payload["flags"] = json!(options.flags);
        }

        for path in ONE_TIME_PATHS {
            let sent = self
                .transport
                .send(Method::POST, ApiBase::Cloud, path, Some(&payload))
                .await;
            match sent {
                Ok(value) => {
                    if let Some(found) = shape::endpoint_from_record(&value) {
                        let uuid = shape::extract_uuid(&value).unwrap_or("one-time").to_string();
                        info!("one-time profile {uuid} started via {path}");
                        return Ok(ResolvedEndpoint {
                            uuid,
                            debug_port: found.debug_port,
                            ws_endpoint: found.ws_endpoint,
                        });
                    }
                    debug!("one-time endpoint {path} answered without an endpoint");
                }
                Err(err) if is_endpoint_missing(&err) => {
                    debug!("one-time endpoint {path} is absent on this service version");
                }
                Err(err) => return Err(err),
            }
        }

        info!("no usable one-time endpoint; creating a durable profile instead");
        let uuid = self.create_profile(spec).await?;
        self.start_profile(&uuid, options).await
    }

    /// Create a proxy record in the cloud store and return its identifier.
    pub async fn create_proxy(&self, proxy: &ProxySpec) -> Result<String> {
        let title = proxy
            .title
            .clone()
            .unwrap_or_else(|| format!("Proxy_{}_{}", proxy.host, proxy.port));
        let mut payload = json!({
            "title": title,
            "host": proxy.host,
            "port": proxy.port,
            "type": proxy.kind,
        });
        // the proxy endpoint wants "login", not "username"
        if let Some(login) = &proxy.login {
            payload["login"] = json!(login);
        }
        if let Some(password) = &proxy.password {
            payload["password"] = json!(password);
        }
        debug!("creating proxy: {}", shape::redact_secrets(&payload));

        let value = self
            .transport
            .send(Method::POST, ApiBase::Cloud, PROXY_PATH, Some(&payload))
            .await?;
        shape::extract_uuid(&value).map(str::to_string).ok_or_else(|| {
            let base = self.transport.base_url(ApiBase::Cloud);
            OctoError::Schema {
                url: format!("{base}{PROXY_PATH}"),
                detail: "proxy create response carries no uuid".to_string(),
            }
        })
    }

    /// Start a profile and resolve its debug endpoint.
    pub async fn start_profile(
        &self,
        uuid: &str,
        options: &StartOptions,
    ) -> Result<ResolvedEndpoint> {
        self.start_profile_with_cancel(uuid, options, &CancellationToken::new())
            .await
    }

    /// Like `start_profile`, but abandons the flow at the next suspension
    /// point once `cancel` fires.
    pub async fn start_profile_with_cancel(
        &self,
        uuid: &str,
        options: &StartOptions,
        cancel: &CancellationToken,
    ) -> Result<ResolvedEndpoint> {
        let lock = self.lifecycle_lock(uuid).await;
        let result = {
            let guard = tokio::select! {
                _ = cancel.cancelled() => None,
                guard = lock.lock() => Some(guard),
            };
            match guard {
                Some(_guard) => {
                    info!("starting profile {uuid}");
                    Resolver::new(self, cancel).run(uuid, options).await
                }
                None => Err(OctoError::Cancelled),
            }
        };
        self.release_lifecycle_lock(uuid, lock).await;
        result
    }

    /// Best-effort stop. Stop is cleanup, not correctness: when every
    /// variant fails the profile is most likely already stopped, so this
    /// logs and returns.
    pub async fn stop_profile(&self, uuid: &str) {
        let lock = self.lifecycle_lock(uuid).await;
        {
            let _guard = lock.lock().await;
            self.stop_profile_locked(uuid).await;
        }
        self.release_lifecycle_lock(uuid, lock).await;
    }

    async fn stop_profile_locked(&self, uuid: &str) {
        let body = json!({ "uuid": uuid });
        for path in STOP_PATHS {
            let path = path.replace("{uuid}", uuid);
            if self.try_stop_once(ApiBase::Local, &path, &body).await {
                info!("stopped profile {uuid} via {path}");
                return;
            }
        }
        debug!("no stop endpoint accepted profile {uuid}; it is likely already stopped");
    }

    /// Force-stop with confirmation. Rounds back off exponentially from
    /// `initial_wait`; the cloud variant joins on the final round.
    pub async fn force_stop_profile(
        &self,
        uuid: &str,
        max_retries: u32,
        initial_wait: Duration,
    ) -> bool {
        let lock = self.lifecycle_lock(uuid).await;
        let stopped = {
            let _guard = lock.lock().await;
            self.force_stop_locked(uuid, max_retries, initial_wait).await
        };
        self.release_lifecycle_lock(uuid, lock).await;
        stopped
    }

    /// Same as `force_stop_profile` minus the lock; the resolver calls this
    /// while already holding the profile's lifecycle lock.
    pub(crate) async fn force_stop_locked(
        &self,
        uuid: &str,
        max_retries: u32,
        initial_wait: Duration,
    ) -> bool {
        let rounds = max_retries.max(1);
        let body = json!({ "uuid": uuid });
        for round in 0..rounds {
            if round > 0 {
                let wait = initial_wait * 2u32.saturating_pow(round - 1);
                debug!("force-stop round {}/{rounds} for {uuid}; waiting {wait:?}", round + 1);
                tokio::time::sleep(wait).await;
            }
            for path in FORCE_STOP_PATHS {
                let path = path.replace("{uuid}", uuid);
                if self.try_stop_once(ApiBase::Local, &path, &body).await {
                    info!("force-stopped profile {uuid} via {path}");
                    return true;
                }
            }
            if round + 1 == rounds {
                let path = FORCE_STOP_CLOUD_PATH.replace("{uuid}", uuid);
                if self.try_stop_once(ApiBase::Cloud, &path, &body).await {
                    info!("force-stopped profile {uuid} via the cloud API");
                    return true;
                }
            }
        }
        warn!("force-stop gave up on profile {uuid}");
        false
    }

    async fn try_stop_once(&self, base: ApiBase, path: &str, body: &Value) -> bool {
        let sent = self.transport.send(Method::POST, base, path, Some(body)).await;
        match sent {
            Ok(_) => true,
            Err(err) => {
                debug!("stop via {base:?} {path} failed: {err}");
                false
            }
        }
    }

    /// Bulk delete. Profiles are cloud-owned records, so this always talks
    /// to the cloud base.
    pub async fn delete_profiles(&self, uuids: &[String]) -> Result<()> {
        if uuids.is_empty() {
            return Ok(());
        }
        let body = json!({ "uuid": uuids });
        self.transport
            .send(Method::DELETE, ApiBase::Cloud, CREATE_PATH, Some(&body))
            .await?;
        info!("deleted {} profile(s)", uuids.len());
        Ok(())
    }

    /// Profiles the local API reports as running. Falls back from the
    /// active listing to the full one, and tolerates both envelope styles.
    pub async fn list_running_profiles(&self) -> Result<Vec<Value>> {
        let active = self.fetch_listing(ACTIVE_LISTING_PATH).await;
        match active {
            Ok(entries) if !entries.is_empty() => Ok(entries),
            Ok(_) => self.fetch_listing(FULL_LISTING_PATH).await,
            Err(err) => {
                debug!("active listing failed ({err}); trying the full listing");
                self.fetch_listing(FULL_LISTING_PATH).await
            }
        }
    }

    async fn fetch_listing(&self, path: &str) -> Result<Vec<Value>> {
        let value = self
            .transport
            .send_allow_list(Method::GET, ApiBase::Local, path, None)
            .await?;
        Ok(shape::profile_entries(&value).to_vec())
    }

    /// First record any read endpoint returns for this profile, unwrapped
    /// from its envelope. `None` when no store knows the identifier.
    pub async fn profile_status(&self, uuid: &str) -> Option<Value> {
        for source in READ_SOURCES {
            let fetched = source.fetch(&self.transport, uuid).await;
            match fetched {
                Ok(value) => match source {
                    ReadSource::Info { .. } => {
                        let record = match value.get("data") {
                            Some(data) if data.is_object() => data.clone(),
                            _ => value,
                        };
                        if record.as_object().is_some_and(|map| !map.is_empty()) {
                            return Some(record);
                        }
                    }
                    ReadSource::Listing { .. } => {
                        if let Some(entry) = shape::find_profile(&value, uuid) {
                            return Some(entry.clone());
                        }
                    }
                },
                Err(err) => debug!("status probe for {uuid} failed: {err}"),
            }
        }
        None
    }

    /// Force-stop everything the listings report as running.
    pub async fn stop_all_running(&self) -> Result<StopAllSummary> {
        let profiles = self.list_running_profiles().await?;
        let mut summary = StopAllSummary {
            running: profiles.len(),
            ..Default::default()
        };
        for entry in &profiles {
            let Some(uuid) = shape::extract_uuid(entry) else {
                debug!("running profile entry without a uuid: {entry}");
                continue;
            };
            let uuid = uuid.to_string();
            if self
                .force_stop_profile(&uuid, STOP_ALL_RETRIES, STOP_ALL_INITIAL_WAIT)
                .await
            {
                summary.stopped.push(uuid);
            } else {
                summary.failed.push(uuid);
            }
        }
        Ok(summary)
    }

    async fn lifecycle_lock(&self, uuid: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(uuid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the caller's reference, then evict the entry when the map holds
    /// the last one. Minting happens under the same map lock, so waiters
    /// with live clones keep the entry alive and the final release removes
    /// it.
    async fn release_lifecycle_lock(&self, uuid: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        drop(lock);
        if locks
            .get(uuid)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(uuid);
        }
    }
}

fn creation_signature(err: &OctoError) -> Option<CreationRetry> {
    let body = match err {
        OctoError::Client { body, .. } | OctoError::Server { body, .. } => body.as_str(),
        OctoError::RateLimited { .. } => return Some(CreationRetry::TransientLimit),
        _ => return None,
    };
    if body.contains("extra_forbidden") && body.contains("userAgent") {
        return Some(CreationRetry::DropUserAgent);
    }
    let lower = body.to_ascii_lowercase();
    if lower.contains("limit_reached")
        || lower.contains("maximum profiles")
        || lower.contains("rate_limited")
        || lower.contains("429")
    {
        return Some(CreationRetry::TransientLimit);
    }
    None
}

fn is_endpoint_missing(err: &OctoError) -> bool {
    matches!(
        err,
        OctoError::Client { status, .. }
            if *status == StatusCode::NOT_FOUND || *status == StatusCode::METHOD_NOT_ALLOWED
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    fn test_client(local: &MockServer, cloud: &MockServer) -> OctoClient {
        OctoClient::new(OctoConfig {
            local_base_url: local.uri(),
            cloud_base_url: cloud.uri(),
            api_token: Some("test-token".to_string()),
            request_timeout_ms: 2_000,
            max_retries: 0,
            backoff_base_ms: 1,
            backoff_cap_ms: 5,
        })
        .with_create_retry_waits(vec![
            Duration::from_millis(5),
            Duration::from_millis(5),
            Duration::from_millis(5),
        ])
    }

    #[tokio::test]
    async fn create_falls_back_to_the_cloud() {
        let local = MockServer::start().await;
        let cloud = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/automation/profiles"))
            .respond_with(ResponseTemplate::new(500).set_body_string("local api down"))
            .expect(1)
            .mount(&local)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/automation/profiles"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "data": { "uuid": "cloud-uuid" },
            })))
            .expect(1)
            .mount(&cloud)
            .await;

        let client = test_client(&local, &cloud);
        let uuid = client
            .create_profile(&ProfileSpec::new("fallback"))
            .await
            .expect("cloud fallback should succeed");
        assert_eq!(uuid, "cloud-uuid");
    }

    #[tokio::test]
    async fn create_drops_user_agent_after_extra_forbidden() {
        let local = MockServer::start().await;
        let cloud = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/automation/profiles"))
            .respond_with(ResponseTemplate::new(400).set_body_string("nope"))
            .mount(&local)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/automation/profiles"))
            .respond_with(ResponseTemplate::new(422).set_body_string(
                r#"{"detail": [{"type": "extra_forbidden", "loc": ["userAgent"]}]}"#,
            ))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&cloud)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/automation/profiles"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "uuid": "ua-free",
            })))
            .expect(1)
            .mount(&cloud)
            .await;

        let mut spec = ProfileSpec::new("ua test");
        spec.user_agent = Some("Mozilla/5.0 (X11; Linux x86_64)".to_string());

        let client = test_client(&local, &cloud);
        let uuid = client
            .create_profile(&spec)
            .await
            .expect("retry without userAgent should succeed");
        assert_eq!(uuid, "ua-free");

        let requests = cloud.received_requests().await.expect("request log");
        assert_eq!(requests.len(), 2);
        let first: Value = serde_json::from_slice(&requests[0].body).expect("json body");
        let second: Value = serde_json::from_slice(&requests[1].body).expect("json body");
        assert!(first.get("userAgent").is_some());
        assert!(second.get("userAgent").is_none());
    }

    #[tokio::test]
    async fn create_retries_transient_limits() {
        let local = MockServer::start().await;
        let cloud = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/automation/profiles"))
            .respond_with(ResponseTemplate::new(400).set_body_string("boom"))
            .mount(&local)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/automation/profiles"))
            .respond_with(
                ResponseTemplate::new(403).set_body_string(r#"{"error": "limit_reached"}"#),
            )
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&cloud)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/automation/profiles"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "uuid": "third-time",
            })))
            .expect(1)
            .mount(&cloud)
            .await;

        let client = test_client(&local, &cloud);
        let uuid = client
            .create_profile(&ProfileSpec::new("limits"))
            .await
            .expect("limit should clear on the third attempt");
        assert_eq!(uuid, "third-time");
    }

    #[tokio::test]
    async fn delete_routes_to_the_cloud() {
        let local = MockServer::start().await;
        let cloud = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v2/automation/profiles"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
            })))
            .expect(1)
            .mount(&cloud)
            .await;

        let client = test_client(&local, &cloud);
        client
            .delete_profiles(&["a".to_string(), "b".to_string()])
            .await
            .expect("delete should succeed");

        let cloud_requests = cloud.received_requests().await.expect("request log");
        let body: Value = serde_json::from_slice(&cloud_requests[0].body).expect("json body");
        assert_eq!(body, serde_json::json!({ "uuid": ["a", "b"] }));
        let local_requests = local.received_requests().await.expect("request log");
        assert!(local_requests.is_empty(), "delete must not touch the local API");
    }

    #[tokio::test]
    async fn delete_of_nothing_is_a_no_op() {
        let local = MockServer::start().await;
        let cloud = MockServer::start().await;
        let client = test_client(&local, &cloud);
        client.delete_profiles(&[]).await.expect("no-op");
        assert!(cloud.received_requests().await.expect("log").is_empty());
    }

    #[tokio::test]
    async fn stop_is_quiet_when_the_profile_is_already_stopped() {
        let local = MockServer::start().await;
        let cloud = MockServer::start().await;
        // no mocks: every stop variant 404s

        let client = test_client(&local, &cloud);
        client.stop_profile("gone").await;
        client.stop_profile("gone").await;

        let requests = local.received_requests().await.expect("request log");
        // both calls walked the whole catalog without erroring
        assert_eq!(requests.len(), 2 * STOP_PATHS.len());
    }

    #[tokio::test]
    async fn stop_halts_at_the_first_accepting_variant() {
        let local = MockServer::start().await;
        let cloud = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/profiles/stop"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
            })))
            .expect(1)
            .mount(&local)
            .await;

        let client = test_client(&local, &cloud);
        client.stop_profile("p1").await;

        let requests = local.received_requests().await.expect("request log");
        assert_eq!(requests.len(), 1);
    }

    #[tokio::test]
    async fn force_stop_reports_failure_and_tries_the_cloud() {
        let local = MockServer::start().await;
        let cloud = MockServer::start().await;
        // everything 404s, including the cloud variant

        let client = test_client(&local, &cloud);
        let stopped = client
            .force_stop_profile("stuck", 2, Duration::from_millis(5))
            .await;
        assert!(!stopped);

        let cloud_requests = cloud.received_requests().await.expect("request log");
        assert_eq!(cloud_requests.len(), 1, "cloud joins only on the final round");
        let local_requests = local.received_requests().await.expect("request log");
        assert_eq!(local_requests.len(), 2 * FORCE_STOP_PATHS.len());
    }

    #[tokio::test]
    async fn force_stop_succeeds_via_the_cloud_last_resort() {
        let local = MockServer::start().await;
        let cloud = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/automation/profiles/stuck/stop"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
            })))
            .expect(1)
            .mount(&cloud)
            .await;

        let client = test_client(&local, &cloud);
        let stopped = client
            .force_stop_profile("stuck", 1, Duration::from_millis(5))
            .await;
        assert!(stopped);
    }

    #[tokio::test]
    async fn listing_falls_back_to_the_full_catalog() {
        let local = MockServer::start().await;
        let cloud = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/profiles/active"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [],
            })))
            .expect(1)
            .mount(&local)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/profiles"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "uuid": "r1", "debug_port": 52801 },
            ])))
            .expect(1)
            .mount(&local)
            .await;

        let client = test_client(&local, &cloud);
        let running = client
            .list_running_profiles()
            .await
            .expect("listing should resolve");
        assert_eq!(running.len(), 1);
        assert_eq!(shape::extract_uuid(&running[0]), Some("r1"));
    }

    #[tokio::test]
    async fn profile_status_unwraps_the_data_envelope() {
        let local = MockServer::start().await;
        let cloud = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/profiles/p9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "data": { "uuid": "p9", "status": "running" },
            })))
            .mount(&local)
            .await;

        let client = test_client(&local, &cloud);
        let record = client.profile_status("p9").await.expect("record found");
        assert_eq!(record["status"], "running");
    }

    #[tokio::test]
    async fn lifecycle_locks_are_evicted_after_use() {
        let local = MockServer::start().await;
        let cloud = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/profiles/start"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "uuid": "fleeting",
                "debug_port": 52899,
                "ws_endpoint": "ws://127.0.0.1:52899/devtools/browser/7c",
            })))
            .mount(&local)
            .await;

        let client = test_client(&local, &cloud);
        client
            .start_profile("fleeting", &StartOptions::default())
            .await
            .expect("start should resolve");
        client.stop_profile("fleeting").await;
        // a uuid never seen before must not linger either
        client.stop_profile("one-shot").await;
        assert!(client.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn stop_all_tallies_successes_and_failures() {
        let local = MockServer::start().await;
        let cloud = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/profiles/active"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{ "uuid": "ok1" }, { "uuid": "ok2" }],
            })))
            .mount(&local)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/profiles/force_stop"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
            })))
            .expect(2)
            .mount(&local)
            .await;

        let client = test_client(&local, &cloud);
        let summary = client.stop_all_running().await.expect("summary");
        assert_eq!(summary.running, 2);
        assert_eq!(summary.stopped, vec!["ok1".to_string(), "ok2".to_string()]);
        assert!(summary.failed.is_empty());
    }
}
