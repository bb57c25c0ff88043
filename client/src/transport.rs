use std::time::Duration;

use rand::Rng;
use reqwest::Method;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::OctoError;
use crate::Result;
use crate::config::OctoConfig;

/// Which API root a request is addressed to. The two stores are not kept in
/// sync by the service, so callers always pick explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiBase {
    Local,
    Cloud,
}

pub(crate) const BODY_PREVIEW_MAX: usize = 2000;

const RATE_LIMIT_DEFAULT_WAIT: Duration = Duration::from_secs(1);
const RATE_LIMIT_MIN_WAIT: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const RETRYABLE_STATUSES: [StatusCode; 3] = [
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// One HTTP door to both API roots. Owns the retry budget; everything above
/// it deals in classified `OctoError`s instead of raw responses.
#[derive(Debug, Clone)]
pub(crate) struct Transport {
    http: reqwest::Client,
    local_base: String,
    cloud_base: String,
    api_token: Option<String>,
    request_timeout: Duration,
    max_retries: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl Transport {
    pub fn new(config: &OctoConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(format!("octo-client/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            local_base: config.local_base_url.trim_end_matches('/').to_string(),
            cloud_base: config.cloud_base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            request_timeout: config.request_timeout(),
            max_retries: config.max_retries,
            backoff_base: config.backoff_base(),
            backoff_cap: config.backoff_cap(),
        }
    }

    pub fn base_url(&self, base: ApiBase) -> &str {
        match base {
            ApiBase::Local => &self.local_base,
            ApiBase::Cloud => &self.cloud_base,
        }
    }

    /// Issue a request and normalize the answer to a JSON object.
    pub async fn send(
        &self,
        method: Method,
        base: ApiBase,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        self.send_inner(method, base, path, body, false).await
    }

    /// Like `send`, but tolerates a bare JSON array (some listing endpoints
    /// answer with one).
    pub async fn send_allow_list(
        &self,
        method: Method,
        base: ApiBase,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        self.send_inner(method, base, path, body, true).await
    }

    async fn send_inner(
        &self,
        method: Method,
        base: ApiBase,
        path: &str,
        body: Option<&Value>,
        allow_list: bool,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url(base), path);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            trace!("{method} {url} (attempt {attempt})");
            let outcome = self.execute(&method, &url, body).await;
            match outcome {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let hint = retry_after(&resp);
                        let preview = body_preview(resp).await;
                        if attempt > self.max_retries {
                            return Err(OctoError::RateLimited {
                                url,
                                retry_after: hint,
                                body: preview,
                            });
                        }
                        let wait = hint.unwrap_or(RATE_LIMIT_DEFAULT_WAIT).max(RATE_LIMIT_MIN_WAIT);
                        warn!(
                            "rate limited by {url} (attempt {attempt}); waiting {wait:?} before retrying"
                        );
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    if RETRYABLE_STATUSES.contains(&status) {
                        if attempt > self.max_retries {
                            return Err(OctoError::Server {
                                status,
                                url,
                                body: body_preview(resp).await,
                            });
                        }
                        let delay = self.backoff(attempt);
                        warn!("HTTP {status} from {url} (attempt {attempt}); retrying in {delay:?}");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    if !status.is_success() {
                        let preview = body_preview(resp).await;
                        return Err(if status.is_server_error() {
                            OctoError::Server {
                                status,
                                url,
                                body: preview,
                            }
                        } else {
                            OctoError::Client {
                                status,
                                url,
                                body: preview,
                            }
                        });
                    }
                    return decode_body(&url, resp, allow_list).await;
                }
                Err(err) => {
                    if attempt > self.max_retries {
                        return Err(OctoError::Network { url, source: err });
                    }
                    let delay = self.backoff(attempt);
                    debug!("network error calling {url}: {err}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn execute(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
    ) -> reqwest::Result<reqwest::Response> {
        let mut request = self
            .http
            .request(method.clone(), url)
            .timeout(self.request_timeout);
        if let Some(token) = &self.api_token {
            request = request.header("X-Octo-Api-Token", token);
        }
        if let Some(json) = body {
            request = request.json(json);
        }
        request.send().await
    }

    /// Exponential backoff with the usual 10% jitter, capped.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let raw = self.backoff_base.as_secs_f64() * 2f64.powi(exp);
        let capped = raw.min(self.backoff_cap.as_secs_f64());
        let jitter = rand::rng().random_range(0.9..1.1);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// `Retry-After` in seconds; the service has been seen sending fractions.
/// Negative, non-finite, or out-of-range values count as no hint.
fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

async fn body_preview(resp: reqwest::Response) -> String {
    match resp.text().await {
        Ok(text) => truncate_chars(&text, BODY_PREVIEW_MAX),
        Err(_) => "<unreadable body>".to_string(),
    }
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

async fn decode_body(url: &str, resp: reqwest::Response, allow_list: bool) -> Result<Value> {
    let bytes = resp.bytes().await.map_err(|source| OctoError::Network {
        url: url.to_string(),
        source,
    })?;
    if bytes.is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    let value: Value = serde_json::from_slice(&bytes).map_err(|err| OctoError::Schema {
        url: url.to_string(),
        detail: format!(
            "invalid JSON ({err}): {}",
            truncate_chars(&String::from_utf8_lossy(&bytes), 200)
        ),
    })?;
    match &value {
        Value::Object(_) => Ok(value),
        Value::Array(_) if allow_list => Ok(value),
        other => Err(OctoError::Schema {
            url: url.to_string(),
            detail: format!(
                "expected a JSON object, got: {}",
                truncate_chars(&other.to_string(), 200)
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Instant;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::header;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    fn transport_for(server: &MockServer, max_retries: u32) -> Transport {
        Transport::new(&OctoConfig {
            local_base_url: server.uri(),
            cloud_base_url: server.uri(),
            api_token: Some("test-token".to_string()),
            request_timeout_ms: 2_000,
            max_retries,
            backoff_base_ms: 5,
            backoff_cap_ms: 20,
        })
    }

    #[tokio::test]
    async fn empty_body_becomes_an_empty_object() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/profiles/p1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let transport = transport_for(&server, 0);
        let value = transport
            .send(Method::GET, ApiBase::Local, "/api/profiles/p1", None)
            .await
            .expect("empty body should normalize");
        assert_eq!(value, json!({}));
    }

    #[tokio::test]
    async fn bare_array_is_rejected_unless_allowed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/profiles"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "uuid": "a" }])))
            .mount(&server)
            .await;

        let transport = transport_for(&server, 0);
        let err = transport
            .send(Method::GET, ApiBase::Local, "/api/profiles", None)
            .await
            .expect_err("bare array should be a schema error");
        assert!(matches!(err, OctoError::Schema { .. }), "got {err:?}");

        let value = transport
            .send_allow_list(Method::GET, ApiBase::Local, "/api/profiles", None)
            .await
            .expect("allow_list should accept the array");
        assert_eq!(value, json!([{ "uuid": "a" }]));
    }

    #[tokio::test]
    async fn retries_bad_gateway_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/profiles/start"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/profiles/start"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "uuid": "p1" })))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport_for(&server, 2);
        let value = transport
            .send(
                Method::POST,
                ApiBase::Local,
                "/api/profiles/start",
                Some(&json!({ "uuid": "p1" })),
            )
            .await
            .expect("second attempt should succeed");
        assert_eq!(value["uuid"], "p1");
        let requests = server.received_requests().await.expect("requests recorded");
        assert_eq!(requests.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rate_limit_waits_for_the_hint_then_retries_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/automation/profiles"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "2")
                    .set_body_string("slow down"),
            )
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/automation/profiles"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "uuid": "p2" })))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport_for(&server, 3);
        let started = Instant::now();
        let value = transport
            .send(
                Method::POST,
                ApiBase::Local,
                "/api/v2/automation/profiles",
                Some(&json!({ "title": "t" })),
            )
            .await
            .expect("retry after the hinted wait");
        assert_eq!(value["uuid"], "p2");
        assert!(
            started.elapsed() >= Duration::from_secs(2),
            "waited only {:?}",
            started.elapsed()
        );
        let requests = server.received_requests().await.expect("requests recorded");
        assert_eq!(requests.len(), 2, "exactly one retry expected");
    }

    #[tokio::test]
    async fn rate_limit_exhaustion_carries_the_hint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/profiles"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "3")
                    .set_body_string("cool off"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport_for(&server, 0);
        let err = transport
            .send(Method::GET, ApiBase::Local, "/api/profiles", None)
            .await
            .expect_err("budget of zero retries should surface the 429");
        match err {
            OctoError::RateLimited {
                retry_after, body, ..
            } => {
                assert_eq!(retry_after, Some(Duration::from_secs(3)));
                assert_eq!(body, "cool off");
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_tolerates_an_oversized_hint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/profiles"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "1e300")
                    .set_body_string("slow down"),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/profiles/active"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "99999999999999999999")
                    .set_body_string("slow down"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport_for(&server, 0);
        for request_path in ["/api/profiles", "/api/profiles/active"] {
            let err = transport
                .send(Method::GET, ApiBase::Local, request_path, None)
                .await
                .expect_err("an oversized hint still classifies as a rate limit");
            assert_eq!(err.status(), Some(StatusCode::TOO_MANY_REQUESTS));
            match err {
                OctoError::RateLimited { retry_after, .. } => assert_eq!(retry_after, None),
                other => panic!("expected RateLimited, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn terminal_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/profiles/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("profile not found"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport_for(&server, 3);
        let err = transport
            .send(Method::GET, ApiBase::Local, "/api/profiles/missing", None)
            .await
            .expect_err("404 is terminal");
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        match err {
            OctoError::Client { status, body, .. } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(body, "profile not found");
            }
            other => panic!("expected Client, got {other:?}"),
        }
        let requests = server.received_requests().await.expect("requests recorded");
        assert_eq!(requests.len(), 1);
    }

    #[tokio::test]
    async fn token_header_is_attached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/profiles/active"))
            .and(header("X-Octo-Api-Token", "test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport_for(&server, 0);
        transport
            .send(Method::GET, ApiBase::Local, "/api/profiles/active", None)
            .await
            .expect("header should match");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("ab", 3), "ab");
        assert_eq!(truncate_chars("перезапуск", 4), "пере");
    }
}
