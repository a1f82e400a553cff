//! Rate-limited HTTP fetcher shared by every recovery adapter.
//!
//! One scheduler per host enforces a minimum inter-request interval plus an
//! optional rolling requests-per-minute quota, and runs the retry policy for
//! transient failures (transport errors, 429 and the retryable 5xx family).
//! Hosts queue FIFO on their scheduler; all waits select against the
//! cancellation token so a shutdown abandons pending requests immediately.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::fixgaps::FixError;
use crate::models::DebugFlags;

/// Per-host scheduling and retry policy.
#[derive(Debug, Clone)]
pub struct HostPolicy {
    pub min_interval_ms: u64,
    pub max_requests_per_minute: Option<usize>,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for HostPolicy {
    fn default() -> Self {
        Self {
            min_interval_ms: 250,
            max_requests_per_minute: None,
            max_attempts: 4,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

/// Longest Retry-After we will honour.
const RETRY_AFTER_CAP_MS: u64 = 300_000;
/// Quota window width.
const QUOTA_WINDOW: Duration = Duration::from_secs(60);

/// Minimal response surface the adapters need.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, FixError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| FixError::BadPayload(format!("json decode: {e}")))
    }
}

/// Transport seam: production uses reqwest, tests inject a mock.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<FetchResponse, String>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, FixError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("candlestore/0.1")
            .build()
            .map_err(|e| FixError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<FetchResponse, String> {
        let resp = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = resp.bytes().await.map_err(|e| e.to_string())?.to_vec();
        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

#[derive(Debug)]
struct HostState {
    next_allowed_at: Instant,
    recent: VecDeque<Instant>,
}

impl HostState {
    fn new() -> Self {
        Self {
            next_allowed_at: Instant::now(),
            recent: VecDeque::new(),
        }
    }
}

pub struct Fetcher {
    transport: Arc<dyn Transport>,
    policies: HashMap<String, HostPolicy>,
    default_policy: HostPolicy,
    hosts: Mutex<HashMap<String, Arc<Mutex<HostState>>>>,
    debug: DebugFlags,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, debug: DebugFlags) -> Self {
        Self {
            transport,
            policies: HashMap::new(),
            default_policy: HostPolicy::default(),
            hosts: Mutex::new(HashMap::new()),
            debug,
        }
    }

    pub fn with_policy(mut self, host: &str, policy: HostPolicy) -> Self {
        self.policies.insert(host.to_string(), policy);
        self
    }

    fn policy_for(&self, host: &str) -> &HostPolicy {
        self.policies.get(host).unwrap_or(&self.default_policy)
    }

    async fn host_state(&self, host: &str) -> Arc<Mutex<HostState>> {
        let mut hosts = self.hosts.lock().await;
        hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(HostState::new())))
            .clone()
    }

    /// GET with host scheduling and retries.
    pub async fn get(&self, url: &str, cancel: &CancellationToken) -> Result<FetchResponse, FixError> {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .ok_or_else(|| FixError::Transport(format!("bad url {url}")))?;
        let policy = self.policy_for(&host).clone();
        let state = self.host_state(&host).await;

        let mut last_error: Option<FixError> = None;
        for attempt in 1..=policy.max_attempts {
            self.admit(&state, &policy, cancel).await?;

            if self.debug.http {
                debug!(url, attempt, "http get");
            }
            let result = tokio::select! {
                r = self.transport.get(url) => r,
                _ = cancel.cancelled() => return Err(FixError::Cancelled),
            };

            let (retryable, error, retry_after) = match result {
                Ok(resp) if resp.status < 400 => return Ok(resp),
                Ok(resp) => {
                    let retryable = matches!(resp.status, 429 | 500 | 502 | 503 | 504);
                    let retry_after = resp.header("retry-after").and_then(parse_retry_after);
                    (
                        retryable,
                        FixError::Http {
                            status: resp.status,
                            url: url.to_string(),
                        },
                        retry_after,
                    )
                }
                Err(e) => (true, FixError::Transport(e), None),
            };

            if !retryable || attempt == policy.max_attempts {
                return Err(error);
            }
            last_error = Some(error);

            let exp = policy
                .base_backoff_ms
                .saturating_mul(1u64 << (attempt - 1).min(20))
                .min(policy.max_backoff_ms);
            let backoff_ms = match retry_after {
                Some(ra) => ra.clamp(policy.min_interval_ms, RETRY_AFTER_CAP_MS),
                None => exp,
            };
            warn!(url, attempt, backoff_ms, "transient failure, backing off");

            {
                // extend the host cooldown so parallel callers also wait
                let mut s = state.lock().await;
                let until = Instant::now() + Duration::from_millis(backoff_ms);
                if until > s.next_allowed_at {
                    s.next_allowed_at = until;
                }
            }
            sleep_cancellable(Duration::from_millis(backoff_ms), cancel).await?;
        }
        Err(last_error.unwrap_or_else(|| FixError::Transport("retries exhausted".into())))
    }

    /// Wait for the host's interval and quota, then reserve a slot. Holding
    /// the host lock across the wait keeps admission FIFO.
    async fn admit(
        &self,
        state: &Arc<Mutex<HostState>>,
        policy: &HostPolicy,
        cancel: &CancellationToken,
    ) -> Result<(), FixError> {
        let mut s = state.lock().await;
        loop {
            let now = Instant::now();
            let interval_wait = s.next_allowed_at.saturating_duration_since(now);

            let quota_wait = match policy.max_requests_per_minute {
                Some(limit) => {
                    while let Some(&front) = s.recent.front() {
                        if now.duration_since(front) >= QUOTA_WINDOW {
                            s.recent.pop_front();
                        } else {
                            break;
                        }
                    }
                    match s.recent.front() {
                        Some(&oldest) if s.recent.len() >= limit => {
                            (oldest + QUOTA_WINDOW).saturating_duration_since(now)
                        }
                        _ => Duration::ZERO,
                    }
                }
                None => Duration::ZERO,
            };

            let wait = interval_wait.max(quota_wait);
            if wait.is_zero() {
                let dispatch = Instant::now();
                s.next_allowed_at = dispatch + Duration::from_millis(policy.min_interval_ms);
                if policy.max_requests_per_minute.is_some() {
                    s.recent.push_back(dispatch);
                }
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(FixError::Cancelled),
            }
        }
    }
}

async fn sleep_cancellable(d: Duration, cancel: &CancellationToken) -> Result<(), FixError> {
    tokio::select! {
        _ = tokio::time::sleep(d) => Ok(()),
        _ = cancel.cancelled() => Err(FixError::Cancelled),
    }
}

/// Retry-After: delta-seconds or an HTTP date.
fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs.saturating_mul(1_000));
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.timestamp_millis() - chrono::Utc::now().timestamp_millis();
    Some(delta.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    /// Transport that records dispatch instants and replays scripted
    /// responses (cycling the last one).
    struct MockTransport {
        responses: SyncMutex<Vec<FetchResponse>>,
        dispatches: SyncMutex<Vec<Instant>>,
    }

    impl MockTransport {
        fn ok() -> Self {
            Self::with_responses(vec![FetchResponse {
                status: 200,
                headers: vec![],
                body: b"ok".to_vec(),
            }])
        }

        fn with_responses(responses: Vec<FetchResponse>) -> Self {
            Self {
                responses: SyncMutex::new(responses),
                dispatches: SyncMutex::new(Vec::new()),
            }
        }

        fn dispatches(&self) -> Vec<Instant> {
            self.dispatches.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn get(&self, _url: &str) -> Result<FetchResponse, String> {
            self.dispatches.lock().push(Instant::now());
            let mut responses = self.responses.lock();
            if responses.len() > 1 {
                Ok(responses.remove(0))
            } else {
                Ok(responses[0].clone())
            }
        }
    }

    fn fetcher(transport: Arc<MockTransport>, policy: HostPolicy) -> Fetcher {
        Fetcher::new(transport, DebugFlags::default()).with_policy("api.test", policy)
    }

    /// Seed scenario: RPM quota pushes the 15th dispatch past the window.
    #[tokio::test(start_paused = true)]
    async fn test_quota_defers_requests_past_window() {
        let transport = Arc::new(MockTransport::ok());
        let f = fetcher(
            transport.clone(),
            HostPolicy {
                min_interval_ms: 100,
                max_requests_per_minute: Some(14),
                max_attempts: 1,
                base_backoff_ms: 100,
                max_backoff_ms: 1_000,
            },
        );
        let cancel = CancellationToken::new();
        for _ in 0..30 {
            f.get("https://api.test/x", &cancel).await.unwrap();
        }
        let d = transport.dispatches();
        assert_eq!(d.len(), 30);
        // 15th request waits for the oldest to leave the rolling minute
        assert!(d[14].duration_since(d[0]) >= Duration::from_secs(60));
        // and within the first window only 14 were dispatched
        let in_window = d.iter().filter(|t| t.duration_since(d[0]) < Duration::from_secs(60)).count();
        assert_eq!(in_window, 14);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_interval_spacing() {
        let transport = Arc::new(MockTransport::ok());
        let f = fetcher(
            transport.clone(),
            HostPolicy {
                min_interval_ms: 200,
                max_requests_per_minute: None,
                max_attempts: 1,
                base_backoff_ms: 100,
                max_backoff_ms: 1_000,
            },
        );
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            f.get("https://api.test/x", &cancel).await.unwrap();
        }
        let d = transport.dispatches();
        assert!(d[1].duration_since(d[0]) >= Duration::from_millis(200));
        assert!(d[2].duration_since(d[1]) >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_on_transient_statuses() {
        let bad = |status| FetchResponse {
            status,
            headers: vec![],
            body: vec![],
        };
        let good = FetchResponse {
            status: 200,
            headers: vec![],
            body: b"ok".to_vec(),
        };
        let transport = Arc::new(MockTransport::with_responses(vec![bad(503), bad(429), good]));
        let f = fetcher(transport.clone(), HostPolicy::default());
        let cancel = CancellationToken::new();
        let resp = f.get("https://api.test/x", &cancel).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(transport.dispatches().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_status_not_retried() {
        let transport = Arc::new(MockTransport::with_responses(vec![FetchResponse {
            status: 404,
            headers: vec![],
            body: vec![],
        }]));
        let f = fetcher(transport.clone(), HostPolicy::default());
        let cancel = CancellationToken::new();
        match f.get("https://api.test/x", &cancel).await {
            Err(FixError::Http { status: 404, .. }) => {}
            other => panic!("expected 404, got {other:?}"),
        }
        assert_eq!(transport.dispatches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_honoured() {
        let transport = Arc::new(MockTransport::with_responses(vec![
            FetchResponse {
                status: 429,
                headers: vec![("Retry-After".to_string(), "7".to_string())],
                body: vec![],
            },
            FetchResponse {
                status: 200,
                headers: vec![],
                body: vec![],
            },
        ]));
        let f = fetcher(transport.clone(), HostPolicy::default());
        let cancel = CancellationToken::new();
        f.get("https://api.test/x", &cancel).await.unwrap();
        let d = transport.dispatches();
        assert!(d[1].duration_since(d[0]) >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_exhausted_surfaces_last_status() {
        let transport = Arc::new(MockTransport::with_responses(vec![FetchResponse {
            status: 503,
            headers: vec![],
            body: vec![],
        }]));
        let f = fetcher(
            transport.clone(),
            HostPolicy {
                max_attempts: 3,
                ..HostPolicy::default()
            },
        );
        let cancel = CancellationToken::new();
        match f.get("https://api.test/x", &cancel).await {
            Err(FixError::Http { status: 503, .. }) => {}
            other => panic!("expected 503, got {other:?}"),
        }
        assert_eq!(transport.dispatches().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_wakes_sleep() {
        let transport = Arc::new(MockTransport::with_responses(vec![FetchResponse {
            status: 503,
            headers: vec![],
            body: vec![],
        }]));
        let f = Arc::new(fetcher(transport, HostPolicy::default()));
        let cancel = CancellationToken::new();
        let task = {
            let f = f.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { f.get("https://api.test/x", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(FixError::Cancelled)));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("7"), Some(7_000));
        assert_eq!(parse_retry_after("0"), Some(0));
        assert_eq!(parse_retry_after("junk"), None);
    }
}
