//! Admission control and in-flight request coalescing.
//!
//! A weighted semaphore caps the number of concurrently executing requests;
//! a single-flight group lets concurrent requests with the same fingerprint
//! share one execution, with followers receiving the leader's outcome.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use hyper::HeaderMap;
use sha2::Digest;
use sha2::Sha256;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tokio::sync::broadcast;
use tracing::debug;

use crate::command::ExecutionState;
use crate::config::HttpServerConf;
use crate::error::AgentErr;

const DEFAULT_BODY_LIMIT: usize = 4 * 1024 * 1024;

/// Shared result of one execution, cheap to hand to every follower.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub state: ExecutionState,
    pub error: Option<Arc<AgentErr>>,
    pub stdout: Arc<Vec<u8>>,
    pub stderr: Arc<Vec<u8>>,
}

/// Which request fields feed the single-flight fingerprint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlightPattern {
    pub req_id_header: Option<String>,
    pub by_method: bool,
    pub by_path: bool,
    pub by_user_ip: bool,
    pub by_body: bool,
    pub headers: Vec<String>,
    pub queries: Vec<String>,
}

impl FlightPattern {
    /// Resolve the configured knobs, inferring the unspecified ones.
    ///
    /// With a req-id header configured the `by-*` switches default to off;
    /// otherwise each of method/path/user-ip defaults to on exactly when one
    /// of the *others* was switched on explicitly.
    pub fn resolve(conf: &HttpServerConf) -> Self {
        let req_id_header = conf
            .single_flight_req_id
            .clone()
            .filter(|name| !name.is_empty());
        let method = conf.single_flight_by_method;
        let path = conf.single_flight_by_path;
        let user_ip = conf.single_flight_by_userip;

        let explicit = |knob: Option<bool>| knob == Some(true);
        let infer = |own: Option<bool>, other_a: Option<bool>, other_b: Option<bool>| {
            own.unwrap_or_else(|| {
                if req_id_header.is_some() {
                    false
                } else {
                    explicit(other_a) || explicit(other_b)
                }
            })
        };

        Self {
            by_method: infer(method, path, user_ip),
            by_path: infer(path, method, user_ip),
            by_user_ip: infer(user_ip, method, path),
            by_body: conf.single_flight_by_body.unwrap_or(false),
            headers: conf.single_flight_by_headers(),
            queries: conf.single_flight_by_queries(),
            req_id_header,
        }
    }
}

/// The request fields a fingerprint is computed from.
#[derive(Debug, Clone, Copy)]
pub struct DigestInput<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub query: &'a str,
    pub remote_addr: Option<SocketAddr>,
    pub body: Option<&'a [u8]>,
}

#[derive(Debug)]
pub struct ReqRestrictor {
    semaphore: Option<Arc<Semaphore>>,
    flight: Option<FlightGroup<ExecOutcome>>,
    pattern: Option<FlightPattern>,
    body_limit: usize,
    bind_followers: bool,
}

impl ReqRestrictor {
    pub fn new(conf: Option<&HttpServerConf>) -> Self {
        let semaphore = conf.filter(|c| c.concurrent_limit_enabled()).map(|c| {
            let mut total = c.concurrent_limit_total();
            if total == 0 {
                total = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
            }
            Arc::new(Semaphore::new(total))
        });

        let (flight, pattern) = match conf {
            Some(c) if c.single_flight_enabled() => {
                (Some(FlightGroup::new()), Some(FlightPattern::resolve(c)))
            }
            _ => (None, None),
        };

        Self {
            semaphore,
            flight,
            pattern,
            body_limit: conf
                .and_then(|c| c.single_flight_body_limit)
                .unwrap_or(DEFAULT_BODY_LIMIT),
            bind_followers: conf
                .and_then(|c| c.single_flight_bind_followers)
                .unwrap_or(true),
        }
    }

    pub fn has_semaphore(&self) -> bool {
        self.semaphore.is_some()
    }

    /// Take one admission permit; the permit releases itself when dropped.
    pub async fn acquire(&self) -> Result<Option<OwnedSemaphorePermit>, AgentErr> {
        match self.semaphore.as_ref() {
            None => Ok(None),
            Some(semaphore) => semaphore
                .clone()
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|error| AgentErr::Admission(error.to_string())),
        }
    }

    pub fn has_single_flight(&self) -> bool {
        self.flight.is_some() && self.pattern.is_some()
    }

    pub fn pattern(&self) -> Option<&FlightPattern> {
        self.pattern.as_ref()
    }

    /// Whether the fingerprint wants the request body buffered.
    pub fn wants_body(&self) -> bool {
        self.pattern.as_ref().is_some_and(|p| p.by_body)
    }

    pub fn body_limit(&self) -> usize {
        self.body_limit
    }

    pub fn bind_followers(&self) -> bool {
        self.bind_followers
    }

    /// The single-flight key for a request: the req-id header value when
    /// configured and present, otherwise the computed fingerprint.
    pub fn flight_key(&self, input: &DigestInput<'_>) -> Option<String> {
        let pattern = self.pattern.as_ref()?;
        if let Some(name) = pattern.req_id_header.as_deref() {
            if let Some(value) = input.headers.get(name) {
                let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
        Some(self.digest(input))
    }

    /// Deterministic fingerprint of the configured request fields.
    pub fn digest(&self, input: &DigestInput<'_>) -> String {
        let Some(pattern) = self.pattern.as_ref() else {
            return String::new();
        };
        let mut parts: Vec<String> = Vec::new();
        if pattern.by_method {
            parts.push(input.method.to_string());
        }
        if pattern.by_path {
            parts.push(input.path.to_string());
        }

        let mut hasher = Sha256::new();
        for name in &pattern.headers {
            if let Some(value) = input.headers.get(name.as_str()) {
                if !value.is_empty() {
                    hasher.update(value.as_bytes());
                }
            }
        }
        for name in &pattern.queries {
            if let Some(value) = first_query_value(input.query, name) {
                if !value.is_empty() {
                    hasher.update(value.as_bytes());
                }
            }
        }
        if pattern.by_body {
            if let Some(body) = input.body {
                hasher.update(body);
            }
        }
        parts.push(hex_digest(&hasher.finalize()));

        if pattern.by_user_ip {
            if let Some(addr) = input.remote_addr {
                parts.push(addr.ip().to_string());
            }
        }
        parts.join("|")
    }

    /// Run `action` through the single-flight group under `key`.
    ///
    /// Returns the shared outcome and whether this request was a follower.
    /// `None` means the leader vanished (or a detached follower timed out)
    /// without publishing a result.
    pub async fn filter_by_digest<F>(
        &self,
        key: String,
        follower_deadline: Option<Duration>,
        action: F,
    ) -> (Option<ExecOutcome>, bool)
    where
        F: Future<Output = ExecOutcome> + Send + 'static,
    {
        match self.flight.as_ref() {
            None => (Some(action.await), false),
            Some(group) => {
                let (outcome, shared) = group.run(&key, follower_deadline, action).await;
                debug!(key = %key, shared, "single-flight request resolved");
                (outcome, shared)
            }
        }
    }
}

fn first_query_value(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn hex_digest(digest: &[u8]) -> String {
    let mut rendered = String::with_capacity(digest.len() * 2);
    for byte in digest {
        rendered.push_str(&format!("{byte:02x}"));
    }
    rendered
}

/// Coalesces concurrent calls with the same key onto one execution.
#[derive(Debug)]
struct FlightGroup<T: Clone + Send + 'static> {
    calls: Arc<Mutex<HashMap<String, broadcast::Sender<T>>>>,
}

impl<T: Clone + Send + 'static> FlightGroup<T> {
    fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn run<F>(&self, key: &str, follower_deadline: Option<Duration>, action: F) -> (Option<T>, bool)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let follower = {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            match calls.get(key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    calls.insert(key.to_string(), tx);
                    None
                }
            }
        };

        if let Some(mut rx) = follower {
            let received = match follower_deadline {
                Some(limit) => match tokio::time::timeout(limit, rx.recv()).await {
                    Ok(received) => received.ok(),
                    Err(_) => None,
                },
                None => rx.recv().await.ok(),
            };
            return (received, true);
        }

        // The leader's execution runs on its own task: followers still get a
        // result if the leading request goes away mid-flight.
        let mut cleanup = FlightCleanup {
            calls: self.calls.clone(),
            key: Some(key.to_string()),
        };
        let leader = tokio::spawn(async move {
            let outcome = action.await;
            if let Some(tx) = cleanup.take() {
                let _ = tx.send(outcome.clone());
            }
            outcome
        });
        match leader.await {
            Ok(outcome) => (Some(outcome), false),
            Err(_) => (None, false),
        }
    }
}

/// Removes the in-flight entry even if the leader's action panics, so later
/// requests start a fresh flight instead of waiting forever.
struct FlightCleanup<T> {
    calls: Arc<Mutex<HashMap<String, broadcast::Sender<T>>>>,
    key: Option<String>,
}

impl<T> FlightCleanup<T> {
    fn take(&mut self) -> Option<broadcast::Sender<T>> {
        let key = self.key.take()?;
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key)
    }
}

impl<T> Drop for FlightCleanup<T> {
    fn drop(&mut self) {
        let _ = self.take();
    }
}
