//! Reliable delivery of packets to the aggregator
//!
//! Two retry layers:
//! - transport: connection or timeout failures are retried a fixed number of
//!   times, half a commit interval apart
//! - status: a response with `status_code != 200` is retried according to a
//!   [`RetryPolicy`] chosen per call, a full commit interval apart

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use fleet_proto::{Api, HeartbeatPacket, Response, StatsPacket, StatusCode};

use crate::config::AgentConfig;

/// How many times a non-200 answer is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Once,
    Times(u32),
    Forever,
}

impl RetryPolicy {
    /// `-1` means forever, anything below 2 means a single attempt.
    pub fn from_sentinel(n: i64) -> Self {
        match n {
            -1 => RetryPolicy::Forever,
            n if n <= 1 => RetryPolicy::Once,
            n => RetryPolicy::Times(u32::try_from(n).unwrap_or(u32::MAX)),
        }
    }

    fn attempts(self) -> Option<u32> {
        match self {
            RetryPolicy::Once => Some(1),
            RetryPolicy::Times(n) => Some(n.max(1)),
            RetryPolicy::Forever => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("http client setup failed: {0}")]
    Setup(#[source] reqwest::Error),
    #[error("aggregator unreachable after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("aggregator answered {status_code}: {reason}")]
    Rejected { status_code: u16, reason: String },
}

#[derive(Debug, Clone)]
pub struct DeliveryTiming {
    pub request_timeout: Duration,
    pub transport_retries: u32,
    pub transport_backoff: Duration,
    pub status_backoff: Duration,
}

impl DeliveryTiming {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            transport_retries: config.transport_retries,
            transport_backoff: config.commit_period() / 2,
            status_backoff: config.commit_period(),
        }
    }
}

pub struct DeliveryClient {
    http: reqwest::Client,
    base_url: String,
    timing: DeliveryTiming,
}

impl DeliveryClient {
    pub fn new(base_url: &str, timing: DeliveryTiming) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder()
            .timeout(timing.request_timeout)
            .user_agent(concat!("fleet-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(DeliveryError::Setup)?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string(), timing })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, DeliveryError> {
        Self::new(&config.aggregator, DeliveryTiming::from_config(config))
    }

    /// One exchange, with transport retries only.
    pub async fn post<T: Serialize + ?Sized>(&self, api: Api, payload: &T) -> Result<Response, DeliveryError> {
        let url = format!("{}{}", self.base_url, api.path());
        let retries = self.timing.transport_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!("POST {url} (attempt {attempt})");
            match self.http.post(&url).json(payload).send().await {
                Ok(resp) => {
                    let http_status = resp.status().as_u16();
                    return Ok(resp.json::<Response>().await.unwrap_or_else(|e| {
                        warn!("undecodable answer from {url}: {e}");
                        Response {
                            status_code: http_status,
                            reason: format!("undecodable answer: {e}"),
                            ts: fleet_proto::now_ts(),
                            data: None,
                        }
                    }));
                }
                Err(e) if attempt < retries => {
                    warn!("{api} delivery attempt {attempt}/{retries} failed: {e}");
                    tokio::time::sleep(self.timing.transport_backoff).await;
                }
                Err(source) => return Err(DeliveryError::Transport { attempts: attempt, source }),
            }
        }
    }

    /// Deliver until the aggregator answers 200 or `policy` is exhausted.
    pub async fn post_with<T: Serialize + ?Sized>(
        &self,
        api: Api,
        payload: &T,
        policy: RetryPolicy,
    ) -> Result<Response, DeliveryError> {
        let mut remaining = policy.attempts();
        loop {
            let err = match self.post(api, payload).await {
                Ok(resp) if resp.is_ok() => return Ok(resp),
                Ok(resp) => {
                    warn!("{api} not accepted, {}: {}", resp.status_code, resp.detail());
                    let err = DeliveryError::Rejected { status_code: resp.status_code, reason: resp.detail().to_string() };
                    // Only a heartbeat can cure an unauthorized address.
                    if api != Api::Heartbeat && resp.status() == Some(StatusCode::Unauthorized) {
                        return Err(err);
                    }
                    err
                }
                Err(e) => {
                    warn!("{api}: {e}");
                    e
                }
            };
            if let Some(left) = remaining.as_mut() {
                *left -= 1;
                if *left == 0 {
                    return Err(err);
                }
            }
            tokio::time::sleep(self.timing.status_backoff).await;
        }
    }

    pub async fn heartbeat(&self, hostname: &str, policy: RetryPolicy) -> Result<Response, DeliveryError> {
        let packet = HeartbeatPacket { hostname: hostname.to_string() };
        self.post_with(Api::Heartbeat, &packet, policy).await
    }

    pub async fn stats(&self, packet: &StatsPacket, policy: RetryPolicy) -> Result<Response, DeliveryError> {
        self.post_with(Api::Stats, packet, policy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn timing(transport_retries: u32) -> DeliveryTiming {
        DeliveryTiming {
            request_timeout: Duration::from_secs(2),
            transport_retries,
            transport_backoff: Duration::from_millis(5),
            status_backoff: Duration::from_millis(5),
        }
    }

    /// Aggregator stand-in rejecting the first `rejections` heartbeats.
    async fn flaky_aggregator(rejections: u32) -> (String, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/heartbeat",
            post(move |Json(_packet): Json<HeartbeatPacket>| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < rejections {
                        Json(Response::rejected(StatusCode::NotAcceptable, "not yet"))
                    } else {
                        Json(Response::ok())
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), calls)
    }

    #[test]
    fn test_retry_sentinels() {
        assert_eq!(RetryPolicy::from_sentinel(-1), RetryPolicy::Forever);
        assert_eq!(RetryPolicy::from_sentinel(1), RetryPolicy::Once);
        assert_eq!(RetryPolicy::from_sentinel(100), RetryPolicy::Times(100));
    }

    #[tokio::test]
    async fn test_rejections_are_retried_within_budget() {
        let (url, calls) = flaky_aggregator(2).await;
        let client = DeliveryClient::new(&url, timing(1)).unwrap();
        let resp = client.heartbeat("node1", RetryPolicy::Times(3)).await.unwrap();
        assert!(resp.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_attempt_surfaces_rejection() {
        let (url, calls) = flaky_aggregator(5).await;
        let client = DeliveryClient::new(&url, timing(1)).unwrap();
        let err = client.heartbeat("node1", RetryPolicy::Once).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { status_code: 406, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forever_waits_for_acceptance() {
        let (url, calls) = flaky_aggregator(6).await;
        let client = DeliveryClient::new(&url, timing(1)).unwrap();
        client.heartbeat("node1", RetryPolicy::Forever).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_unauthorized_stats_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/stats",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(Response::rejected(StatusCode::Unauthorized, "127.0.0.1"))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = DeliveryClient::new(&url, timing(1)).unwrap();
        let packet = StatsPacket::Tasks { tasks: Vec::new() };
        let err = client.stats(&packet, RetryPolicy::Times(5)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { status_code: 401, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_aggregator_exhausts_transport_retries() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = DeliveryClient::new(&format!("http://{addr}/"), timing(3)).unwrap();
        let err = client.heartbeat("node1", RetryPolicy::Once).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transport { attempts: 3, .. }));
    }
}
