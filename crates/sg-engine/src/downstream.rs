//! Downstream Work Collaborator
//!
//! The slow, possibly unreliable service every admitted request is dispatched
//! to. `MockDownstream` simulates a chat-completion API with random latency;
//! `HttpDownstream` POSTs the payload to a real endpoint.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use sg_config::DownstreamConfig;

use crate::error::EngineError;
use crate::Result;

#[async_trait]
pub trait Downstream: Send + Sync {
    /// Perform the work for one payload
    async fn invoke(&self, payload: &Value) -> Result<Value>;
}

/// Simulated chat-completion service
pub struct MockDownstream {
    request_count: AtomicU64,
    min_latency: Duration,
    max_latency: Duration,
    failure_rate: f64,
}

impl MockDownstream {
    pub fn new(min_latency: Duration, max_latency: Duration, failure_rate: f64) -> Self {
        Self {
            request_count: AtomicU64::new(0),
            min_latency,
            max_latency: max_latency.max(min_latency),
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &DownstreamConfig) -> Self {
        Self::new(
            Duration::from_millis(config.mock_min_latency_ms),
            Duration::from_millis(config.mock_max_latency_ms),
            config.mock_failure_rate,
        )
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }
}

impl Default for MockDownstream {
    fn default() -> Self {
        Self::from_config(&DownstreamConfig::default())
    }
}

#[async_trait]
impl Downstream for MockDownstream {
    async fn invoke(&self, payload: &Value) -> Result<Value> {
        let n = self.request_count.fetch_add(1, Ordering::SeqCst) + 1;

        let (latency, fail) = {
            let mut rng = rand::rng();
            let latency = if self.max_latency > self.min_latency {
                rng.random_range(self.min_latency..=self.max_latency)
            } else {
                self.min_latency
            };
            (latency, rng.random_bool(self.failure_rate))
        };

        tokio::time::sleep(latency).await;

        if fail {
            return Err(EngineError::Downstream(format!("simulated failure for mock request {n}")));
        }

        let prompt = payload.get("prompt").and_then(Value::as_str);
        let prompt_tokens = prompt.map(str::len).unwrap_or(0);

        Ok(json!({
            "id": format!("mock_response_{n}"),
            "object": "chat.completion",
            "created": Utc::now().timestamp(),
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": format!("Mock response for: {}", prompt.unwrap_or("No prompt")),
                },
                "finish_reason": "stop",
            }],
            "usage": {
                "prompt_tokens": prompt_tokens,
                "completion_tokens": 50,
                "total_tokens": prompt_tokens + 50,
            },
        }))
    }
}

/// Downstream reached over HTTP: the payload is POSTed as JSON and a 2xx JSON
/// body is the result.
pub struct HttpDownstream {
    client: Client,
    url: String,
}

impl HttpDownstream {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()?;
        let url = url.into();
        info!(url = %url, timeout_ms = timeout.as_millis() as u64, "HttpDownstream initialized");
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Downstream for HttpDownstream {
    async fn invoke(&self, payload: &Value) -> Result<Value> {
        let response = self
            .client
            .post(&self.url)
            .header("Accept", "application/json")
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(url = %self.url, status = status.as_u16(), "Downstream returned error status");
            return Err(EngineError::DownstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<Value>().await?)
    }
}
