//! HTTP client for the routing service's `/v1/route` endpoint.

use crate::error::{CollectError, CollectResult, ScoringError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_ROUTER_ENDPOINT: &str = "http://localhost:4141/v1/route";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The routing service's verdict for one prompt, with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub complexity_score: f64,
    pub routing_tier: String,
    pub reasoning: String,
}

/// Anything that can judge a prompt's complexity.
#[async_trait]
pub trait ComplexityScorer: Send + Sync {
    async fn score(&self, prompt: &str) -> Result<RoutingDecision, ScoringError>;
}

#[derive(Serialize)]
struct RouteRequest<'a> {
    messages: [RouteMessage<'a>; 1],
}

#[derive(Serialize)]
struct RouteMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteResponse {
    #[serde(default)]
    complexity_score: Option<f64>,
    #[serde(default)]
    routing_tier: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

impl From<RouteResponse> for RoutingDecision {
    fn from(r: RouteResponse) -> Self {
        Self {
            complexity_score: r.complexity_score.unwrap_or(0.0),
            routing_tier: r.routing_tier.unwrap_or_else(|| "local".to_string()),
            reasoning: r.reasoning.unwrap_or_else(|| "Unknown".to_string()),
        }
    }
}

/// Routing-service client.
#[derive(Debug, Clone)]
pub struct RouterClient {
    endpoint: String,
    timeout: Duration,
    client: Client,
}

impl RouterClient {
    /// Creates a client for `endpoint` with a per-call `timeout`.
    ///
    /// # Errors
    /// Returns `CollectError::InvalidConfig` for a zero timeout, a non-HTTP
    /// endpoint, or if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> CollectResult<Self> {
        let endpoint = endpoint.into();
        if timeout.is_zero() {
            return Err(CollectError::InvalidConfig("timeout must be greater than zero".to_string()));
        }
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(CollectError::InvalidConfig(format!("endpoint must be an http(s) URL, got {endpoint}")));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollectError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { endpoint, timeout, client })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl ComplexityScorer for RouterClient {
    async fn score(&self, prompt: &str) -> Result<RoutingDecision, ScoringError> {
        debug!(endpoint = %self.endpoint, prompt_len = prompt.len(), "requesting routing decision");

        let body = RouteRequest { messages: [RouteMessage { role: "user", content: prompt }] };
        let response = self.client.post(&self.endpoint).json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                ScoringError::Timeout(self.timeout)
            } else {
                ScoringError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ScoringError::Timeout(self.timeout)
            } else {
                ScoringError::Transport(e.to_string())
            }
        })?;

        if !status.is_success() {
            return Err(ScoringError::Status { status: status.as_u16(), body: text });
        }

        let parsed: RouteResponse =
            serde_json::from_str(&text).map_err(|e| ScoringError::Malformed(e.to_string()))?;
        Ok(parsed.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_score_sends_chat_message_and_reads_fields() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/route")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "messages": [{ "role": "user", "content": "Hello!" }]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"complexityScore": 0.1, "routingTier": "local", "reasoning": "greeting"}"#)
            .create_async()
            .await;

        let client = RouterClient::new(format!("{}/v1/route", server.url()), DEFAULT_TIMEOUT).unwrap();
        let decision = client.score("Hello!").await.unwrap();

        assert_eq!(
            decision,
            RoutingDecision {
                complexity_score: 0.1,
                routing_tier: "local".to_string(),
                reasoning: "greeting".to_string(),
            }
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_fields_take_defaults() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/route")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = RouterClient::new(format!("{}/v1/route", server.url()), DEFAULT_TIMEOUT).unwrap();
        let decision = client.score("anything").await.unwrap();
        assert_eq!(decision.complexity_score, 0.0);
        assert_eq!(decision.routing_tier, "local");
        assert_eq!(decision.reasoning, "Unknown");
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/route")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let client = RouterClient::new(format!("{}/v1/route", server.url()), DEFAULT_TIMEOUT).unwrap();
        let err = client.score("x").await.unwrap_err();
        assert!(matches!(err, ScoringError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_malformed_body_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/route")
            .with_status(200)
            .with_body(r#"{"complexityScore": "high"}"#)
            .create_async()
            .await;

        let client = RouterClient::new(format!("{}/v1/route", server.url()), DEFAULT_TIMEOUT).unwrap();
        assert!(matches!(client.score("x").await.unwrap_err(), ScoringError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let client = RouterClient::new(format!("http://{addr}/v1/route"), Duration::from_millis(200)).unwrap();
        let err = client.score("x").await.unwrap_err();
        assert!(matches!(err, ScoringError::Timeout(_)), "{err}");
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(RouterClient::new("localhost:4141", DEFAULT_TIMEOUT).is_err());
        assert!(RouterClient::new(DEFAULT_ROUTER_ENDPOINT, Duration::ZERO).is_err());
    }
}
