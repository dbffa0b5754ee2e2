//! Executor HTTP client (spec.md §6 wire protocol): the scheduler's outbound
//! calls to a task executor. Trait-isolated the way the teacher isolates
//! `Harness`, so the Dispatcher and Health Monitor can be tested against a
//! fake implementation instead of a live HTTP server.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// The `POST {base_url}/execute` request body (spec.md §6).
#[derive(Debug, Clone, Serialize)]
pub struct DispatchRequest {
    pub execution_id: Uuid,
    pub task_id: Uuid,
    pub task_name: String,
    pub parameters: Value,
    pub scheduled_time: DateTime<Utc>,
    pub callback_url: String,
    pub timeout_seconds: i32,
    pub retry_count: i32,
}

/// Outcome of a dispatch POST, distinguishing the cases the Dispatcher must
/// branch on (spec.md §4.9 step 4, §7 `ExecutorDown`).
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// 2xx: the executor accepted the work and will call back.
    Accepted,
    /// Non-2xx response, with the error text to persist.
    Rejected(String),
    /// The request exceeded `timeout_seconds` before a response arrived.
    TimedOut,
    /// The connection itself failed (refused, unreachable, DNS) rather than
    /// the executor answering with an error -- the executor is down, not
    /// just unhappy with this request. Distinguished from `Rejected` so the
    /// Dispatcher can re-select once without spending a retry.
    Unreachable(String),
}

/// The scheduler's outbound calls to one executor.
#[async_trait]
pub trait ExecutorClient: Send + Sync {
    async fn dispatch(&self, base_url: &str, request: &DispatchRequest, timeout: Duration) -> DispatchOutcome;

    /// `GET {health_check_url}`; `true` iff the response was 2xx within `timeout`.
    async fn health_check(&self, health_check_url: &str, timeout: Duration) -> bool;

    /// `POST {base_url}/stop {"execution_id": id}`, fire-and-forget (spec.md
    /// §6: "2xx not required for scheduler to complete cancellation").
    async fn stop(&self, base_url: &str, execution_id: Uuid);
}

const _: () = {
    fn _assert_object_safe(_: &dyn ExecutorClient) {}
};

/// The one real backend: plain HTTP over `reqwest`.
pub struct HttpExecutorClient {
    http: reqwest::Client,
}

impl HttpExecutorClient {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }
}

impl Default for HttpExecutorClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutorClient for HttpExecutorClient {
    async fn dispatch(&self, base_url: &str, request: &DispatchRequest, timeout: Duration) -> DispatchOutcome {
        let url = format!("{base_url}/execute");
        let response = self.http.post(&url).json(request).timeout(timeout).send().await;

        match response {
            Ok(resp) if resp.status().is_success() => DispatchOutcome::Accepted,
            Ok(resp) => DispatchOutcome::Rejected(format!("executor returned {}", resp.status())),
            Err(e) if e.is_timeout() => DispatchOutcome::TimedOut,
            Err(e) if e.is_connect() => DispatchOutcome::Unreachable(e.to_string()),
            Err(e) => DispatchOutcome::Rejected(e.to_string()),
        }
    }

    async fn health_check(&self, health_check_url: &str, timeout: Duration) -> bool {
        self.http
            .get(health_check_url)
            .timeout(timeout)
            .send()
            .await
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }

    async fn stop(&self, base_url: &str, execution_id: Uuid) {
        let url = format!("{base_url}/stop");
        let _ = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "execution_id": execution_id }))
            .timeout(Duration::from_secs(5))
            .send()
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_request() -> DispatchRequest {
        DispatchRequest {
            execution_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            task_name: "nightly".into(),
            parameters: serde_json::json!({}),
            scheduled_time: Utc::now(),
            callback_url: "http://scheduler/api/v1/executions/x/callback".into(),
            timeout_seconds: 5,
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn dispatch_maps_2xx_to_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let client = HttpExecutorClient::new();
        let outcome = client.dispatch(&server.uri(), &sample_request(), Duration::from_secs(5)).await;
        assert_eq!(outcome, DispatchOutcome::Accepted);
    }

    #[tokio::test]
    async fn dispatch_maps_5xx_to_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = HttpExecutorClient::new();
        let outcome = client.dispatch(&server.uri(), &sample_request(), Duration::from_secs(5)).await;
        assert!(matches!(outcome, DispatchOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn dispatch_maps_connection_refused_to_unreachable() {
        // Nothing listens on this port: the connection itself fails before
        // any response can arrive, which must map to `Unreachable`, not
        // `Rejected` (those are the two error.rs branches spec.md §7
        // distinguishes for retry-budget purposes).
        let client = HttpExecutorClient::new();
        let outcome = client.dispatch("http://127.0.0.1:1", &sample_request(), Duration::from_secs(2)).await;
        assert!(matches!(outcome, DispatchOutcome::Unreachable(_)), "expected Unreachable, got {outcome:?}");
    }

    #[tokio::test]
    async fn health_check_is_true_only_on_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = HttpExecutorClient::new();
        assert!(client.health_check(&format!("{}/health", server.uri()), Duration::from_secs(5)).await);
    }
}
