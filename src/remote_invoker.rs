//! Transport-agnostic wrapper that runs a single remote agent call through a
//! per-endpoint circuit breaker.
//!
//! The wire format (§ see the crate's external-interfaces notes) is fixed —
//! `POST {endpoint}/api/v1/agents/{agent}/execute` and friends — but the HTTP
//! client itself is a capability the core is injected with, so tests can run
//! against an in-memory transport without sockets.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::clock::Clock;
use crate::error::{Component, CoreError, Result};
use crate::types::{AgentInput, AgentOutput};

/// The narrow transport capability set the core consumes. An implementation
/// over real HTTP is provided ([`HttpAgentTransport`]); tests may substitute
/// any other implementation.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn invoke(&self, endpoint: &str, agent: &str, input: &AgentInput) -> Result<AgentOutput>;

    async fn invoke_async(&self, endpoint: &str, agent: &str, input: &AgentInput) -> Result<String>;

    async fn poll(&self, endpoint: &str, task_id: &str) -> Result<Option<AgentOutput>>;

    async fn ping(&self, endpoint: &str) -> Result<()>;

    async fn list_agents(&self, endpoint: &str) -> Result<Vec<String>>;
}

/// The default [`AgentTransport`] over HTTP/1.1 + JSON via `reqwest`.
pub struct HttpAgentTransport {
    client: reqwest::Client,
}

impl HttpAgentTransport {
    pub fn new(request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("reqwest client builder should not fail with static config");
        Self { client }
    }
}

#[derive(Deserialize)]
struct AsyncAccepted {
    task_id: String,
}

#[derive(Deserialize)]
struct AgentsList {
    agents: Vec<String>,
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn invoke(&self, endpoint: &str, agent: &str, input: &AgentInput) -> Result<AgentOutput> {
        let url = format!("{endpoint}/api/v1/agents/{agent}/execute");
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(input)
            .send()
            .await
            .map_err(CoreError::from)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::agent_execution(
                Component::RemoteInvoker,
                "invoke",
                format!("non-2xx response: {status}"),
            )
            .with_context("status_code", status)
            .with_context("response_body", body));
        }

        response.json::<AgentOutput>().await.map_err(CoreError::from)
    }

    async fn invoke_async(&self, endpoint: &str, agent: &str, input: &AgentInput) -> Result<String> {
        let url = format!("{endpoint}/api/v1/agents/{agent}/execute/async");
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(input)
            .send()
            .await
            .map_err(CoreError::from)?;

        if response.status().as_u16() != 202 {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::agent_execution(
                Component::RemoteInvoker,
                "invoke_async",
                format!("expected 202, got {status}"),
            )
            .with_context("status_code", status)
            .with_context("response_body", body));
        }

        let accepted: AsyncAccepted = response.json().await.map_err(CoreError::from)?;
        Ok(accepted.task_id)
    }

    async fn poll(&self, endpoint: &str, task_id: &str) -> Result<Option<AgentOutput>> {
        let url = format!("{endpoint}/api/v1/agents/tasks/{task_id}");
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(CoreError::from)?;

        match response.status().as_u16() {
            200 => Ok(Some(response.json().await.map_err(CoreError::from)?)),
            202 => Ok(None),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(CoreError::agent_execution(
                    Component::RemoteInvoker,
                    "poll",
                    format!("unexpected status {status}"),
                )
                .with_context("status_code", status)
                .with_context("response_body", body))
            }
        }
    }

    async fn ping(&self, endpoint: &str) -> Result<()> {
        let url = format!("{endpoint}/health");
        let response = self.client.get(&url).send().await.map_err(CoreError::from)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(CoreError::distributed_heartbeat(
                Component::RemoteInvoker,
                "ping",
                format!("unhealthy status {}", response.status().as_u16()),
            ))
        }
    }

    async fn list_agents(&self, endpoint: &str) -> Result<Vec<String>> {
        let url = format!("{endpoint}/api/v1/agents");
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(CoreError::from)?;
        let listing: AgentsList = response.json().await.map_err(CoreError::from)?;
        Ok(listing.agents)
    }
}

/// Wraps one endpoint's calls in a circuit breaker. The invoker keeps one
/// breaker per endpoint it has ever seen (see `DESIGN.md` for why this
/// departs from the source's single shared breaker).
pub struct RemoteInvoker {
    transport: Arc<dyn AgentTransport>,
    breakers: parking_lot::Mutex<HashMap<String, CircuitBreaker>>,
    breaker_config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl RemoteInvoker {
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        breaker_config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport,
            breakers: parking_lot::Mutex::new(HashMap::new()),
            breaker_config,
            clock,
            poll_interval,
        }
    }

    fn breaker_for(&self, endpoint: &str) -> CircuitBreaker {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                CircuitBreaker::new(self.breaker_config.clone()).with_clock(self.clock.clone())
            })
            .clone()
    }

    /// Returns the current breaker state for `endpoint`, for observability
    /// and for tests that assert on circuit transitions.
    pub fn circuit_state(&self, endpoint: &str) -> CircuitState {
        self.breaker_for(endpoint).state()
    }

    pub async fn execute(
        &self,
        endpoint: &str,
        agent_name: &str,
        input: &AgentInput,
    ) -> Result<AgentOutput> {
        let breaker = self.breaker_for(endpoint);
        let transport = self.transport.clone();
        let endpoint_owned = endpoint.to_string();
        let agent_owned = agent_name.to_string();
        let input_owned = input.clone();

        let result = breaker
            .execute(|| async move { transport.invoke(&endpoint_owned, &agent_owned, &input_owned).await })
            .await;

        match result {
            Ok(output) => Ok(output),
            Err(BreakerError::CircuitOpen { failures, open_for }) => {
                Err(CoreError::distributed_connection(
                    Component::RemoteInvoker,
                    "execute",
                    "circuit open",
                )
                .with_context("endpoint", endpoint)
                .with_context("agent_name", agent_name)
                .with_context("circuit_state", CircuitState::Open)
                .with_context("failures", failures)
                .with_context("open_for_ms", open_for.as_millis()))
            }
            Err(BreakerError::Inner(e)) => Err(e),
        }
    }

    pub async fn execute_async(&self, endpoint: &str, agent_name: &str, input: &AgentInput) -> Result<String> {
        self.transport.invoke_async(endpoint, agent_name, input).await
    }

    pub async fn get_async_result(&self, endpoint: &str, task_id: &str) -> Result<Option<AgentOutput>> {
        self.transport.poll(endpoint, task_id).await
    }

    /// Polls until the task completes or `ctx_cancel` fires.
    pub async fn wait_for_async_result(
        &self,
        endpoint: &str,
        task_id: &str,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<AgentOutput> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CoreError::distributed_coordination(
                        Component::RemoteInvoker,
                        "wait_for_async_result",
                        "cancelled while polling",
                    ));
                }
                result = self.get_async_result(endpoint, task_id) => {
                    if let Some(output) = result? {
                        return Ok(output);
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CoreError::distributed_coordination(
                        Component::RemoteInvoker,
                        "wait_for_async_result",
                        "cancelled while polling",
                    ));
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    pub async fn ping(&self, endpoint: &str) -> Result<()> {
        self.transport.ping(endpoint).await
    }

    pub async fn list_agents(&self, endpoint: &str) -> Result<Vec<String>> {
        self.transport.list_agents(endpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::shared_monotonic;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyTransport {
        calls: AtomicUsize,
        fail_first_n: usize,
    }

    #[async_trait]
    impl AgentTransport for FlakyTransport {
        async fn invoke(&self, _endpoint: &str, _agent: &str, _input: &AgentInput) -> Result<AgentOutput> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_n {
                Err(CoreError::distributed_connection(
                    Component::RemoteInvoker,
                    "invoke",
                    "connection refused",
                ))
            } else {
                Ok(AgentOutput::default())
            }
        }

        async fn invoke_async(&self, _e: &str, _a: &str, _i: &AgentInput) -> Result<String> {
            unimplemented!()
        }

        async fn poll(&self, _e: &str, _t: &str) -> Result<Option<AgentOutput>> {
            unimplemented!()
        }

        async fn ping(&self, _e: &str) -> Result<()> {
            Ok(())
        }

        async fn list_agents(&self, _e: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn trips_breaker_after_repeated_transport_failures() {
        let transport = Arc::new(FlakyTransport {
            calls: AtomicUsize::new(0),
            fail_first_n: 10,
        });
        let invoker = RemoteInvoker::new(
            transport,
            CircuitBreakerConfig {
                max_failures: 3,
                timeout: Duration::from_secs(30),
                on_state_change: None,
            },
            shared_monotonic(),
            Duration::from_millis(10),
        );

        for _ in 0..3 {
            let err = invoker.execute("http://a", "agent", &AgentInput::default()).await.unwrap_err();
            assert_eq!(err.kind, crate::error::ErrorKind::DistributedConnection);
        }

        let err = invoker.execute("http://a", "agent", &AgentInput::default()).await.unwrap_err();
        assert_eq!(err.context_value("circuit_state"), Some("open"));
    }

    #[tokio::test]
    async fn per_endpoint_breaker_isolation() {
        let transport = Arc::new(FlakyTransport {
            calls: AtomicUsize::new(0),
            fail_first_n: 100,
        });
        let invoker = RemoteInvoker::new(
            transport,
            CircuitBreakerConfig {
                max_failures: 1,
                timeout: Duration::from_secs(30),
                on_state_change: None,
            },
            shared_monotonic(),
            Duration::from_millis(10),
        );

        let _ = invoker.execute("http://a", "agent", &AgentInput::default()).await;
        assert_eq!(invoker.circuit_state("http://a"), CircuitState::Open);
        assert_eq!(invoker.circuit_state("http://b"), CircuitState::Closed);
    }
}
