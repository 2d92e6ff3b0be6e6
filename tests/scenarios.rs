//! End-to-end scenarios seeded against the coordination core as a whole:
//! breaker trip/recover, round-robin fairness, failover, bounded fan-out,
//! and the registry sweep.

use fleetmesh_core::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use fleetmesh_core::config::{CoordinatorSettings, RegistrySettings};

struct FixedTransport {
    responses: HashMap<String, std::result::Result<(), String>>,
}

#[async_trait]
impl AgentTransport for FixedTransport {
    async fn invoke(&self, endpoint: &str, _agent: &str, _input: &AgentInput) -> fleetmesh_core::Result<AgentOutput> {
        match self.responses.get(endpoint) {
            Some(Ok(())) | None => Ok(AgentOutput {
                result: serde_json::json!({ "endpoint": endpoint }),
                metadata: Default::default(),
            }),
            Some(Err(msg)) => Err(CoreError::distributed_connection(
                Component::RemoteInvoker,
                "invoke",
                msg.clone(),
            )),
        }
    }

    async fn invoke_async(&self, _e: &str, _a: &str, _i: &AgentInput) -> fleetmesh_core::Result<String> {
        unimplemented!()
    }

    async fn poll(&self, _e: &str, _t: &str) -> fleetmesh_core::Result<Option<AgentOutput>> {
        unimplemented!()
    }

    async fn ping(&self, _e: &str) -> fleetmesh_core::Result<()> {
        Ok(())
    }

    async fn list_agents(&self, _e: &str) -> fleetmesh_core::Result<Vec<String>> {
        Ok(vec![])
    }
}

#[tokio::test]
async fn scenario_breaker_trip_and_probe_recover() {
    let clock = ManualClock::new();
    let cb = CircuitBreaker::new(CircuitBreakerConfig {
        max_failures: 3,
        timeout: Duration::from_millis(100),
        on_state_change: None,
    })
    .with_clock(Arc::new(clock.clone()));

    for _ in 0..3 {
        let _ = cb.execute(|| async { Err::<(), _>("boom") }).await;
    }
    assert_eq!(cb.state(), CircuitState::Open);

    let result = cb.execute(|| async { Ok::<_, &str>(()) }).await;
    assert!(result.unwrap_err().is_circuit_open());

    clock.advance(150);
    let result = cb.execute(|| async { Ok::<_, &str>(()) }).await;
    assert!(result.is_ok());
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.failure_count(), 0);
}

#[tokio::test]
async fn scenario_breaker_trip_and_probe_fail_reopens() {
    let clock = ManualClock::new();
    let cb = CircuitBreaker::new(CircuitBreakerConfig {
        max_failures: 3,
        timeout: Duration::from_millis(100),
        on_state_change: None,
    })
    .with_clock(Arc::new(clock.clone()));

    for _ in 0..3 {
        let _ = cb.execute(|| async { Err::<(), _>("boom") }).await;
    }
    clock.advance(150);
    let _ = cb.execute(|| async { Err::<(), _>("boom again") }).await;

    assert_eq!(cb.state(), CircuitState::Open);
}

#[tokio::test]
async fn scenario_round_robin_across_three_instances() {
    let registry = Arc::new(Registry::new(RegistrySettings::default()));
    for id in ["i1", "i2", "i3"] {
        registry
            .register(ServiceInstance::new(id, "S", format!("http://{id}")).unwrap())
            .unwrap();
    }
    let invoker = Arc::new(RemoteInvoker::new(
        Arc::new(FixedTransport { responses: HashMap::new() }),
        CircuitBreakerConfig::default(),
        fleetmesh_core::clock::shared_monotonic(),
        Duration::from_millis(10),
    ));
    let coordinator = Coordinator::new(registry.clone(), invoker, CoordinatorSettings::default());

    let mut picked = Vec::new();
    for _ in 0..6 {
        let out = coordinator.execute_agent("S", "A", &AgentInput::default()).await.unwrap();
        picked.push(out.result["endpoint"].as_str().unwrap().to_string());
    }
    assert_eq!(
        picked,
        vec!["http://i1", "http://i2", "http://i3", "http://i1", "http://i2", "http://i3"]
    );
    registry.close().await;
}

#[tokio::test]
async fn scenario_failover_on_network_error() {
    let registry = Arc::new(Registry::new(RegistrySettings::default()));
    registry.register(ServiceInstance::new("i1", "S", "http://i1").unwrap()).unwrap();
    registry.register(ServiceInstance::new("i2", "S", "http://i2").unwrap()).unwrap();

    let mut responses = HashMap::new();
    responses.insert("http://i1".to_string(), Err("connection timeout".to_string()));
    let invoker = Arc::new(RemoteInvoker::new(
        Arc::new(FixedTransport { responses }),
        CircuitBreakerConfig::default(),
        fleetmesh_core::clock::shared_monotonic(),
        Duration::from_millis(10),
    ));
    let coordinator = Coordinator::new(registry.clone(), invoker, CoordinatorSettings::default());

    let out = coordinator.execute_agent("S", "A", &AgentInput::default()).await.unwrap();
    assert_eq!(out.result["endpoint"], "http://i2");
    registry.close().await;
}

#[tokio::test]
async fn scenario_parallel_bounded_concurrency() {
    struct SlowTransport {
        in_flight: Arc<AtomicUsize>,
        max_observed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AgentTransport for SlowTransport {
        async fn invoke(&self, endpoint: &str, _agent: &str, _input: &AgentInput) -> fleetmesh_core::Result<AgentOutput> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_observed.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(AgentOutput {
                result: serde_json::json!({ "endpoint": endpoint }),
                metadata: Default::default(),
            })
        }

        async fn invoke_async(&self, _e: &str, _a: &str, _i: &AgentInput) -> fleetmesh_core::Result<String> {
            unimplemented!()
        }
        async fn poll(&self, _e: &str, _t: &str) -> fleetmesh_core::Result<Option<AgentOutput>> {
            unimplemented!()
        }
        async fn ping(&self, _e: &str) -> fleetmesh_core::Result<()> {
            Ok(())
        }
        async fn list_agents(&self, _e: &str) -> fleetmesh_core::Result<Vec<String>> {
            Ok(vec![])
        }
    }

    let registry = Arc::new(Registry::new(RegistrySettings::default()));
    registry.register(ServiceInstance::new("i1", "S", "http://i1").unwrap()).unwrap();

    let max_observed = Arc::new(AtomicUsize::new(0));
    let invoker = Arc::new(RemoteInvoker::new(
        Arc::new(SlowTransport {
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_observed: max_observed.clone(),
        }),
        CircuitBreakerConfig::default(),
        fleetmesh_core::clock::shared_monotonic(),
        Duration::from_millis(10),
    ));
    let coordinator = Arc::new(Coordinator::new(
        registry.clone(),
        invoker,
        CoordinatorSettings {
            max_concurrency: 5,
            max_retries: 1,
        },
    ));

    let tasks: Vec<_> = (0..50)
        .map(|i| AgentTask::new("S", "A", AgentInput::new(serde_json::json!(i))))
        .collect();

    let started = std::time::Instant::now();
    let cancel = tokio_util::sync::CancellationToken::new();
    let (results, err) = coordinator.execute_parallel(tasks, &cancel).await;
    let elapsed = started.elapsed();

    assert!(err.is_none());
    assert_eq!(results.len(), 50);
    assert!(elapsed >= Duration::from_millis(500), "elapsed={elapsed:?}");
    assert!(max_observed.load(Ordering::SeqCst) <= 5);
    registry.close().await;
}

#[tokio::test]
async fn scenario_sweep_demotes_stale_instance() {
    let registry = Registry::new(RegistrySettings {
        sweep_interval: Duration::from_secs(3600),
        stale_after: Duration::from_secs(60),
    });
    registry.register(ServiceInstance::new("i1", "S", "http://i1").unwrap()).unwrap();

    // Backdate LastSeen directly rather than waiting on the wall clock.
    {
        let mut instance = registry.get_instance("i1").unwrap();
        instance.last_seen = chrono::Utc::now() - chrono::Duration::seconds(61);
        registry.deregister("i1").unwrap();
        registry.register(instance).unwrap();
    }

    registry.sweep_once();
    assert!(!registry.get_instance("i1").unwrap().healthy);

    registry.heartbeat("i1").unwrap();
    assert!(registry.get_instance("i1").unwrap().healthy);
    registry.close().await;
}
