//! In-memory catalog of service instances with liveness state and a
//! background sweep that demotes stale instances.
//!
//! A single reader/writer lock guards both indices (by-ID and per-service
//! ordered list) so mutators are mutually exclusive and readers see a
//! consistent snapshot. The background sweeper is an explicit task with its
//! own shutdown hook, unlike the ticker-with-no-shutdown this core's source
//! material favored — tests trigger a sweep deterministically by calling
//! [`Registry::sweep_once`] directly instead of waiting on the ticker.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RegistrySettings;
use crate::error::{Component, CoreError, Result};
use crate::types::ServiceInstance;

/// Point-in-time counts. Not guaranteed consistent with concurrent
/// observations made through other Registry methods.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceStats {
    pub total: usize,
    pub healthy: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStatistics {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub services_count: usize,
    pub per_service: HashMap<String, ServiceStats>,
}

struct State {
    by_id: HashMap<String, ServiceInstance>,
    /// Registration-ordered instance IDs per service. Kept even when a
    /// service's instance count drops to zero, so a known-but-currently-empty
    /// service is distinguishable from one that was never registered.
    by_service: HashMap<String, Vec<String>>,
}

impl State {
    fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_service: HashMap::new(),
        }
    }
}

pub struct Registry {
    state: Arc<RwLock<State>>,
    cancel: CancellationToken,
    sweep_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    stale_after: Duration,
}

impl Registry {
    /// Constructs the registry and spawns its background sweeper task.
    pub fn new(settings: RegistrySettings) -> Self {
        let state = Arc::new(RwLock::new(State::new()));
        let cancel = CancellationToken::new();

        let registry = Self {
            state: state.clone(),
            cancel: cancel.clone(),
            sweep_handle: parking_lot::Mutex::new(None),
            stale_after: settings.stale_after,
        };

        let sweep_state = state.clone();
        let sweep_cancel = cancel.clone();
        let stale_after = settings.stale_after;
        let interval = settings.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = sweep_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        sweep_over(&sweep_state, stale_after);
                    }
                }
            }
        });
        *registry.sweep_handle.lock() = Some(handle);
        registry
    }

    /// Stops the background sweeper and waits for it to exit.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.sweep_handle.lock().take() {
            let _ = handle.await;
        }
    }

    pub fn register(&self, instance: ServiceInstance) -> Result<()> {
        if instance.id.is_empty() {
            return Err(CoreError::invalid_input(Component::Registry, "register", "id"));
        }
        if instance.service_name.is_empty() {
            return Err(CoreError::invalid_input(
                Component::Registry,
                "register",
                "service_name",
            ));
        }
        if instance.endpoint.is_empty() {
            return Err(CoreError::invalid_input(
                Component::Registry,
                "register",
                "endpoint",
            ));
        }

        let mut state = self.state.write();
        if state.by_id.contains_key(&instance.id) {
            return Err(CoreError::new(
                crate::error::ErrorKind::InvalidInput,
                Component::Registry,
                "register",
                "duplicate instance id",
            )
            .with_context("id", &instance.id));
        }
        state
            .by_service
            .entry(instance.service_name.clone())
            .or_default()
            .push(instance.id.clone());
        state.by_id.insert(instance.id.clone(), instance);
        Ok(())
    }

    pub fn deregister(&self, id: &str) -> Result<()> {
        let mut state = self.state.write();
        let instance = state
            .by_id
            .remove(id)
            .ok_or_else(|| not_found(id, "deregister"))?;
        if let Some(list) = state.by_service.get_mut(&instance.service_name) {
            list.retain(|existing| existing != id);
        }
        Ok(())
    }

    pub fn heartbeat(&self, id: &str) -> Result<()> {
        let mut state = self.state.write();
        let instance = state
            .by_id
            .get_mut(id)
            .ok_or_else(|| not_found(id, "heartbeat"))?;
        instance.last_seen = Utc::now();
        instance.healthy = true;
        Ok(())
    }

    /// No-op on an absent ID, to keep concurrent success/failure feedback
    /// paths simple for callers that may race a deregistration.
    pub fn mark_healthy(&self, id: &str) {
        let mut state = self.state.write();
        if let Some(instance) = state.by_id.get_mut(id) {
            instance.healthy = true;
        }
    }

    pub fn mark_unhealthy(&self, id: &str) {
        let mut state = self.state.write();
        if let Some(instance) = state.by_id.get_mut(id) {
            instance.healthy = false;
        }
    }

    pub fn get_instance(&self, id: &str) -> Result<ServiceInstance> {
        let state = self.state.read();
        state
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(id, "get_instance"))
    }

    /// Healthy instances for `service_name`, in registration order. Errors
    /// if the service was never registered; returns an empty vector (no
    /// error) if it exists but currently has no healthy instances.
    pub fn get_healthy_instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        let state = self.state.read();
        let ids = state
            .by_service
            .get(service_name)
            .ok_or_else(|| service_not_found(service_name, "get_healthy_instances"))?;
        Ok(ids
            .iter()
            .filter_map(|id| state.by_id.get(id))
            .filter(|instance| instance.healthy)
            .cloned()
            .collect())
    }

    pub fn get_all_instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        let state = self.state.read();
        let ids = state
            .by_service
            .get(service_name)
            .ok_or_else(|| service_not_found(service_name, "get_all_instances"))?;
        Ok(ids
            .iter()
            .filter_map(|id| state.by_id.get(id))
            .cloned()
            .collect())
    }

    pub fn list_services(&self) -> Vec<String> {
        let state = self.state.read();
        state.by_service.keys().cloned().collect()
    }

    pub fn get_statistics(&self) -> RegistryStatistics {
        let state = self.state.read();
        let mut per_service = HashMap::with_capacity(state.by_service.len());
        let mut total_instances = 0usize;
        let mut healthy_instances = 0usize;
        for (service, ids) in &state.by_service {
            let mut total = 0usize;
            let mut healthy = 0usize;
            for id in ids {
                if let Some(instance) = state.by_id.get(id) {
                    total += 1;
                    if instance.healthy {
                        healthy += 1;
                    }
                }
            }
            total_instances += total;
            healthy_instances += healthy;
            per_service.insert(service.clone(), ServiceStats { total, healthy });
        }
        RegistryStatistics {
            total_instances,
            healthy_instances,
            services_count: state.by_service.len(),
            per_service,
        }
    }

    /// Runs one liveness sweep synchronously, for deterministic tests.
    pub fn sweep_once(&self) {
        sweep_over(&self.state, self.stale_after);
    }
}

fn sweep_over(state: &Arc<RwLock<State>>, stale_after: Duration) {
    let now = Utc::now();
    let mut demoted = Vec::new();
    {
        let mut state = state.write();
        for instance in state.by_id.values_mut() {
            if !instance.healthy {
                continue;
            }
            let age = now.signed_duration_since(instance.last_seen);
            if age.num_milliseconds() > stale_after.as_millis() as i64 {
                instance.healthy = false;
                demoted.push(instance.id.clone());
            }
        }
    }
    for id in demoted {
        tracing::warn!(instance_id = %id, "registry sweep demoted stale instance");
    }
}

fn not_found(id: &str, operation: &'static str) -> CoreError {
    CoreError::agent_not_found(Component::Registry, operation, "instance not found")
        .with_context("id", id)
}

fn service_not_found(service_name: &str, operation: &'static str) -> CoreError {
    CoreError::agent_not_found(Component::Registry, operation, "service not found")
        .with_context("service_name", service_name)
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, service: &str) -> ServiceInstance {
        ServiceInstance::new(id, service, format!("http://{id}")).unwrap()
    }

    #[tokio::test]
    async fn register_and_lookup_round_trips() {
        let registry = Registry::new(RegistrySettings::default());
        registry.register(instance("i1", "svc")).unwrap();

        let found = registry.get_instance("i1").unwrap();
        assert_eq!(found.service_name, "svc");
        assert!(found.healthy);

        registry.close().await;
    }

    #[tokio::test]
    async fn register_rejects_empty_fields_even_when_built_by_hand() {
        let registry = Registry::new(RegistrySettings::default());
        let mut instance = instance("i1", "svc");
        instance.id = String::new();
        let err = registry.register(instance).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidInput);
        registry.close().await;
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let registry = Registry::new(RegistrySettings::default());
        registry.register(instance("i1", "svc")).unwrap();
        let err = registry.register(instance("i1", "svc")).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidInput);
        registry.close().await;
    }

    #[tokio::test]
    async fn deregister_removes_from_both_indices() {
        let registry = Registry::new(RegistrySettings::default());
        registry.register(instance("i1", "svc")).unwrap();
        registry.deregister("i1").unwrap();

        assert!(registry.get_instance("i1").is_err());
        assert_eq!(registry.get_all_instances("svc").unwrap().len(), 0);
        registry.close().await;
    }

    #[tokio::test]
    async fn unknown_service_is_not_found_distinct_from_empty() {
        let registry = Registry::new(RegistrySettings::default());
        assert!(registry.get_healthy_instances("ghost").is_err());

        registry.register(instance("i1", "svc")).unwrap();
        registry.mark_unhealthy("i1");
        let healthy = registry.get_healthy_instances("svc").unwrap();
        assert!(healthy.is_empty());
        registry.close().await;
    }

    #[tokio::test]
    async fn sweep_demotes_and_heartbeat_revives() {
        let registry = Registry::new(RegistrySettings {
            sweep_interval: Duration::from_secs(3600),
            stale_after: Duration::from_secs(60),
        });
        registry.register(instance("i1", "svc")).unwrap();
        {
            let mut state = registry.state.write();
            let instance = state.by_id.get_mut("i1").unwrap();
            instance.last_seen = Utc::now() - chrono::Duration::seconds(61);
        }

        registry.sweep_once();
        assert!(!registry.get_instance("i1").unwrap().healthy);

        registry.heartbeat("i1").unwrap();
        assert!(registry.get_instance("i1").unwrap().healthy);
        registry.close().await;
    }

    #[tokio::test]
    async fn healthy_instances_preserve_registration_order() {
        let registry = Registry::new(RegistrySettings::default());
        for id in ["i1", "i2", "i3"] {
            registry.register(instance(id, "svc")).unwrap();
        }
        let ids: Vec<_> = registry
            .get_healthy_instances("svc")
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["i1", "i2", "i3"]);
        registry.close().await;
    }
}
