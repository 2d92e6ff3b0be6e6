//! Request routing: instance selection, single-attempt failover,
//! retry-with-backoff, and the parallel / sequential batch drivers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorSettings;
use crate::error::{Component, CoreError, Result};
use crate::registry::Registry;
use crate::remote_invoker::RemoteInvoker;
use crate::types::{AgentInput, AgentOutput, AgentTask, AgentTaskResult, ServiceInstance};

/// The routing brain. Holds no instance state of its own beyond the
/// round-robin cursor per service; instance health lives in the [`Registry`].
pub struct Coordinator {
    registry: Arc<Registry>,
    invoker: Arc<RemoteInvoker>,
    round_robin: Mutex<HashMap<String, usize>>,
    semaphore: Arc<Semaphore>,
    max_retries: u32,
}

impl Coordinator {
    pub fn new(registry: Arc<Registry>, invoker: Arc<RemoteInvoker>, settings: CoordinatorSettings) -> Self {
        Self {
            registry,
            invoker,
            round_robin: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(settings.max_concurrency.max(1))),
            max_retries: settings.max_retries.max(1),
        }
    }

    /// Round-robin instance selection for `service_name`. The round-robin
    /// index is read-modify-written under a mutex that is held only for that
    /// step, never across the subsequent remote call.
    fn select_instance(&self, service_name: &str) -> Result<ServiceInstance> {
        let instances = self.registry.get_healthy_instances(service_name)?;
        if instances.is_empty() {
            return Err(CoreError::agent_not_found(
                Component::Coordinator,
                "select_instance",
                "no healthy instances for service",
            )
            .with_context("service_name", service_name));
        }

        let mut cursor = self.round_robin.lock();
        let idx = *cursor.entry(service_name.to_string()).or_insert(0);
        let chosen = instances[idx % instances.len()].clone();
        cursor.insert(service_name.to_string(), (idx + 1) % instances.len());
        Ok(chosen)
    }

    /// Single call with at most one failover attempt against a different
    /// healthy instance, if the initial failure looks network-related.
    pub async fn execute_agent(
        &self,
        service_name: &str,
        agent_name: &str,
        input: &AgentInput,
    ) -> Result<AgentOutput> {
        let chosen = self.select_instance(service_name)?;

        match self.invoker.execute(&chosen.endpoint, agent_name, input).await {
            Ok(output) => {
                self.registry.mark_healthy(&chosen.id);
                Ok(output)
            }
            Err(err) => {
                self.registry.mark_unhealthy(&chosen.id);
                if err.is_retryable_network() {
                    self.execute_with_failover(service_name, agent_name, input, &chosen.id).await
                } else {
                    Err(CoreError::agent_execution(
                        Component::Coordinator,
                        "execute_agent",
                        err.message().to_string(),
                    )
                    .with_context("service_name", service_name)
                    .with_context("agent_name", agent_name)
                    .with_context("instance_id", &chosen.id)
                    .with_source(err))
                }
            }
        }
    }

    /// A single additional attempt against the first healthy instance other
    /// than `failed_id`. No breaker bypass, no further recursion: if this
    /// instance also fails, the error surfaces as-is.
    async fn execute_with_failover(
        &self,
        service_name: &str,
        agent_name: &str,
        input: &AgentInput,
        failed_id: &str,
    ) -> Result<AgentOutput> {
        let instances = self.registry.get_healthy_instances(service_name)?;
        let candidate = instances
            .into_iter()
            .find(|instance| instance.id != failed_id)
            .ok_or_else(|| {
                CoreError::distributed_coordination(
                    Component::Coordinator,
                    "execute_with_failover",
                    "no failover candidate",
                )
                .with_context("service_name", service_name)
                .with_context("failed_id", failed_id)
            })?;

        match self.invoker.execute(&candidate.endpoint, agent_name, input).await {
            Ok(output) => {
                self.registry.mark_healthy(&candidate.id);
                Ok(output)
            }
            Err(err) => {
                self.registry.mark_unhealthy(&candidate.id);
                Err(CoreError::agent_execution(
                    Component::Coordinator,
                    "execute_with_failover",
                    err.message().to_string(),
                )
                .with_context("service_name", service_name)
                .with_context("agent_name", agent_name)
                .with_context("instance_id", &candidate.id)
                .with_source(err))
            }
        }
    }

    /// Up to `max_retries` attempts of [`Self::execute_agent`], sleeping
    /// `i` seconds before attempt `i` (so attempt 0 never waits). Every sleep
    /// is cancellable.
    pub async fn execute_agent_with_retry(
        &self,
        service_name: &str,
        agent_name: &str,
        input: &AgentInput,
        cancel: &CancellationToken,
    ) -> Result<AgentOutput> {
        let mut last_err = None;
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let backoff = Duration::from_secs(attempt as u64);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(CoreError::distributed_coordination(
                            Component::Coordinator,
                            "execute_agent_with_retry",
                            "cancelled during backoff",
                        ));
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            match self.execute_agent(service_name, agent_name, input).await {
                Ok(output) => return Ok(output),
                Err(err) => last_err = Some(err),
            }
        }

        Err(CoreError::agent_execution(
            Component::Coordinator,
            "execute_agent_with_retry",
            "exhausted retries",
        )
        .with_context("service_name", service_name)
        .with_context("agent_name", agent_name)
        .with_context("max_retries", self.max_retries)
        .with_source(last_err.expect("max_retries must be >= 1")))
    }

    /// Bounded-concurrency fan-out. Results preserve input ordering by
    /// index, not completion order. Cancelling `cancel` stops admitting new
    /// tasks; already-running tasks run to completion.
    pub async fn execute_parallel(
        self: &Arc<Self>,
        tasks: Vec<AgentTask>,
        cancel: &CancellationToken,
    ) -> (Vec<AgentTaskResult>, Option<CoreError>) {
        let total = tasks.len();
        let mut handles = Vec::with_capacity(total);

        for (index, task) in tasks.into_iter().enumerate() {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => permit,
            };
            let permit = match permit {
                Ok(p) => p,
                Err(_) => break,
            };

            let coordinator = self.clone();
            let task_for_panic = task.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let result = coordinator
                    .execute_agent(&task.service_name, &task.agent_name, &task.input)
                    .await;
                (index, AgentTaskResult { task, outcome: result })
            });
            handles.push((index, task_for_panic, handle));
        }

        let launched = handles.len();
        let mut slots: Vec<Option<AgentTaskResult>> = (0..total).map(|_| None).collect();
        let mut failed_count = 0usize;

        for (index, task_for_panic, handle) in handles {
            match handle.await {
                Ok((index, result)) => {
                    if result.outcome.is_err() {
                        failed_count += 1;
                    }
                    slots[index] = Some(result);
                }
                Err(join_err) => {
                    failed_count += 1;
                    let err = CoreError::distributed_coordination(
                        Component::Coordinator,
                        "execute_parallel",
                        "task panicked",
                    )
                    .with_context("task_index", index)
                    .with_context("join_error", join_err);
                    slots[index] = Some(AgentTaskResult::failure(task_for_panic, err));
                }
            }
        }

        let results: Vec<AgentTaskResult> = slots.into_iter().flatten().collect();

        if failed_count > 0 {
            let err = CoreError::agent_execution(
                Component::Coordinator,
                "execute_parallel",
                "some tasks failed",
            )
            .with_context("failed_count", failed_count)
            .with_context("total_tasks", total)
            .with_context("launched_tasks", launched);
            (results, Some(err))
        } else {
            (results, None)
        }
    }

    /// Runs tasks one at a time, piping each success's output into the next
    /// task's `context["previous_output"]`. Stops at the first failure.
    pub async fn execute_sequential(&self, mut tasks: Vec<AgentTask>) -> (Vec<AgentTaskResult>, Option<CoreError>) {
        let mut results = Vec::with_capacity(tasks.len());

        for index in 0..tasks.len() {
            let task = tasks[index].clone();
            match self.execute_agent(&task.service_name, &task.agent_name, &task.input).await {
                Ok(output) => {
                    if let Some(next) = tasks.get_mut(index + 1) {
                        next.input
                            .context
                            .insert("previous_output".to_string(), output.result.clone());
                    }
                    results.push(AgentTaskResult::success(task, output));
                }
                Err(err) => {
                    let cause = err.message().to_string();
                    let for_slot = CoreError::agent_execution(
                        Component::Coordinator,
                        "execute_sequential",
                        "task failed",
                    )
                    .with_context("task_index", index)
                    .with_context("service_name", &task.service_name)
                    .with_context("agent_name", &task.agent_name)
                    .with_context("cause", &cause);
                    let for_caller = CoreError::agent_execution(
                        Component::Coordinator,
                        "execute_sequential",
                        "task failed",
                    )
                    .with_context("task_index", index)
                    .with_context("service_name", &task.service_name)
                    .with_context("agent_name", &task.agent_name)
                    .with_source(err);
                    results.push(AgentTaskResult::failure(task, for_slot));
                    return (results, Some(for_caller));
                }
            }
        }

        (results, None)
    }
}
