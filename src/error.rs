//! Structured error type for the coordination core.
//!
//! Every error returned from this crate carries an enumerated [`ErrorKind`], a
//! human-readable message, the [`Component`] that raised it, the operation in
//! progress, and a string-keyed context map for attributing a failure to a
//! service, agent, or instance without parsing the message. Wrapping preserves
//! the cause chain via `#[source]`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A specialized `Result` for coordination-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// The subsystem that raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Registry,
    CircuitBreaker,
    RemoteInvoker,
    Coordinator,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Component::Registry => "registry",
            Component::CircuitBreaker => "circuit_breaker",
            Component::RemoteInvoker => "remote_invoker",
            Component::Coordinator => "coordinator",
        };
        f.write_str(s)
    }
}

/// The enumerated error kinds referenced throughout the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Registration missing a required field.
    InvalidInput,
    /// Config deserialization failure. Not part of the domain model proper;
    /// surfaced only at the `Config::load`/`from_file` boundary.
    InvalidConfig,
    /// Missing ID, missing service, or zero healthy instances.
    AgentNotFound,
    /// Non-2xx response, or a wrapped coordinator failure.
    AgentExecution,
    /// Transport failure, or an open-circuit short-circuit.
    DistributedConnection,
    /// Response decode failure.
    DistributedSerialization,
    /// Failover-path structural failure (e.g. no failover candidate).
    DistributedCoordination,
    /// Ping failure.
    DistributedHeartbeat,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::AgentNotFound => "agent_not_found",
            ErrorKind::AgentExecution => "agent_execution",
            ErrorKind::DistributedConnection => "distributed_connection",
            ErrorKind::DistributedSerialization => "distributed_serialization",
            ErrorKind::DistributedCoordination => "distributed_coordination",
            ErrorKind::DistributedHeartbeat => "distributed_heartbeat",
        };
        f.write_str(s)
    }
}

/// Severity used to pick the tracing level when [`CoreError::log`] is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Warning,
    Error,
    Critical,
}

impl ErrorKind {
    fn default_severity(self) -> ErrorSeverity {
        match self {
            ErrorKind::InvalidInput | ErrorKind::InvalidConfig => ErrorSeverity::Warning,
            ErrorKind::AgentNotFound => ErrorSeverity::Warning,
            ErrorKind::AgentExecution | ErrorKind::DistributedSerialization => {
                ErrorSeverity::Error
            }
            ErrorKind::DistributedConnection | ErrorKind::DistributedHeartbeat => {
                ErrorSeverity::Error
            }
            ErrorKind::DistributedCoordination => ErrorSeverity::Critical,
        }
    }
}

/// A structured error carrying kind, component, operation, context, and cause.
#[derive(Debug, Clone, Error)]
pub struct CoreError {
    pub kind: ErrorKind,
    pub component: Component,
    pub operation: &'static str,
    message: String,
    context: HashMap<String, String>,
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}: {} ({})",
            self.component, self.operation, self.message, self.kind
        )?;
        if !self.context.is_empty() {
            write!(f, " context=")?;
            let mut entries: Vec<_> = self.context.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (i, (k, v)) in entries.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{k}={v}")?;
            }
        }
        Ok(())
    }
}

impl CoreError {
    pub fn new(
        kind: ErrorKind,
        component: Component,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            component,
            operation,
            message: message.into(),
            context: HashMap::new(),
            source: None,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.kind.default_severity()
    }

    /// Emit this error through `tracing` at a level matched to its severity.
    pub fn log(&self) {
        match self.severity() {
            ErrorSeverity::Warning => {
                tracing::warn!(kind = %self.kind, component = %self.component, operation = self.operation, "{}", self.message)
            }
            ErrorSeverity::Error => {
                tracing::error!(kind = %self.kind, component = %self.component, operation = self.operation, "{}", self.message)
            }
            ErrorSeverity::Critical => {
                tracing::error!(kind = %self.kind, component = %self.component, operation = self.operation, critical = true, "{}", self.message)
            }
        }
    }

    // Convenience constructors used throughout the core.

    pub fn invalid_input(component: Component, operation: &'static str, field: &str) -> Self {
        Self::new(
            ErrorKind::InvalidInput,
            component,
            operation,
            format!("missing required field `{field}`"),
        )
        .with_context("field", field)
    }

    pub fn agent_not_found(
        component: Component,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::AgentNotFound, component, operation, message)
    }

    pub fn agent_execution(
        component: Component,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::AgentExecution, component, operation, message)
    }

    pub fn distributed_connection(
        component: Component,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::DistributedConnection,
            component,
            operation,
            message,
        )
    }

    pub fn distributed_serialization(
        component: Component,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::DistributedSerialization,
            component,
            operation,
            message,
        )
    }

    pub fn distributed_coordination(
        component: Component,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::DistributedCoordination,
            component,
            operation,
            message,
        )
    }

    pub fn distributed_heartbeat(
        component: Component,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::DistributedHeartbeat,
            component,
            operation,
            message,
        )
    }

    /// Textual heuristic used by the coordinator to decide whether a failure
    /// is worth a single failover attempt. Matches the acknowledged-brittle
    /// substring classifier: case-sensitive, message-only.
    pub fn is_retryable_network(&self) -> bool {
        const NEEDLES: [&str; 3] = ["connection refused", "timeout", "connection reset"];
        NEEDLES.iter().any(|n| self.message.contains(n))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return CoreError::new(
                ErrorKind::DistributedSerialization,
                Component::RemoteInvoker,
                "decode",
                err.to_string(),
            )
            .with_source(err);
        }

        let op = if err.is_timeout() {
            "timeout"
        } else if err.is_connect() {
            "connect"
        } else {
            "request"
        };
        CoreError::new(
            ErrorKind::DistributedConnection,
            Component::RemoteInvoker,
            "http_call",
            format!("{op}: {err}"),
        )
        .with_source(err)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::new(
            ErrorKind::DistributedSerialization,
            Component::RemoteInvoker,
            "decode",
            err.to_string(),
        )
        .with_source(err)
    }
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::new(
            ErrorKind::InvalidConfig,
            Component::Coordinator,
            "load_config",
            err.to_string(),
        )
        .with_source(err)
    }
}
