//! Distributed coordination core: routes remote agent invocations across a
//! fleet of service instances, tolerates partial failure, and bounds
//! concurrent load.
//!
//! Five pieces fit together, leaves first:
//!
//! - [`circuit_breaker`] — per-endpoint failure isolation with a lock-free
//!   fast path.
//! - [`registry`] — in-memory service-instance catalog with a background
//!   liveness sweep.
//! - [`remote_invoker`] — a single-call wrapper over an injected transport,
//!   running each call through a breaker.
//! - [`coordinator`] — selection, failover, retry, and the batch drivers.
//! - [`error`] — the structured error type threaded through all of the above.
//!
//! The HTTP transport's wire codec, the logging façade, and the calling
//! agent's business logic are collaborators this crate consumes through
//! narrow interfaces ([`remote_invoker::AgentTransport`], `tracing`,
//! [`clock::Clock`]) rather than subsystems it re-implements.

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod registry;
pub mod remote_invoker;
pub mod telemetry;
pub mod types;

pub use error::{CoreError, Result};

/// Re-exports for the common case of wiring up a coordinator end to end.
pub mod prelude {
    pub use crate::circuit_breaker::{
        BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    };
    pub use crate::clock::{Clock, ManualClock, MonotonicClock};
    pub use crate::config::Config;
    pub use crate::coordinator::Coordinator;
    pub use crate::error::{Component, CoreError, ErrorKind, ErrorSeverity, Result};
    pub use crate::registry::{Registry, RegistryStatistics};
    pub use crate::remote_invoker::{AgentTransport, HttpAgentTransport, RemoteInvoker};
    pub use crate::types::{AgentInput, AgentOutput, AgentTask, AgentTaskResult, ServiceInstance};
}
