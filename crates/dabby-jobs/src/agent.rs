//! The agent-pool capability consumed by the dispatcher.
//!
//! The actual domain logic (LLM calls, file analysis) lives outside this
//! core; the dispatcher only needs a way to execute an opaque payload and
//! learn which backend instance, if any, served it.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use dabby_state::InstanceId;

pub type AgentFuture = Pin<Box<dyn Future<Output = Result<AgentResponse, AgentError>> + Send>>;

/// Executes job payloads. Implementations route to a backend instance
/// (typically through the load balancer) and run the domain logic there.
pub trait AgentPool: Send + Sync {
    fn execute(&self, payload: serde_json::Value) -> AgentFuture;
}

/// A successful execution.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    /// The instance that served the call, when the pool routed to one.
    /// Used to feed the outcome back into the registry's metrics.
    pub instance: Option<InstanceId>,
    pub body: serde_json::Value,
}

/// A failed execution.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AgentError {
    /// The instance the call was routed to, if routing got that far.
    pub instance: Option<InstanceId>,
    pub message: String,
}

impl AgentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            instance: None,
            message: message.into(),
        }
    }

    pub fn on_instance(mut self, instance: impl Into<InstanceId>) -> Self {
        self.instance = Some(instance.into());
        self
    }
}
