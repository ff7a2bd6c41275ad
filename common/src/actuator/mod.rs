// External collaborator contracts
// Everything behind these traits performs real page work; the core only
// schedules it. Any error crossing this boundary is caught by the
// caller and treated as a failed unit of work, never a crash.

pub mod http;

pub use http::HttpActuator;

use async_trait::async_trait;

use crate::errors::ActuationError;
use crate::models::{BatchOutcome, BulkJobRequest, SlotOptions, TaskDescriptor};

/// Handle to a scoped, ephemeral execution context (e.g. a background
/// browser tab) bound to one target URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextHandle {
    pub id: String,
    pub url: String,
}

/// Acquires and releases execution contexts. `release` is idempotent
/// and is called exactly once per acquire on every exit path.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn acquire(&self, url: &str, foreground: bool) -> Result<ContextHandle, ActuationError>;

    async fn release(&self, handle: ContextHandle);
}

/// Performs one unit of engagement work against a live page context.
/// Returns whether the work succeeded; the runner maps any `Err` to a
/// plain failure.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn execute(
        &self,
        task: &TaskDescriptor,
        context: &ContextHandle,
    ) -> Result<bool, ActuationError>;
}

/// Resolves an activity-source URL to the identifier of its first
/// content item. `Ok(None)` is a resolution miss, not an error.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve_first_item(
        &self,
        source_url: &str,
        context: &ContextHandle,
    ) -> Result<Option<String>, ActuationError>;
}

/// Entitlement/feature-flag check consulted before daily bulk dispatch.
/// Callers fail closed: an `Err` means no execution.
#[async_trait]
pub trait EntitlementChecker: Send + Sync {
    async fn has_feature(&self, name: &str) -> Result<bool, ActuationError>;
}

/// Dispatches a daily bulk job description to the execution layer.
#[async_trait]
pub trait BulkDispatcher: Send + Sync {
    async fn dispatch(&self, request: &BulkJobRequest) -> Result<(), ActuationError>;
}

/// Processes a slice of batch-import items with per-slot options.
/// `is_busy` is the re-entrancy guard: a firing that finds the layer
/// busy skips rather than queueing a second concurrent run.
#[async_trait]
pub trait BatchActuator: Send + Sync {
    async fn is_busy(&self) -> bool;

    async fn run_batch(
        &self,
        items: &[String],
        options: &SlotOptions,
    ) -> Result<BatchOutcome, ActuationError>;
}
