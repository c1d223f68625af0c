//! Capability execution seam
//!
//! The structured-data and relationship-graph query executors are external
//! collaborators; this trait is the whole of their surface as seen from the
//! orchestration core. Test doubles implement it with injected delays and
//! failures.

use async_trait::async_trait;

use crate::invocation::{CapabilityInvocation, ExecutionResult};
use crate::scope::AccessControlContext;

/// An external, independently invocable retrieval capability
///
/// Implementations must honor the scope injected into the invocation's
/// bindings; ignoring it is a contract violation on their side. The executor
/// still re-checks results against the allowed set before folding.
#[async_trait]
pub trait CapabilityExecutor: Send + Sync {
    /// Capability name as registered in the capability registry
    fn name(&self) -> &str;

    /// Execute one scoped invocation
    ///
    /// Errors are recovered by the executor into failed [`ExecutionResult`]s;
    /// implementations should not retry internally on behalf of the
    /// orchestrator.
    async fn execute(
        &self,
        invocation: &CapabilityInvocation,
        scope: &AccessControlContext,
    ) -> anyhow::Result<ExecutionResult>;
}
