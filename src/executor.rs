//! Dependency-Aware Executor
//!
//! Takes the invocations proposed in one planning round, classifies each as
//! independent or dependent on another invocation's output, dispatches
//! independents concurrently, and runs dependents sequentially after their
//! prerequisites have folded into WorkingContext. Capability failures and
//! timeouts are recovered into failed results in the batch; only entity
//! resolution failures abort the round.
//!
//! WorkingContext is mutated here only between dispatch stages, on the
//! coordinating task. Worker tasks produce results and nothing else.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::capability::CapabilityExecutor;
use crate::config::OrchestratorConfig;
use crate::conversation::WorkingContext;
use crate::error::Result;
use crate::invocation::{CapabilityInvocation, ExecutionErrorKind, ExecutionResult};
use crate::resolver::{AccountResolver, ResolutionOutcome};
use crate::scope::AccessControlContext;

/// Round execution plan: invocation indices split by dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Resolvable before the round starts; eligible for concurrent dispatch
    pub independent: Vec<usize>,
    /// Reference a WorkingContext key that must come from another
    /// invocation's output; run sequentially after the join barrier
    pub dependent: Vec<usize>,
}

/// Classify a round's invocations against the WorkingContext as it stands
/// at round start
///
/// An invocation whose bindings reference a key not yet present is
/// dependent. Anything unclassifiable lands in the sequential stage too:
/// correctness over latency.
pub fn classify(invocations: &[CapabilityInvocation], working: &WorkingContext) -> ExecutionPlan {
    let mut independent = Vec::new();
    let mut dependent = Vec::new();

    for (idx, invocation) in invocations.iter().enumerate() {
        let unresolved = invocation
            .binding_references()
            .iter()
            .any(|key| !working.contains_key(key));
        if unresolved {
            dependent.push(idx);
        } else {
            independent.push(idx);
        }
    }

    ExecutionPlan {
        independent,
        dependent,
    }
}

/// Executes one round's invocations under scope, timeout, and deadline
pub struct DependencyAwareExecutor {
    capabilities: HashMap<String, Arc<dyn CapabilityExecutor>>,
    resolver: Arc<AccountResolver>,
    config: OrchestratorConfig,
}

impl DependencyAwareExecutor {
    pub fn new(
        capabilities: Vec<Arc<dyn CapabilityExecutor>>,
        resolver: Arc<AccountResolver>,
        config: OrchestratorConfig,
    ) -> Self {
        let capabilities = capabilities
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();
        Self {
            capabilities,
            resolver,
            config,
        }
    }

    /// Execute a round of invocations, returning one result per invocation
    /// in the caller's order
    ///
    /// `deadline` bounds the whole request; invocations that cannot start or
    /// finish before it fold as cancelled partial results rather than being
    /// silently dropped.
    #[instrument(skip_all, fields(invocations = invocations.len()))]
    pub async fn execute(
        &self,
        invocations: &[CapabilityInvocation],
        ctx: &Arc<AccessControlContext>,
        working: &mut WorkingContext,
        deadline: Instant,
    ) -> Result<Vec<ExecutionResult>> {
        let plan = classify(invocations, working);
        debug!(
            independent = plan.independent.len(),
            dependent = plan.dependent.len(),
            "classified round"
        );

        let mut slots: Vec<Option<ExecutionResult>> = vec![None; invocations.len()];

        // Stage 1: concurrent dispatch of independents, joined as a barrier
        let mut handles = Vec::new();
        for &idx in &plan.independent {
            let invocation = match substitute_bindings(&invocations[idx], working) {
                Ok(inv) => inv,
                Err(failure) => {
                    slots[idx] = Some(failure);
                    continue;
                }
            };
            let prepared = match self.prepare(&invocation, ctx).await? {
                Ok(inv) => inv,
                Err(early) => {
                    slots[idx] = Some(early);
                    continue;
                }
            };
            let capability = self.capabilities.get(&prepared.capability).cloned();
            let ctx = Arc::clone(ctx);
            let budget = Self::budget(self.config.invocation_timeout, deadline);
            handles.push(tokio::spawn(async move {
                (idx, run_one(capability, prepared, ctx, budget).await)
            }));
        }

        for handle in futures::future::join_all(handles).await {
            match handle {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(join_err) => {
                    // A panicked worker must not take the round with it.
                    warn!(error = %join_err, "worker task failed to join");
                }
            }
        }

        // Fold the independents so dependents can see their output
        for &idx in &plan.independent {
            if let Some(result) = slots[idx].take() {
                slots[idx] = Some(self.admit(result, ctx, working));
            }
        }

        // Stage 2: dependents, strictly sequential in proposal order
        for &idx in &plan.dependent {
            let invocation = match substitute_bindings(&invocations[idx], working) {
                Ok(inv) => inv,
                Err(failure) => {
                    slots[idx] = Some(failure);
                    continue;
                }
            };
            let prepared = match self.prepare(&invocation, ctx).await? {
                Ok(inv) => inv,
                Err(early) => {
                    slots[idx] = Some(early);
                    continue;
                }
            };
            let capability = self.capabilities.get(&prepared.capability).cloned();
            let budget = Self::budget(self.config.invocation_timeout, deadline);
            let result = run_one(capability, prepared, Arc::clone(ctx), budget).await;
            slots[idx] = Some(self.admit(result, ctx, working));
        }

        Ok(slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| {
                    ExecutionResult::failed(
                        invocations[idx].capability.clone(),
                        ExecutionErrorKind::Cancelled,
                        "worker task did not complete",
                    )
                })
            })
            .collect())
    }

    /// Resolve mentions and apply access-control scoping
    ///
    /// Returns `Err(result)` for a usable early failure (ambiguous mention);
    /// propagates only hard resolution errors.
    async fn prepare(
        &self,
        invocation: &CapabilityInvocation,
        ctx: &Arc<AccessControlContext>,
    ) -> Result<std::result::Result<CapabilityInvocation, ExecutionResult>> {
        let mut invocation = invocation.clone();

        if let Some(mentions) = invocation.accounts_mentioned.clone() {
            let mut resolved_ids = Vec::new();
            for mention in &mentions {
                match self.resolver.resolve(mention, ctx).await? {
                    ResolutionOutcome::Resolved {
                        account_id,
                        display_name,
                        confidence,
                    } => {
                        debug!(%mention, %account_id, confidence, %display_name, "mention resolved");
                        resolved_ids.push(account_id);
                    }
                    ResolutionOutcome::Disambiguate { candidates } => {
                        let listing = candidates
                            .iter()
                            .map(|c| format!("{} ({:.2})", c.display_name, c.similarity))
                            .collect::<Vec<_>>()
                            .join(", ");
                        return Ok(Err(ExecutionResult::failed(
                            invocation.capability.clone(),
                            ExecutionErrorKind::Upstream,
                            format!(
                                "ambiguous account mention '{mention}': candidates [{listing}]; ask the user to pick one"
                            ),
                        )));
                    }
                }
            }
            if !resolved_ids.is_empty() {
                invocation.bindings.insert(
                    "resolved_account_ids".to_string(),
                    serde_json::Value::Array(
                        resolved_ids.into_iter().map(serde_json::Value::String).collect(),
                    ),
                );
            }
        }

        Ok(Ok(ctx.scope_invocation(
            &invocation,
            self.config.unscoped_capability.as_deref(),
        )))
    }

    /// RBAC-check a result and fold it into WorkingContext
    ///
    /// A violating result is discarded and replaced by an access-denied
    /// failure record; its rows never reach the context or the caller.
    fn admit(
        &self,
        result: ExecutionResult,
        ctx: &AccessControlContext,
        working: &mut WorkingContext,
    ) -> ExecutionResult {
        if let Err(violation) = ctx.check_result(&result) {
            warn!(source = %result.source, error = %violation, "discarding result outside allowed set");
            return ExecutionResult::failed(
                result.source,
                ExecutionErrorKind::AccessDenied,
                "result referenced an entity outside the caller's allowed set and was discarded",
            );
        }
        working.absorb_result(&result);
        result
    }

    fn budget(invocation_timeout: Duration, deadline: Instant) -> TimeBudget {
        let remaining = deadline.saturating_duration_since(Instant::now());
        TimeBudget {
            allowance: invocation_timeout.min(remaining),
            deadline_limited: remaining < invocation_timeout,
        }
    }
}

/// Time allowance for one invocation, tagged with what bounded it
///
/// Expiry of a deadline-limited budget is a cancellation by the request
/// deadline, not a per-invocation timeout; the two fold with different kinds.
struct TimeBudget {
    allowance: Duration,
    deadline_limited: bool,
}

/// Run one scoped invocation against its capability with a time budget
async fn run_one(
    capability: Option<Arc<dyn CapabilityExecutor>>,
    invocation: CapabilityInvocation,
    ctx: Arc<AccessControlContext>,
    budget: TimeBudget,
) -> ExecutionResult {
    let Some(capability) = capability else {
        return ExecutionResult::failed(
            invocation.capability.clone(),
            ExecutionErrorKind::Upstream,
            format!("no executor registered for capability '{}'", invocation.capability),
        );
    };

    if budget.allowance.is_zero() {
        return ExecutionResult::failed(
            invocation.capability.clone(),
            ExecutionErrorKind::Cancelled,
            "request deadline reached before dispatch",
        );
    }

    match timeout(budget.allowance, capability.execute(&invocation, &ctx)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => ExecutionResult::failed(
            invocation.capability.clone(),
            ExecutionErrorKind::Upstream,
            e.to_string(),
        ),
        Err(_) if budget.deadline_limited => ExecutionResult::failed(
            invocation.capability.clone(),
            ExecutionErrorKind::Cancelled,
            format!(
                "request deadline cancelled invocation after {}ms",
                budget.allowance.as_millis()
            ),
        ),
        Err(_) => ExecutionResult::failed(
            invocation.capability.clone(),
            ExecutionErrorKind::Timeout,
            format!("invocation exceeded {}ms budget", budget.allowance.as_millis()),
        ),
    }
}

/// Replace "$key" binding values, at any nesting depth, with the
/// WorkingContext values they name
///
/// A reference that is still unresolved after the prerequisites folded means
/// the upstream invocation produced nothing usable; that is a failure for
/// this invocation, not a reason to guess.
fn substitute_bindings(
    invocation: &CapabilityInvocation,
    working: &WorkingContext,
) -> std::result::Result<CapabilityInvocation, ExecutionResult> {
    let mut substituted = invocation.clone();
    for (name, value) in substituted.bindings.iter_mut() {
        if let Err(key) = substitute_value(value, working) {
            return Err(ExecutionResult::failed(
                invocation.capability.clone(),
                ExecutionErrorKind::Upstream,
                format!("binding '{name}' references '${key}' which no prior invocation produced"),
            ));
        }
    }
    Ok(substituted)
}

fn substitute_value(
    value: &mut Value,
    working: &WorkingContext,
) -> std::result::Result<(), String> {
    match value {
        Value::String(s) => {
            if let Some(key) = s.strip_prefix('$').map(str::to_string) {
                match working.get(&key) {
                    Some(resolved) => *value = resolved.clone(),
                    None => return Err(key),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_value(item, working)?;
            }
        }
        Value::Object(map) => {
            for nested in map.values_mut() {
                substitute_value(nested, working)?;
            }
        }
        _ => {}
    }
    Ok(())
}
