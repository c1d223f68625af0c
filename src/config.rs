//! Orchestrator configuration
//!
//! Explicit configuration structs constructed once per process or request and
//! passed into components. Nothing in the crate reads ambient global state;
//! the RBAC exception flag in particular is an explicit, auditable field here
//! rather than an environment lookup buried in a capability.

use std::time::Duration;

/// Top-level configuration for the planning loop and executor
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum planning rounds before the loop gives up with a structured
    /// incomplete-answer error.
    pub max_rounds: usize,
    /// Per-invocation execution timeout.
    pub invocation_timeout: Duration,
    /// Whole-request deadline. In-flight invocations past the deadline fold
    /// as cancelled partial results.
    pub request_deadline: Duration,
    /// Entity resolution tuning.
    pub resolver: ResolverConfig,
    /// Name of the one capability exempt from access-control scoping, if
    /// any. All other capabilities are always scoped.
    pub unscoped_capability: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_rounds: 6,
            invocation_timeout: Duration::from_secs(30),
            request_deadline: Duration::from_secs(120),
            resolver: ResolverConfig::default(),
            unscoped_capability: None,
        }
    }
}

impl OrchestratorConfig {
    /// Load overrides from the environment (honors a local .env file)
    ///
    /// Recognized variables: `COPILOT_MAX_ROUNDS`, `COPILOT_INVOCATION_TIMEOUT_SECS`,
    /// `COPILOT_REQUEST_DEADLINE_SECS`, `COPILOT_UNSCOPED_CAPABILITY`.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Some(rounds) = env_parse::<usize>("COPILOT_MAX_ROUNDS") {
            config.max_rounds = rounds;
        }
        if let Some(secs) = env_parse::<u64>("COPILOT_INVOCATION_TIMEOUT_SECS") {
            config.invocation_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("COPILOT_REQUEST_DEADLINE_SECS") {
            config.request_deadline = Duration::from_secs(secs);
        }
        if let Ok(name) = std::env::var("COPILOT_UNSCOPED_CAPABILITY") {
            if !name.is_empty() {
                config.unscoped_capability = Some(name);
            }
        }

        config
    }
}

/// Entity resolver tuning
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Minimum cosine similarity for a confident single match.
    pub confidence_threshold: f32,
    /// A second candidate closer than this to the top score forces
    /// disambiguation even when the top clears the threshold.
    pub near_tie_margin: f32,
    /// Number of candidates carried in a disambiguation outcome.
    pub top_k: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.80,
            near_tie_margin: 0.05,
            top_k: 5,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
