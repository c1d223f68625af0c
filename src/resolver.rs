//! Account Resolver
//!
//! Maps a free-text account mention to a canonical identifier:
//! normalize the mention, fetch the candidate names visible under the
//! caller's access-control context, embed mention and candidates, rank by
//! cosine similarity, then decide between a confident single match and a
//! top-K disambiguation.
//!
//! Low confidence is never an error here; the resolver always returns a
//! usable outcome. Only candidate fetch and embedding failures are hard
//! errors.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::ResolverConfig;
use crate::error::{OrchestratorError, Result};
use crate::scope::AccessControlContext;

/// Produces a numeric embedding for a piece of text
///
/// The model behind this is out of scope; production wiring supplies an
/// implementation, tests supply fixed vectors. Embeddings are expected to be
/// L2-normalized so cosine similarity is a dot product.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Fetches the account names visible under the current scope
///
/// RBAC is enforced at fetch time: implementations must never return an
/// unscoped global list and filter afterwards.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn visible_accounts(&self, ctx: &AccessControlContext) -> anyhow::Result<Vec<AccountRef>>;
}

/// A canonical account visible to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRef {
    pub account_id: String,
    pub display_name: String,
}

/// A scored resolution candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityCandidate {
    pub account_id: String,
    pub display_name: String,
    /// Cosine similarity to the mention, clamped to [0, 1]
    pub similarity: f32,
}

/// Outcome of resolving one mention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResolutionOutcome {
    /// Single confident match
    Resolved {
        account_id: String,
        display_name: String,
        confidence: f32,
    },
    /// Ambiguous; top-K candidates for the caller-facing layer to present
    Disambiguate { candidates: Vec<EntityCandidate> },
}

/// The mention-to-identifier resolution pipeline
pub struct AccountResolver {
    embedder: Arc<dyn Embedder>,
    candidates: Arc<dyn CandidateSource>,
    config: ResolverConfig,
    suffix_re: Regex,
    /// Embedding memo keyed by exact input text. Entries are write-once;
    /// concurrent resolves share reads and never re-embed a seen text.
    memo: RwLock<HashMap<String, Vec<f32>>>,
}

impl AccountResolver {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        candidates: Arc<dyn CandidateSource>,
        config: ResolverConfig,
    ) -> Self {
        // Corporate suffixes carry no signal for matching and hurt recall on
        // informal mentions ("Microsoft" vs "Microsoft Corporation").
        let suffix_re = Regex::new(
            r"(?i)[,\s]+(incorporated|corporation|limited|company|inc|corp|llc|ltd|plc|gmbh|co)\.?$",
        )
        .expect("static suffix regex");
        Self {
            embedder,
            candidates,
            config,
            suffix_re,
            memo: RwLock::new(HashMap::new()),
        }
    }

    async fn embed_memoized(&self, text: &str) -> Result<Vec<f32>> {
        if let Ok(memo) = self.memo.read() {
            if let Some(hit) = memo.get(text) {
                return Ok(hit.clone());
            }
        }
        let vector = self
            .embedder
            .embed(text)
            .await
            .map_err(|e| OrchestratorError::resolution("embedding", e))?;
        if let Ok(mut memo) = self.memo.write() {
            memo.entry(text.to_string()).or_insert_with(|| vector.clone());
        }
        Ok(vector)
    }

    /// Normalize a mention for embedding: trim, lowercase, strip trailing
    /// corporate suffixes
    pub fn normalize_mention(&self, mention: &str) -> String {
        let mut normalized = mention.trim().to_lowercase();
        loop {
            let stripped = self.suffix_re.replace(&normalized, "").trim().to_string();
            if stripped == normalized || stripped.is_empty() {
                break;
            }
            normalized = stripped;
        }
        normalized
    }

    /// Resolve a mention against the accounts visible under `ctx`
    #[instrument(skip(self, ctx), fields(mention = %mention))]
    pub async fn resolve(
        &self,
        mention: &str,
        ctx: &AccessControlContext,
    ) -> Result<ResolutionOutcome> {
        let normalized = self.normalize_mention(mention);

        let visible = self
            .candidates
            .visible_accounts(ctx)
            .await
            .map_err(|e| OrchestratorError::resolution("candidate_fetch", e))?;

        if visible.is_empty() {
            debug!("no visible candidates under current scope");
            return Ok(ResolutionOutcome::Disambiguate { candidates: vec![] });
        }

        let query = self.embed_memoized(&normalized).await?;

        let mut scored = Vec::with_capacity(visible.len());
        for account in visible {
            let target = self.embed_memoized(&account.display_name).await?;
            let similarity = cosine_similarity(&query, &target).clamp(0.0, 1.0);
            scored.push(EntityCandidate {
                account_id: account.account_id,
                display_name: account.display_name,
                similarity,
            });
        }

        // Descending by score; ties broken by display name ascending so
        // repeated calls over identical inputs rank identically.
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.display_name.cmp(&b.display_name))
        });

        let top = &scored[0];
        let runner_up = scored.get(1).map(|c| c.similarity).unwrap_or(0.0);
        debug!(
            top = %top.display_name,
            score = top.similarity,
            runner_up,
            "ranked candidates"
        );

        if top.similarity >= self.config.confidence_threshold
            && top.similarity - runner_up >= self.config.near_tie_margin
        {
            return Ok(ResolutionOutcome::Resolved {
                account_id: top.account_id.clone(),
                display_name: top.display_name.clone(),
                confidence: top.similarity,
            });
        }

        scored.truncate(self.config.top_k);
        Ok(ResolutionOutcome::Disambiguate { candidates: scored })
    }
}

/// Cosine similarity between two vectors
///
/// For L2-normalized inputs this is the dot product; the general form keeps
/// non-normalized test vectors honest.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
