//! LLM provider capability contract.
//!
//! The engine only depends on this trait; wire formats live with the
//! providers. Enrichment may promote a fuzzy decision to SYNONYM_ONLY or
//! demote it to REVIEW, but the engine never delegates AUTO_MERGE to a
//! provider. An unavailable provider degrades the pipeline to fuzzy-only.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ResolveError;

/// A candidate-pair enrichment request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentRequest {
	pub name1: String,
	pub name2: String,
	pub entity_type: String,
	pub context: Option<String>,
}

/// Provider verdict for one candidate pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentResponse {
	/// Provider confidence in `[0,1]`.
	pub confidence: f64,
	pub are_same_entity: bool,
	pub reasoning: String,
	#[serde(default)]
	pub suggested_synonyms: Vec<String>,
	#[serde(default)]
	pub related_entities: Vec<String>,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
	async fn enrich(&self, request: &EnrichmentRequest) -> Result<EnrichmentResponse, ResolveError>;

	async fn is_available(&self) -> bool;

	fn provider_name(&self) -> &str;
}
