//! The resolution pipeline: normalize, block, score, decide.
//!
//! For each `(name, type)` input the pipeline consults the cache, takes the
//! identity lock, and then runs exact match, synonym lookup, blocking-keyed
//! fuzzy scoring, and the threshold decision, persisting a MatchDecision for
//! every fuzzy evaluation. Exact and synonym hits bypass the decision graph.
//! Under the identity lock the sequence check-cache, check-exact,
//! check-synonym, fuzzy, decide, write, populate-cache is linearizable with
//! respect to other resolutions of the same normalized identity.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::audit::AuditStore;
use crate::blocking::blocking_keys;
use crate::cache::{CacheKey, ResolutionCache};
use crate::config::ResolveOptions;
use crate::decay::ConfidenceDecay;
use crate::error::ResolveError;
use crate::llm::{EnrichmentRequest, EnrichmentResponse, LlmProvider};
use crate::lock::IdentityLock;
use crate::merge::{MergeEngine, MergeRequest};
use crate::model::{
	AuditAction, AuditEntry, Entity, MatchDecision, MatchOutcome, ReviewItem, ReviewStatus,
	Synonym, SynonymSource,
};
use crate::normalize::NormalizationEngine;
use crate::reference::EntityReference;
use crate::repo::{
	BlockingIndex as _, DecisionRepo as _, EntityRepo as _, Repositories, ReviewRepo as _,
	SynonymRepo as _,
};
use crate::similarity::{SimilarityScore, SimilarityScorer};

/// Maximum accepted input name length.
pub const MAX_NAME_LEN: usize = 1000;

static NAME_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"^[\p{L}\p{N}\s.,&'\-]+$").expect("name pattern"));
static ENTITY_TYPE_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("entity type pattern"));
static REL_TYPE_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("relationship type pattern"));

/// Validate a raw input name: non-blank, bounded, no control characters,
/// restricted character class.
pub fn validate_name(name: &str) -> Result<(), ResolveError> {
	if name.trim().is_empty() {
		return Err(ResolveError::InvalidInput("name must not be blank".to_string()));
	}
	if name.chars().count() > MAX_NAME_LEN {
		return Err(ResolveError::InvalidInput(format!(
			"name exceeds {} characters",
			MAX_NAME_LEN
		)));
	}
	if name.chars().any(char::is_control) {
		return Err(ResolveError::InvalidInput(
			"name contains control characters".to_string(),
		));
	}
	if !NAME_RE.is_match(name) {
		return Err(ResolveError::InvalidInput(format!(
			"name contains characters outside the permitted class: {:?}",
			name
		)));
	}
	Ok(())
}

pub fn validate_entity_type(entity_type: &str) -> Result<(), ResolveError> {
	if !ENTITY_TYPE_RE.is_match(entity_type) {
		return Err(ResolveError::InvalidInput(format!(
			"entity type must be alphanumeric/underscore: {:?}",
			entity_type
		)));
	}
	Ok(())
}

pub fn validate_relationship_type(rel_type: &str) -> Result<(), ResolveError> {
	if !REL_TYPE_RE.is_match(rel_type) {
		return Err(ResolveError::InvalidInput(format!(
			"relationship type must be alphanumeric/underscore: {:?}",
			rel_type
		)));
	}
	Ok(())
}

/// Outcome of one resolution.
#[derive(Debug, Clone)]
pub struct ResolutionResult {
	/// The canonical entity the input resolved to (or the entity created).
	pub entity: Entity,
	pub is_new_entity: bool,
	pub was_matched_via_synonym: bool,
	pub was_new_synonym_created: bool,
	pub decision: MatchOutcome,
	pub score: f64,
	pub input_name: String,
	pub matched_name: Option<String>,
	/// Merge-stable handle to the canonical entity.
	pub reference: EntityReference,
}

#[derive(Default)]
pub struct PipelineCounters {
	resolutions: AtomicU64,
	exact_hits: AtomicU64,
	synonym_hits: AtomicU64,
	auto_merges: AtomicU64,
	synonyms_attached: AtomicU64,
	reviews_submitted: AtomicU64,
	no_matches: AtomicU64,
	llm_consults: AtomicU64,
}

/// Snapshot of pipeline activity for the health surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PipelineStats {
	pub resolutions: u64,
	pub exact_hits: u64,
	pub synonym_hits: u64,
	pub auto_merges: u64,
	pub synonyms_attached: u64,
	pub reviews_submitted: u64,
	pub no_matches: u64,
	pub llm_consults: u64,
}

impl PipelineCounters {
	fn bump(counter: &AtomicU64) {
		counter.fetch_add(1, Ordering::Relaxed);
	}

	pub fn snapshot(&self) -> PipelineStats {
		PipelineStats {
			resolutions: self.resolutions.load(Ordering::Relaxed),
			exact_hits: self.exact_hits.load(Ordering::Relaxed),
			synonym_hits: self.synonym_hits.load(Ordering::Relaxed),
			auto_merges: self.auto_merges.load(Ordering::Relaxed),
			synonyms_attached: self.synonyms_attached.load(Ordering::Relaxed),
			reviews_submitted: self.reviews_submitted.load(Ordering::Relaxed),
			no_matches: self.no_matches.load(Ordering::Relaxed),
			llm_consults: self.llm_consults.load(Ordering::Relaxed),
		}
	}
}

/// Best-scoring fuzzy candidate.
struct BestCandidate {
	entity: Entity,
	score: SimilarityScore,
}

pub struct ResolutionPipeline {
	normalizer: NormalizationEngine,
	scorer: SimilarityScorer,
	repos: Repositories,
	cache: Arc<dyn ResolutionCache>,
	locks: Arc<dyn IdentityLock>,
	llm: Option<Arc<dyn LlmProvider>>,
	merge_engine: Arc<MergeEngine>,
	audit: Arc<dyn AuditStore>,
	decay: ConfidenceDecay,
	evaluator: String,
	counters: PipelineCounters,
}

impl ResolutionPipeline {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		normalizer: NormalizationEngine,
		scorer: SimilarityScorer,
		repos: Repositories,
		cache: Arc<dyn ResolutionCache>,
		locks: Arc<dyn IdentityLock>,
		llm: Option<Arc<dyn LlmProvider>>,
		merge_engine: Arc<MergeEngine>,
		audit: Arc<dyn AuditStore>,
		decay: ConfidenceDecay,
		evaluator: impl Into<String>,
	) -> Self {
		Self {
			normalizer,
			scorer,
			repos,
			cache,
			locks,
			llm,
			merge_engine,
			audit,
			decay,
			evaluator: evaluator.into(),
			counters: PipelineCounters::default(),
		}
	}

	pub fn stats(&self) -> PipelineStats {
		self.counters.snapshot()
	}

	pub fn normalizer(&self) -> &NormalizationEngine {
		&self.normalizer
	}

	pub fn repos(&self) -> &Repositories {
		&self.repos
	}

	fn reference_for(&self, entity: &Entity) -> EntityReference {
		EntityReference::new(entity.id, entity.entity_type.clone(), self.repos.entities.clone())
	}

	/// The cacheable form of a result: creation flags are facts about one
	/// invocation, not about the identity, so they never replay from cache.
	fn cache_put(&self, key: &CacheKey, result: &ResolutionResult) {
		let mut cached = result.clone();
		cached.is_new_entity = false;
		cached.was_new_synonym_created = false;
		self.cache.put(key.clone(), cached);
	}

	/// Resolve one `(name, type)` input end to end.
	pub async fn resolve(
		&self,
		name: &str,
		entity_type: &str,
		options: &ResolveOptions,
	) -> Result<ResolutionResult, ResolveError> {
		validate_name(name)?;
		validate_entity_type(entity_type)?;
		options.validate()?;

		let normalized = self.normalizer.normalize(name, entity_type);
		if normalized.is_empty() {
			return Err(ResolveError::InvalidInput(format!(
				"name {:?} normalizes to the empty string",
				name
			)));
		}

		let cache_key = CacheKey::new(&normalized, entity_type);
		if let Some(hit) = self.cache.get(&cache_key) {
			return Ok(hit);
		}

		let lock_key = format!("{}:{}", entity_type, normalized);
		let guard = self.locks.acquire(&lock_key, options.lock_timeout_ms).await?;
		let outcome = self
			.resolve_locked(name, entity_type, &normalized, &cache_key, options)
			.await;
		guard.release().await;

		let result = outcome?;
		PipelineCounters::bump(&self.counters.resolutions);
		Ok(result)
	}

	/// Read-only lookup: exact match, then best live synonym. No mutation,
	/// no lock.
	pub async fn lookup(
		&self,
		name: &str,
		entity_type: &str,
	) -> Result<Option<Entity>, ResolveError> {
		validate_name(name)?;
		validate_entity_type(entity_type)?;
		let normalized = self.normalizer.normalize(name, entity_type);
		if normalized.is_empty() {
			return Ok(None);
		}

		if let Some(entity) = self
			.repos
			.entities
			.find_active_by_normalized(&normalized, entity_type)
			.await?
		{
			return Ok(Some(entity));
		}

		let hits = self
			.repos
			.synonyms
			.find_by_normalized(&normalized, entity_type)
			.await?;
		Ok(hits.into_iter().map(|(_, entity)| entity).next())
	}

	async fn resolve_locked(
		&self,
		name: &str,
		entity_type: &str,
		normalized: &str,
		cache_key: &CacheKey,
		options: &ResolveOptions,
	) -> Result<ResolutionResult, ResolveError> {
		// A concurrent resolution of the same identity may have landed while
		// we waited on the lock.
		if let Some(hit) = self.cache.get(cache_key) {
			return Ok(hit);
		}

		if let Some(result) = self
			.try_exact_match(name, entity_type, normalized, cache_key)
			.await?
		{
			return Ok(result);
		}

		if let Some(result) = self
			.try_synonym_match(name, entity_type, normalized, cache_key, options)
			.await?
		{
			return Ok(result);
		}

		self.resolve_fuzzy(name, entity_type, normalized, cache_key, options)
			.await
	}

	/// Step 5: exact match on the normalized identity. Bypasses the decision
	/// graph.
	async fn try_exact_match(
		&self,
		name: &str,
		entity_type: &str,
		normalized: &str,
		cache_key: &CacheKey,
	) -> Result<Option<ResolutionResult>, ResolveError> {
		let entity = match self
			.repos
			.entities
			.find_active_by_normalized(normalized, entity_type)
			.await?
		{
			Some(entity) => entity,
			None => return Ok(None),
		};

		PipelineCounters::bump(&self.counters.exact_hits);
		let was_new_synonym_created = self
			.attach_synonym_if_new(&entity, name, normalized, SynonymSource::System, 1.0)
			.await?;

		let result = ResolutionResult {
			reference: self.reference_for(&entity),
			matched_name: Some(entity.canonical_name.clone()),
			entity,
			is_new_entity: false,
			was_matched_via_synonym: false,
			was_new_synonym_created,
			decision: MatchOutcome::AutoMerge,
			score: 1.0,
			input_name: name.to_string(),
		};
		self.cache_put(cache_key, &result);
		Ok(Some(result))
	}

	/// Step 6: synonym lookup. A live synonym resolves with its effective
	/// confidence; a decayed one falls through to fuzzy matching.
	async fn try_synonym_match(
		&self,
		name: &str,
		entity_type: &str,
		normalized: &str,
		cache_key: &CacheKey,
		options: &ResolveOptions,
	) -> Result<Option<ResolutionResult>, ResolveError> {
		let hits = self
			.repos
			.synonyms
			.find_by_normalized(normalized, entity_type)
			.await?;

		let best = hits
			.into_iter()
			.map(|(synonym, entity)| {
				let effective = self.decay.effective(&synonym);
				(synonym, entity, effective)
			})
			.max_by(|a, b| a.2.total_cmp(&b.2));

		let (mut synonym, entity, effective) = match best {
			Some(best) => best,
			None => return Ok(None),
		};

		if effective < options.synonym_threshold {
			debug!(
				"synonym '{}' for '{}' decayed to {:.3}; falling back to fuzzy",
				synonym.value, normalized, effective
			);
			return Ok(None);
		}

		// The hit is a confirmation: reinforce the synonym. Persistence of
		// the reinforcement must not fail the resolution.
		self.decay.reinforce(&mut synonym);
		if let Err(e) = self.repos.synonyms.update(&synonym).await {
			warn!("synonym reinforcement persist failed: {}", e);
		}

		PipelineCounters::bump(&self.counters.synonym_hits);
		let result = ResolutionResult {
			reference: self.reference_for(&entity),
			matched_name: Some(entity.canonical_name.clone()),
			entity,
			is_new_entity: false,
			was_matched_via_synonym: true,
			was_new_synonym_created: false,
			decision: MatchOutcome::AutoMerge,
			score: effective,
			input_name: name.to_string(),
		};
		self.cache_put(cache_key, &result);
		Ok(Some(result))
	}

	/// Steps 7-11: candidate narrowing, scoring, threshold decision, LLM
	/// enrichment, decision persistence, and the outcome's side effects.
	async fn resolve_fuzzy(
		&self,
		name: &str,
		entity_type: &str,
		normalized: &str,
		cache_key: &CacheKey,
		options: &ResolveOptions,
	) -> Result<ResolutionResult, ResolveError> {
		let keys = blocking_keys(normalized);
		let mut candidates = self.repos.blocking.candidates(&keys, entity_type).await?;
		if candidates.is_empty() {
			// Cold index: bounded full scan of the type.
			candidates = self
				.repos
				.entities
				.scan_active_by_type(entity_type, options.fallback_scan_limit)
				.await?;
		}

		let mut best: Option<BestCandidate> = None;
		for candidate in candidates {
			let score = self.scorer.score(normalized, &candidate.normalized_name);
			let better = best
				.as_ref()
				.is_none_or(|b| score.composite > b.score.composite);
			if better {
				best = Some(BestCandidate {
					entity: candidate,
					score,
				});
			}
		}

		let best_score = best.as_ref().map(|b| b.score).unwrap_or(SimilarityScore::ZERO);
		let mut outcome = match &best {
			Some(b)
				if b.score.composite >= options.auto_merge_threshold
					&& options.auto_merge_enabled =>
			{
				MatchOutcome::AutoMerge
			}
			Some(b) if b.score.composite >= options.synonym_threshold => MatchOutcome::SynonymOnly,
			Some(b) if b.score.composite >= options.review_threshold => MatchOutcome::Review,
			_ => MatchOutcome::NoMatch,
		};

		// Step 10: LLM enrichment of non-auto-merge fuzzy decisions. The
		// provider may promote to SYNONYM_ONLY (never AUTO_MERGE) or demote
		// to REVIEW; unavailability degrades to the fuzzy outcome.
		let mut llm_notes = None;
		if options.use_llm && outcome != MatchOutcome::AutoMerge {
			if let (Some(provider), Some(b)) = (&self.llm, &best) {
				if let Some(response) = self
					.consult_llm(provider.as_ref(), name, &b.entity, entity_type)
					.await
				{
					if response.are_same_entity {
						outcome = if response.confidence >= options.llm_confidence_threshold {
							MatchOutcome::SynonymOnly
						} else {
							MatchOutcome::Review
						};
					}
					if !response.suggested_synonyms.is_empty() {
						llm_notes = serde_json::to_string(&serde_json::json!({
							"suggested_synonyms": response.suggested_synonyms,
							"reasoning": response.reasoning,
						}))
						.ok();
					}
				}
			}
		}

		// The input entity, when this outcome materializes one.
		let input_entity = match outcome {
			MatchOutcome::AutoMerge | MatchOutcome::NoMatch => {
				Some(Entity::new(name, normalized, entity_type, 1.0))
			}
			MatchOutcome::Review if options.review_creates_entity => {
				Some(Entity::new(name, normalized, entity_type, 1.0))
			}
			_ => None,
		};
		let input_temp_id = input_entity.as_ref().map(|e| e.id).unwrap_or_else(Uuid::new_v4);

		// Step 11: persist the decision with every subscore and threshold.
		let decision = MatchDecision {
			id: Uuid::new_v4(),
			input_entity_temp_id: input_temp_id,
			candidate_entity_id: best.as_ref().map(|b| b.entity.id),
			entity_type: entity_type.to_string(),
			levenshtein_score: best_score.levenshtein,
			jaro_winkler_score: best_score.jaro_winkler,
			jaccard_score: best_score.jaccard,
			final_score: best_score.composite,
			auto_merge_threshold: options.auto_merge_threshold,
			synonym_threshold: options.synonym_threshold,
			review_threshold: options.review_threshold,
			outcome,
			evaluator: self.evaluator.clone(),
			timestamp: Utc::now(),
		};
		self.repos.decisions.record_match(&decision).await?;

		let result = match outcome {
			MatchOutcome::AutoMerge => {
				let b = best.expect("auto-merge requires a candidate");
				let input = input_entity.expect("auto-merge materializes the input entity");
				self.create_entity_with_keys(&input, &options.source_system).await?;

				let report = self
					.merge_engine
					.merge(&MergeRequest {
						source_id: input.id,
						target_id: b.entity.id,
						confidence_score: b.score.composite,
						decision: MatchOutcome::AutoMerge,
						triggered_by: "system".to_string(),
						reasoning: format!(
							"composite score {:.4} at or above auto-merge threshold {:.2}",
							b.score.composite, options.auto_merge_threshold
						),
						source_system: options.source_system.clone(),
					})
					.await?;

				PipelineCounters::bump(&self.counters.auto_merges);
				ResolutionResult {
					reference: self.reference_for(&b.entity),
					matched_name: Some(b.entity.canonical_name.clone()),
					entity: b.entity,
					is_new_entity: false,
					was_matched_via_synonym: false,
					was_new_synonym_created: report.synonym_attached,
					decision: MatchOutcome::AutoMerge,
					score: b.score.composite,
					input_name: name.to_string(),
				}
			}
			MatchOutcome::SynonymOnly => {
				let b = best.expect("synonym-only requires a candidate");
				let created = self
					.attach_synonym_if_new(
						&b.entity,
						name,
						normalized,
						SynonymSource::System,
						b.score.composite,
					)
					.await?;
				ResolutionResult {
					reference: self.reference_for(&b.entity),
					matched_name: Some(b.entity.canonical_name.clone()),
					entity: b.entity,
					is_new_entity: false,
					was_matched_via_synonym: false,
					was_new_synonym_created: created,
					decision: MatchOutcome::SynonymOnly,
					score: b.score.composite,
					input_name: name.to_string(),
				}
			}
			MatchOutcome::Review => {
				let b = best.expect("review requires a candidate");
				let (result_entity, is_new) = match &input_entity {
					Some(input) => {
						self.create_entity_with_keys(input, &options.source_system).await?;
						(input.clone(), true)
					}
					None => (b.entity.clone(), false),
				};

				let item = ReviewItem {
					id: Uuid::new_v4(),
					source_entity_id: input_temp_id,
					candidate_entity_id: b.entity.id,
					source_entity_name: name.to_string(),
					candidate_entity_name: b.entity.canonical_name.clone(),
					entity_type: entity_type.to_string(),
					similarity_score: b.score.composite,
					status: ReviewStatus::Pending,
					submitted_at: Utc::now(),
					reviewed_at: None,
					reviewer_id: None,
					notes: llm_notes,
					match_decision_id: Some(decision.id),
				};
				self.repos.reviews.create(&item).await?;
				self.audit_quiet(
					AuditAction::ReviewSubmitted,
					b.entity.id,
					"system",
					[
						("review_id", serde_json::json!(item.id.to_string())),
						("source_entity_name", serde_json::json!(name)),
						("similarity_score", serde_json::json!(b.score.composite)),
					],
				)
				.await;

				PipelineCounters::bump(&self.counters.reviews_submitted);
				ResolutionResult {
					reference: self.reference_for(&result_entity),
					matched_name: Some(b.entity.canonical_name.clone()),
					entity: result_entity,
					is_new_entity: is_new,
					was_matched_via_synonym: false,
					was_new_synonym_created: false,
					decision: MatchOutcome::Review,
					score: b.score.composite,
					input_name: name.to_string(),
				}
			}
			MatchOutcome::NoMatch => {
				let input = input_entity.expect("no-match materializes the input entity");
				self.create_entity_with_keys(&input, &options.source_system).await?;
				PipelineCounters::bump(&self.counters.no_matches);
				ResolutionResult {
					reference: self.reference_for(&input),
					matched_name: None,
					entity: input,
					is_new_entity: true,
					was_matched_via_synonym: false,
					was_new_synonym_created: false,
					decision: MatchOutcome::NoMatch,
					score: best_score.composite,
					input_name: name.to_string(),
				}
			}
		};

		self.cache_put(cache_key, &result);
		Ok(result)
	}

	async fn consult_llm(
		&self,
		provider: &dyn LlmProvider,
		name: &str,
		candidate: &Entity,
		entity_type: &str,
	) -> Option<EnrichmentResponse> {
		if !provider.is_available().await {
			warn!(
				"LLM provider '{}' unavailable; continuing fuzzy-only",
				provider.provider_name()
			);
			return None;
		}
		let request = EnrichmentRequest {
			name1: name.to_string(),
			name2: candidate.canonical_name.clone(),
			entity_type: entity_type.to_string(),
			context: None,
		};
		match provider.enrich(&request).await {
			Ok(response) => {
				PipelineCounters::bump(&self.counters.llm_consults);
				Some(response)
			}
			Err(e) => {
				warn!("LLM enrichment failed; continuing fuzzy-only: {}", e);
				None
			}
		}
	}

	/// Persist a new entity plus its blocking keys, with an audit entry.
	async fn create_entity_with_keys(
		&self,
		entity: &Entity,
		source_system: &Option<String>,
	) -> Result<(), ResolveError> {
		self.repos.entities.create(entity).await?;
		let keys = blocking_keys(&entity.normalized_name);
		self.repos.blocking.add_keys(entity.id, &keys).await?;
		self.audit_quiet(
			AuditAction::EntityCreated,
			entity.id,
			"system",
			[
				("canonical_name", serde_json::json!(entity.canonical_name)),
				("entity_type", serde_json::json!(entity.entity_type)),
				("source_system", serde_json::json!(source_system)),
			],
		)
		.await;
		Ok(())
	}

	/// Attach a synonym unless the raw form is the canonical name itself or
	/// an equivalent synonym already exists.
	pub(crate) async fn attach_synonym_if_new(
		&self,
		entity: &Entity,
		raw_value: &str,
		normalized_value: &str,
		source: SynonymSource,
		confidence: f64,
	) -> Result<bool, ResolveError> {
		if raw_value == entity.canonical_name {
			return Ok(false);
		}
		if self
			.repos
			.synonyms
			.exists_for_entity(entity.id, normalized_value)
			.await?
		{
			return Ok(false);
		}

		let synonym = Synonym::new(
			raw_value,
			normalized_value,
			source,
			confidence.clamp(0.0, 1.0),
			entity.id,
		);
		self.repos.synonyms.create(&synonym).await?;
		self.audit_quiet(
			AuditAction::SynonymAdded,
			entity.id,
			"system",
			[
				("value", serde_json::json!(raw_value)),
				("source", serde_json::json!(source)),
			],
		)
		.await;
		PipelineCounters::bump(&self.counters.synonyms_attached);
		Ok(true)
	}

	/// Audit write that never fails the surrounding operation.
	async fn audit_quiet<const N: usize>(
		&self,
		action: AuditAction,
		entity_id: Uuid,
		actor: &str,
		details: [(&str, serde_json::Value); N],
	) {
		let details: BTreeMap<String, serde_json::Value> = details
			.into_iter()
			.map(|(k, v)| (k.to_string(), v))
			.collect();
		let entry = AuditEntry::new(action, entity_id, actor, details);
		if let Err(e) = self.audit.record(entry).await {
			warn!("audit write failed ({}): {}", action, e);
		}
	}
}
