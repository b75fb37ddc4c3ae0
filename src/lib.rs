//! Entity resolution engine over a property graph store.
//!
//! For each incoming `(name, type)` pair the engine decides whether to match
//! it to an existing canonical entity, attach a new synonym, flag a human
//! review, or create a new entity, and performs merges atomically under
//! concurrent load via per-identity locks and compensating transactions.
//!
//! [`EntityResolver`] is the transport-agnostic facade over the resolution
//! pipeline, merge engine, review queue, batch context, audit trail, and
//! merge ledger. Storage is reached exclusively through the
//! [`store::GraphStore`] contract; the bundled backends are Postgres +
//! Apache AGE and a contract-equivalent in-memory graph.

pub mod audit;
pub mod batch;
pub mod blocking;
pub mod cache;
pub mod config;
pub mod decay;
pub mod error;
pub mod llm;
pub mod lock;
pub mod merge;
pub mod model;
pub mod normalize;
pub mod observability;
pub mod pipeline;
pub mod reference;
pub mod repo;
pub mod review;
pub mod similarity;
pub mod store;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;
use uuid::Uuid;

use crate::audit::{AuditStore, InMemoryAuditStore, InMemoryMergeLedger, MergeLedger, record_quiet};
use crate::batch::{BatchContext, RelationshipSpec, create_canonical_relationship};
use crate::cache::{CacheInvalidator, CacheStats, ResolutionCache, build_cache};
use crate::config::{BatchConfig, CacheConfig, DecayConfig, ResolveOptions, ScorerWeights};
use crate::decay::ConfidenceDecay;
use crate::error::ResolveError;
use crate::llm::LlmProvider;
use crate::lock::{IdentityLock, InProcessLock};
use crate::merge::{MergeEngine, MergeReport, MergeRequest};
use crate::model::{
	AuditAction, AuditEntry, Entity, MatchOutcome, Relationship, ReviewItem, Synonym,
	SynonymSource,
};
use crate::normalize::NormalizationEngine;
use crate::pipeline::{PipelineStats, ResolutionPipeline, ResolutionResult, validate_name};
use crate::reference::canonical_id_of;
use crate::repo::{
	EntityRepo as _, RelationshipRepo as _, Repositories, SynonymRepo as _,
};
use crate::review::ReviewService;
use crate::similarity::SimilarityScorer;
use crate::store::GraphStore as _;
use crate::store::pool::{PoolStats, StorePool};

/// Engine-level configuration: explicit option records, no builders.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
	pub options: ResolveOptions,
	pub weights: ScorerWeights,
	pub cache: CacheConfig,
	pub decay: DecayConfig,
	pub batch: BatchConfig,
	/// Evaluator name stamped on match decisions.
	pub evaluator: String,
}

impl Default for ResolverConfig {
	fn default() -> Self {
		Self {
			options: ResolveOptions::default(),
			weights: ScorerWeights::default(),
			cache: CacheConfig::default(),
			decay: DecayConfig::default(),
			batch: BatchConfig::default(),
			evaluator: "fuzzy-composite-v1".to_string(),
		}
	}
}

/// The engine's external capabilities, injected at construction.
#[derive(Clone)]
pub struct ResolverDeps {
	pub repos: Repositories,
	pub locks: Arc<dyn IdentityLock>,
	pub audit: Arc<dyn AuditStore>,
	pub ledger: Arc<dyn MergeLedger>,
	pub llm: Option<Arc<dyn LlmProvider>>,
	/// Present for pooled store deployments; feeds the health surface.
	pub pool: Option<Arc<StorePool>>,
}

impl ResolverDeps {
	/// All-in-memory capability set: memory repositories, in-process locks,
	/// memory audit/ledger, no LLM, no pool.
	pub fn in_memory() -> Self {
		Self {
			repos: Repositories::in_memory(),
			locks: Arc::new(InProcessLock::new()),
			audit: Arc::new(InMemoryAuditStore::new()),
			ledger: Arc::new(InMemoryMergeLedger::new()),
			llm: None,
			pool: None,
		}
	}
}

/// Point-in-time engine health.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
	pub store_connected: bool,
	pub pool: Option<PoolStats>,
	pub cache: CacheStats,
	pub pipeline: PipelineStats,
}

/// Transport-agnostic facade over the resolution core.
pub struct EntityResolver {
	pipeline: Arc<ResolutionPipeline>,
	merge_engine: Arc<MergeEngine>,
	review: ReviewService,
	repos: Repositories,
	cache: Arc<dyn ResolutionCache>,
	audit: Arc<dyn AuditStore>,
	ledger: Arc<dyn MergeLedger>,
	pool: Option<Arc<StorePool>>,
	locks: Arc<dyn IdentityLock>,
	batch_config: BatchConfig,
	options: ResolveOptions,
	normalizer: NormalizationEngine,
}

impl EntityResolver {
	pub fn new(deps: ResolverDeps, config: ResolverConfig) -> Result<Self, ResolveError> {
		config.options.validate()?;
		let scorer = SimilarityScorer::new(config.weights)?;
		let normalizer = NormalizationEngine::with_builtin_rules();
		let decay = ConfidenceDecay::new(config.decay);
		let cache = build_cache(&config.cache);

		let merge_engine = Arc::new(MergeEngine::new(
			deps.repos.clone(),
			deps.ledger.clone(),
			deps.audit.clone(),
			deps.locks.clone(),
			config.options.lock_timeout_ms,
		));
		merge_engine.register_listener(Arc::new(CacheInvalidator(cache.clone())));

		let pipeline = Arc::new(ResolutionPipeline::new(
			normalizer.clone(),
			scorer,
			deps.repos.clone(),
			cache.clone(),
			deps.locks.clone(),
			deps.llm.clone(),
			merge_engine.clone(),
			deps.audit.clone(),
			decay,
			config.evaluator,
		));

		let review = ReviewService::new(
			deps.repos.clone(),
			deps.audit.clone(),
			merge_engine.clone(),
			decay,
			normalizer.clone(),
		);

		Ok(Self {
			pipeline,
			merge_engine,
			review,
			repos: deps.repos,
			cache,
			audit: deps.audit,
			ledger: deps.ledger,
			pool: deps.pool,
			locks: deps.locks,
			batch_config: config.batch,
			options: config.options,
			normalizer,
		})
	}

	/// All-in-memory engine; the backend the test suites run against.
	pub fn in_memory(config: ResolverConfig) -> Result<Self, ResolveError> {
		Self::new(ResolverDeps::in_memory(), config)
	}

	// -- resolution -------------------------------------------------------

	/// Resolve a raw name with the engine's default options.
	pub async fn resolve(
		&self,
		name: &str,
		entity_type: &str,
	) -> Result<ResolutionResult, ResolveError> {
		self.pipeline.resolve(name, entity_type, &self.options).await
	}

	/// Resolve with per-call option overrides.
	pub async fn resolve_with(
		&self,
		name: &str,
		entity_type: &str,
		options: &ResolveOptions,
	) -> Result<ResolutionResult, ResolveError> {
		self.pipeline.resolve(name, entity_type, options).await
	}

	/// Read-only lookup by exact match or synonym; no state is touched.
	pub async fn find_entity(
		&self,
		name: &str,
		entity_type: &str,
	) -> Result<Option<Entity>, ResolveError> {
		self.pipeline.lookup(name, entity_type).await
	}

	pub async fn get_entity(&self, id: Uuid) -> Result<Entity, ResolveError> {
		self.repos
			.entities
			.find_by_id(id)
			.await?
			.ok_or_else(|| ResolveError::not_found("entity", id))
	}

	/// The terminal ACTIVE entity of the merge chain starting at `id`.
	pub async fn get_canonical_entity(&self, id: Uuid) -> Result<Entity, ResolveError> {
		let canonical_id = canonical_id_of(&self.repos.entities, id).await?;
		self.get_entity(canonical_id).await
	}

	// -- synonyms ---------------------------------------------------------

	pub async fn get_synonyms(&self, entity_id: Uuid) -> Result<Vec<Synonym>, ResolveError> {
		self.get_entity(entity_id).await?;
		Ok(self.repos.synonyms.list_for_entity(entity_id).await?)
	}

	/// Attach a synonym to the canonical entity of `entity_id`. Returns
	/// false when an equivalent synonym already exists.
	pub async fn add_synonym(
		&self,
		entity_id: Uuid,
		value: &str,
		source: SynonymSource,
	) -> Result<bool, ResolveError> {
		validate_name(value)?;
		let entity = self.get_canonical_entity(entity_id).await?;
		let normalized = self.normalizer.normalize(value, &entity.entity_type);
		if normalized.is_empty() {
			return Err(ResolveError::InvalidInput(format!(
				"synonym {:?} normalizes to the empty string",
				value
			)));
		}
		self.pipeline
			.attach_synonym_if_new(&entity, value, &normalized, source, 1.0)
			.await
	}

	// -- relationships ----------------------------------------------------

	/// Create a library-managed relationship between the canonical entities
	/// of the given endpoints.
	pub async fn create_relationship(
		&self,
		source_entity_id: Uuid,
		target_entity_id: Uuid,
		rel_type: &str,
		properties: BTreeMap<String, serde_json::Value>,
		created_by: &str,
	) -> Result<Relationship, ResolveError> {
		let spec = RelationshipSpec {
			source_entity_id,
			target_entity_id,
			rel_type: rel_type.to_string(),
			properties,
			created_by: created_by.to_string(),
		};
		create_canonical_relationship(&self.repos, &self.audit, &spec).await
	}

	pub async fn get_relationships(
		&self,
		entity_id: Uuid,
	) -> Result<Vec<Relationship>, ResolveError> {
		Ok(self.repos.relationships.list_for_entity(entity_id).await?)
	}

	pub async fn delete_relationship(&self, id: Uuid, actor: &str) -> Result<(), ResolveError> {
		let relationship = self
			.repos
			.relationships
			.find_by_id(id)
			.await?
			.ok_or_else(|| ResolveError::not_found("relationship", id))?;
		self.repos.relationships.delete(id).await?;
		record_quiet(
			&self.audit,
			AuditEntry::new(
				AuditAction::RelationshipDeleted,
				relationship.source_entity_id,
				actor,
				BTreeMap::from([
					(
						"relationship_id".to_string(),
						serde_json::json!(id.to_string()),
					),
					(
						"rel_type".to_string(),
						serde_json::json!(relationship.rel_type),
					),
				]),
			),
		)
		.await;
		Ok(())
	}

	// -- batches ----------------------------------------------------------

	/// Begin a bulk resolution context with the engine's defaults.
	pub fn begin_batch(&self) -> BatchContext {
		self.begin_batch_with(self.options.clone())
	}

	pub fn begin_batch_with(&self, options: ResolveOptions) -> BatchContext {
		BatchContext::new(
			self.pipeline.clone(),
			self.repos.clone(),
			self.audit.clone(),
			self.batch_config.clone(),
			options,
		)
	}

	// -- reviews ----------------------------------------------------------

	pub async fn pending_reviews(&self, limit: usize) -> Result<Vec<ReviewItem>, ResolveError> {
		self.review.pending(limit).await
	}

	pub async fn approve_review(
		&self,
		review_id: Uuid,
		reviewer_id: &str,
		rationale: Option<String>,
	) -> Result<ReviewItem, ResolveError> {
		self.review.approve(review_id, reviewer_id, rationale).await
	}

	pub async fn reject_review(
		&self,
		review_id: Uuid,
		reviewer_id: &str,
		rationale: Option<String>,
	) -> Result<ReviewItem, ResolveError> {
		self.review.reject(review_id, reviewer_id, rationale).await
	}

	// -- administration ---------------------------------------------------

	/// Human-triggered merge through the same engine as the automatic path:
	/// same locks, ledger, audit, and compensations.
	pub async fn merge_entities(
		&self,
		source_id: Uuid,
		target_id: Uuid,
		actor: &str,
		reasoning: &str,
	) -> Result<MergeReport, ResolveError> {
		let source = self.get_entity(source_id).await?;
		// Hold the source identity lock so this merge is linearizable with
		// resolutions of the source's name; the engine takes the target's.
		let lock_key = format!("{}:{}", source.entity_type, source.normalized_name);
		let guard = self
			.locks
			.acquire(&lock_key, self.options.lock_timeout_ms)
			.await?;
		let outcome = self
			.merge_engine
			.merge(&MergeRequest {
				source_id,
				target_id,
				confidence_score: 1.0,
				decision: MatchOutcome::AutoMerge,
				triggered_by: actor.to_string(),
				reasoning: reasoning.to_string(),
				source_system: None,
			})
			.await;
		guard.release().await;
		outcome
	}

	/// Soft-delete: the entity disappears from read paths but stays in the
	/// graph until the retention sweep.
	pub async fn soft_delete_entity(&self, id: Uuid, actor: &str) -> Result<(), ResolveError> {
		self.get_entity(id).await?;
		self.repos.entities.soft_delete(id, Utc::now()).await?;
		self.cache.invalidate_entity(id);
		record_quiet(
			&self.audit,
			AuditEntry::new(AuditAction::EntityPurged, id, actor, BTreeMap::new()),
		)
		.await;
		Ok(())
	}

	/// Retention sweep: hard-delete soft-deleted entities older than the
	/// cutoff, with their incident edges. Never cascades merges.
	pub async fn purge_deleted(&self, older_than: DateTime<Utc>) -> Result<u64, ResolveError> {
		let purged = self.repos.entities.purge_deleted(older_than).await?;
		if purged > 0 {
			info!("retention sweep purged {} entit(ies)", purged);
		}
		Ok(purged)
	}

	// -- observability ----------------------------------------------------

	pub async fn health(&self) -> HealthReport {
		let store_connected = match &self.pool {
			Some(pool) => match pool.borrow().await {
				Ok(handle) => handle.is_connected().await,
				Err(_) => false,
			},
			// In-memory backends have no external store to probe.
			None => true,
		};
		HealthReport {
			store_connected,
			pool: self.pool.as_ref().map(|p| p.stats()),
			cache: self.cache.stats(),
			pipeline: self.pipeline.stats(),
		}
	}

	/// Prometheus-compatible metrics payload.
	pub fn metrics_text(&self) -> String {
		let pool_stats = self.pool.as_ref().map(|p| p.stats());
		observability::metrics_text(
			&self.pipeline.stats(),
			&self.cache.stats(),
			pool_stats.as_ref(),
		)
	}

	pub fn audit_log(&self) -> Arc<dyn AuditStore> {
		self.audit.clone()
	}

	pub fn merge_ledger(&self) -> Arc<dyn MergeLedger> {
		self.ledger.clone()
	}

	pub fn decision_log(&self) -> Arc<dyn repo::DecisionRepo> {
		self.repos.decisions.clone()
	}
}
