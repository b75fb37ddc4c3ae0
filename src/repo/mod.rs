//! Repositories: CRUD and traversal over the graph model.
//!
//! Each repository is a narrow capability trait with two contract-equivalent
//! implementations: Cypher-backed over the [`GraphStore`](crate::store::GraphStore)
//! contract (`graph`) and in-memory (`memory`). The in-memory variant backs
//! unit and integration tests and any embedded deployment that does not need
//! a shared store.

pub mod graph;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
	Duplicate, Entity, MatchDecision, Relationship, ReviewDecision, ReviewItem, Synonym,
};

/// Captured endpoint state of a rewritten relationship, kept so a failed
/// merge can restore the prior wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointRewrite {
	pub relationship_id: Uuid,
	pub old_source: Uuid,
	pub old_target: Uuid,
	pub new_source: Uuid,
	pub new_target: Uuid,
}

#[async_trait]
pub trait EntityRepo: Send + Sync {
	async fn create(&self, entity: &Entity) -> Result<(), StoreError>;

	async fn find_by_id(&self, id: Uuid) -> Result<Option<Entity>, StoreError>;

	/// The unique ACTIVE, non-deleted entity for a `(normalizedName, type)`
	/// pair, if any.
	async fn find_active_by_normalized(
		&self,
		normalized_name: &str,
		entity_type: &str,
	) -> Result<Option<Entity>, StoreError>;

	/// Bounded full scan of ACTIVE entities of a type; the cold-index
	/// fallback for candidate narrowing.
	async fn scan_active_by_type(
		&self,
		entity_type: &str,
		limit: usize,
	) -> Result<Vec<Entity>, StoreError>;

	/// Flip the source to MERGED and create its `MERGED_INTO` edge.
	async fn mark_merged(&self, source_id: Uuid, target_id: Uuid) -> Result<(), StoreError>;

	/// Compensation for `mark_merged`: revert to ACTIVE and drop the edge.
	async fn unmark_merged(&self, source_id: Uuid, target_id: Uuid) -> Result<(), StoreError>;

	/// One hop along the `MERGED_INTO` chain.
	async fn merged_into(&self, id: Uuid) -> Result<Option<Uuid>, StoreError>;

	async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

	/// Retention sweep: hard-delete soft-deleted entities older than the
	/// cutoff together with their incident edges. Returns the purge count.
	async fn purge_deleted(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait SynonymRepo: Send + Sync {
	async fn create(&self, synonym: &Synonym) -> Result<(), StoreError>;

	async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

	/// Synonyms matching a normalized value, paired with their ACTIVE,
	/// type-matching entity.
	async fn find_by_normalized(
		&self,
		normalized_value: &str,
		entity_type: &str,
	) -> Result<Vec<(Synonym, Entity)>, StoreError>;

	async fn list_for_entity(&self, entity_id: Uuid) -> Result<Vec<Synonym>, StoreError>;

	/// Persist mutated confidence/support/confirmation fields.
	async fn update(&self, synonym: &Synonym) -> Result<(), StoreError>;

	async fn exists_for_entity(
		&self,
		entity_id: Uuid,
		normalized_value: &str,
	) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait DuplicateRepo: Send + Sync {
	async fn create(&self, duplicate: &Duplicate) -> Result<(), StoreError>;

	async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

	async fn list_for_entity(&self, entity_id: Uuid) -> Result<Vec<Duplicate>, StoreError>;
}

#[async_trait]
pub trait RelationshipRepo: Send + Sync {
	async fn create(&self, relationship: &Relationship) -> Result<(), StoreError>;

	async fn find_by_id(&self, id: Uuid) -> Result<Option<Relationship>, StoreError>;

	async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

	/// Relationships with either endpoint at the given entity.
	async fn list_for_entity(&self, entity_id: Uuid) -> Result<Vec<Relationship>, StoreError>;

	/// Rewrite every endpoint at `from` to `to`, returning the captured
	/// prior wiring for compensation.
	async fn rewrite_endpoints(
		&self,
		from: Uuid,
		to: Uuid,
	) -> Result<Vec<EndpointRewrite>, StoreError>;

	/// Compensation for `rewrite_endpoints`.
	async fn restore_endpoints(&self, rewrites: &[EndpointRewrite]) -> Result<(), StoreError>;
}

#[async_trait]
pub trait DecisionRepo: Send + Sync {
	async fn record_match(&self, decision: &MatchDecision) -> Result<(), StoreError>;

	async fn find_match(&self, id: Uuid) -> Result<Option<MatchDecision>, StoreError>;

	async fn list_matches(&self) -> Result<Vec<MatchDecision>, StoreError>;

	/// Record a human decision, linked `RESULTED_IN` from its originating
	/// match decision when one exists.
	async fn record_review_decision(&self, decision: &ReviewDecision) -> Result<(), StoreError>;

	async fn list_review_decisions(&self) -> Result<Vec<ReviewDecision>, StoreError>;
}

#[async_trait]
pub trait ReviewRepo: Send + Sync {
	async fn create(&self, item: &ReviewItem) -> Result<(), StoreError>;

	async fn find_by_id(&self, id: Uuid) -> Result<Option<ReviewItem>, StoreError>;

	async fn update(&self, item: &ReviewItem) -> Result<(), StoreError>;

	async fn list_pending(&self, limit: usize) -> Result<Vec<ReviewItem>, StoreError>;
}

#[async_trait]
pub trait BlockingIndex: Send + Sync {
	/// Persist the keys (MERGE semantics: key nodes are shared) and link the
	/// entity to each.
	async fn add_keys(&self, entity_id: Uuid, keys: &[String]) -> Result<(), StoreError>;

	/// Distinct ACTIVE entities of the type reachable from any of the keys.
	async fn candidates(
		&self,
		keys: &[String],
		entity_type: &str,
	) -> Result<Vec<Entity>, StoreError>;
}

/// Bundle of repository handles wired into the pipeline, merge engine, and
/// review service.
#[derive(Clone)]
pub struct Repositories {
	pub entities: Arc<dyn EntityRepo>,
	pub synonyms: Arc<dyn SynonymRepo>,
	pub duplicates: Arc<dyn DuplicateRepo>,
	pub relationships: Arc<dyn RelationshipRepo>,
	pub decisions: Arc<dyn DecisionRepo>,
	pub reviews: Arc<dyn ReviewRepo>,
	pub blocking: Arc<dyn BlockingIndex>,
}

impl Repositories {
	/// In-memory backend: one shared graph behind every repository handle.
	pub fn in_memory() -> Self {
		let g = memory::MemoryGraph::new();
		Self {
			entities: Arc::new(g.clone()),
			synonyms: Arc::new(g.clone()),
			duplicates: Arc::new(g.clone()),
			relationships: Arc::new(g.clone()),
			decisions: Arc::new(g.clone()),
			reviews: Arc::new(g.clone()),
			blocking: Arc::new(g),
		}
	}

	/// Cypher-backed repositories sharing one store pool.
	pub fn graph_backed(pool: Arc<crate::store::pool::StorePool>) -> Self {
		let g = graph::GraphRepositories::new(pool);
		Self {
			entities: Arc::new(g.clone()),
			synonyms: Arc::new(g.clone()),
			duplicates: Arc::new(g.clone()),
			relationships: Arc::new(g.clone()),
			decisions: Arc::new(g.clone()),
			reviews: Arc::new(g.clone()),
			blocking: Arc::new(g),
		}
	}
}
