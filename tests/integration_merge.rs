//! Merge engine scenarios: committed-merge invariants, compensating
//! rollback, merge-stable references, ledger provenance, and cache
//! invalidation.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use entigraph::audit::{AuditFilter, AuditStore as _, MergeLedger as _};
use entigraph::config::ResolveOptions;
use entigraph::error::StoreError;
use entigraph::model::{AuditAction, Entity, EntityStatus, MatchOutcome};
use entigraph::repo::{DuplicateRepo as _, EndpointRewrite, EntityRepo, RelationshipRepo};
use entigraph::{ResolverConfig, ResolverDeps};
use uuid::Uuid;

use common::{resolver, resolver_from, resolver_with_deps};

#[tokio::test]
async fn committed_merge_satisfies_all_invariants() {
	let (engine, deps) = resolver_with_deps();

	let source = engine.resolve("Globex Corporation", "COMPANY").await.unwrap().entity;
	let target = engine.resolve("Initech", "COMPANY").await.unwrap().entity;
	let third = engine.resolve("Hooli", "COMPANY").await.unwrap().entity;

	// A relationship hanging off the source must be rewritten by the merge.
	engine
		.create_relationship(source.id, third.id, "PARTNER_OF", BTreeMap::new(), "tester")
		.await
		.unwrap();

	let report = engine
		.merge_entities(source.id, target.id, "admin", "confirmed duplicate")
		.await
		.unwrap();
	assert_eq!(report.relationships_rewritten, 1);
	assert!(report.synonym_attached);

	// Source flipped to MERGED; target untouched.
	let source_after = engine.get_entity(source.id).await.unwrap();
	assert_eq!(source_after.status, EntityStatus::Merged);
	assert_eq!(
		engine.get_entity(target.id).await.unwrap().status,
		EntityStatus::Active
	);

	// No library-managed relationship references the source.
	assert!(engine.get_relationships(source.id).await.unwrap().is_empty());
	let rewritten = engine.get_relationships(target.id).await.unwrap();
	assert_eq!(rewritten.len(), 1);
	assert_eq!(rewritten[0].source_entity_id, target.id);

	// The source's name carried over as a synonym; a duplicate record holds
	// the pre-merge identity.
	let synonyms = engine.get_synonyms(target.id).await.unwrap();
	assert!(synonyms.iter().any(|s| s.value == "Globex Corporation"));
	let duplicates = deps.repos.duplicates.list_for_entity(target.id).await.unwrap();
	assert_eq!(duplicates.len(), 1);
	assert_eq!(duplicates[0].original_name, "Globex Corporation");

	// Provenance: a MergeRecord and an ENTITY_MERGED audit entry exist.
	let records = engine.merge_ledger().by_source(source.id).await.unwrap();
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].target_entity_id, target.id);
	let merged_audit = engine
		.audit_log()
		.query(&AuditFilter {
			action: Some(AuditAction::EntityMerged),
			entity_id: Some(target.id),
			..Default::default()
		})
		.await
		.unwrap();
	assert_eq!(merged_audit.len(), 1);

	// Resolving the source's name now lands on the target via its synonym.
	let re_resolved = engine.resolve("Globex Corporation", "COMPANY").await.unwrap();
	assert_eq!(re_resolved.entity.id, target.id);
	assert!(re_resolved.was_matched_via_synonym);
}

#[tokio::test]
async fn reference_survives_merge() {
	let engine = resolver();

	let a = engine.resolve("A Corp", "COMPANY").await.unwrap();
	let b = engine.resolve("B Corp", "COMPANY").await.unwrap();
	let reference = a.reference.clone();
	assert!(!reference.was_merged().await.unwrap());

	engine
		.merge_entities(a.entity.id, b.entity.id, "admin", "administrative merge")
		.await
		.unwrap();

	assert_eq!(reference.current_id().await.unwrap(), b.entity.id);
	assert!(reference.was_merged().await.unwrap());

	// get_canonical_entity follows the same chain.
	let canonical = engine.get_canonical_entity(a.entity.id).await.unwrap();
	assert_eq!(canonical.id, b.entity.id);
}

#[tokio::test]
async fn chained_merges_walk_to_the_terminal_entity() {
	let engine = resolver();

	let a = engine.resolve("Alpha Logistics", "COMPANY").await.unwrap().entity;
	let b = engine.resolve("Beta Logistics", "COMPANY").await.unwrap().entity;
	let c = engine.resolve("Gamma Logistics", "COMPANY").await.unwrap().entity;

	engine.merge_entities(a.id, b.id, "admin", "dedupe").await.unwrap();
	engine.merge_entities(b.id, c.id, "admin", "dedupe").await.unwrap();

	assert_eq!(engine.get_canonical_entity(a.id).await.unwrap().id, c.id);

	// The ledger reconstructs the full chain from any member.
	let chain = engine.merge_ledger().chain_for(a.id).await.unwrap();
	assert_eq!(chain.len(), 2);
	let chain = engine.merge_ledger().chain_for(c.id).await.unwrap();
	assert_eq!(chain.len(), 2);
}

#[tokio::test]
async fn fuzzy_auto_merge_goes_through_the_engine() {
	// Lowered bands make the ~0.75 pair auto-mergeable.
	let options = ResolveOptions {
		auto_merge_threshold: 0.70,
		synonym_threshold: 0.65,
		review_threshold: 0.60,
		..Default::default()
	};
	let (engine, _deps) = resolver_with_deps();

	let seeded = engine.resolve("Acme Systems", "COMPANY").await.unwrap().entity;
	let result = engine
		.resolve_with("Acme Systemes", "COMPANY", &options)
		.await
		.unwrap();

	assert_eq!(result.decision, MatchOutcome::AutoMerge);
	assert_eq!(result.entity.id, seeded.id);
	assert!(!result.is_new_entity);

	// The input was materialized and merged: a MERGED entity with the
	// input's normalized name exists, and the ledger has the record.
	let records = engine.merge_ledger().by_target(seeded.id).await.unwrap();
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].decision, MatchOutcome::AutoMerge);
	let merged_source = engine.get_entity(records[0].source_entity_id).await.unwrap();
	assert_eq!(merged_source.status, EntityStatus::Merged);
	assert_eq!(merged_source.normalized_name, "acme systemes");
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

/// Relationship repository that fails `rewrite_endpoints` on demand.
struct FailingRewrites {
	inner: Arc<dyn RelationshipRepo>,
	fail: Arc<AtomicBool>,
}

#[async_trait]
impl RelationshipRepo for FailingRewrites {
	async fn create(&self, r: &entigraph::model::Relationship) -> Result<(), StoreError> {
		self.inner.create(r).await
	}

	async fn find_by_id(
		&self,
		id: Uuid,
	) -> Result<Option<entigraph::model::Relationship>, StoreError> {
		self.inner.find_by_id(id).await
	}

	async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
		self.inner.delete(id).await
	}

	async fn list_for_entity(
		&self,
		entity_id: Uuid,
	) -> Result<Vec<entigraph::model::Relationship>, StoreError> {
		self.inner.list_for_entity(entity_id).await
	}

	async fn rewrite_endpoints(
		&self,
		from: Uuid,
		to: Uuid,
	) -> Result<Vec<EndpointRewrite>, StoreError> {
		if self.fail.load(Ordering::SeqCst) {
			return Err(StoreError::Query("injected rewrite failure".to_string()));
		}
		self.inner.rewrite_endpoints(from, to).await
	}

	async fn restore_endpoints(&self, rewrites: &[EndpointRewrite]) -> Result<(), StoreError> {
		self.inner.restore_endpoints(rewrites).await
	}
}

/// Entity repository that fails `mark_merged` on demand.
struct FailingFlip {
	inner: Arc<dyn EntityRepo>,
	fail: Arc<AtomicBool>,
}

#[async_trait]
impl EntityRepo for FailingFlip {
	async fn create(&self, e: &Entity) -> Result<(), StoreError> {
		self.inner.create(e).await
	}

	async fn find_by_id(&self, id: Uuid) -> Result<Option<Entity>, StoreError> {
		self.inner.find_by_id(id).await
	}

	async fn find_active_by_normalized(
		&self,
		normalized_name: &str,
		entity_type: &str,
	) -> Result<Option<Entity>, StoreError> {
		self.inner
			.find_active_by_normalized(normalized_name, entity_type)
			.await
	}

	async fn scan_active_by_type(
		&self,
		entity_type: &str,
		limit: usize,
	) -> Result<Vec<Entity>, StoreError> {
		self.inner.scan_active_by_type(entity_type, limit).await
	}

	async fn mark_merged(&self, source_id: Uuid, target_id: Uuid) -> Result<(), StoreError> {
		if self.fail.load(Ordering::SeqCst) {
			return Err(StoreError::Query("injected flip failure".to_string()));
		}
		self.inner.mark_merged(source_id, target_id).await
	}

	async fn unmark_merged(&self, source_id: Uuid, target_id: Uuid) -> Result<(), StoreError> {
		self.inner.unmark_merged(source_id, target_id).await
	}

	async fn merged_into(&self, id: Uuid) -> Result<Option<Uuid>, StoreError> {
		self.inner.merged_into(id).await
	}

	async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
		self.inner.soft_delete(id, at).await
	}

	async fn purge_deleted(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
		self.inner.purge_deleted(older_than).await
	}
}

#[tokio::test]
async fn rewrite_failure_rolls_back_synonym_and_duplicate() {
	let fail = Arc::new(AtomicBool::new(false));
	let mut deps = ResolverDeps::in_memory();
	deps.repos.relationships = Arc::new(FailingRewrites {
		inner: deps.repos.relationships.clone(),
		fail: fail.clone(),
	});
	let engine = resolver_from(deps.clone(), ResolverConfig::default());

	let source = engine.resolve("Rollback Corp", "COMPANY").await.unwrap().entity;
	let target = engine.resolve("Survivor Corp", "COMPANY").await.unwrap().entity;

	fail.store(true, Ordering::SeqCst);
	let err = engine
		.merge_entities(source.id, target.id, "admin", "should fail")
		.await
		.unwrap_err();
	assert_eq!(err.kind(), "MERGE_ABORTED");

	// All pre-merge conditions hold.
	assert_eq!(
		engine.get_entity(source.id).await.unwrap().status,
		EntityStatus::Active
	);
	assert!(engine.get_synonyms(target.id).await.unwrap().is_empty());
	assert!(
		deps.repos
			.duplicates
			.list_for_entity(target.id)
			.await
			.unwrap()
			.is_empty()
	);
	assert!(engine.merge_ledger().by_source(source.id).await.unwrap().is_empty());

	// The same merge succeeds once the fault clears.
	fail.store(false, Ordering::SeqCst);
	engine
		.merge_entities(source.id, target.id, "admin", "retry")
		.await
		.unwrap();
}

#[tokio::test]
async fn flip_failure_restores_rewritten_relationships() {
	let fail = Arc::new(AtomicBool::new(false));
	let mut deps = ResolverDeps::in_memory();
	deps.repos.entities = Arc::new(FailingFlip {
		inner: deps.repos.entities.clone(),
		fail: fail.clone(),
	});
	let engine = resolver_from(deps.clone(), ResolverConfig::default());

	let source = engine.resolve("Edge Corp", "COMPANY").await.unwrap().entity;
	let target = engine.resolve("Mainline Corp", "COMPANY").await.unwrap().entity;
	let other = engine.resolve("Bystander Corp", "COMPANY").await.unwrap().entity;
	engine
		.create_relationship(source.id, other.id, "SUPPLIES", BTreeMap::new(), "tester")
		.await
		.unwrap();

	fail.store(true, Ordering::SeqCst);
	let err = engine
		.merge_entities(source.id, target.id, "admin", "should fail at flip")
		.await
		.unwrap_err();
	assert_eq!(err.kind(), "MERGE_ABORTED");

	// The step-3 rewrite was compensated: the relationship points at the
	// source again and the target has none.
	let rels = engine.get_relationships(source.id).await.unwrap();
	assert_eq!(rels.len(), 1);
	assert_eq!(rels[0].source_entity_id, source.id);
	assert!(engine.get_relationships(target.id).await.unwrap().is_empty());
	assert_eq!(
		engine.get_entity(source.id).await.unwrap().status,
		EntityStatus::Active
	);
}

#[tokio::test]
async fn cache_entries_for_both_sides_drop_on_merge() {
	let engine = resolver();

	// Populate the cache for both identities.
	let a = engine.resolve("Left Corp", "COMPANY").await.unwrap().entity;
	let b = engine.resolve("Right Corp", "COMPANY").await.unwrap().entity;
	engine.resolve("Left Corp", "COMPANY").await.unwrap();
	engine.resolve("Right Corp", "COMPANY").await.unwrap();

	engine.merge_entities(a.id, b.id, "admin", "dedupe").await.unwrap();

	// A stale cache would hand back the MERGED entity; the listener dropped
	// it, so the resolution goes through the synonym to the target.
	let re_resolved = engine.resolve("Left Corp", "COMPANY").await.unwrap();
	assert_eq!(re_resolved.entity.id, b.id);
	assert_eq!(re_resolved.entity.status, EntityStatus::Active);
}
