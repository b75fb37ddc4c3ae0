//! In-memory repository backend: one shared graph of hash maps behind a
//! read-write lock. Contract-equivalent to the Cypher-backed repositories;
//! used by tests and embedded deployments.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{
	BlockingIndex, DecisionRepo, DuplicateRepo, EndpointRewrite, EntityRepo, RelationshipRepo,
	ReviewRepo, SynonymRepo,
};
use crate::error::StoreError;
use crate::model::{
	Duplicate, Entity, EntityStatus, MatchDecision, Relationship, ReviewDecision, ReviewItem,
	ReviewStatus, Synonym,
};

#[derive(Default)]
struct Inner {
	entities: HashMap<Uuid, Entity>,
	merged_into: HashMap<Uuid, Uuid>,
	synonyms: HashMap<Uuid, Synonym>,
	duplicates: HashMap<Uuid, Duplicate>,
	relationships: HashMap<Uuid, Relationship>,
	match_decisions: Vec<MatchDecision>,
	review_decisions: Vec<ReviewDecision>,
	reviews: HashMap<Uuid, ReviewItem>,
	// blocking key value -> linked entity ids
	blocking: HashMap<String, HashSet<Uuid>>,
	entity_keys: HashMap<Uuid, Vec<String>>,
}

/// Shared in-memory graph. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct MemoryGraph {
	inner: Arc<RwLock<Inner>>,
}

impl MemoryGraph {
	pub fn new() -> Self {
		Self::default()
	}

	fn is_visible(entity: &Entity) -> bool {
		entity.status == EntityStatus::Active && entity.deleted_at.is_none()
	}
}

#[async_trait]
impl EntityRepo for MemoryGraph {
	async fn create(&self, entity: &Entity) -> Result<(), StoreError> {
		self.inner.write().entities.insert(entity.id, entity.clone());
		Ok(())
	}

	async fn find_by_id(&self, id: Uuid) -> Result<Option<Entity>, StoreError> {
		Ok(self.inner.read().entities.get(&id).cloned())
	}

	async fn find_active_by_normalized(
		&self,
		normalized_name: &str,
		entity_type: &str,
	) -> Result<Option<Entity>, StoreError> {
		Ok(self
			.inner
			.read()
			.entities
			.values()
			.find(|e| {
				Self::is_visible(e)
					&& e.normalized_name == normalized_name
					&& e.entity_type == entity_type
			})
			.cloned())
	}

	async fn scan_active_by_type(
		&self,
		entity_type: &str,
		limit: usize,
	) -> Result<Vec<Entity>, StoreError> {
		let inner = self.inner.read();
		let mut all: Vec<Entity> = inner
			.entities
			.values()
			.filter(|e| Self::is_visible(e) && e.entity_type == entity_type)
			.cloned()
			.collect();
		all.sort_by_key(|e| e.created_at);
		all.truncate(limit);
		Ok(all)
	}

	async fn mark_merged(&self, source_id: Uuid, target_id: Uuid) -> Result<(), StoreError> {
		let mut inner = self.inner.write();
		let source = inner
			.entities
			.get_mut(&source_id)
			.ok_or_else(|| StoreError::Query(format!("entity {} missing", source_id)))?;
		source.status = EntityStatus::Merged;
		source.updated_at = Utc::now();
		inner.merged_into.insert(source_id, target_id);
		Ok(())
	}

	async fn unmark_merged(&self, source_id: Uuid, target_id: Uuid) -> Result<(), StoreError> {
		let mut inner = self.inner.write();
		if inner.merged_into.get(&source_id) == Some(&target_id) {
			inner.merged_into.remove(&source_id);
		}
		if let Some(source) = inner.entities.get_mut(&source_id) {
			source.status = EntityStatus::Active;
			source.updated_at = Utc::now();
		}
		Ok(())
	}

	async fn merged_into(&self, id: Uuid) -> Result<Option<Uuid>, StoreError> {
		Ok(self.inner.read().merged_into.get(&id).copied())
	}

	async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
		if let Some(e) = self.inner.write().entities.get_mut(&id) {
			e.deleted_at = Some(at);
			e.updated_at = Utc::now();
		}
		Ok(())
	}

	async fn purge_deleted(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
		let mut inner = self.inner.write();
		let doomed: Vec<Uuid> = inner
			.entities
			.values()
			.filter(|e| matches!(e.deleted_at, Some(at) if at <= older_than))
			.map(|e| e.id)
			.collect();

		for id in &doomed {
			inner.entities.remove(id);
			inner.merged_into.remove(id);
			inner.merged_into.retain(|_, target| target != id);
			inner.synonyms.retain(|_, s| s.entity_id != *id);
			inner.duplicates.retain(|_, d| d.entity_id != *id);
			inner
				.relationships
				.retain(|_, r| r.source_entity_id != *id && r.target_entity_id != *id);
			if let Some(keys) = inner.entity_keys.remove(id) {
				for key in keys {
					if let Some(linked) = inner.blocking.get_mut(&key) {
						linked.remove(id);
					}
				}
			}
		}
		Ok(doomed.len() as u64)
	}
}

#[async_trait]
impl SynonymRepo for MemoryGraph {
	async fn create(&self, synonym: &Synonym) -> Result<(), StoreError> {
		self.inner
			.write()
			.synonyms
			.insert(synonym.id, synonym.clone());
		Ok(())
	}

	async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
		self.inner.write().synonyms.remove(&id);
		Ok(())
	}

	async fn find_by_normalized(
		&self,
		normalized_value: &str,
		entity_type: &str,
	) -> Result<Vec<(Synonym, Entity)>, StoreError> {
		let inner = self.inner.read();
		let mut out = Vec::new();
		for synonym in inner.synonyms.values() {
			if synonym.normalized_value != normalized_value {
				continue;
			}
			if let Some(entity) = inner.entities.get(&synonym.entity_id) {
				if Self::is_visible(entity) && entity.entity_type == entity_type {
					out.push((synonym.clone(), entity.clone()));
				}
			}
		}
		out.sort_by_key(|(s, _)| s.created_at);
		Ok(out)
	}

	async fn list_for_entity(&self, entity_id: Uuid) -> Result<Vec<Synonym>, StoreError> {
		let inner = self.inner.read();
		let mut out: Vec<Synonym> = inner
			.synonyms
			.values()
			.filter(|s| s.entity_id == entity_id)
			.cloned()
			.collect();
		out.sort_by_key(|s| s.created_at);
		Ok(out)
	}

	async fn update(&self, synonym: &Synonym) -> Result<(), StoreError> {
		let mut inner = self.inner.write();
		match inner.synonyms.get_mut(&synonym.id) {
			Some(existing) => {
				*existing = synonym.clone();
				Ok(())
			}
			None => Err(StoreError::Query(format!("synonym {} missing", synonym.id))),
		}
	}

	async fn exists_for_entity(
		&self,
		entity_id: Uuid,
		normalized_value: &str,
	) -> Result<bool, StoreError> {
		Ok(self
			.inner
			.read()
			.synonyms
			.values()
			.any(|s| s.entity_id == entity_id && s.normalized_value == normalized_value))
	}
}

#[async_trait]
impl DuplicateRepo for MemoryGraph {
	async fn create(&self, duplicate: &Duplicate) -> Result<(), StoreError> {
		self.inner
			.write()
			.duplicates
			.insert(duplicate.id, duplicate.clone());
		Ok(())
	}

	async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
		self.inner.write().duplicates.remove(&id);
		Ok(())
	}

	async fn list_for_entity(&self, entity_id: Uuid) -> Result<Vec<Duplicate>, StoreError> {
		let inner = self.inner.read();
		let mut out: Vec<Duplicate> = inner
			.duplicates
			.values()
			.filter(|d| d.entity_id == entity_id)
			.cloned()
			.collect();
		out.sort_by_key(|d| d.created_at);
		Ok(out)
	}
}

#[async_trait]
impl RelationshipRepo for MemoryGraph {
	async fn create(&self, relationship: &Relationship) -> Result<(), StoreError> {
		self.inner
			.write()
			.relationships
			.insert(relationship.id, relationship.clone());
		Ok(())
	}

	async fn find_by_id(&self, id: Uuid) -> Result<Option<Relationship>, StoreError> {
		Ok(self.inner.read().relationships.get(&id).cloned())
	}

	async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
		Ok(self.inner.write().relationships.remove(&id).is_some())
	}

	async fn list_for_entity(&self, entity_id: Uuid) -> Result<Vec<Relationship>, StoreError> {
		let inner = self.inner.read();
		let mut out: Vec<Relationship> = inner
			.relationships
			.values()
			.filter(|r| r.source_entity_id == entity_id || r.target_entity_id == entity_id)
			.cloned()
			.collect();
		out.sort_by_key(|r| r.created_at);
		Ok(out)
	}

	async fn rewrite_endpoints(
		&self,
		from: Uuid,
		to: Uuid,
	) -> Result<Vec<EndpointRewrite>, StoreError> {
		let mut inner = self.inner.write();
		let mut rewrites = Vec::new();
		for rel in inner.relationships.values_mut() {
			let touches = rel.source_entity_id == from || rel.target_entity_id == from;
			if !touches {
				continue;
			}
			let rewrite = EndpointRewrite {
				relationship_id: rel.id,
				old_source: rel.source_entity_id,
				old_target: rel.target_entity_id,
				new_source: if rel.source_entity_id == from { to } else { rel.source_entity_id },
				new_target: if rel.target_entity_id == from { to } else { rel.target_entity_id },
			};
			rel.source_entity_id = rewrite.new_source;
			rel.target_entity_id = rewrite.new_target;
			rewrites.push(rewrite);
		}
		Ok(rewrites)
	}

	async fn restore_endpoints(&self, rewrites: &[EndpointRewrite]) -> Result<(), StoreError> {
		let mut inner = self.inner.write();
		for rewrite in rewrites {
			if let Some(rel) = inner.relationships.get_mut(&rewrite.relationship_id) {
				rel.source_entity_id = rewrite.old_source;
				rel.target_entity_id = rewrite.old_target;
			}
		}
		Ok(())
	}
}

#[async_trait]
impl DecisionRepo for MemoryGraph {
	async fn record_match(&self, decision: &MatchDecision) -> Result<(), StoreError> {
		self.inner.write().match_decisions.push(decision.clone());
		Ok(())
	}

	async fn find_match(&self, id: Uuid) -> Result<Option<MatchDecision>, StoreError> {
		Ok(self
			.inner
			.read()
			.match_decisions
			.iter()
			.find(|d| d.id == id)
			.cloned())
	}

	async fn list_matches(&self) -> Result<Vec<MatchDecision>, StoreError> {
		Ok(self.inner.read().match_decisions.clone())
	}

	async fn record_review_decision(&self, decision: &ReviewDecision) -> Result<(), StoreError> {
		self.inner.write().review_decisions.push(decision.clone());
		Ok(())
	}

	async fn list_review_decisions(&self) -> Result<Vec<ReviewDecision>, StoreError> {
		Ok(self.inner.read().review_decisions.clone())
	}
}

#[async_trait]
impl ReviewRepo for MemoryGraph {
	async fn create(&self, item: &ReviewItem) -> Result<(), StoreError> {
		self.inner.write().reviews.insert(item.id, item.clone());
		Ok(())
	}

	async fn find_by_id(&self, id: Uuid) -> Result<Option<ReviewItem>, StoreError> {
		Ok(self.inner.read().reviews.get(&id).cloned())
	}

	async fn update(&self, item: &ReviewItem) -> Result<(), StoreError> {
		let mut inner = self.inner.write();
		match inner.reviews.get_mut(&item.id) {
			Some(existing) => {
				*existing = item.clone();
				Ok(())
			}
			None => Err(StoreError::Query(format!("review {} missing", item.id))),
		}
	}

	async fn list_pending(&self, limit: usize) -> Result<Vec<ReviewItem>, StoreError> {
		let inner = self.inner.read();
		let mut out: Vec<ReviewItem> = inner
			.reviews
			.values()
			.filter(|r| r.status == ReviewStatus::Pending)
			.cloned()
			.collect();
		out.sort_by_key(|r| r.submitted_at);
		out.truncate(limit);
		Ok(out)
	}
}

#[async_trait]
impl BlockingIndex for MemoryGraph {
	async fn add_keys(&self, entity_id: Uuid, keys: &[String]) -> Result<(), StoreError> {
		let mut inner = self.inner.write();
		for key in keys {
			inner
				.blocking
				.entry(key.clone())
				.or_default()
				.insert(entity_id);
		}
		let stored = inner.entity_keys.entry(entity_id).or_default();
		for key in keys {
			if !stored.contains(key) {
				stored.push(key.clone());
			}
		}
		Ok(())
	}

	async fn candidates(
		&self,
		keys: &[String],
		entity_type: &str,
	) -> Result<Vec<Entity>, StoreError> {
		let inner = self.inner.read();
		let mut seen: HashSet<Uuid> = HashSet::new();
		let mut out = Vec::new();
		for key in keys {
			if let Some(linked) = inner.blocking.get(key) {
				for id in linked {
					if !seen.insert(*id) {
						continue;
					}
					if let Some(entity) = inner.entities.get(id) {
						if Self::is_visible(entity) && entity.entity_type == entity_type {
							out.push(entity.clone());
						}
					}
				}
			}
		}
		out.sort_by_key(|e| e.created_at);
		Ok(out)
	}
}
