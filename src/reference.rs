//! Merge-stable entity references.
//!
//! An `EntityReference` carries the original `(id, type)` it was issued for
//! and re-resolves the current canonical id on every dereference by walking
//! the `MERGED_INTO` chain. It never caches a resolved id across a merge.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{ResolveError, StoreError};
use crate::model::{Entity, EntityStatus};
use crate::repo::EntityRepo;

/// `MERGED_INTO` is a DAG by invariant; anything deeper than this is treated
/// as corruption rather than walked forever.
const MAX_CHAIN_DEPTH: usize = 64;

/// Walk the `MERGED_INTO` chain from `original` to the terminal ACTIVE id.
/// Surfaces NOT_FOUND for an unknown starting id and a store error for a
/// chain that ends anywhere other than an ACTIVE entity.
pub(crate) async fn canonical_id_of(
	entities: &Arc<dyn EntityRepo>,
	original: Uuid,
) -> Result<Uuid, ResolveError> {
	if entities.find_by_id(original).await?.is_none() {
		return Err(ResolveError::not_found("entity", original));
	}

	let mut current = original;
	for _ in 0..MAX_CHAIN_DEPTH {
		match entities.merged_into(current).await? {
			Some(next) => current = next,
			None => {
				let entity = entities
					.find_by_id(current)
					.await?
					.ok_or(StoreError::CorruptedMergeChain(current))?;
				if entity.status != EntityStatus::Active {
					return Err(StoreError::CorruptedMergeChain(current).into());
				}
				return Ok(current);
			}
		}
	}
	Err(StoreError::CorruptedMergeChain(original).into())
}

#[derive(Clone)]
pub struct EntityReference {
	original_id: Uuid,
	entity_type: String,
	entities: Arc<dyn EntityRepo>,
}

impl EntityReference {
	pub fn new(original_id: Uuid, entity_type: impl Into<String>, entities: Arc<dyn EntityRepo>) -> Self {
		Self {
			original_id,
			entity_type: entity_type.into(),
			entities,
		}
	}

	pub fn original_id(&self) -> Uuid {
		self.original_id
	}

	pub fn entity_type(&self) -> &str {
		&self.entity_type
	}

	/// Walk the merge chain and return the terminal ACTIVE id. A chain that
	/// ends at a non-ACTIVE entity or exceeds the depth bound surfaces a
	/// store error.
	pub async fn current_id(&self) -> Result<Uuid, ResolveError> {
		canonical_id_of(&self.entities, self.original_id).await
	}

	/// The current canonical entity.
	pub async fn current(&self) -> Result<Entity, ResolveError> {
		let id = self.current_id().await?;
		self.entities
			.find_by_id(id)
			.await?
			.ok_or_else(|| ResolveError::not_found("entity", id))
	}

	/// Whether the originally referenced entity has since been merged away.
	pub async fn was_merged(&self) -> Result<bool, ResolveError> {
		Ok(self.current_id().await? != self.original_id)
	}
}

impl fmt::Debug for EntityReference {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EntityReference")
			.field("original_id", &self.original_id)
			.field("entity_type", &self.entity_type)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::repo::memory::MemoryGraph;

	#[tokio::test]
	async fn unmerged_reference_resolves_to_itself() {
		let g = MemoryGraph::new();
		let e = Entity::new("Acme", "acme", "COMPANY", 1.0);
		EntityRepo::create(&g, &e).await.unwrap();

		let entities: Arc<dyn EntityRepo> = Arc::new(g);
		let r = EntityReference::new(e.id, "COMPANY", entities);
		assert_eq!(r.current_id().await.unwrap(), e.id);
		assert!(!r.was_merged().await.unwrap());
	}

	#[tokio::test]
	async fn reference_follows_multi_hop_chain() {
		let g = MemoryGraph::new();
		let a = Entity::new("A Corp", "a", "COMPANY", 1.0);
		let b = Entity::new("B Corp", "b", "COMPANY", 1.0);
		let c = Entity::new("C Corp", "c", "COMPANY", 1.0);
		for e in [&a, &b, &c] {
			EntityRepo::create(&g, e).await.unwrap();
		}
		g.mark_merged(a.id, b.id).await.unwrap();
		g.mark_merged(b.id, c.id).await.unwrap();

		let entities: Arc<dyn EntityRepo> = Arc::new(g);
		let r = EntityReference::new(a.id, "COMPANY", entities);
		assert_eq!(r.current_id().await.unwrap(), c.id);
		assert!(r.was_merged().await.unwrap());
		assert_eq!(r.current().await.unwrap().canonical_name, "C Corp");
	}

	#[tokio::test]
	async fn non_active_terminus_is_corruption() {
		let g = MemoryGraph::new();
		let mut dead_end = Entity::new("Dead End", "dead end", "COMPANY", 1.0);
		dead_end.status = EntityStatus::Merged;
		EntityRepo::create(&g, &dead_end).await.unwrap();

		let entities: Arc<dyn EntityRepo> = Arc::new(g);
		let r = EntityReference::new(dead_end.id, "COMPANY", entities);
		let err = r.current_id().await.unwrap_err();
		assert_eq!(err.kind(), "STORE_ERROR");
	}
}
