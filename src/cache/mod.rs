//! Bounded TTL cache of resolution results.
//!
//! Keyed by `(normalizedName, type)`. A secondary index maps entity ids to
//! the cache keys resolving to them so merge events can invalidate both
//! sides; an eviction hook prunes the index when the LRU bound pushes an
//! entry out. The cache is internally synchronized and may be disabled by
//! swapping in the no-op implementation.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::merge::MergeListener;
use crate::pipeline::ResolutionResult;

/// Cache key: normalized identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
	pub normalized_name: String,
	pub entity_type: String,
}

impl CacheKey {
	pub fn new(normalized_name: impl Into<String>, entity_type: impl Into<String>) -> Self {
		Self {
			normalized_name: normalized_name.into(),
			entity_type: entity_type.into(),
		}
	}
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
	pub hits: u64,
	pub misses: u64,
	pub evictions: u64,
	pub size: usize,
}

pub trait ResolutionCache: Send + Sync {
	fn get(&self, key: &CacheKey) -> Option<ResolutionResult>;

	fn put(&self, key: CacheKey, value: ResolutionResult);

	/// Drop every entry whose result maps to the entity.
	fn invalidate_entity(&self, entity_id: Uuid);

	fn clear(&self);

	fn stats(&self) -> CacheStats;
}

/// Build the configured cache implementation.
pub fn build_cache(config: &CacheConfig) -> Arc<dyn ResolutionCache> {
	if config.enabled {
		Arc::new(TtlResolutionCache::new(config.clone()))
	} else {
		Arc::new(NoopCache)
	}
}

struct CacheEntry {
	result: ResolutionResult,
	entity_id: Uuid,
	inserted: Instant,
}

struct CacheInner {
	map: LruCache<CacheKey, CacheEntry>,
	by_entity: HashMap<Uuid, HashSet<CacheKey>>,
}

impl CacheInner {
	fn unindex(&mut self, entity_id: Uuid, key: &CacheKey) {
		if let Some(keys) = self.by_entity.get_mut(&entity_id) {
			keys.remove(key);
			if keys.is_empty() {
				self.by_entity.remove(&entity_id);
			}
		}
	}
}

/// Bounded LRU with per-entry TTL.
pub struct TtlResolutionCache {
	inner: Mutex<CacheInner>,
	ttl: Duration,
	hits: AtomicU64,
	misses: AtomicU64,
	evictions: AtomicU64,
}

impl TtlResolutionCache {
	pub fn new(config: CacheConfig) -> Self {
		let capacity = NonZeroUsize::new(config.max_entries.max(1)).expect("non-zero capacity");
		Self {
			inner: Mutex::new(CacheInner {
				map: LruCache::new(capacity),
				by_entity: HashMap::new(),
			}),
			ttl: Duration::from_millis(config.ttl_ms),
			hits: AtomicU64::new(0),
			misses: AtomicU64::new(0),
			evictions: AtomicU64::new(0),
		}
	}
}

impl ResolutionCache for TtlResolutionCache {
	fn get(&self, key: &CacheKey) -> Option<ResolutionResult> {
		let mut inner = self.inner.lock();
		let expired = match inner.map.get(key) {
			Some(entry) => entry.inserted.elapsed() > self.ttl,
			None => {
				self.misses.fetch_add(1, Ordering::Relaxed);
				return None;
			}
		};

		if expired {
			if let Some(entry) = inner.map.pop(key) {
				inner.unindex(entry.entity_id, key);
			}
			self.evictions.fetch_add(1, Ordering::Relaxed);
			self.misses.fetch_add(1, Ordering::Relaxed);
			return None;
		}

		self.hits.fetch_add(1, Ordering::Relaxed);
		inner.map.get(key).map(|entry| entry.result.clone())
	}

	fn put(&self, key: CacheKey, value: ResolutionResult) {
		let entity_id = value.entity.id;
		let mut inner = self.inner.lock();

		if let Some(previous) = inner.map.pop(&key) {
			inner.unindex(previous.entity_id, &key);
		}

		let evicted = inner.map.push(
			key.clone(),
			CacheEntry {
				result: value,
				entity_id,
				inserted: Instant::now(),
			},
		);
		// Removal hook: the LRU bound pushed an entry out.
		if let Some((evicted_key, evicted_entry)) = evicted {
			if evicted_key != key {
				inner.unindex(evicted_entry.entity_id, &evicted_key);
				self.evictions.fetch_add(1, Ordering::Relaxed);
			}
		}

		inner.by_entity.entry(entity_id).or_default().insert(key);
	}

	fn invalidate_entity(&self, entity_id: Uuid) {
		let mut inner = self.inner.lock();
		let keys = match inner.by_entity.remove(&entity_id) {
			Some(keys) => keys,
			None => return,
		};
		for key in keys {
			inner.map.pop(&key);
		}
	}

	fn clear(&self) {
		let mut inner = self.inner.lock();
		inner.map.clear();
		inner.by_entity.clear();
	}

	fn stats(&self) -> CacheStats {
		CacheStats {
			hits: self.hits.load(Ordering::Relaxed),
			misses: self.misses.load(Ordering::Relaxed),
			evictions: self.evictions.load(Ordering::Relaxed),
			size: self.inner.lock().map.len(),
		}
	}
}

impl MergeListener for TtlResolutionCache {
	fn entities_merged(&self, source_id: Uuid, target_id: Uuid) {
		self.invalidate_entity(source_id);
		self.invalidate_entity(target_id);
	}
}

/// Merge-listener adapter over any cache implementation: a committed merge
/// invalidates the entries of both endpoints.
pub struct CacheInvalidator(pub Arc<dyn ResolutionCache>);

impl MergeListener for CacheInvalidator {
	fn entities_merged(&self, source_id: Uuid, target_id: Uuid) {
		self.0.invalidate_entity(source_id);
		self.0.invalidate_entity(target_id);
	}
}

/// Disabled cache: every lookup misses, nothing is stored.
pub struct NoopCache;

impl ResolutionCache for NoopCache {
	fn get(&self, _key: &CacheKey) -> Option<ResolutionResult> {
		None
	}

	fn put(&self, _key: CacheKey, _value: ResolutionResult) {}

	fn invalidate_entity(&self, _entity_id: Uuid) {}

	fn clear(&self) {}

	fn stats(&self) -> CacheStats {
		CacheStats {
			hits: 0,
			misses: 0,
			evictions: 0,
			size: 0,
		}
	}
}

impl MergeListener for NoopCache {
	fn entities_merged(&self, _source_id: Uuid, _target_id: Uuid) {}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{Entity, MatchOutcome};
	use crate::reference::EntityReference;
	use crate::repo::EntityRepo;
	use crate::repo::memory::MemoryGraph;

	fn result_for(entity: &Entity) -> ResolutionResult {
		let entities: Arc<dyn EntityRepo> = Arc::new(MemoryGraph::new());
		ResolutionResult {
			entity: entity.clone(),
			is_new_entity: false,
			was_matched_via_synonym: false,
			was_new_synonym_created: false,
			decision: MatchOutcome::AutoMerge,
			score: 1.0,
			input_name: entity.canonical_name.clone(),
			matched_name: Some(entity.canonical_name.clone()),
			reference: EntityReference::new(entity.id, entity.entity_type.clone(), entities),
		}
	}

	fn cache(max_entries: usize, ttl_ms: u64) -> TtlResolutionCache {
		TtlResolutionCache::new(CacheConfig {
			enabled: true,
			max_entries,
			ttl_ms,
		})
	}

	#[test]
	fn hit_miss_and_stats() {
		let c = cache(8, 60_000);
		let entity = Entity::new("Acme", "acme", "COMPANY", 1.0);
		let key = CacheKey::new("acme", "COMPANY");

		assert!(c.get(&key).is_none());
		c.put(key.clone(), result_for(&entity));
		assert_eq!(c.get(&key).unwrap().entity.id, entity.id);

		let stats = c.stats();
		assert_eq!(stats.hits, 1);
		assert_eq!(stats.misses, 1);
		assert_eq!(stats.size, 1);
	}

	#[test]
	fn ttl_expiry_evicts() {
		let c = cache(8, 0);
		let entity = Entity::new("Acme", "acme", "COMPANY", 1.0);
		let key = CacheKey::new("acme", "COMPANY");
		c.put(key.clone(), result_for(&entity));

		std::thread::sleep(Duration::from_millis(5));
		assert!(c.get(&key).is_none());
		let stats = c.stats();
		assert_eq!(stats.evictions, 1);
		assert_eq!(stats.size, 0);
	}

	#[test]
	fn lru_bound_prunes_secondary_index() {
		let c = cache(2, 60_000);
		let e1 = Entity::new("A", "a", "COMPANY", 1.0);
		let e2 = Entity::new("B", "b", "COMPANY", 1.0);
		let e3 = Entity::new("C", "c", "COMPANY", 1.0);
		c.put(CacheKey::new("a", "COMPANY"), result_for(&e1));
		c.put(CacheKey::new("b", "COMPANY"), result_for(&e2));
		c.put(CacheKey::new("c", "COMPANY"), result_for(&e3));

		// "a" was evicted by the bound; invalidating its entity is a no-op
		// and the remaining entries are untouched.
		assert_eq!(c.stats().size, 2);
		assert_eq!(c.stats().evictions, 1);
		c.invalidate_entity(e1.id);
		assert_eq!(c.stats().size, 2);
	}

	#[test]
	fn merge_event_invalidates_both_sides() {
		let c = cache(8, 60_000);
		let source = Entity::new("Src", "src", "COMPANY", 1.0);
		let target = Entity::new("Tgt", "tgt", "COMPANY", 1.0);
		c.put(CacheKey::new("src", "COMPANY"), result_for(&source));
		c.put(CacheKey::new("tgt", "COMPANY"), result_for(&target));

		c.entities_merged(source.id, target.id);
		assert!(c.get(&CacheKey::new("src", "COMPANY")).is_none());
		assert!(c.get(&CacheKey::new("tgt", "COMPANY")).is_none());
	}

	#[test]
	fn overwrite_same_key_reindexes() {
		let c = cache(8, 60_000);
		let old = Entity::new("Old", "name", "COMPANY", 1.0);
		let new = Entity::new("New", "name", "COMPANY", 1.0);
		let key = CacheKey::new("name", "COMPANY");

		c.put(key.clone(), result_for(&old));
		c.put(key.clone(), result_for(&new));
		assert_eq!(c.stats().size, 1);

		// Invalidating the stale entity leaves the fresh entry alone.
		c.invalidate_entity(old.id);
		assert_eq!(c.get(&key).unwrap().entity.id, new.id);

		c.invalidate_entity(new.id);
		assert!(c.get(&key).is_none());
	}

	#[test]
	fn noop_cache_never_stores() {
		let c = NoopCache;
		let entity = Entity::new("Acme", "acme", "COMPANY", 1.0);
		let key = CacheKey::new("acme", "COMPANY");
		c.put(key.clone(), result_for(&entity));
		assert!(c.get(&key).is_none());
		assert_eq!(c.stats().size, 0);
	}
}
