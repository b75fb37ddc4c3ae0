//! Batch context: a scoped buffer for bulk resolution.
//!
//! Dedups case-insensitively within the batch on `(name, type)` so repeated
//! spellings cost one resolution. Relationship creation is deferred until
//! commit and processed in chunks; a failed relationship is recorded and does
//! not abort the rest, since the entity resolutions are already
//! durable. The context enforces `max_batch_size` on new entries only and a
//! soft memory ceiling with a one-shot warning at 80%. A context dropped
//! without commit or abandon auto-commits its deferred relationships.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use log::warn;
use uuid::Uuid;

use crate::audit::{AuditStore, record_quiet};
use crate::config::{BatchConfig, ResolveOptions};
use crate::error::ResolveError;
use crate::model::{AuditAction, AuditEntry, Relationship};
use crate::pipeline::{ResolutionPipeline, ResolutionResult, validate_relationship_type};
use crate::reference::canonical_id_of;
use crate::repo::{RelationshipRepo as _, Repositories};

/// A relationship to create, by entity ids. Endpoints are re-resolved to
/// their canonical entities at creation time, so a merge between deferral
/// and commit cannot dangle.
#[derive(Debug, Clone)]
pub struct RelationshipSpec {
	pub source_entity_id: Uuid,
	pub target_entity_id: Uuid,
	pub rel_type: String,
	pub properties: BTreeMap<String, serde_json::Value>,
	pub created_by: String,
}

/// Create a relationship between the canonical entities of the given
/// endpoints. Shared by the immediate path and the batch commit path.
pub(crate) async fn create_canonical_relationship(
	repos: &Repositories,
	audit: &Arc<dyn AuditStore>,
	spec: &RelationshipSpec,
) -> Result<Relationship, ResolveError> {
	validate_relationship_type(&spec.rel_type)?;

	let source_id = canonical_id_of(&repos.entities, spec.source_entity_id).await?;
	let target_id = canonical_id_of(&repos.entities, spec.target_entity_id).await?;

	let relationship = Relationship {
		id: Uuid::new_v4(),
		source_entity_id: source_id,
		target_entity_id: target_id,
		rel_type: spec.rel_type.clone(),
		properties: spec.properties.clone(),
		created_at: Utc::now(),
		created_by: spec.created_by.clone(),
	};
	repos.relationships.create(&relationship).await?;

	let mut details = BTreeMap::new();
	details.insert(
		"relationship_id".to_string(),
		serde_json::json!(relationship.id.to_string()),
	);
	details.insert("rel_type".to_string(), serde_json::json!(relationship.rel_type));
	details.insert(
		"target_entity_id".to_string(),
		serde_json::json!(target_id.to_string()),
	);
	record_quiet(
		audit,
		AuditEntry::new(
			AuditAction::RelationshipCreated,
			source_id,
			&spec.created_by,
			details,
		),
	)
	.await;

	Ok(relationship)
}

/// Totals reported by a committed batch.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
	pub total_processed: usize,
	pub new_entities_created: usize,
	pub duplicates_found: usize,
	pub relationships_created: usize,
	pub relationship_failures: Vec<String>,
}

/// One in-flight batch. Not shared across tasks; each context is
/// single-threaded by construction.
pub struct BatchContext {
	pipeline: Arc<ResolutionPipeline>,
	repos: Repositories,
	audit: Arc<dyn AuditStore>,
	config: BatchConfig,
	options: ResolveOptions,
	seen: HashMap<(String, String), ResolutionResult>,
	deferred: Vec<RelationshipSpec>,
	total_processed: usize,
	new_entities_created: usize,
	duplicates_found: usize,
	memory_estimate: usize,
	warned_memory: bool,
	finished: bool,
}

impl BatchContext {
	pub(crate) fn new(
		pipeline: Arc<ResolutionPipeline>,
		repos: Repositories,
		audit: Arc<dyn AuditStore>,
		config: BatchConfig,
		options: ResolveOptions,
	) -> Self {
		Self {
			pipeline,
			repos,
			audit,
			config,
			options,
			seen: HashMap::new(),
			deferred: Vec::new(),
			total_processed: 0,
			new_entities_created: 0,
			duplicates_found: 0,
			memory_estimate: 0,
			warned_memory: false,
			finished: false,
		}
	}

	fn dedup_key(name: &str, entity_type: &str) -> (String, String) {
		(name.trim().to_lowercase(), entity_type.to_string())
	}

	fn track_memory(&mut self, bytes: usize) {
		self.memory_estimate += bytes;
		let threshold = self.config.max_batch_memory_bytes * 4 / 5;
		if !self.warned_memory && self.memory_estimate >= threshold {
			self.warned_memory = true;
			warn!(
				"batch memory estimate {}B crossed 80% of the {}B ceiling",
				self.memory_estimate, self.config.max_batch_memory_bytes
			);
		}
	}

	/// Resolve within the batch. Duplicate spellings of an already-resolved
	/// `(name, type)` return the buffered result and bypass the size limit.
	pub async fn resolve(
		&mut self,
		name: &str,
		entity_type: &str,
	) -> Result<ResolutionResult, ResolveError> {
		let key = Self::dedup_key(name, entity_type);
		if let Some(hit) = self.seen.get(&key) {
			self.total_processed += 1;
			self.duplicates_found += 1;
			return Ok(hit.clone());
		}

		if self.seen.len() >= self.config.max_batch_size {
			return Err(ResolveError::BatchSizeExceeded {
				limit: self.config.max_batch_size,
			});
		}

		let result = self.pipeline.resolve(name, entity_type, &self.options).await?;
		self.total_processed += 1;
		if result.is_new_entity {
			self.new_entities_created += 1;
		}
		self.track_memory(
			std::mem::size_of::<ResolutionResult>() + key.0.len() + key.1.len() + name.len(),
		);
		self.seen.insert(key, result.clone());
		Ok(result)
	}

	/// Buffer a relationship for creation at commit time.
	pub fn defer_relationship(&mut self, spec: RelationshipSpec) -> Result<(), ResolveError> {
		validate_relationship_type(&spec.rel_type)?;
		self.track_memory(
			std::mem::size_of::<RelationshipSpec>()
				+ spec.rel_type.len()
				+ spec.properties.len() * 64,
		);
		self.deferred.push(spec);
		Ok(())
	}

	pub fn deferred_count(&self) -> usize {
		self.deferred.len()
	}

	/// Process deferred relationships in chunks and report totals. Each
	/// relationship failure is recorded and does not abort the rest.
	pub async fn commit(mut self) -> Result<BatchResult, ResolveError> {
		self.finished = true;
		let deferred = std::mem::take(&mut self.deferred);

		let mut relationships_created = 0;
		let mut relationship_failures = Vec::new();
		let chunk_size = self.config.commit_chunk_size.max(1);
		for chunk in deferred.chunks(chunk_size) {
			for spec in chunk {
				match create_canonical_relationship(&self.repos, &self.audit, spec).await {
					Ok(_) => relationships_created += 1,
					Err(e) => relationship_failures.push(format!(
						"{} -[{}]-> {}: {}",
						spec.source_entity_id, spec.rel_type, spec.target_entity_id, e
					)),
				}
			}
		}

		Ok(BatchResult {
			total_processed: self.total_processed,
			new_entities_created: self.new_entities_created,
			duplicates_found: self.duplicates_found,
			relationships_created,
			relationship_failures,
		})
	}

	/// Discard the deferred relationship buffer. Entity resolutions already
	/// performed stay durable.
	pub fn abandon(mut self) {
		self.finished = true;
		self.deferred.clear();
	}
}

impl Drop for BatchContext {
	fn drop(&mut self) {
		if self.finished || self.deferred.is_empty() {
			return;
		}
		// Neither committed nor abandoned: auto-commit the deferred buffer.
		warn!(
			"batch context dropped with {} deferred relationship(s); auto-committing",
			self.deferred.len()
		);
		let deferred = std::mem::take(&mut self.deferred);
		let repos = self.repos.clone();
		let audit = self.audit.clone();
		match tokio::runtime::Handle::try_current() {
			Ok(handle) => {
				handle.spawn(async move {
					for spec in deferred {
						if let Err(e) =
							create_canonical_relationship(&repos, &audit, &spec).await
						{
							warn!("auto-commit relationship failed: {}", e);
						}
					}
				});
			}
			Err(_) => warn!("no runtime available; {} deferred relationship(s) lost", deferred.len()),
		}
	}
}
