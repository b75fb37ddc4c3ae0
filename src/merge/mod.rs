//! Merge engine: the ordered six-step merge of `source -> target` with a
//! registered compensation per reversible step.
//!
//! Steps run in order; the completed-step list is the compensation log. Any
//! failure rolls the log back in LIFO order (best effort, each compensation
//! failure logged but not fatal to the others) and surfaces `MERGE_ABORTED`.
//! The ledger append carries the rollback evidence and is itself append-only,
//! so it has no compensation; the audit entry never fails the merge.
//!
//! Merges are serialized per target by holding the identity lock on
//! `type:target.normalizedName` for the duration. Listeners (the resolution
//! cache among them) are notified only after the merge commits.

use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::audit::{AuditStore, MergeLedger};
use crate::error::ResolveError;
use crate::lock::IdentityLock;
use crate::model::{
	AuditAction, AuditEntry, Duplicate, Entity, MatchOutcome, MergeRecord, Synonym, SynonymSource,
};
use crate::repo::{
	DuplicateRepo as _, EndpointRewrite, EntityRepo as _, RelationshipRepo as _, Repositories,
	SynonymRepo as _,
};

/// Observer of committed merges.
pub trait MergeListener: Send + Sync {
	fn entities_merged(&self, source_id: Uuid, target_id: Uuid);
}

/// One merge invocation.
#[derive(Debug, Clone)]
pub struct MergeRequest {
	pub source_id: Uuid,
	pub target_id: Uuid,
	pub confidence_score: f64,
	pub decision: MatchOutcome,
	pub triggered_by: String,
	pub reasoning: String,
	pub source_system: Option<String>,
}

/// What a committed merge did.
#[derive(Debug, Clone)]
pub struct MergeReport {
	pub source: Entity,
	pub target: Entity,
	pub merge_record_id: Uuid,
	pub relationships_rewritten: usize,
	pub synonym_attached: bool,
}

/// Compensation log entry: a completed reversible step.
enum CompletedStep {
	SynonymAttached(Uuid),
	DuplicateRecorded(Uuid),
	RelationshipsRewritten(Vec<EndpointRewrite>),
	StatusFlipped { source_id: Uuid, target_id: Uuid },
}

pub struct MergeEngine {
	repos: Repositories,
	ledger: Arc<dyn MergeLedger>,
	audit: Arc<dyn AuditStore>,
	locks: Arc<dyn IdentityLock>,
	listeners: RwLock<Vec<Arc<dyn MergeListener>>>,
	lock_timeout_ms: u64,
}

impl MergeEngine {
	pub fn new(
		repos: Repositories,
		ledger: Arc<dyn MergeLedger>,
		audit: Arc<dyn AuditStore>,
		locks: Arc<dyn IdentityLock>,
		lock_timeout_ms: u64,
	) -> Self {
		Self {
			repos,
			ledger,
			audit,
			locks,
			listeners: RwLock::new(Vec::new()),
			lock_timeout_ms,
		}
	}

	pub fn register_listener(&self, listener: Arc<dyn MergeListener>) {
		self.listeners.write().push(listener);
	}

	/// Merge `source` into `target`. Both must be ACTIVE, distinct, and of
	/// the same type.
	pub async fn merge(&self, request: &MergeRequest) -> Result<MergeReport, ResolveError> {
		if request.source_id == request.target_id {
			return Err(ResolveError::InvalidInput(
				"cannot merge an entity into itself".to_string(),
			));
		}

		let source = self
			.repos
			.entities
			.find_by_id(request.source_id)
			.await?
			.ok_or_else(|| ResolveError::not_found("entity", request.source_id))?;
		let target = self
			.repos
			.entities
			.find_by_id(request.target_id)
			.await?
			.ok_or_else(|| ResolveError::not_found("entity", request.target_id))?;

		if source.entity_type != target.entity_type {
			return Err(ResolveError::InvalidInput(format!(
				"cannot merge across types: {} vs {}",
				source.entity_type, target.entity_type
			)));
		}
		if !source.is_active() || !target.is_active() {
			return Err(ResolveError::InvalidInput(
				"both merge endpoints must be ACTIVE".to_string(),
			));
		}

		let lock_key = format!("{}:{}", target.entity_type, target.normalized_name);
		let guard = self.locks.acquire(&lock_key, self.lock_timeout_ms).await?;
		let outcome = self.run_steps(&source, &target, request).await;
		guard.release().await;

		let report = outcome?;
		for listener in self.listeners.read().iter() {
			listener.entities_merged(source.id, target.id);
		}
		info!(
			"merged {} ({}) into {} ({})",
			source.canonical_name, source.id, target.canonical_name, target.id
		);
		Ok(report)
	}

	async fn run_steps(
		&self,
		source: &Entity,
		target: &Entity,
		request: &MergeRequest,
	) -> Result<MergeReport, ResolveError> {
		let mut completed: Vec<CompletedStep> = Vec::with_capacity(4);

		// Step 1: carry the source's canonical name over as a SYSTEM synonym.
		let already_known = match self
			.repos
			.synonyms
			.exists_for_entity(target.id, &source.normalized_name)
			.await
		{
			Ok(known) => known,
			Err(e) => return Err(self.abort(&completed, "attach-synonym", e.to_string()).await),
		};
		let synonym_attached = !already_known;
		if !already_known {
			let synonym = Synonym::new(
				&source.canonical_name,
				&source.normalized_name,
				SynonymSource::System,
				request.confidence_score.clamp(0.0, 1.0),
				target.id,
			);
			if let Err(e) = self.repos.synonyms.create(&synonym).await {
				return Err(self.abort(&completed, "attach-synonym", e.to_string()).await);
			}
			completed.push(CompletedStep::SynonymAttached(synonym.id));
		}

		// Step 2: preserve the pre-merge identity as a Duplicate record.
		let duplicate = Duplicate {
			id: Uuid::new_v4(),
			original_name: source.canonical_name.clone(),
			normalized_name: source.normalized_name.clone(),
			source_system: request.source_system.clone(),
			created_at: Utc::now(),
			entity_id: target.id,
		};
		if let Err(e) = self.repos.duplicates.create(&duplicate).await {
			return Err(self.abort(&completed, "record-duplicate", e.to_string()).await);
		}
		completed.push(CompletedStep::DuplicateRecorded(duplicate.id));

		// Step 3: rewrite library-managed relationships onto the target.
		let rewrites = match self
			.repos
			.relationships
			.rewrite_endpoints(source.id, target.id)
			.await
		{
			Ok(rewrites) => rewrites,
			Err(e) => {
				return Err(self
					.abort(&completed, "rewrite-relationships", e.to_string())
					.await);
			}
		};
		let relationships_rewritten = rewrites.len();
		completed.push(CompletedStep::RelationshipsRewritten(rewrites));

		// Step 4: flip the source to MERGED and wire MERGED_INTO.
		if let Err(e) = self.repos.entities.mark_merged(source.id, target.id).await {
			return Err(self.abort(&completed, "flip-status", e.to_string()).await);
		}
		completed.push(CompletedStep::StatusFlipped {
			source_id: source.id,
			target_id: target.id,
		});

		// Step 5: append the merge record. The ledger holds rollback
		// evidence, so this step has no compensation of its own.
		let record = MergeRecord {
			id: Uuid::new_v4(),
			source_entity_id: source.id,
			target_entity_id: target.id,
			source_entity_name: source.canonical_name.clone(),
			target_entity_name: target.canonical_name.clone(),
			confidence_score: request.confidence_score,
			decision: request.decision,
			triggered_by: request.triggered_by.clone(),
			reasoning: request.reasoning.clone(),
			timestamp: Utc::now(),
		};
		if let Err(e) = self.ledger.append(record.clone()).await {
			return Err(self.abort(&completed, "append-ledger", e.to_string()).await);
		}

		// Step 6: audit trail. Failures are logged, never fatal.
		let mut details = std::collections::BTreeMap::new();
		details.insert(
			"source_entity_id".to_string(),
			serde_json::json!(source.id.to_string()),
		);
		details.insert(
			"source_entity_name".to_string(),
			serde_json::json!(source.canonical_name),
		);
		details.insert(
			"confidence_score".to_string(),
			serde_json::json!(request.confidence_score),
		);
		details.insert("decision".to_string(), serde_json::json!(request.decision));
		let entry = AuditEntry::new(
			AuditAction::EntityMerged,
			target.id,
			&request.triggered_by,
			details,
		);
		if let Err(e) = self.audit.record(entry).await {
			warn!("audit write for merge {} -> {} failed: {}", source.id, target.id, e);
		}

		Ok(MergeReport {
			source: source.clone(),
			target: target.clone(),
			merge_record_id: record.id,
			relationships_rewritten,
			synonym_attached,
		})
	}

	/// Run compensations in LIFO order and build the typed failure.
	async fn abort(
		&self,
		completed: &[CompletedStep],
		failed_step: &'static str,
		cause: String,
	) -> ResolveError {
		warn!(
			"merge aborted at '{}' ({}); compensating {} completed step(s)",
			failed_step,
			cause,
			completed.len()
		);

		for step in completed.iter().rev() {
			let result = match step {
				CompletedStep::SynonymAttached(id) => self.repos.synonyms.delete(*id).await,
				CompletedStep::DuplicateRecorded(id) => self.repos.duplicates.delete(*id).await,
				CompletedStep::RelationshipsRewritten(rewrites) => {
					self.repos.relationships.restore_endpoints(rewrites).await
				}
				CompletedStep::StatusFlipped {
					source_id,
					target_id,
				} => {
					self.repos
						.entities
						.unmark_merged(*source_id, *target_id)
						.await
				}
			};
			if let Err(e) = result {
				warn!("merge compensation failed (continuing): {}", e);
			}
		}

		ResolveError::MergeAborted { failed_step, cause }
	}
}
