//! Human review of borderline matches.
//!
//! Approving a review merges the provisional source entity into the
//! candidate through the merge engine and reinforces every synonym of the
//! target; rejecting applies negative reinforcement to the candidate's
//! synonyms. Both record an immutable ReviewDecision linked to the
//! originating MatchDecision, and both require the item to still be PENDING.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use log::warn;
use serde::Deserialize;
use uuid::Uuid;

use crate::audit::{AuditStore, record_quiet};
use crate::decay::ConfidenceDecay;
use crate::error::ResolveError;
use crate::merge::{MergeEngine, MergeRequest};
use crate::model::{
	AuditAction, AuditEntry, MatchOutcome, ReviewAction, ReviewDecision, ReviewItem, ReviewStatus,
	Synonym, SynonymSource,
};
use crate::normalize::NormalizationEngine;
use crate::reference::canonical_id_of;
use crate::repo::{
	DecisionRepo as _, EntityRepo as _, Repositories, ReviewRepo as _, SynonymRepo as _,
};

/// Confidence penalty applied to a candidate's synonyms on rejection.
const REJECTION_PENALTY: f64 = 0.05;

/// Stored confidence for synonyms suggested by an LLM and persisted on
/// approval.
const LLM_SYNONYM_CONFIDENCE: f64 = 0.7;

/// LLM enrichment payload the pipeline stashes in review notes.
#[derive(Deserialize)]
struct ReviewNotes {
	#[serde(default)]
	suggested_synonyms: Vec<String>,
}

pub struct ReviewService {
	repos: Repositories,
	audit: Arc<dyn AuditStore>,
	merge_engine: Arc<MergeEngine>,
	decay: ConfidenceDecay,
	normalizer: NormalizationEngine,
}

impl ReviewService {
	pub fn new(
		repos: Repositories,
		audit: Arc<dyn AuditStore>,
		merge_engine: Arc<MergeEngine>,
		decay: ConfidenceDecay,
		normalizer: NormalizationEngine,
	) -> Self {
		Self {
			repos,
			audit,
			merge_engine,
			decay,
			normalizer,
		}
	}

	pub async fn pending(&self, limit: usize) -> Result<Vec<ReviewItem>, ResolveError> {
		Ok(self.repos.reviews.list_pending(limit).await?)
	}

	async fn load_pending(&self, review_id: Uuid) -> Result<ReviewItem, ResolveError> {
		let item = self
			.repos
			.reviews
			.find_by_id(review_id)
			.await?
			.ok_or_else(|| ResolveError::not_found("review", review_id))?;
		if item.status != ReviewStatus::Pending {
			return Err(ResolveError::ReviewStateInvalid {
				id: review_id,
				status: item.status,
			});
		}
		Ok(item)
	}

	/// Approve: the pair is the same entity. Merges the provisional source
	/// into the candidate's canonical entity, reinforces the target's
	/// synonyms, and persists any LLM-suggested synonyms from the item notes.
	pub async fn approve(
		&self,
		review_id: Uuid,
		reviewer_id: &str,
		rationale: Option<String>,
	) -> Result<ReviewItem, ResolveError> {
		let mut item = self.load_pending(review_id).await?;
		let target_id = canonical_id_of(&self.repos.entities, item.candidate_entity_id).await?;

		let source = self.repos.entities.find_by_id(item.source_entity_id).await?;
		match source.filter(|s| s.is_active() && s.id != target_id) {
			Some(source) => {
				self.merge_engine
					.merge(&MergeRequest {
						source_id: source.id,
						target_id,
						confidence_score: item.similarity_score,
						decision: MatchOutcome::Review,
						triggered_by: reviewer_id.to_string(),
						reasoning: rationale
							.clone()
							.unwrap_or_else(|| "approved by review".to_string()),
						source_system: None,
					})
					.await?;
			}
			None => {
				// Pending-entity policy: no provisional entity was created,
				// so the approved pairing lands as a synonym of the target.
				self.attach_synonym(
					target_id,
					&item.source_entity_name,
					&item.entity_type,
					SynonymSource::Human,
					item.similarity_score,
				)
				.await?;
			}
		}

		// Approval confirms the target's aliases.
		let synonyms = self.repos.synonyms.list_for_entity(target_id).await?;
		for mut synonym in synonyms {
			self.decay.reinforce(&mut synonym);
			self.repos.synonyms.update(&synonym).await?;
		}

		if let Some(notes) = &item.notes {
			self.persist_suggested_synonyms(target_id, &item.entity_type, notes)
				.await;
		}

		item.status = ReviewStatus::Approved;
		item.reviewed_at = Some(Utc::now());
		item.reviewer_id = Some(reviewer_id.to_string());
		self.repos.reviews.update(&item).await?;

		self.record_decision(&item, ReviewAction::Approve, reviewer_id, rationale)
			.await?;
		record_quiet(
			&self.audit,
			AuditEntry::new(
				AuditAction::ReviewApproved,
				target_id,
				reviewer_id,
				review_details(&item),
			),
		)
		.await;

		Ok(item)
	}

	/// Reject: the pair is not the same entity. Penalizes the candidate's
	/// synonyms without touching their support counts.
	pub async fn reject(
		&self,
		review_id: Uuid,
		reviewer_id: &str,
		rationale: Option<String>,
	) -> Result<ReviewItem, ResolveError> {
		let mut item = self.load_pending(review_id).await?;
		let target_id = canonical_id_of(&self.repos.entities, item.candidate_entity_id).await?;

		let synonyms = self.repos.synonyms.list_for_entity(target_id).await?;
		for mut synonym in synonyms {
			self.decay.negative_reinforcement(&mut synonym, REJECTION_PENALTY);
			self.repos.synonyms.update(&synonym).await?;
		}

		item.status = ReviewStatus::Rejected;
		item.reviewed_at = Some(Utc::now());
		item.reviewer_id = Some(reviewer_id.to_string());
		self.repos.reviews.update(&item).await?;

		self.record_decision(&item, ReviewAction::Reject, reviewer_id, rationale)
			.await?;
		record_quiet(
			&self.audit,
			AuditEntry::new(
				AuditAction::ReviewRejected,
				target_id,
				reviewer_id,
				review_details(&item),
			),
		)
		.await;

		Ok(item)
	}

	async fn record_decision(
		&self,
		item: &ReviewItem,
		action: ReviewAction,
		reviewer_id: &str,
		rationale: Option<String>,
	) -> Result<(), ResolveError> {
		let decision = ReviewDecision {
			id: Uuid::new_v4(),
			review_id: item.id,
			action,
			reviewer_id: reviewer_id.to_string(),
			rationale,
			decided_at: Utc::now(),
			match_decision_id: item.match_decision_id,
		};
		self.repos.decisions.record_review_decision(&decision).await?;
		Ok(())
	}

	async fn attach_synonym(
		&self,
		entity_id: Uuid,
		value: &str,
		entity_type: &str,
		source: SynonymSource,
		confidence: f64,
	) -> Result<bool, ResolveError> {
		let normalized = self.normalizer.normalize(value, entity_type);
		if normalized.is_empty()
			|| self
				.repos
				.synonyms
				.exists_for_entity(entity_id, &normalized)
				.await?
		{
			return Ok(false);
		}
		let synonym = Synonym::new(value, normalized, source, confidence.clamp(0.0, 1.0), entity_id);
		self.repos.synonyms.create(&synonym).await?;
		Ok(true)
	}

	/// Persist LLM-suggested synonyms stashed in review notes. Best effort:
	/// unparsable notes or individual failures are logged and skipped.
	async fn persist_suggested_synonyms(&self, entity_id: Uuid, entity_type: &str, notes: &str) {
		let parsed: ReviewNotes = match serde_json::from_str(notes) {
			Ok(parsed) => parsed,
			Err(_) => return,
		};
		for value in parsed.suggested_synonyms {
			match self
				.attach_synonym(
					entity_id,
					&value,
					entity_type,
					SynonymSource::Llm,
					LLM_SYNONYM_CONFIDENCE,
				)
				.await
			{
				Ok(true) => {
					record_quiet(
						&self.audit,
						AuditEntry::new(
							AuditAction::SynonymAdded,
							entity_id,
							"llm",
							BTreeMap::from([(
								"value".to_string(),
								serde_json::json!(value),
							)]),
						),
					)
					.await;
				}
				Ok(false) => {}
				Err(e) => warn!("persisting suggested synonym '{}' failed: {}", value, e),
			}
		}
	}
}

fn review_details(item: &ReviewItem) -> BTreeMap<String, serde_json::Value> {
	BTreeMap::from([
		(
			"review_id".to_string(),
			serde_json::json!(item.id.to_string()),
		),
		(
			"source_entity_name".to_string(),
			serde_json::json!(item.source_entity_name),
		),
		(
			"similarity_score".to_string(),
			serde_json::json!(item.similarity_score),
		),
	])
}
