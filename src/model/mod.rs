//! Graph data model: the node and edge records persisted by the repositories
//! and the enums they carry. All identifiers are opaque UUIDs; all timestamps
//! are UTC instants. Enum values serialize to the SCREAMING_SNAKE_CASE labels
//! stored on graph nodes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an entity node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityStatus {
	Active,
	Merged,
}

impl fmt::Display for EntityStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			EntityStatus::Active => write!(f, "ACTIVE"),
			EntityStatus::Merged => write!(f, "MERGED"),
		}
	}
}

/// Origin of a synonym attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SynonymSource {
	System,
	Human,
	Llm,
}

impl fmt::Display for SynonymSource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SynonymSource::System => write!(f, "SYSTEM"),
			SynonymSource::Human => write!(f, "HUMAN"),
			SynonymSource::Llm => write!(f, "LLM"),
		}
	}
}

/// Outcome of a resolution decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchOutcome {
	AutoMerge,
	SynonymOnly,
	Review,
	NoMatch,
}

impl fmt::Display for MatchOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			MatchOutcome::AutoMerge => write!(f, "AUTO_MERGE"),
			MatchOutcome::SynonymOnly => write!(f, "SYNONYM_ONLY"),
			MatchOutcome::Review => write!(f, "REVIEW"),
			MatchOutcome::NoMatch => write!(f, "NO_MATCH"),
		}
	}
}

/// Status of a queued review item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
	Pending,
	Approved,
	Rejected,
}

impl fmt::Display for ReviewStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ReviewStatus::Pending => write!(f, "PENDING"),
			ReviewStatus::Approved => write!(f, "APPROVED"),
			ReviewStatus::Rejected => write!(f, "REJECTED"),
		}
	}
}

/// Action taken by a human reviewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewAction {
	Approve,
	Reject,
}

impl fmt::Display for ReviewAction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ReviewAction::Approve => write!(f, "APPROVE"),
			ReviewAction::Reject => write!(f, "REJECT"),
		}
	}
}

/// Actions recorded in the append-only audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
	EntityCreated,
	EntityMerged,
	MergeRolledBack,
	SynonymAdded,
	SynonymReinforced,
	SynonymWeakened,
	RelationshipCreated,
	RelationshipDeleted,
	ReviewSubmitted,
	ReviewApproved,
	ReviewRejected,
	EntityPurged,
}

impl fmt::Display for AuditAction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			AuditAction::EntityCreated => "ENTITY_CREATED",
			AuditAction::EntityMerged => "ENTITY_MERGED",
			AuditAction::MergeRolledBack => "MERGE_ROLLED_BACK",
			AuditAction::SynonymAdded => "SYNONYM_ADDED",
			AuditAction::SynonymReinforced => "SYNONYM_REINFORCED",
			AuditAction::SynonymWeakened => "SYNONYM_WEAKENED",
			AuditAction::RelationshipCreated => "RELATIONSHIP_CREATED",
			AuditAction::RelationshipDeleted => "RELATIONSHIP_DELETED",
			AuditAction::ReviewSubmitted => "REVIEW_SUBMITTED",
			AuditAction::ReviewApproved => "REVIEW_APPROVED",
			AuditAction::ReviewRejected => "REVIEW_REJECTED",
			AuditAction::EntityPurged => "ENTITY_PURGED",
		};
		write!(f, "{}", s)
	}
}

/// A canonical (or merged) named entity node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
	pub id: Uuid,
	pub canonical_name: String,
	pub normalized_name: String,
	pub entity_type: String,
	pub confidence_score: f64,
	pub status: EntityStatus,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub deleted_at: Option<DateTime<Utc>>,
}

impl Entity {
	/// Construct a fresh ACTIVE entity for a resolved name.
	pub fn new(
		canonical_name: impl Into<String>,
		normalized_name: impl Into<String>,
		entity_type: impl Into<String>,
		confidence_score: f64,
	) -> Self {
		let now = Utc::now();
		Self {
			id: Uuid::new_v4(),
			canonical_name: canonical_name.into(),
			normalized_name: normalized_name.into(),
			entity_type: entity_type.into(),
			confidence_score,
			status: EntityStatus::Active,
			created_at: now,
			updated_at: now,
			deleted_at: None,
		}
	}

	pub fn is_active(&self) -> bool {
		self.status == EntityStatus::Active && self.deleted_at.is_none()
	}
}

/// An alternative surface form attached to exactly one ACTIVE entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Synonym {
	pub id: Uuid,
	pub value: String,
	pub normalized_value: String,
	pub source: SynonymSource,
	pub confidence: f64,
	pub support_count: u64,
	pub created_at: DateTime<Utc>,
	pub last_confirmed_at: DateTime<Utc>,
	pub entity_id: Uuid,
}

impl Synonym {
	pub fn new(
		value: impl Into<String>,
		normalized_value: impl Into<String>,
		source: SynonymSource,
		confidence: f64,
		entity_id: Uuid,
	) -> Self {
		let now = Utc::now();
		Self {
			id: Uuid::new_v4(),
			value: value.into(),
			normalized_value: normalized_value.into(),
			source,
			confidence,
			support_count: 0,
			created_at: now,
			last_confirmed_at: now,
			entity_id,
		}
	}
}

/// Pre-merge identity of a merged entity's source name, preserved for
/// provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Duplicate {
	pub id: Uuid,
	pub original_name: String,
	pub normalized_name: String,
	pub source_system: Option<String>,
	pub created_at: DateTime<Utc>,
	pub entity_id: Uuid,
}

/// A library-managed relationship between two entities of the same tenant.
/// Endpoints are rewritten to the canonical entity on merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
	pub id: Uuid,
	pub source_entity_id: Uuid,
	pub target_entity_id: Uuid,
	pub rel_type: String,
	pub properties: BTreeMap<String, serde_json::Value>,
	pub created_at: DateTime<Utc>,
	pub created_by: String,
}

/// Immutable provenance node for an automated match decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchDecision {
	pub id: Uuid,
	pub input_entity_temp_id: Uuid,
	pub candidate_entity_id: Option<Uuid>,
	pub entity_type: String,
	pub levenshtein_score: f64,
	pub jaro_winkler_score: f64,
	pub jaccard_score: f64,
	pub final_score: f64,
	pub auto_merge_threshold: f64,
	pub synonym_threshold: f64,
	pub review_threshold: f64,
	pub outcome: MatchOutcome,
	pub evaluator: String,
	pub timestamp: DateTime<Utc>,
}

/// Immutable record of a human decision, linked to its originating
/// MatchDecision via `RESULTED_IN`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewDecision {
	pub id: Uuid,
	pub review_id: Uuid,
	pub action: ReviewAction,
	pub reviewer_id: String,
	pub rationale: Option<String>,
	pub decided_at: DateTime<Utc>,
	pub match_decision_id: Option<Uuid>,
}

/// A queued human-review pairing of a source entity and its best candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
	pub id: Uuid,
	pub source_entity_id: Uuid,
	pub candidate_entity_id: Uuid,
	pub source_entity_name: String,
	pub candidate_entity_name: String,
	pub entity_type: String,
	pub similarity_score: f64,
	pub status: ReviewStatus,
	pub submitted_at: DateTime<Utc>,
	pub reviewed_at: Option<DateTime<Utc>>,
	pub reviewer_id: Option<String>,
	pub notes: Option<String>,
	pub match_decision_id: Option<Uuid>,
}

/// Append-only merge provenance record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRecord {
	pub id: Uuid,
	pub source_entity_id: Uuid,
	pub target_entity_id: Uuid,
	pub source_entity_name: String,
	pub target_entity_name: String,
	pub confidence_score: f64,
	pub decision: MatchOutcome,
	pub triggered_by: String,
	pub reasoning: String,
	pub timestamp: DateTime<Utc>,
}

/// Append-only audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
	pub id: Uuid,
	pub action: AuditAction,
	pub entity_id: Uuid,
	pub actor_id: String,
	pub details: BTreeMap<String, serde_json::Value>,
	pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
	pub fn new(
		action: AuditAction,
		entity_id: Uuid,
		actor_id: impl Into<String>,
		details: BTreeMap<String, serde_json::Value>,
	) -> Self {
		Self {
			id: Uuid::new_v4(),
			action,
			entity_id,
			actor_id: actor_id.into(),
			details,
			timestamp: Utc::now(),
		}
	}
}
