use thiserror::Error;
use uuid::Uuid;

use crate::model::ReviewStatus;

/// Errors raised by the graph store adapter and its pool.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("query failed: {0}")]
	Query(String),

	#[error("store connection unavailable: {0}")]
	Connection(String),

	#[error("no store handle available within {wait_ms}ms")]
	PoolExhausted { wait_ms: u64 },

	#[error("invalid query parameter '{name}': {reason}")]
	InvalidParameter { name: String, reason: String },

	#[error("merge chain from entity {0} does not terminate at an ACTIVE entity")]
	CorruptedMergeChain(Uuid),
}

/// Public error taxonomy of the resolution core.
///
/// Each variant maps to one error kind of the external contract; `kind()`
/// returns the stable kind string transports key their status mapping on.
#[derive(Debug, Error)]
pub enum ResolveError {
	#[error("invalid input: {0}")]
	InvalidInput(String),

	#[error("could not acquire identity lock '{key}' within {timeout_ms}ms")]
	LockTimeout { key: String, timeout_ms: u64 },

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error("merge aborted at step '{failed_step}': {cause}; compensations applied")]
	MergeAborted {
		failed_step: &'static str,
		cause: String,
	},

	#[error("batch limit of {limit} entries reached; commit and start a new batch")]
	BatchSizeExceeded { limit: usize },

	#[error("LLM provider unavailable: {0}")]
	LlmUnavailable(String),

	#[error("review {id} is not pending (status: {status})")]
	ReviewStateInvalid { id: Uuid, status: ReviewStatus },

	#[error("{kind} not found: {id}")]
	NotFound { kind: &'static str, id: String },
}

impl ResolveError {
	/// Stable kind identifier for transport-level mapping.
	pub fn kind(&self) -> &'static str {
		match self {
			ResolveError::InvalidInput(_) => "INVALID_INPUT",
			ResolveError::LockTimeout { .. } => "LOCK_TIMEOUT",
			ResolveError::Store(StoreError::PoolExhausted { .. }) => "POOL_EXHAUSTED",
			ResolveError::Store(_) => "STORE_ERROR",
			ResolveError::MergeAborted { .. } => "MERGE_ABORTED",
			ResolveError::BatchSizeExceeded { .. } => "BATCH_SIZE_EXCEEDED",
			ResolveError::LlmUnavailable(_) => "LLM_UNAVAILABLE",
			ResolveError::ReviewStateInvalid { .. } => "REVIEW_STATE_INVALID",
			ResolveError::NotFound { .. } => "NOT_FOUND",
		}
	}

	pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
		ResolveError::NotFound {
			kind,
			id: id.to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn kind_strings_are_stable() {
		let e = ResolveError::InvalidInput("blank name".into());
		assert_eq!(e.kind(), "INVALID_INPUT");

		let e = ResolveError::LockTimeout {
			key: "COMPANY:acme".into(),
			timeout_ms: 5000,
		};
		assert_eq!(e.kind(), "LOCK_TIMEOUT");

		let e: ResolveError = StoreError::Query("boom".into()).into();
		assert_eq!(e.kind(), "STORE_ERROR");
	}

	#[test]
	fn store_error_display_carries_context() {
		let e = StoreError::InvalidParameter {
			name: "props".into(),
			reason: "maps are not bindable".into(),
		};
		assert!(e.to_string().contains("props"));
	}
}
