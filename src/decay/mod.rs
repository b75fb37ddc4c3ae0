//! Confidence decay: the effective confidence of a synonym decays
//! exponentially with days since last confirmation and is boosted
//! logarithmically by its support count.
//!
//! `effective(s) = clamp[0,1]( confidence * exp(-lambda * days) + boost(k) )`
//! with `boost(k) = min(cap, alpha * ln(1 + k))`.

use chrono::{DateTime, Utc};

use crate::config::DecayConfig;
use crate::model::Synonym;

/// The decay model, parameterized by a `DecayConfig`.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceDecay {
	config: DecayConfig,
}

impl ConfidenceDecay {
	pub fn new(config: DecayConfig) -> Self {
		Self { config }
	}

	/// Reinforcement boost: monotone increasing in the support count with
	/// diminishing returns, capped.
	pub fn boost(&self, support_count: u64) -> f64 {
		let raw = self.config.boost_alpha * (1.0 + support_count as f64).ln();
		raw.min(self.config.boost_cap)
	}

	/// Effective confidence at instant `now`. Clock skew that puts
	/// `last_confirmed_at` in the future counts as zero elapsed days.
	pub fn effective_at(&self, synonym: &Synonym, now: DateTime<Utc>) -> f64 {
		let elapsed_days = (now - synonym.last_confirmed_at)
			.num_seconds()
			.max(0) as f64
			/ 86_400.0;
		let decayed = synonym.confidence * (-self.config.lambda_per_day * elapsed_days).exp();
		(decayed + self.boost(synonym.support_count)).clamp(0.0, 1.0)
	}

	pub fn effective(&self, synonym: &Synonym) -> f64 {
		self.effective_at(synonym, Utc::now())
	}

	/// Confirm the synonym: bump the support count and reset the decay clock.
	pub fn reinforce(&self, synonym: &mut Synonym) {
		synonym.support_count += 1;
		synonym.last_confirmed_at = Utc::now();
	}

	/// Penalize the synonym's stored confidence without touching the support
	/// count.
	pub fn negative_reinforcement(&self, synonym: &mut Synonym, delta: f64) {
		synonym.confidence = (synonym.confidence - delta).max(0.0);
	}

	/// A synonym below the synonym threshold is no longer trusted for
	/// auto-merge and should be re-reviewed.
	pub fn should_trigger_review(&self, synonym: &Synonym, synonym_threshold: f64) -> bool {
		self.effective(synonym) < synonym_threshold
	}

	/// A synonym below the review threshold is stale.
	pub fn is_stale(&self, synonym: &Synonym, review_threshold: f64) -> bool {
		self.effective(synonym) < review_threshold
	}
}

impl Default for ConfidenceDecay {
	fn default() -> Self {
		Self::new(DecayConfig::default())
	}
}
