use anyhow::Result;
use serde::Deserialize;

use crate::error::ResolveError;

/// Runtime configuration for the resolution engine.
///
/// Values are loaded from (in order): `config` file (optional) and environment
/// variables prefixed with `EGR_` (e.g. `EGR_DATABASE_URL`). Component-level
/// tuning lives in the explicit option records below; `Settings` carries only
/// what bootstrap needs.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct Settings {
	pub database_url: Option<String>,
	pub graph_name: String,
	pub log_level: Option<String>,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			database_url: None,
			graph_name: "entigraph".to_string(),
			log_level: Some("info".to_string()),
		}
	}
}

/// Partial settings used to overlay environment/file values on top of defaults.
#[derive(Debug, Deserialize)]
struct PartialSettings {
	database_url: Option<String>,
	graph_name: Option<String>,
	log_level: Option<String>,
}

/// Load settings from config file (optional) and environment variables.
pub fn load() -> Result<Settings> {
	let builder = config::Config::builder()
		.add_source(config::File::with_name("config").required(false))
		// Double-underscore separator so single-underscore env names like
		// `EGR_DATABASE_URL` map to `database_url` instead of nested keys.
		.add_source(config::Environment::with_prefix("EGR").separator("__"));

	let cfg = builder.build()?;
	let partial: PartialSettings = cfg.try_deserialize()?;

	let mut s = Settings::default();
	if let Some(db) = partial.database_url {
		s.database_url = Some(db);
	}
	if let Some(graph) = partial.graph_name {
		s.graph_name = graph;
	}
	if let Some(level) = partial.log_level {
		s.log_level = Some(level);
	}
	// Direct env vars take precedence; some environments set them in ways
	// the `config` crate does not map as expected.
	if let Ok(db) = std::env::var("EGR_DATABASE_URL") {
		if !db.is_empty() {
			s.database_url = Some(db);
		}
	}
	if let Ok(g) = std::env::var("EGR_GRAPH_NAME") {
		if !g.is_empty() {
			s.graph_name = g;
		}
	}
	if let Ok(l) = std::env::var("EGR_LOG_LEVEL") {
		if !l.is_empty() {
			s.log_level = Some(l);
		}
	}

	Ok(s)
}

/// Per-call resolution options. Construct with `Default` and override fields.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
	pub auto_merge_threshold: f64,
	pub synonym_threshold: f64,
	pub review_threshold: f64,
	pub auto_merge_enabled: bool,
	pub use_llm: bool,
	pub llm_confidence_threshold: f64,
	pub source_system: Option<String>,
	pub lock_timeout_ms: u64,
	/// When a REVIEW outcome fires, create the provisional entity for the
	/// input (the upstream system's observed behavior). When false the
	/// decision and review item are recorded without an entity.
	pub review_creates_entity: bool,
	/// Candidate cap applied to the full-scan fallback when the blocking
	/// index returns nothing.
	pub fallback_scan_limit: usize,
}

impl Default for ResolveOptions {
	fn default() -> Self {
		Self {
			auto_merge_threshold: 0.92,
			synonym_threshold: 0.80,
			review_threshold: 0.60,
			auto_merge_enabled: true,
			use_llm: false,
			llm_confidence_threshold: 0.85,
			source_system: None,
			lock_timeout_ms: 10_000,
			review_creates_entity: true,
			fallback_scan_limit: 1_000,
		}
	}
}

impl ResolveOptions {
	/// Thresholds must be ordered and inside [0,1].
	pub fn validate(&self) -> Result<(), ResolveError> {
		let ordered = 0.0 <= self.review_threshold
			&& self.review_threshold <= self.synonym_threshold
			&& self.synonym_threshold <= self.auto_merge_threshold
			&& self.auto_merge_threshold <= 1.0;
		if !ordered {
			return Err(ResolveError::InvalidInput(format!(
				"thresholds must satisfy 0 <= review ({}) <= synonym ({}) <= auto-merge ({}) <= 1",
				self.review_threshold, self.synonym_threshold, self.auto_merge_threshold
			)));
		}
		if !(0.0..=1.0).contains(&self.llm_confidence_threshold) {
			return Err(ResolveError::InvalidInput(format!(
				"llm_confidence_threshold {} outside [0,1]",
				self.llm_confidence_threshold
			)));
		}
		Ok(())
	}
}

/// Composite scorer weights. Must be non-negative and sum to 1 within 0.001.
#[derive(Debug, Clone, Copy)]
pub struct ScorerWeights {
	pub edit_distance: f64,
	pub prefix_weighted: f64,
	pub token_overlap: f64,
}

impl Default for ScorerWeights {
	fn default() -> Self {
		Self {
			edit_distance: 0.33,
			prefix_weighted: 0.34,
			token_overlap: 0.33,
		}
	}
}

impl ScorerWeights {
	pub fn validate(&self) -> Result<(), ResolveError> {
		if self.edit_distance < 0.0 || self.prefix_weighted < 0.0 || self.token_overlap < 0.0 {
			return Err(ResolveError::InvalidInput(
				"scorer weights must be non-negative".to_string(),
			));
		}
		let sum = self.edit_distance + self.prefix_weighted + self.token_overlap;
		if (sum - 1.0).abs() > 0.001 {
			return Err(ResolveError::InvalidInput(format!(
				"scorer weights must sum to 1 +/- 0.001, got {}",
				sum
			)));
		}
		Ok(())
	}
}

/// Bounded TTL cache tuning.
#[derive(Debug, Clone)]
pub struct CacheConfig {
	pub enabled: bool,
	pub max_entries: usize,
	pub ttl_ms: u64,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			max_entries: 10_000,
			ttl_ms: 300_000,
		}
	}
}

/// Identity lock tuning; `lease_ms` only applies to the graph-backed lock.
#[derive(Debug, Clone)]
pub struct LockConfig {
	pub max_retries: u32,
	pub retry_delay_ms: u64,
	pub lease_ms: u64,
}

impl Default for LockConfig {
	fn default() -> Self {
		Self {
			max_retries: 50,
			retry_delay_ms: 100,
			lease_ms: 30_000,
		}
	}
}

/// Connection pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
	pub max_total: usize,
	pub max_idle: usize,
	pub min_idle: usize,
	pub max_wait_ms: u64,
	pub test_on_borrow: bool,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			max_total: 16,
			max_idle: 8,
			min_idle: 1,
			max_wait_ms: 5_000,
			test_on_borrow: true,
		}
	}
}

/// Batch context guards.
#[derive(Debug, Clone)]
pub struct BatchConfig {
	pub max_batch_size: usize,
	pub max_batch_memory_bytes: usize,
	pub commit_chunk_size: usize,
}

impl Default for BatchConfig {
	fn default() -> Self {
		Self {
			max_batch_size: 10_000,
			max_batch_memory_bytes: 64 * 1024 * 1024,
			commit_chunk_size: 100,
		}
	}
}

/// Confidence decay model parameters.
#[derive(Debug, Clone, Copy)]
pub struct DecayConfig {
	/// Exponential decay rate per day of non-confirmation.
	pub lambda_per_day: f64,
	/// Reinforcement boost coefficient for `alpha * ln(1 + support_count)`.
	pub boost_alpha: f64,
	/// Upper bound on the reinforcement boost.
	pub boost_cap: f64,
}

impl Default for DecayConfig {
	fn default() -> Self {
		Self {
			lambda_per_day: 0.001,
			boost_alpha: 0.05,
			boost_cap: 0.15,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_options_are_valid() {
		ResolveOptions::default().validate().unwrap();
		ScorerWeights::default().validate().unwrap();
	}

	#[test]
	fn unordered_thresholds_rejected() {
		let opts = ResolveOptions {
			review_threshold: 0.9,
			synonym_threshold: 0.8,
			..Default::default()
		};
		assert!(opts.validate().is_err());
	}

	#[test]
	fn weights_must_sum_to_one() {
		let w = ScorerWeights {
			edit_distance: 0.5,
			prefix_weighted: 0.5,
			token_overlap: 0.5,
		};
		assert!(w.validate().is_err());

		let w = ScorerWeights {
			edit_distance: 0.5,
			prefix_weighted: 0.25,
			token_overlap: 0.25,
		};
		w.validate().unwrap();
	}

	#[test]
	fn negative_weight_rejected() {
		let w = ScorerWeights {
			edit_distance: -0.1,
			prefix_weighted: 0.6,
			token_overlap: 0.5,
		};
		assert!(w.validate().is_err());
	}

	#[test]
	fn settings_defaults() {
		// Defaults only; avoid mutating the environment because other tests
		// in this binary run in parallel.
		let d = Settings::default();
		assert_eq!(d.graph_name, "entigraph");
		assert_eq!(d.log_level.as_deref(), Some("info"));
		assert!(d.database_url.is_none());
	}
}
