//! End-to-end resolution scenarios against the in-memory backend: exact
//! matching through normalization, synonym lookup, fuzzy decisions, LLM
//! enrichment rules, and input validation.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use entigraph::config::ResolveOptions;
use entigraph::error::ResolveError;
use entigraph::llm::{EnrichmentRequest, EnrichmentResponse, LlmProvider};
use entigraph::model::{MatchOutcome, SynonymSource};
use entigraph::repo::DecisionRepo as _;
use entigraph::{ResolverConfig, ResolverDeps};

use common::{llm_options, resolver, resolver_from, resolver_with_deps};

#[tokio::test]
async fn legal_suffix_variants_resolve_to_one_canonical() {
	let engine = resolver();

	let first = engine.resolve("Tesla, Inc.", "COMPANY").await.unwrap();
	assert!(first.is_new_entity);
	assert_eq!(first.entity.normalized_name, "tesla");

	let second = engine.resolve("Tesla Incorporated", "COMPANY").await.unwrap();
	assert!(!second.is_new_entity);
	assert_eq!(second.entity.id, first.entity.id);
	assert_eq!(second.decision, MatchOutcome::AutoMerge);
	assert_eq!(second.score, 1.0);
	// The distinct raw spelling lands as a SYSTEM synonym.
	assert!(second.was_new_synonym_created);
	let synonyms = engine.get_synonyms(first.entity.id).await.unwrap();
	assert!(synonyms.iter().any(|s| s.value == "Tesla Incorporated"));
}

#[tokio::test]
async fn exact_match_bypasses_the_decision_graph() {
	let (engine, _deps) = resolver_with_deps();

	engine.resolve("Microsoft Corporation", "COMPANY").await.unwrap();
	let decisions_after_seed = engine.decision_log().list_matches().await.unwrap().len();

	let result = engine.resolve("Microsoft Corp.", "COMPANY").await.unwrap();
	assert_eq!(result.decision, MatchOutcome::AutoMerge);
	assert_eq!(result.score, 1.0);
	assert!(!result.is_new_entity);

	// No MatchDecision was persisted for the exact hit.
	let decisions_after = engine.decision_log().list_matches().await.unwrap().len();
	assert_eq!(decisions_after, decisions_after_seed);
}

#[tokio::test]
async fn same_name_different_types_stay_distinct() {
	let engine = resolver();

	let company = engine.resolve("Apple", "COMPANY").await.unwrap();
	let product = engine.resolve("Apple", "PRODUCT").await.unwrap();

	assert_ne!(company.entity.id, product.entity.id);
	assert!(company.is_new_entity);
	assert!(product.is_new_entity);
}

#[tokio::test]
async fn synonym_lookup_resolves_and_reinforces() {
	let engine = resolver();

	let seeded = engine.resolve("Acme Corp", "COMPANY").await.unwrap();
	engine
		.add_synonym(seeded.entity.id, "Acme Holdings", SynonymSource::Human)
		.await
		.unwrap();

	// "Acme Holdings GmbH" normalizes to the synonym's normalized value.
	let result = engine.resolve("Acme Holdings GmbH", "COMPANY").await.unwrap();
	assert!(!result.is_new_entity);
	assert!(result.was_matched_via_synonym);
	assert_eq!(result.entity.id, seeded.entity.id);
	assert_eq!(result.decision, MatchOutcome::AutoMerge);
	assert!(result.score > 0.9, "fresh synonym scores near its confidence");

	// The hit reinforced the synonym.
	let synonyms = engine.get_synonyms(seeded.entity.id).await.unwrap();
	let synonym = synonyms
		.iter()
		.find(|s| s.normalized_value == "acme holdings")
		.unwrap();
	assert_eq!(synonym.support_count, 1);
}

#[tokio::test]
async fn near_duplicate_lands_in_review_band() {
	let engine = resolver();

	let seeded = engine.resolve("Acme Systems", "COMPANY").await.unwrap();
	let result = engine.resolve("Acme Systemes", "COMPANY").await.unwrap();

	assert_eq!(result.decision, MatchOutcome::Review);
	assert!(result.score >= 0.60 && result.score < 0.80, "score {}", result.score);
	// The review policy created a provisional entity for the input.
	assert!(result.is_new_entity);
	assert_ne!(result.entity.id, seeded.entity.id);

	let pending = engine.pending_reviews(10).await.unwrap();
	assert_eq!(pending.len(), 1);
	assert_eq!(pending[0].candidate_entity_id, seeded.entity.id);
	assert_eq!(pending[0].source_entity_id, result.entity.id);
}

#[tokio::test]
async fn review_can_hold_the_entity_pending() {
	let engine = resolver();
	engine.resolve("Acme Systems", "COMPANY").await.unwrap();

	let options = ResolveOptions {
		review_creates_entity: false,
		..Default::default()
	};
	let result = engine
		.resolve_with("Acme Systemes", "COMPANY", &options)
		.await
		.unwrap();

	assert_eq!(result.decision, MatchOutcome::Review);
	assert!(!result.is_new_entity);
	// No provisional entity was created for the input's own identity.
	assert!(engine.find_entity("Acme Systemes", "COMPANY").await.unwrap().is_none());
	let pending = engine.pending_reviews(10).await.unwrap();
	assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn unrelated_name_creates_new_entity() {
	let engine = resolver();
	engine.resolve("Acme Systems", "COMPANY").await.unwrap();

	let result = engine.resolve("Zenith Robotics", "COMPANY").await.unwrap();
	assert_eq!(result.decision, MatchOutcome::NoMatch);
	assert!(result.is_new_entity);
	assert!(result.matched_name.is_none());
}

#[tokio::test]
async fn auto_merge_disabled_caps_at_synonym() {
	// "Acme Systemes" vs "Acme Systems" scores ~0.75 with default weights;
	// lowered thresholds put it in the auto-merge band so the flag's effect
	// is observable.
	let bands = ResolveOptions {
		auto_merge_threshold: 0.70,
		synonym_threshold: 0.65,
		review_threshold: 0.60,
		..Default::default()
	};

	let engine = resolver();
	let seeded = engine.resolve("Acme Systems", "COMPANY").await.unwrap();
	let merged = engine
		.resolve_with("Acme Systemes", "COMPANY", &bands)
		.await
		.unwrap();
	assert_eq!(merged.decision, MatchOutcome::AutoMerge);
	assert_eq!(merged.entity.id, seeded.entity.id);

	// Fresh engine, same bands, auto-merge off: the same score caps at
	// SYNONYM_ONLY.
	let engine = resolver();
	let seeded = engine.resolve("Acme Systems", "COMPANY").await.unwrap();
	let capped = engine
		.resolve_with(
			"Acme Systemes",
			"COMPANY",
			&ResolveOptions {
				auto_merge_enabled: false,
				..bands
			},
		)
		.await
		.unwrap();
	assert_eq!(capped.decision, MatchOutcome::SynonymOnly);
	assert_eq!(capped.entity.id, seeded.entity.id);
	assert!(capped.was_new_synonym_created);
}

#[tokio::test]
async fn validation_rejects_bad_names() {
	let engine = resolver();

	for bad in ["", "   ", "null\u{0000}byte", "semi;colon"] {
		let err = engine.resolve(bad, "COMPANY").await.unwrap_err();
		assert_eq!(err.kind(), "INVALID_INPUT", "input {:?}", bad);
	}

	let too_long = "a".repeat(1001);
	let err = engine.resolve(&too_long, "COMPANY").await.unwrap_err();
	assert_eq!(err.kind(), "INVALID_INPUT");

	let err = engine.resolve("Acme", "no spaces allowed").await.unwrap_err();
	assert_eq!(err.kind(), "INVALID_INPUT");
}

#[tokio::test]
async fn find_entity_is_read_only() {
	let engine = resolver();
	assert!(engine.find_entity("Ghost Corp", "COMPANY").await.unwrap().is_none());

	// The lookup did not create anything.
	let result = engine.resolve("Ghost Corp", "COMPANY").await.unwrap();
	assert!(result.is_new_entity);

	let found = engine.find_entity("Ghost Corporation", "COMPANY").await.unwrap();
	assert_eq!(found.unwrap().id, result.entity.id);
}

// ---------------------------------------------------------------------------
// LLM enrichment rules
// ---------------------------------------------------------------------------

struct StubProvider {
	available: bool,
	are_same: bool,
	confidence: f64,
	suggested: Vec<String>,
}

#[async_trait]
impl LlmProvider for StubProvider {
	async fn enrich(&self, _request: &EnrichmentRequest) -> Result<EnrichmentResponse, ResolveError> {
		Ok(EnrichmentResponse {
			confidence: self.confidence,
			are_same_entity: self.are_same,
			reasoning: "stubbed".to_string(),
			suggested_synonyms: self.suggested.clone(),
			related_entities: Vec::new(),
		})
	}

	async fn is_available(&self) -> bool {
		self.available
	}

	fn provider_name(&self) -> &str {
		"stub"
	}
}

fn engine_with_provider(provider: StubProvider) -> entigraph::EntityResolver {
	let mut deps = ResolverDeps::in_memory();
	deps.llm = Some(Arc::new(provider));
	resolver_from(deps, ResolverConfig::default())
}

#[tokio::test]
async fn llm_same_with_high_confidence_promotes_to_synonym_only() {
	let engine = engine_with_provider(StubProvider {
		available: true,
		are_same: true,
		confidence: 0.95,
		suggested: vec![],
	});

	let seeded = engine.resolve("Acme Systems", "COMPANY").await.unwrap();
	let result = engine
		.resolve_with("Acme Systemes", "COMPANY", &llm_options())
		.await
		.unwrap();

	// Promoted from REVIEW, never to AUTO_MERGE.
	assert_eq!(result.decision, MatchOutcome::SynonymOnly);
	assert!(!result.is_new_entity);
	assert_eq!(result.entity.id, seeded.entity.id);
	assert!(result.was_new_synonym_created);
}

#[tokio::test]
async fn llm_same_with_low_confidence_demands_review() {
	let engine = engine_with_provider(StubProvider {
		available: true,
		are_same: true,
		confidence: 0.5,
		suggested: vec![],
	});

	engine.resolve("Acme Systems", "COMPANY").await.unwrap();
	let result = engine
		.resolve_with("Acme Systemes", "COMPANY", &llm_options())
		.await
		.unwrap();
	assert_eq!(result.decision, MatchOutcome::Review);
}

#[tokio::test]
async fn llm_not_same_retains_fuzzy_outcome() {
	let engine = engine_with_provider(StubProvider {
		available: true,
		are_same: false,
		confidence: 0.99,
		suggested: vec![],
	});

	engine.resolve("Acme Systems", "COMPANY").await.unwrap();
	let result = engine
		.resolve_with("Acme Systemes", "COMPANY", &llm_options())
		.await
		.unwrap();
	// The fuzzy outcome for this pair is REVIEW; the provider's denial
	// leaves it untouched.
	assert_eq!(result.decision, MatchOutcome::Review);
}

#[tokio::test]
async fn unavailable_llm_degrades_to_fuzzy_only() {
	let engine = engine_with_provider(StubProvider {
		available: false,
		are_same: true,
		confidence: 0.99,
		suggested: vec![],
	});

	engine.resolve("Acme Systems", "COMPANY").await.unwrap();
	let result = engine
		.resolve_with("Acme Systemes", "COMPANY", &llm_options())
		.await
		.unwrap();
	assert_eq!(result.decision, MatchOutcome::Review);
}
