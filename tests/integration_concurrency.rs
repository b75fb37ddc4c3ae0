//! Concurrency scenarios: exactly-once creation under concurrent identical
//! resolution, and independence of distinct identities.

mod common;

use std::sync::Arc;

use entigraph::config::CacheConfig;
use entigraph::{EntityResolver, ResolverConfig, ResolverDeps};

use common::resolver;

async fn concurrent_identical_resolution(engine: EntityResolver) {
	let engine = Arc::new(engine);

	let tasks: Vec<_> = (0..8)
		.map(|_| {
			let engine = engine.clone();
			tokio::spawn(async move { engine.resolve("NewCo", "COMPANY").await })
		})
		.collect();

	let mut results = Vec::new();
	for task in tasks {
		results.push(task.await.unwrap().unwrap());
	}

	// Exactly one invocation created the entity; everyone observes the same
	// canonical id.
	let created = results.iter().filter(|r| r.is_new_entity).count();
	assert_eq!(created, 1);
	let canonical = results[0].entity.id;
	assert!(results.iter().all(|r| r.entity.id == canonical));
}

#[tokio::test]
async fn identical_resolutions_create_exactly_one_entity() {
	concurrent_identical_resolution(resolver()).await;
}

#[tokio::test]
async fn identical_resolutions_with_cache_disabled() {
	let config = ResolverConfig {
		cache: CacheConfig {
			enabled: false,
			..Default::default()
		},
		..Default::default()
	};
	let engine = EntityResolver::new(ResolverDeps::in_memory(), config).unwrap();
	concurrent_identical_resolution(engine).await;
}

#[tokio::test]
async fn distinct_identities_resolve_independently() {
	let engine = Arc::new(resolver());

	let names = [
		"Aurora Mining",
		"Borealis Shipping",
		"Cascade Timber",
		"Denali Airways",
		"Evergreen Farms",
	];
	let tasks: Vec<_> = names
		.iter()
		.map(|name| {
			let engine = engine.clone();
			let name = name.to_string();
			tokio::spawn(async move { engine.resolve(&name, "COMPANY").await })
		})
		.collect();

	let mut ids = Vec::new();
	for task in tasks {
		let result = task.await.unwrap().unwrap();
		assert!(result.is_new_entity);
		ids.push(result.entity.id);
	}
	ids.sort();
	ids.dedup();
	assert_eq!(ids.len(), names.len());
}

#[tokio::test]
async fn same_type_scoped_identity_under_load() {
	// Mixed spellings of one identity plus an unrelated identity, resolved
	// concurrently: one canonical each.
	let engine = Arc::new(resolver());

	let inputs = [
		("Omega Works, Inc.", "COMPANY"),
		("Omega Works Incorporated", "COMPANY"),
		("Omega Works", "COMPANY"),
		("Omega Works", "PRODUCT"),
	];
	let tasks: Vec<_> = inputs
		.iter()
		.map(|(name, entity_type)| {
			let engine = engine.clone();
			let name = name.to_string();
			let entity_type = entity_type.to_string();
			tokio::spawn(async move { engine.resolve(&name, &entity_type).await })
		})
		.collect();

	let mut results = Vec::new();
	for task in tasks {
		results.push(task.await.unwrap().unwrap());
	}

	let company_ids: std::collections::HashSet<_> = results
		.iter()
		.filter(|r| r.entity.entity_type == "COMPANY")
		.map(|r| r.entity.id)
		.collect();
	assert_eq!(company_ids.len(), 1);

	let product_ids: std::collections::HashSet<_> = results
		.iter()
		.filter(|r| r.entity.entity_type == "PRODUCT")
		.map(|r| r.entity.id)
		.collect();
	assert_eq!(product_ids.len(), 1);
	assert!(company_ids.is_disjoint(&product_ids));
}
