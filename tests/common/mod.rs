//! Shared helpers for the integration suites: in-memory engines and option
//! presets.
#![allow(dead_code)]

use entigraph::config::ResolveOptions;
use entigraph::{EntityResolver, ResolverConfig, ResolverDeps};

/// An all-in-memory engine with default configuration.
pub fn resolver() -> EntityResolver {
	EntityResolver::in_memory(ResolverConfig::default()).expect("default config is valid")
}

/// An engine plus the capability set it was built from, so tests can inspect
/// repositories, audit, and ledger directly.
pub fn resolver_with_deps() -> (EntityResolver, ResolverDeps) {
	let deps = ResolverDeps::in_memory();
	let engine =
		EntityResolver::new(deps.clone(), ResolverConfig::default()).expect("default config");
	(engine, deps)
}

/// Engine built from explicit deps and config.
pub fn resolver_from(deps: ResolverDeps, config: ResolverConfig) -> EntityResolver {
	EntityResolver::new(deps, config).expect("config is valid")
}

/// Default options with LLM enrichment switched on.
pub fn llm_options() -> ResolveOptions {
	ResolveOptions {
		use_llm: true,
		..Default::default()
	}
}
