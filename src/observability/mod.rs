//! Logging initialization and the in-process metrics rendering.
//!
//! Metrics are plain atomic counters owned by their components; this module
//! renders their snapshots into a Prometheus-compatible text payload without
//! pulling in an exporter dependency. Sinks and scrape transport are the
//! embedding application's concern.

use log::LevelFilter;

use crate::cache::CacheStats;
use crate::pipeline::PipelineStats;
use crate::store::pool::PoolStats;

/// Initialize `fern`-based logging to stdout. `level` falls back to `info`
/// when absent or unparseable. Safe to call once per process.
pub fn init_logging(level: Option<&str>) -> anyhow::Result<()> {
	let level = level
		.unwrap_or("info")
		.parse::<LevelFilter>()
		.unwrap_or(LevelFilter::Info);

	fern::Dispatch::new()
		.format(|out, message, record| {
			out.finish(format_args!(
				"{} [{}] {}: {}",
				chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
				record.level(),
				record.target(),
				message
			))
		})
		.level(level)
		.chain(std::io::stdout())
		.apply()?;
	Ok(())
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
	out.push_str(&format!("# HELP {} {}\n", name, help));
	out.push_str(&format!("# TYPE {} counter\n", name));
	out.push_str(&format!("{} {}\n", name, value));
}

fn gauge(out: &mut String, name: &str, help: &str, value: u64) {
	out.push_str(&format!("# HELP {} {}\n", name, help));
	out.push_str(&format!("# TYPE {} gauge\n", name));
	out.push_str(&format!("{} {}\n", name, value));
}

/// Render component snapshots as Prometheus-compatible text.
pub fn metrics_text(
	pipeline: &PipelineStats,
	cache: &CacheStats,
	pool: Option<&PoolStats>,
) -> String {
	let mut out = String::new();

	counter(
		&mut out,
		"entigraph_resolutions_total",
		"Total resolutions completed",
		pipeline.resolutions,
	);
	counter(
		&mut out,
		"entigraph_exact_hits_total",
		"Resolutions answered by exact normalized match",
		pipeline.exact_hits,
	);
	counter(
		&mut out,
		"entigraph_synonym_hits_total",
		"Resolutions answered by synonym lookup",
		pipeline.synonym_hits,
	);
	counter(
		&mut out,
		"entigraph_auto_merges_total",
		"Fuzzy auto-merges performed",
		pipeline.auto_merges,
	);
	counter(
		&mut out,
		"entigraph_synonyms_attached_total",
		"Synonyms attached by the pipeline",
		pipeline.synonyms_attached,
	);
	counter(
		&mut out,
		"entigraph_reviews_submitted_total",
		"Review items submitted",
		pipeline.reviews_submitted,
	);
	counter(
		&mut out,
		"entigraph_no_matches_total",
		"Resolutions that created a new entity",
		pipeline.no_matches,
	);
	counter(
		&mut out,
		"entigraph_llm_consults_total",
		"LLM enrichment calls made",
		pipeline.llm_consults,
	);

	counter(&mut out, "entigraph_cache_hits_total", "Resolution cache hits", cache.hits);
	counter(
		&mut out,
		"entigraph_cache_misses_total",
		"Resolution cache misses",
		cache.misses,
	);
	counter(
		&mut out,
		"entigraph_cache_evictions_total",
		"Resolution cache evictions",
		cache.evictions,
	);
	gauge(
		&mut out,
		"entigraph_cache_size",
		"Resolution cache entry count",
		cache.size as u64,
	);

	if let Some(pool) = pool {
		gauge(
			&mut out,
			"entigraph_pool_active",
			"Store handles currently borrowed",
			pool.active as u64,
		);
		gauge(
			&mut out,
			"entigraph_pool_idle",
			"Store handles idle in the pool",
			pool.idle as u64,
		);
		counter(
			&mut out,
			"entigraph_pool_borrowed_total",
			"Store handles borrowed",
			pool.total_borrowed,
		);
		counter(
			&mut out,
			"entigraph_pool_created_total",
			"Store handles created",
			pool.total_created,
		);
	}

	out
}
