//! Graph store contract and the Postgres + Apache AGE adapter.
//!
//! The only storage coupling in the crate: a typed query/execute contract
//! with parameter binding, index creation, and liveness probing. Parameters
//! are rendered into the Cypher text as JSON-escaped literals; collection
//! values are refused except ordered string lists (used for `IN` over
//! blocking keys).

pub mod pool;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::{PgPool, Row as SqlxRow};

use crate::error::StoreError;

/// Maximum length of a Cypher-bound string parameter.
pub const MAX_STRING_PARAM_LEN: usize = 4000;

/// A typed query parameter. Maps and nested collections are unrepresentable;
/// ordered string lists are the only collection form.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
	Str(String),
	Int(i64),
	Float(f64),
	Bool(bool),
	StrList(Vec<String>),
	Null,
}

impl ParamValue {
	pub fn str(v: impl Into<String>) -> Self {
		ParamValue::Str(v.into())
	}

	pub fn opt_str(v: Option<String>) -> Self {
		match v {
			Some(s) => ParamValue::Str(s),
			None => ParamValue::Null,
		}
	}
}

/// Ordered parameter map. Ordering keeps rendered queries deterministic for
/// logging and tests.
pub type Params = BTreeMap<String, ParamValue>;

/// One returned row: column alias to JSON value.
pub type Row = BTreeMap<String, serde_json::Value>;

/// Convenience constructor for parameter maps.
#[macro_export]
macro_rules! params {
	($($key:expr => $value:expr),* $(,)?) => {{
		let mut map = $crate::store::Params::new();
		$(map.insert($key.to_string(), $value);)*
		map
	}};
}

static PARAM_NAME_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("param name pattern"));

/// Validate a parameter map against the binding rules.
pub fn validate_params(params: &Params) -> Result<(), StoreError> {
	for (name, value) in params {
		if !PARAM_NAME_RE.is_match(name) {
			return Err(StoreError::InvalidParameter {
				name: name.clone(),
				reason: "parameter names must be alphanumeric/underscore".to_string(),
			});
		}
		match value {
			ParamValue::Str(s) => {
				if s.chars().count() > MAX_STRING_PARAM_LEN {
					return Err(StoreError::InvalidParameter {
						name: name.clone(),
						reason: format!("string exceeds {} characters", MAX_STRING_PARAM_LEN),
					});
				}
			}
			ParamValue::StrList(items) => {
				for item in items {
					if item.chars().count() > MAX_STRING_PARAM_LEN {
						return Err(StoreError::InvalidParameter {
							name: name.clone(),
							reason: format!(
								"list element exceeds {} characters",
								MAX_STRING_PARAM_LEN
							),
						});
					}
				}
			}
			ParamValue::Float(f) => {
				if !f.is_finite() {
					return Err(StoreError::InvalidParameter {
						name: name.clone(),
						reason: "non-finite float".to_string(),
					});
				}
			}
			ParamValue::Int(_) | ParamValue::Bool(_) | ParamValue::Null => {}
		}
	}
	Ok(())
}

/// Render `$name` placeholders into JSON-escaped literals. Longer names are
/// substituted first so `$key` never clobbers part of `$key_two`.
pub fn render_query(query: &str, params: &Params) -> Result<String, StoreError> {
	validate_params(params)?;

	let mut names: Vec<&String> = params.keys().collect();
	names.sort_by_key(|n| std::cmp::Reverse(n.len()));

	let mut rendered = query.to_string();
	for name in names {
		let literal = render_value(&params[name]);
		rendered = rendered.replace(&format!("${}", name), &literal);
	}
	Ok(rendered)
}

fn render_value(value: &ParamValue) -> String {
	match value {
		// serde_json string encoding gives escape-free injection.
		ParamValue::Str(s) => serde_json::to_string(s).unwrap_or_else(|_| "null".to_string()),
		ParamValue::Int(i) => i.to_string(),
		ParamValue::Float(f) => f.to_string(),
		ParamValue::Bool(b) => b.to_string(),
		ParamValue::StrList(items) => {
			let rendered: Vec<String> = items
				.iter()
				.map(|s| serde_json::to_string(s).unwrap_or_else(|_| "null".to_string()))
				.collect();
			format!("[{}]", rendered.join(", "))
		}
		ParamValue::Null => "null".to_string(),
	}
}

/// The storage capability used by every graph-backed repository.
#[async_trait]
pub trait GraphStore: Send + Sync {
	/// Run a write statement.
	async fn execute(&self, query: &str, params: &Params) -> Result<(), StoreError>;

	/// Run a read query. Graph-backed callers project a single map per row
	/// (`RETURN {..} AS v`); each row decodes into a column/value map.
	async fn query(&self, query: &str, params: &Params) -> Result<Vec<Row>, StoreError>;

	/// Create the required indexes (idempotent).
	async fn create_indexes(&self) -> Result<(), StoreError>;

	/// Lightweight liveness probe.
	async fn is_connected(&self) -> bool;

	async fn close(&self) -> Result<(), StoreError>;
}

/// Postgres + Apache AGE implementation. All Cypher goes through the
/// `ag_catalog.cypher` SQL function with the graph name and the rendered
/// query bound as text parameters.
pub struct AgeStore {
	pool: PgPool,
	graph: String,
}

const CYPHER_SQL: &str =
	"SELECT v::text AS v FROM ag_catalog.cypher($1::text, $2::text) AS (v ag_catalog.agtype)";

/// Index obligations on the AGE label tables; expression indexes over the
/// agtype property accessor.
const INDEX_SPECS: &[(&str, &str, &str)] = &[
	("entity_id_idx", "Entity", "id"),
	("entity_norm_idx", "Entity", "normalized_name"),
	("entity_type_idx", "Entity", "entity_type"),
	("synonym_norm_idx", "Synonym", "normalized_value"),
	("blocking_key_idx", "BlockingKey", "value"),
	("audit_id_idx", "AuditEntry", "id"),
	("audit_entity_idx", "AuditEntry", "entity_id"),
	("audit_action_idx", "AuditEntry", "action"),
	("audit_ts_idx", "AuditEntry", "timestamp"),
];

impl AgeStore {
	pub fn new(pool: PgPool, graph: impl Into<String>) -> Self {
		Self {
			pool,
			graph: graph.into(),
		}
	}

	/// Connect helper using a DATABASE_URL-like string.
	pub async fn connect(database_url: &str, graph: &str) -> Result<Self> {
		let pool = PgPool::connect(database_url).await?;
		Ok(Self::new(pool, graph))
	}

	/// Strip agtype annotations (`::vertex`, `::edge`, ...) so the remaining
	/// text parses as JSON.
	fn agtype_to_json(raw: &str) -> Result<serde_json::Value, StoreError> {
		static ANNOTATION_RE: Lazy<Regex> =
			Lazy::new(|| Regex::new(r"::\w+").expect("agtype annotation pattern"));
		let cleaned = ANNOTATION_RE.replace_all(raw, "");
		serde_json::from_str(&cleaned)
			.map_err(|e| StoreError::Query(format!("unparseable agtype row: {}", e)))
	}
}

#[async_trait]
impl GraphStore for AgeStore {
	async fn execute(&self, query: &str, params: &Params) -> Result<(), StoreError> {
		let cypher = render_query(query, params)?;
		debug!("cypher execute: {}", cypher);
		sqlx::query(CYPHER_SQL)
			.bind(&self.graph)
			.bind(&cypher)
			.execute(&self.pool)
			.await
			.map_err(|e| StoreError::Query(e.to_string()))?;
		Ok(())
	}

	async fn query(&self, query: &str, params: &Params) -> Result<Vec<Row>, StoreError> {
		let cypher = render_query(query, params)?;
		debug!("cypher query: {}", cypher);
		let rows = sqlx::query(CYPHER_SQL)
			.bind(&self.graph)
			.bind(&cypher)
			.fetch_all(&self.pool)
			.await
			.map_err(|e| StoreError::Query(e.to_string()))?;

		let mut out = Vec::with_capacity(rows.len());
		for row in rows {
			let raw: String = row
				.try_get("v")
				.map_err(|e| StoreError::Query(e.to_string()))?;
			match Self::agtype_to_json(&raw)? {
				serde_json::Value::Object(map) => {
					out.push(map.into_iter().collect::<Row>());
				}
				other => {
					let mut map = Row::new();
					map.insert("v".to_string(), other);
					out.push(map);
				}
			}
		}
		Ok(out)
	}

	async fn create_indexes(&self) -> Result<(), StoreError> {
		for (name, label, property) in INDEX_SPECS {
			let sql = format!(
				"CREATE INDEX IF NOT EXISTS {name} ON {graph}.\"{label}\" \
				 (ag_catalog.agtype_access_operator(properties, '\"{property}\"'::ag_catalog.agtype))",
				name = name,
				graph = self.graph,
				label = label,
				property = property,
			);
			sqlx::query(&sql)
				.execute(&self.pool)
				.await
				.map_err(|e| StoreError::Query(format!("index {}: {}", name, e)))?;
		}
		Ok(())
	}

	async fn is_connected(&self) -> bool {
		sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
	}

	async fn close(&self) -> Result<(), StoreError> {
		self.pool.close().await;
		Ok(())
	}
}
