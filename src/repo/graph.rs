//! Cypher-backed repositories over the [`GraphStore`] contract.
//!
//! Every operation borrows a pooled store handle for its duration. Node
//! properties use the same names as the model structs' serde fields, so read
//! projections (`properties(n)`) decode straight through serde. Timestamps
//! are stored as fixed-precision RFC3339 strings, which keeps lexicographic
//! comparison in range predicates sound. Relationship property maps are
//! stored as a JSON string (`properties_json`) because the parameter
//! contract refuses map-valued bindings.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
	BlockingIndex, DecisionRepo, DuplicateRepo, EndpointRewrite, EntityRepo, RelationshipRepo,
	ReviewRepo, SynonymRepo,
};
use crate::error::StoreError;
use crate::model::{
	Duplicate, Entity, MatchDecision, Relationship, ReviewDecision, ReviewItem, Synonym,
};
use crate::params;
use crate::store::pool::{PooledStore, StorePool};
use crate::store::{GraphStore as _, ParamValue, Row};

/// Repository bundle implementation over one shared store pool.
#[derive(Clone)]
pub struct GraphRepositories {
	pool: Arc<StorePool>,
}

impl GraphRepositories {
	pub fn new(pool: Arc<StorePool>) -> Self {
		Self { pool }
	}

	async fn store(&self) -> Result<PooledStore, StoreError> {
		self.pool.borrow().await
	}
}

fn ts(dt: DateTime<Utc>) -> String {
	dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> ParamValue {
	match dt {
		Some(dt) => ParamValue::Str(ts(dt)),
		None => ParamValue::Null,
	}
}

fn decode<T: DeserializeOwned>(row: Row) -> Result<T, StoreError> {
	decode_value(serde_json::Value::Object(row.into_iter().collect()))
}

fn decode_value<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
	serde_json::from_value(value).map_err(|e| StoreError::Query(format!("row decode: {}", e)))
}

fn row_field(row: &mut Row, field: &str) -> Result<serde_json::Value, StoreError> {
	row.remove(field)
		.ok_or_else(|| StoreError::Query(format!("missing '{}' column", field)))
}

fn uuid_field(row: &Row, field: &str) -> Result<Uuid, StoreError> {
	let raw = row
		.get(field)
		.and_then(|v| v.as_str())
		.ok_or_else(|| StoreError::Query(format!("missing '{}' column", field)))?;
	Uuid::parse_str(raw).map_err(|e| StoreError::Query(format!("bad uuid in '{}': {}", field, e)))
}

/// Wire form of a `LIBRARY_REL` edge's own properties.
#[derive(Serialize, Deserialize)]
struct RelEdge {
	id: Uuid,
	rel_type: String,
	properties_json: String,
	created_at: DateTime<Utc>,
	created_by: String,
}

fn decode_relationship(mut row: Row) -> Result<Relationship, StoreError> {
	let source = uuid_field(&row, "source")?;
	let target = uuid_field(&row, "target")?;
	let edge: RelEdge = decode_value(row_field(&mut row, "rel")?)?;
	let properties = serde_json::from_str(&edge.properties_json)
		.map_err(|e| StoreError::Query(format!("relationship properties decode: {}", e)))?;
	Ok(Relationship {
		id: edge.id,
		source_entity_id: source,
		target_entity_id: target,
		rel_type: edge.rel_type,
		properties,
		created_at: edge.created_at,
		created_by: edge.created_by,
	})
}

#[async_trait]
impl EntityRepo for GraphRepositories {
	async fn create(&self, entity: &Entity) -> Result<(), StoreError> {
		let store = self.store().await?;
		let p = params! {
			"id" => ParamValue::str(entity.id.to_string()),
			"canonical_name" => ParamValue::str(&entity.canonical_name),
			"normalized_name" => ParamValue::str(&entity.normalized_name),
			"entity_type" => ParamValue::str(&entity.entity_type),
			"confidence_score" => ParamValue::Float(entity.confidence_score),
			"status" => ParamValue::str(entity.status.to_string()),
			"created_at" => ParamValue::str(ts(entity.created_at)),
			"updated_at" => ParamValue::str(ts(entity.updated_at)),
		};
		store
			.execute(
				"CREATE (e:Entity {id: $id, canonical_name: $canonical_name, \
				 normalized_name: $normalized_name, entity_type: $entity_type, \
				 confidence_score: $confidence_score, status: $status, \
				 created_at: $created_at, updated_at: $updated_at})",
				&p,
			)
			.await
	}

	async fn find_by_id(&self, id: Uuid) -> Result<Option<Entity>, StoreError> {
		let store = self.store().await?;
		let p = params! { "id" => ParamValue::str(id.to_string()) };
		let rows = store
			.query("MATCH (e:Entity {id: $id}) RETURN properties(e) LIMIT 1", &p)
			.await?;
		rows.into_iter().next().map(decode).transpose()
	}

	async fn find_active_by_normalized(
		&self,
		normalized_name: &str,
		entity_type: &str,
	) -> Result<Option<Entity>, StoreError> {
		let store = self.store().await?;
		let p = params! {
			"normalized_name" => ParamValue::str(normalized_name),
			"entity_type" => ParamValue::str(entity_type),
		};
		let rows = store
			.query(
				"MATCH (e:Entity {normalized_name: $normalized_name, \
				 entity_type: $entity_type, status: \"ACTIVE\"}) \
				 WHERE e.deleted_at IS NULL RETURN properties(e) LIMIT 1",
				&p,
			)
			.await?;
		rows.into_iter().next().map(decode).transpose()
	}

	async fn scan_active_by_type(
		&self,
		entity_type: &str,
		limit: usize,
	) -> Result<Vec<Entity>, StoreError> {
		let store = self.store().await?;
		let p = params! {
			"entity_type" => ParamValue::str(entity_type),
			"limit" => ParamValue::Int(limit as i64),
		};
		let rows = store
			.query(
				"MATCH (e:Entity {entity_type: $entity_type, status: \"ACTIVE\"}) \
				 WHERE e.deleted_at IS NULL \
				 RETURN properties(e) ORDER BY e.created_at LIMIT $limit",
				&p,
			)
			.await?;
		rows.into_iter().map(decode).collect()
	}

	async fn mark_merged(&self, source_id: Uuid, target_id: Uuid) -> Result<(), StoreError> {
		let store = self.store().await?;
		let p = params! {
			"source_id" => ParamValue::str(source_id.to_string()),
			"target_id" => ParamValue::str(target_id.to_string()),
			"now" => ParamValue::str(ts(Utc::now())),
		};
		store
			.execute(
				"MATCH (s:Entity {id: $source_id}), (t:Entity {id: $target_id}) \
				 MERGE (s)-[:MERGED_INTO]->(t) \
				 SET s.status = \"MERGED\", s.updated_at = $now",
				&p,
			)
			.await
	}

	async fn unmark_merged(&self, source_id: Uuid, target_id: Uuid) -> Result<(), StoreError> {
		let store = self.store().await?;
		let p = params! {
			"source_id" => ParamValue::str(source_id.to_string()),
			"target_id" => ParamValue::str(target_id.to_string()),
			"now" => ParamValue::str(ts(Utc::now())),
		};
		store
			.execute(
				"MATCH (s:Entity {id: $source_id})-[m:MERGED_INTO]->(t:Entity {id: $target_id}) \
				 SET s.status = \"ACTIVE\", s.updated_at = $now \
				 DELETE m",
				&p,
			)
			.await
	}

	async fn merged_into(&self, id: Uuid) -> Result<Option<Uuid>, StoreError> {
		let store = self.store().await?;
		let p = params! { "id" => ParamValue::str(id.to_string()) };
		let rows = store
			.query(
				"MATCH (s:Entity {id: $id})-[:MERGED_INTO]->(t:Entity) \
				 RETURN {id: t.id} LIMIT 1",
				&p,
			)
			.await?;
		match rows.into_iter().next() {
			Some(row) => Ok(Some(uuid_field(&row, "id")?)),
			None => Ok(None),
		}
	}

	async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
		let store = self.store().await?;
		let p = params! {
			"id" => ParamValue::str(id.to_string()),
			"at" => ParamValue::str(ts(at)),
			"now" => ParamValue::str(ts(Utc::now())),
		};
		store
			.execute(
				"MATCH (e:Entity {id: $id}) SET e.deleted_at = $at, e.updated_at = $now",
				&p,
			)
			.await
	}

	async fn purge_deleted(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
		let store = self.store().await?;
		let p = params! { "cutoff" => ParamValue::str(ts(older_than)) };
		let doomed = store
			.query(
				"MATCH (e:Entity) WHERE e.deleted_at IS NOT NULL AND e.deleted_at <= $cutoff \
				 RETURN {id: e.id}",
				&p,
			)
			.await?;
		store
			.execute(
				"MATCH (e:Entity) WHERE e.deleted_at IS NOT NULL AND e.deleted_at <= $cutoff \
				 OPTIONAL MATCH (s:Synonym)-[:SYNONYM_OF]->(e) \
				 OPTIONAL MATCH (d:Duplicate)-[:DUPLICATE_OF]->(e) \
				 DETACH DELETE s, d, e",
				&p,
			)
			.await?;
		Ok(doomed.len() as u64)
	}
}

#[async_trait]
impl SynonymRepo for GraphRepositories {
	async fn create(&self, synonym: &Synonym) -> Result<(), StoreError> {
		let store = self.store().await?;
		let p = params! {
			"id" => ParamValue::str(synonym.id.to_string()),
			"value" => ParamValue::str(&synonym.value),
			"normalized_value" => ParamValue::str(&synonym.normalized_value),
			"source" => ParamValue::str(synonym.source.to_string()),
			"confidence" => ParamValue::Float(synonym.confidence),
			"support_count" => ParamValue::Int(synonym.support_count as i64),
			"created_at" => ParamValue::str(ts(synonym.created_at)),
			"last_confirmed_at" => ParamValue::str(ts(synonym.last_confirmed_at)),
			"entity_id" => ParamValue::str(synonym.entity_id.to_string()),
		};
		store
			.execute(
				"MATCH (e:Entity {id: $entity_id}) \
				 CREATE (s:Synonym {id: $id, value: $value, \
				 normalized_value: $normalized_value, source: $source, \
				 confidence: $confidence, support_count: $support_count, \
				 created_at: $created_at, last_confirmed_at: $last_confirmed_at, \
				 entity_id: $entity_id})-[:SYNONYM_OF]->(e)",
				&p,
			)
			.await
	}

	async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
		let store = self.store().await?;
		let p = params! { "id" => ParamValue::str(id.to_string()) };
		store
			.execute("MATCH (s:Synonym {id: $id}) DETACH DELETE s", &p)
			.await
	}

	async fn find_by_normalized(
		&self,
		normalized_value: &str,
		entity_type: &str,
	) -> Result<Vec<(Synonym, Entity)>, StoreError> {
		let store = self.store().await?;
		let p = params! {
			"normalized_value" => ParamValue::str(normalized_value),
			"entity_type" => ParamValue::str(entity_type),
		};
		let rows = store
			.query(
				"MATCH (s:Synonym {normalized_value: $normalized_value})-[:SYNONYM_OF]->\
				 (e:Entity {status: \"ACTIVE\", entity_type: $entity_type}) \
				 WHERE e.deleted_at IS NULL \
				 RETURN {synonym: properties(s), entity: properties(e)} \
				 ORDER BY s.created_at",
				&p,
			)
			.await?;
		rows.into_iter()
			.map(|mut row| {
				let synonym: Synonym = decode_value(row_field(&mut row, "synonym")?)?;
				let entity: Entity = decode_value(row_field(&mut row, "entity")?)?;
				Ok((synonym, entity))
			})
			.collect()
	}

	async fn list_for_entity(&self, entity_id: Uuid) -> Result<Vec<Synonym>, StoreError> {
		let store = self.store().await?;
		let p = params! { "entity_id" => ParamValue::str(entity_id.to_string()) };
		let rows = store
			.query(
				"MATCH (s:Synonym)-[:SYNONYM_OF]->(e:Entity {id: $entity_id}) \
				 RETURN properties(s) ORDER BY s.created_at",
				&p,
			)
			.await?;
		rows.into_iter().map(decode).collect()
	}

	async fn update(&self, synonym: &Synonym) -> Result<(), StoreError> {
		let store = self.store().await?;
		let p = params! {
			"id" => ParamValue::str(synonym.id.to_string()),
			"confidence" => ParamValue::Float(synonym.confidence),
			"support_count" => ParamValue::Int(synonym.support_count as i64),
			"last_confirmed_at" => ParamValue::str(ts(synonym.last_confirmed_at)),
		};
		store
			.execute(
				"MATCH (s:Synonym {id: $id}) \
				 SET s.confidence = $confidence, s.support_count = $support_count, \
				 s.last_confirmed_at = $last_confirmed_at",
				&p,
			)
			.await
	}

	async fn exists_for_entity(
		&self,
		entity_id: Uuid,
		normalized_value: &str,
	) -> Result<bool, StoreError> {
		let store = self.store().await?;
		let p = params! {
			"entity_id" => ParamValue::str(entity_id.to_string()),
			"normalized_value" => ParamValue::str(normalized_value),
		};
		let rows = store
			.query(
				"MATCH (s:Synonym {normalized_value: $normalized_value})-[:SYNONYM_OF]->\
				 (e:Entity {id: $entity_id}) RETURN {id: s.id} LIMIT 1",
				&p,
			)
			.await?;
		Ok(!rows.is_empty())
	}
}

#[async_trait]
impl DuplicateRepo for GraphRepositories {
	async fn create(&self, duplicate: &Duplicate) -> Result<(), StoreError> {
		let store = self.store().await?;
		let p = params! {
			"id" => ParamValue::str(duplicate.id.to_string()),
			"original_name" => ParamValue::str(&duplicate.original_name),
			"normalized_name" => ParamValue::str(&duplicate.normalized_name),
			"source_system" => ParamValue::opt_str(duplicate.source_system.clone()),
			"created_at" => ParamValue::str(ts(duplicate.created_at)),
			"entity_id" => ParamValue::str(duplicate.entity_id.to_string()),
		};
		store
			.execute(
				"MATCH (e:Entity {id: $entity_id}) \
				 CREATE (d:Duplicate {id: $id, original_name: $original_name, \
				 normalized_name: $normalized_name, source_system: $source_system, \
				 created_at: $created_at, entity_id: $entity_id})-[:DUPLICATE_OF]->(e)",
				&p,
			)
			.await
	}

	async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
		let store = self.store().await?;
		let p = params! { "id" => ParamValue::str(id.to_string()) };
		store
			.execute("MATCH (d:Duplicate {id: $id}) DETACH DELETE d", &p)
			.await
	}

	async fn list_for_entity(&self, entity_id: Uuid) -> Result<Vec<Duplicate>, StoreError> {
		let store = self.store().await?;
		let p = params! { "entity_id" => ParamValue::str(entity_id.to_string()) };
		let rows = store
			.query(
				"MATCH (d:Duplicate)-[:DUPLICATE_OF]->(e:Entity {id: $entity_id}) \
				 RETURN properties(d) ORDER BY d.created_at",
				&p,
			)
			.await?;
		rows.into_iter().map(decode).collect()
	}
}

impl GraphRepositories {
	/// Create a `LIBRARY_REL` edge between two entities from an edge record.
	async fn create_edge(
		&self,
		source_id: Uuid,
		target_id: Uuid,
		edge: &RelEdge,
	) -> Result<(), StoreError> {
		let store = self.store().await?;
		let p = params! {
			"id" => ParamValue::str(edge.id.to_string()),
			"source_id" => ParamValue::str(source_id.to_string()),
			"target_id" => ParamValue::str(target_id.to_string()),
			"rel_type" => ParamValue::str(&edge.rel_type),
			"properties_json" => ParamValue::str(&edge.properties_json),
			"created_at" => ParamValue::str(ts(edge.created_at)),
			"created_by" => ParamValue::str(&edge.created_by),
		};
		store
			.execute(
				"MATCH (a:Entity {id: $source_id}), (b:Entity {id: $target_id}) \
				 CREATE (a)-[r:LIBRARY_REL {id: $id, rel_type: $rel_type, \
				 properties_json: $properties_json, created_at: $created_at, \
				 created_by: $created_by}]->(b)",
				&p,
			)
			.await
	}

	async fn delete_edge(&self, id: Uuid) -> Result<(), StoreError> {
		let store = self.store().await?;
		let p = params! { "id" => ParamValue::str(id.to_string()) };
		store
			.execute(
				"MATCH (:Entity)-[r:LIBRARY_REL {id: $id}]->(:Entity) DELETE r",
				&p,
			)
			.await
	}
}

#[async_trait]
impl RelationshipRepo for GraphRepositories {
	async fn create(&self, relationship: &Relationship) -> Result<(), StoreError> {
		let properties_json = serde_json::to_string(&relationship.properties)
			.map_err(|e| StoreError::Query(format!("relationship properties encode: {}", e)))?;
		let edge = RelEdge {
			id: relationship.id,
			rel_type: relationship.rel_type.clone(),
			properties_json,
			created_at: relationship.created_at,
			created_by: relationship.created_by.clone(),
		};
		self.create_edge(relationship.source_entity_id, relationship.target_entity_id, &edge)
			.await
	}

	async fn find_by_id(&self, id: Uuid) -> Result<Option<Relationship>, StoreError> {
		let store = self.store().await?;
		let p = params! { "id" => ParamValue::str(id.to_string()) };
		let rows = store
			.query(
				"MATCH (a:Entity)-[r:LIBRARY_REL {id: $id}]->(b:Entity) \
				 RETURN {rel: properties(r), source: a.id, target: b.id} LIMIT 1",
				&p,
			)
			.await?;
		rows.into_iter().next().map(decode_relationship).transpose()
	}

	async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
		let existing = RelationshipRepo::find_by_id(self, id).await?;
		if existing.is_none() {
			return Ok(false);
		}
		self.delete_edge(id).await?;
		Ok(true)
	}

	async fn list_for_entity(&self, entity_id: Uuid) -> Result<Vec<Relationship>, StoreError> {
		let store = self.store().await?;
		let p = params! { "entity_id" => ParamValue::str(entity_id.to_string()) };
		let rows = store
			.query(
				"MATCH (a:Entity)-[r:LIBRARY_REL]->(b:Entity) \
				 WHERE a.id = $entity_id OR b.id = $entity_id \
				 RETURN {rel: properties(r), source: a.id, target: b.id} \
				 ORDER BY r.created_at",
				&p,
			)
			.await?;
		rows.into_iter().map(decode_relationship).collect()
	}

	async fn rewrite_endpoints(
		&self,
		from: Uuid,
		to: Uuid,
	) -> Result<Vec<EndpointRewrite>, StoreError> {
		let incident = RelationshipRepo::list_for_entity(self, from).await?;
		let mut rewrites = Vec::with_capacity(incident.len());

		for rel in incident {
			let rewrite = EndpointRewrite {
				relationship_id: rel.id,
				old_source: rel.source_entity_id,
				old_target: rel.target_entity_id,
				new_source: if rel.source_entity_id == from { to } else { rel.source_entity_id },
				new_target: if rel.target_entity_id == from { to } else { rel.target_entity_id },
			};
			let properties_json = serde_json::to_string(&rel.properties)
				.map_err(|e| StoreError::Query(format!("relationship properties encode: {}", e)))?;
			let edge = RelEdge {
				id: rel.id,
				rel_type: rel.rel_type.clone(),
				properties_json,
				created_at: rel.created_at,
				created_by: rel.created_by.clone(),
			};
			// Cypher cannot retarget an existing edge; recreate it.
			self.delete_edge(rel.id).await?;
			self.create_edge(rewrite.new_source, rewrite.new_target, &edge)
				.await?;
			rewrites.push(rewrite);
		}
		Ok(rewrites)
	}

	async fn restore_endpoints(&self, rewrites: &[EndpointRewrite]) -> Result<(), StoreError> {
		for rewrite in rewrites {
			let rel = match RelationshipRepo::find_by_id(self, rewrite.relationship_id).await? {
				Some(r) => r,
				None => continue,
			};
			let properties_json = serde_json::to_string(&rel.properties)
				.map_err(|e| StoreError::Query(format!("relationship properties encode: {}", e)))?;
			let edge = RelEdge {
				id: rel.id,
				rel_type: rel.rel_type.clone(),
				properties_json,
				created_at: rel.created_at,
				created_by: rel.created_by.clone(),
			};
			self.delete_edge(rel.id).await?;
			self.create_edge(rewrite.old_source, rewrite.old_target, &edge)
				.await?;
		}
		Ok(())
	}
}

#[async_trait]
impl DecisionRepo for GraphRepositories {
	async fn record_match(&self, decision: &MatchDecision) -> Result<(), StoreError> {
		let store = self.store().await?;
		let p = params! {
			"id" => ParamValue::str(decision.id.to_string()),
			"input_entity_temp_id" => ParamValue::str(decision.input_entity_temp_id.to_string()),
			"candidate_entity_id" =>
				ParamValue::opt_str(decision.candidate_entity_id.map(|id| id.to_string())),
			"entity_type" => ParamValue::str(&decision.entity_type),
			"levenshtein_score" => ParamValue::Float(decision.levenshtein_score),
			"jaro_winkler_score" => ParamValue::Float(decision.jaro_winkler_score),
			"jaccard_score" => ParamValue::Float(decision.jaccard_score),
			"final_score" => ParamValue::Float(decision.final_score),
			"auto_merge_threshold" => ParamValue::Float(decision.auto_merge_threshold),
			"synonym_threshold" => ParamValue::Float(decision.synonym_threshold),
			"review_threshold" => ParamValue::Float(decision.review_threshold),
			"outcome" => ParamValue::str(decision.outcome.to_string()),
			"evaluator" => ParamValue::str(&decision.evaluator),
			"timestamp" => ParamValue::str(ts(decision.timestamp)),
		};
		store
			.execute(
				"CREATE (d:MatchDecision {id: $id, \
				 input_entity_temp_id: $input_entity_temp_id, \
				 candidate_entity_id: $candidate_entity_id, entity_type: $entity_type, \
				 levenshtein_score: $levenshtein_score, \
				 jaro_winkler_score: $jaro_winkler_score, jaccard_score: $jaccard_score, \
				 final_score: $final_score, auto_merge_threshold: $auto_merge_threshold, \
				 synonym_threshold: $synonym_threshold, review_threshold: $review_threshold, \
				 outcome: $outcome, evaluator: $evaluator, timestamp: $timestamp})",
				&p,
			)
			.await
	}

	async fn find_match(&self, id: Uuid) -> Result<Option<MatchDecision>, StoreError> {
		let store = self.store().await?;
		let p = params! { "id" => ParamValue::str(id.to_string()) };
		let rows = store
			.query(
				"MATCH (d:MatchDecision {id: $id}) RETURN properties(d) LIMIT 1",
				&p,
			)
			.await?;
		rows.into_iter().next().map(decode).transpose()
	}

	async fn list_matches(&self) -> Result<Vec<MatchDecision>, StoreError> {
		let store = self.store().await?;
		let rows = store
			.query(
				"MATCH (d:MatchDecision) RETURN properties(d) ORDER BY d.timestamp",
				&Default::default(),
			)
			.await?;
		rows.into_iter().map(decode).collect()
	}

	async fn record_review_decision(&self, decision: &ReviewDecision) -> Result<(), StoreError> {
		let store = self.store().await?;
		let p = params! {
			"id" => ParamValue::str(decision.id.to_string()),
			"review_id" => ParamValue::str(decision.review_id.to_string()),
			"action" => ParamValue::str(decision.action.to_string()),
			"reviewer_id" => ParamValue::str(&decision.reviewer_id),
			"rationale" => ParamValue::opt_str(decision.rationale.clone()),
			"decided_at" => ParamValue::str(ts(decision.decided_at)),
			"match_decision_id" =>
				ParamValue::opt_str(decision.match_decision_id.map(|id| id.to_string())),
		};
		store
			.execute(
				"CREATE (r:ReviewDecision {id: $id, review_id: $review_id, \
				 action: $action, reviewer_id: $reviewer_id, rationale: $rationale, \
				 decided_at: $decided_at, match_decision_id: $match_decision_id})",
				&p,
			)
			.await?;

		if let Some(match_id) = decision.match_decision_id {
			let p = params! {
				"match_id" => ParamValue::str(match_id.to_string()),
				"decision_id" => ParamValue::str(decision.id.to_string()),
			};
			store
				.execute(
					"MATCH (d:MatchDecision {id: $match_id}) \
					 MATCH (r:ReviewDecision {id: $decision_id}) \
					 MERGE (d)-[:RESULTED_IN]->(r)",
					&p,
				)
				.await?;
		}
		Ok(())
	}

	async fn list_review_decisions(&self) -> Result<Vec<ReviewDecision>, StoreError> {
		let store = self.store().await?;
		let rows = store
			.query(
				"MATCH (r:ReviewDecision) RETURN properties(r) ORDER BY r.decided_at",
				&Default::default(),
			)
			.await?;
		rows.into_iter().map(decode).collect()
	}
}

#[async_trait]
impl ReviewRepo for GraphRepositories {
	async fn create(&self, item: &ReviewItem) -> Result<(), StoreError> {
		let store = self.store().await?;
		let p = params! {
			"id" => ParamValue::str(item.id.to_string()),
			"source_entity_id" => ParamValue::str(item.source_entity_id.to_string()),
			"candidate_entity_id" => ParamValue::str(item.candidate_entity_id.to_string()),
			"source_entity_name" => ParamValue::str(&item.source_entity_name),
			"candidate_entity_name" => ParamValue::str(&item.candidate_entity_name),
			"entity_type" => ParamValue::str(&item.entity_type),
			"similarity_score" => ParamValue::Float(item.similarity_score),
			"status" => ParamValue::str(item.status.to_string()),
			"submitted_at" => ParamValue::str(ts(item.submitted_at)),
			"reviewed_at" => opt_ts(item.reviewed_at),
			"reviewer_id" => ParamValue::opt_str(item.reviewer_id.clone()),
			"notes" => ParamValue::opt_str(item.notes.clone()),
			"match_decision_id" =>
				ParamValue::opt_str(item.match_decision_id.map(|id| id.to_string())),
		};
		store
			.execute(
				"CREATE (ri:ReviewItem {id: $id, source_entity_id: $source_entity_id, \
				 candidate_entity_id: $candidate_entity_id, \
				 source_entity_name: $source_entity_name, \
				 candidate_entity_name: $candidate_entity_name, \
				 entity_type: $entity_type, similarity_score: $similarity_score, \
				 status: $status, submitted_at: $submitted_at, reviewed_at: $reviewed_at, \
				 reviewer_id: $reviewer_id, notes: $notes, \
				 match_decision_id: $match_decision_id})",
				&p,
			)
			.await
	}

	async fn find_by_id(&self, id: Uuid) -> Result<Option<ReviewItem>, StoreError> {
		let store = self.store().await?;
		let p = params! { "id" => ParamValue::str(id.to_string()) };
		let rows = store
			.query(
				"MATCH (ri:ReviewItem {id: $id}) RETURN properties(ri) LIMIT 1",
				&p,
			)
			.await?;
		rows.into_iter().next().map(decode).transpose()
	}

	async fn update(&self, item: &ReviewItem) -> Result<(), StoreError> {
		let store = self.store().await?;
		let p = params! {
			"id" => ParamValue::str(item.id.to_string()),
			"status" => ParamValue::str(item.status.to_string()),
			"reviewed_at" => opt_ts(item.reviewed_at),
			"reviewer_id" => ParamValue::opt_str(item.reviewer_id.clone()),
			"notes" => ParamValue::opt_str(item.notes.clone()),
		};
		store
			.execute(
				"MATCH (ri:ReviewItem {id: $id}) \
				 SET ri.status = $status, ri.reviewed_at = $reviewed_at, \
				 ri.reviewer_id = $reviewer_id, ri.notes = $notes",
				&p,
			)
			.await
	}

	async fn list_pending(&self, limit: usize) -> Result<Vec<ReviewItem>, StoreError> {
		let store = self.store().await?;
		let p = params! { "limit" => ParamValue::Int(limit as i64) };
		let rows = store
			.query(
				"MATCH (ri:ReviewItem {status: \"PENDING\"}) \
				 RETURN properties(ri) ORDER BY ri.submitted_at LIMIT $limit",
				&p,
			)
			.await?;
		rows.into_iter().map(decode).collect()
	}
}

#[async_trait]
impl BlockingIndex for GraphRepositories {
	async fn add_keys(&self, entity_id: Uuid, keys: &[String]) -> Result<(), StoreError> {
		let store = self.store().await?;
		for key in keys {
			let p = params! {
				"entity_id" => ParamValue::str(entity_id.to_string()),
				"value" => ParamValue::str(key),
			};
			store
				.execute(
					"MATCH (e:Entity {id: $entity_id}) \
					 MERGE (b:BlockingKey {value: $value}) \
					 MERGE (e)-[:HAS_BLOCKING_KEY]->(b)",
					&p,
				)
				.await?;
		}
		Ok(())
	}

	async fn candidates(
		&self,
		keys: &[String],
		entity_type: &str,
	) -> Result<Vec<Entity>, StoreError> {
		if keys.is_empty() {
			return Ok(Vec::new());
		}
		let store = self.store().await?;
		let p = params! {
			"keys" => ParamValue::StrList(keys.to_vec()),
			"entity_type" => ParamValue::str(entity_type),
		};
		let rows = store
			.query(
				"MATCH (e:Entity {status: \"ACTIVE\", entity_type: $entity_type})\
				 -[:HAS_BLOCKING_KEY]->(b:BlockingKey) \
				 WHERE b.value IN $keys AND e.deleted_at IS NULL \
				 WITH DISTINCT e RETURN properties(e) ORDER BY e.created_at",
				&p,
			)
			.await?;
		rows.into_iter().map(decode).collect()
	}
}
