//! Append-only audit trail and merge ledger.
//!
//! Both stores are pluggable: the in-memory and graph-backed implementations
//! are contract-equivalent. Writes are atomic appends; readers observe
//! monotonic timestamps modulo clock skew. Audit failures are logged by
//! callers and never fail the operation being audited.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{AuditAction, AuditEntry, MatchOutcome, MergeRecord};
use crate::params;
use crate::store::{GraphStore as _, ParamValue};
use crate::store::pool::StorePool;

/// Filter for audit queries; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
	pub entity_id: Option<Uuid>,
	pub action: Option<AuditAction>,
	pub actor_id: Option<String>,
	pub from: Option<DateTime<Utc>>,
	pub to: Option<DateTime<Utc>>,
}

impl AuditFilter {
	fn matches(&self, entry: &AuditEntry) -> bool {
		if let Some(id) = self.entity_id {
			if entry.entity_id != id {
				return false;
			}
		}
		if let Some(action) = self.action {
			if entry.action != action {
				return false;
			}
		}
		if let Some(actor) = &self.actor_id {
			if &entry.actor_id != actor {
				return false;
			}
		}
		if let Some(from) = self.from {
			if entry.timestamp < from {
				return false;
			}
		}
		if let Some(to) = self.to {
			if entry.timestamp > to {
				return false;
			}
		}
		true
	}
}

/// Record an audit entry, logging instead of failing: audit writes never
/// prevent the operation being audited.
pub async fn record_quiet(store: &Arc<dyn AuditStore>, entry: AuditEntry) {
	let action = entry.action;
	if let Err(e) = store.record(entry).await {
		log::warn!("audit write failed ({}): {}", action, e);
	}
}

#[async_trait]
pub trait AuditStore: Send + Sync {
	async fn record(&self, entry: AuditEntry) -> Result<(), StoreError>;

	/// Filtered query, ordered by timestamp ascending.
	async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, StoreError>;

	/// Entity-scoped cursor page: entries strictly after `after`, ordered by
	/// timestamp ascending.
	async fn page_for_entity(
		&self,
		entity_id: Uuid,
		after: Option<DateTime<Utc>>,
		limit: usize,
	) -> Result<Vec<AuditEntry>, StoreError>;
}

#[async_trait]
pub trait MergeLedger: Send + Sync {
	/// Strictly append-only.
	async fn append(&self, record: MergeRecord) -> Result<(), StoreError>;

	async fn by_source(&self, source_id: Uuid) -> Result<Vec<MergeRecord>, StoreError>;

	async fn by_target(&self, target_id: Uuid) -> Result<Vec<MergeRecord>, StoreError>;

	async fn by_actor(&self, triggered_by: &str) -> Result<Vec<MergeRecord>, StoreError>;

	async fn by_decision(&self, decision: MatchOutcome) -> Result<Vec<MergeRecord>, StoreError>;

	async fn in_range(
		&self,
		from: DateTime<Utc>,
		to: DateTime<Utc>,
	) -> Result<Vec<MergeRecord>, StoreError>;

	/// The full recursive merge chain touching an entity: every record
	/// transitively connected to it through shared source/target ids,
	/// ordered by timestamp ascending.
	async fn chain_for(&self, entity_id: Uuid) -> Result<Vec<MergeRecord>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryAuditStore {
	entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
	async fn record(&self, entry: AuditEntry) -> Result<(), StoreError> {
		self.entries.write().push(entry);
		Ok(())
	}

	async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, StoreError> {
		let mut out: Vec<AuditEntry> = self
			.entries
			.read()
			.iter()
			.filter(|e| filter.matches(e))
			.cloned()
			.collect();
		out.sort_by_key(|e| e.timestamp);
		Ok(out)
	}

	async fn page_for_entity(
		&self,
		entity_id: Uuid,
		after: Option<DateTime<Utc>>,
		limit: usize,
	) -> Result<Vec<AuditEntry>, StoreError> {
		let mut out: Vec<AuditEntry> = self
			.entries
			.read()
			.iter()
			.filter(|e| e.entity_id == entity_id)
			.filter(|e| after.is_none_or(|cursor| e.timestamp > cursor))
			.cloned()
			.collect();
		out.sort_by_key(|e| e.timestamp);
		out.truncate(limit);
		Ok(out)
	}
}

#[derive(Default)]
pub struct InMemoryMergeLedger {
	records: RwLock<Vec<MergeRecord>>,
}

impl InMemoryMergeLedger {
	pub fn new() -> Self {
		Self::default()
	}

	fn filtered(&self, pred: impl Fn(&MergeRecord) -> bool) -> Vec<MergeRecord> {
		let mut out: Vec<MergeRecord> = self
			.records
			.read()
			.iter()
			.filter(|r| pred(r))
			.cloned()
			.collect();
		out.sort_by_key(|r| r.timestamp);
		out
	}
}

#[async_trait]
impl MergeLedger for InMemoryMergeLedger {
	async fn append(&self, record: MergeRecord) -> Result<(), StoreError> {
		self.records.write().push(record);
		Ok(())
	}

	async fn by_source(&self, source_id: Uuid) -> Result<Vec<MergeRecord>, StoreError> {
		Ok(self.filtered(|r| r.source_entity_id == source_id))
	}

	async fn by_target(&self, target_id: Uuid) -> Result<Vec<MergeRecord>, StoreError> {
		Ok(self.filtered(|r| r.target_entity_id == target_id))
	}

	async fn by_actor(&self, triggered_by: &str) -> Result<Vec<MergeRecord>, StoreError> {
		Ok(self.filtered(|r| r.triggered_by == triggered_by))
	}

	async fn by_decision(&self, decision: MatchOutcome) -> Result<Vec<MergeRecord>, StoreError> {
		Ok(self.filtered(|r| r.decision == decision))
	}

	async fn in_range(
		&self,
		from: DateTime<Utc>,
		to: DateTime<Utc>,
	) -> Result<Vec<MergeRecord>, StoreError> {
		Ok(self.filtered(|r| r.timestamp >= from && r.timestamp <= to))
	}

	async fn chain_for(&self, entity_id: Uuid) -> Result<Vec<MergeRecord>, StoreError> {
		let records = self.records.read().clone();
		Ok(chain_from(&records, entity_id))
	}
}

/// Transitive closure of merge records over shared source/target ids.
fn chain_from(records: &[MergeRecord], entity_id: Uuid) -> Vec<MergeRecord> {
	let mut frontier: HashSet<Uuid> = HashSet::from([entity_id]);
	let mut included: HashSet<Uuid> = HashSet::new();

	loop {
		let mut grew = false;
		for record in records {
			if included.contains(&record.id) {
				continue;
			}
			if frontier.contains(&record.source_entity_id)
				|| frontier.contains(&record.target_entity_id)
			{
				included.insert(record.id);
				grew |= frontier.insert(record.source_entity_id);
				grew |= frontier.insert(record.target_entity_id);
				grew = true;
			}
		}
		if !grew {
			break;
		}
	}

	let mut out: Vec<MergeRecord> = records
		.iter()
		.filter(|r| included.contains(&r.id))
		.cloned()
		.collect();
	out.sort_by_key(|r| r.timestamp);
	out
}

// ---------------------------------------------------------------------------
// Graph-backed implementations
// ---------------------------------------------------------------------------

fn ts(dt: DateTime<Utc>) -> String {
	dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Wire form of an `(:AuditEntry)` node; the details map is stored as a JSON
/// string because map-valued bindings are refused by the parameter contract.
#[derive(Serialize, Deserialize)]
struct AuditNode {
	id: Uuid,
	action: AuditAction,
	entity_id: Uuid,
	actor_id: String,
	details_json: String,
	timestamp: DateTime<Utc>,
}

impl AuditNode {
	fn into_entry(self) -> Result<AuditEntry, StoreError> {
		let details: BTreeMap<String, serde_json::Value> =
			serde_json::from_str(&self.details_json)
				.map_err(|e| StoreError::Query(format!("audit details decode: {}", e)))?;
		Ok(AuditEntry {
			id: self.id,
			action: self.action,
			entity_id: self.entity_id,
			actor_id: self.actor_id,
			details,
			timestamp: self.timestamp,
		})
	}
}

pub struct GraphAuditStore {
	pool: Arc<StorePool>,
}

impl GraphAuditStore {
	pub fn new(pool: Arc<StorePool>) -> Self {
		Self { pool }
	}
}

#[async_trait]
impl AuditStore for GraphAuditStore {
	async fn record(&self, entry: AuditEntry) -> Result<(), StoreError> {
		let details_json = serde_json::to_string(&entry.details)
			.map_err(|e| StoreError::Query(format!("audit details encode: {}", e)))?;
		let store = self.pool.borrow().await?;
		let p = params! {
			"id" => ParamValue::str(entry.id.to_string()),
			"action" => ParamValue::str(entry.action.to_string()),
			"entity_id" => ParamValue::str(entry.entity_id.to_string()),
			"actor_id" => ParamValue::str(&entry.actor_id),
			"details_json" => ParamValue::str(details_json),
			"timestamp" => ParamValue::str(ts(entry.timestamp)),
		};
		store
			.execute(
				"CREATE (a:AuditEntry {id: $id, action: $action, entity_id: $entity_id, \
				 actor_id: $actor_id, details_json: $details_json, timestamp: $timestamp})",
				&p,
			)
			.await
	}

	async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, StoreError> {
		let store = self.pool.borrow().await?;
		let mut clauses: Vec<&str> = Vec::new();
		let mut p = crate::store::Params::new();

		if let Some(id) = filter.entity_id {
			clauses.push("a.entity_id = $entity_id");
			p.insert("entity_id".into(), ParamValue::str(id.to_string()));
		}
		if let Some(action) = filter.action {
			clauses.push("a.action = $action");
			p.insert("action".into(), ParamValue::str(action.to_string()));
		}
		if let Some(actor) = &filter.actor_id {
			clauses.push("a.actor_id = $actor_id");
			p.insert("actor_id".into(), ParamValue::str(actor));
		}
		if let Some(from) = filter.from {
			clauses.push("a.timestamp >= $from_ts");
			p.insert("from_ts".into(), ParamValue::str(ts(from)));
		}
		if let Some(to) = filter.to {
			clauses.push("a.timestamp <= $to_ts");
			p.insert("to_ts".into(), ParamValue::str(ts(to)));
		}

		let where_clause = if clauses.is_empty() {
			String::new()
		} else {
			format!(" WHERE {}", clauses.join(" AND "))
		};
		let query = format!(
			"MATCH (a:AuditEntry){} RETURN properties(a) ORDER BY a.timestamp",
			where_clause
		);

		let rows = store.query(&query, &p).await?;
		rows.into_iter()
			.map(|row| {
				let node: AuditNode = serde_json::from_value(serde_json::Value::Object(
					row.into_iter().collect(),
				))
				.map_err(|e| StoreError::Query(format!("audit row decode: {}", e)))?;
				node.into_entry()
			})
			.collect()
	}

	async fn page_for_entity(
		&self,
		entity_id: Uuid,
		after: Option<DateTime<Utc>>,
		limit: usize,
	) -> Result<Vec<AuditEntry>, StoreError> {
		let filter = AuditFilter {
			entity_id: Some(entity_id),
			..Default::default()
		};
		let mut entries = self.query(&filter).await?;
		if let Some(cursor) = after {
			entries.retain(|e| e.timestamp > cursor);
		}
		entries.truncate(limit);
		Ok(entries)
	}
}

pub struct GraphMergeLedger {
	pool: Arc<StorePool>,
}

impl GraphMergeLedger {
	pub fn new(pool: Arc<StorePool>) -> Self {
		Self { pool }
	}

	async fn query_records(
		&self,
		where_clause: &str,
		p: &crate::store::Params,
	) -> Result<Vec<MergeRecord>, StoreError> {
		let store = self.pool.borrow().await?;
		let query = format!(
			"MATCH (m:MergeRecord){} RETURN properties(m) ORDER BY m.timestamp",
			where_clause
		);
		let rows = store.query(&query, p).await?;
		rows.into_iter()
			.map(|row| {
				serde_json::from_value(serde_json::Value::Object(row.into_iter().collect()))
					.map_err(|e| StoreError::Query(format!("merge record decode: {}", e)))
			})
			.collect()
	}
}

#[async_trait]
impl MergeLedger for GraphMergeLedger {
	async fn append(&self, record: MergeRecord) -> Result<(), StoreError> {
		let store = self.pool.borrow().await?;
		let p = params! {
			"id" => ParamValue::str(record.id.to_string()),
			"source_entity_id" => ParamValue::str(record.source_entity_id.to_string()),
			"target_entity_id" => ParamValue::str(record.target_entity_id.to_string()),
			"source_entity_name" => ParamValue::str(&record.source_entity_name),
			"target_entity_name" => ParamValue::str(&record.target_entity_name),
			"confidence_score" => ParamValue::Float(record.confidence_score),
			"decision" => ParamValue::str(record.decision.to_string()),
			"triggered_by" => ParamValue::str(&record.triggered_by),
			"reasoning" => ParamValue::str(&record.reasoning),
			"timestamp" => ParamValue::str(ts(record.timestamp)),
		};
		store
			.execute(
				"CREATE (m:MergeRecord {id: $id, source_entity_id: $source_entity_id, \
				 target_entity_id: $target_entity_id, \
				 source_entity_name: $source_entity_name, \
				 target_entity_name: $target_entity_name, \
				 confidence_score: $confidence_score, decision: $decision, \
				 triggered_by: $triggered_by, reasoning: $reasoning, \
				 timestamp: $timestamp})",
				&p,
			)
			.await
	}

	async fn by_source(&self, source_id: Uuid) -> Result<Vec<MergeRecord>, StoreError> {
		let p = params! { "id" => ParamValue::str(source_id.to_string()) };
		self.query_records(" WHERE m.source_entity_id = $id", &p).await
	}

	async fn by_target(&self, target_id: Uuid) -> Result<Vec<MergeRecord>, StoreError> {
		let p = params! { "id" => ParamValue::str(target_id.to_string()) };
		self.query_records(" WHERE m.target_entity_id = $id", &p).await
	}

	async fn by_actor(&self, triggered_by: &str) -> Result<Vec<MergeRecord>, StoreError> {
		let p = params! { "actor" => ParamValue::str(triggered_by) };
		self.query_records(" WHERE m.triggered_by = $actor", &p).await
	}

	async fn by_decision(&self, decision: MatchOutcome) -> Result<Vec<MergeRecord>, StoreError> {
		let p = params! { "decision" => ParamValue::str(decision.to_string()) };
		self.query_records(" WHERE m.decision = $decision", &p).await
	}

	async fn in_range(
		&self,
		from: DateTime<Utc>,
		to: DateTime<Utc>,
	) -> Result<Vec<MergeRecord>, StoreError> {
		let p = params! {
			"from_ts" => ParamValue::str(ts(from)),
			"to_ts" => ParamValue::str(ts(to)),
		};
		self.query_records(" WHERE m.timestamp >= $from_ts AND m.timestamp <= $to_ts", &p)
			.await
	}

	async fn chain_for(&self, entity_id: Uuid) -> Result<Vec<MergeRecord>, StoreError> {
		// Frontier expansion over source/target ids; each round fetches the
		// records touching ids discovered in the previous round.
		let mut known_ids: HashSet<Uuid> = HashSet::from([entity_id]);
		let mut collected: BTreeMap<Uuid, MergeRecord> = BTreeMap::new();
		let mut frontier: Vec<Uuid> = vec![entity_id];

		while !frontier.is_empty() {
			let ids: Vec<String> = frontier.drain(..).map(|id| id.to_string()).collect();
			let p = params! { "ids" => ParamValue::StrList(ids) };
			let batch = self
				.query_records(
					" WHERE m.source_entity_id IN $ids OR m.target_entity_id IN $ids",
					&p,
				)
				.await?;
			for record in batch {
				if collected.contains_key(&record.id) {
					continue;
				}
				for id in [record.source_entity_id, record.target_entity_id] {
					if known_ids.insert(id) {
						frontier.push(id);
					}
				}
				collected.insert(record.id, record);
			}
		}

		let mut out: Vec<MergeRecord> = collected.into_values().collect();
		out.sort_by_key(|r| r.timestamp);
		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(entity_id: Uuid, action: AuditAction, actor: &str) -> AuditEntry {
		AuditEntry::new(action, entity_id, actor, BTreeMap::new())
	}

	fn record(source: Uuid, target: Uuid) -> MergeRecord {
		MergeRecord {
			id: Uuid::new_v4(),
			source_entity_id: source,
			target_entity_id: target,
			source_entity_name: "s".into(),
			target_entity_name: "t".into(),
			confidence_score: 0.95,
			decision: MatchOutcome::AutoMerge,
			triggered_by: "system".into(),
			reasoning: "score above threshold".into(),
			timestamp: Utc::now(),
		}
	}

	#[tokio::test]
	async fn audit_filters_compose() {
		let store = InMemoryAuditStore::new();
		let e1 = Uuid::new_v4();
		let e2 = Uuid::new_v4();
		store.record(entry(e1, AuditAction::EntityCreated, "system")).await.unwrap();
		store.record(entry(e1, AuditAction::EntityMerged, "system")).await.unwrap();
		store.record(entry(e2, AuditAction::EntityCreated, "alice")).await.unwrap();

		let by_entity = store
			.query(&AuditFilter {
				entity_id: Some(e1),
				..Default::default()
			})
			.await
			.unwrap();
		assert_eq!(by_entity.len(), 2);

		let by_action_and_actor = store
			.query(&AuditFilter {
				action: Some(AuditAction::EntityCreated),
				actor_id: Some("alice".into()),
				..Default::default()
			})
			.await
			.unwrap();
		assert_eq!(by_action_and_actor.len(), 1);
		assert_eq!(by_action_and_actor[0].entity_id, e2);
	}

	#[tokio::test]
	async fn audit_page_is_cursor_ordered() {
		let store = InMemoryAuditStore::new();
		let e = Uuid::new_v4();
		for _ in 0..5 {
			store.record(entry(e, AuditAction::SynonymAdded, "system")).await.unwrap();
		}

		let first_page = store.page_for_entity(e, None, 2).await.unwrap();
		assert_eq!(first_page.len(), 2);
		assert!(first_page[0].timestamp <= first_page[1].timestamp);

		let cursor = first_page[1].timestamp;
		let second_page = store.page_for_entity(e, Some(cursor), 10).await.unwrap();
		assert_eq!(second_page.len(), 3);
		assert!(second_page.iter().all(|entry| entry.timestamp > cursor));
	}

	#[tokio::test]
	async fn ledger_queries_by_dimension() {
		let ledger = InMemoryMergeLedger::new();
		let a = Uuid::new_v4();
		let b = Uuid::new_v4();
		let c = Uuid::new_v4();
		ledger.append(record(a, b)).await.unwrap();
		ledger.append(record(c, b)).await.unwrap();

		assert_eq!(ledger.by_source(a).await.unwrap().len(), 1);
		assert_eq!(ledger.by_target(b).await.unwrap().len(), 2);
		assert_eq!(ledger.by_actor("system").await.unwrap().len(), 2);
		assert_eq!(
			ledger.by_decision(MatchOutcome::AutoMerge).await.unwrap().len(),
			2
		);
		assert!(ledger.by_decision(MatchOutcome::Review).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn chain_walks_transitive_merges() {
		let ledger = InMemoryMergeLedger::new();
		let a = Uuid::new_v4();
		let b = Uuid::new_v4();
		let c = Uuid::new_v4();
		let unrelated = record(Uuid::new_v4(), Uuid::new_v4());

		ledger.append(record(a, b)).await.unwrap();
		ledger.append(record(b, c)).await.unwrap();
		ledger.append(unrelated).await.unwrap();

		// Starting from the terminal entity, the whole chain comes back.
		let chain = ledger.chain_for(c).await.unwrap();
		assert_eq!(chain.len(), 2);
		// And from the first source too.
		let chain = ledger.chain_for(a).await.unwrap();
		assert_eq!(chain.len(), 2);
	}
}
