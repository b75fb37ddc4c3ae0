//! Per-identity mutual exclusion.
//!
//! The lock key is `type + ":" + normalizedName`; whoever holds it owns every
//! state transition for that identity. Two strategies implement the same
//! contract: an in-process mutex table and a graph-backed advisory lock with
//! a TTL lease for cross-process deployments. Acquisition is always bounded
//! by a timeout and surfaces `LOCK_TIMEOUT` on expiry; release is scoped via
//! the returned guard and safe to skip only because the guard's drop path
//! releases best-effort.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use log::warn;
use once_cell::sync::Lazy;
use rand::Rng;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{ResolveError, StoreError};
use crate::params;
use crate::store::{GraphStore as _, ParamValue};
use crate::store::pool::StorePool;

/// Identity lock contract.
#[async_trait]
pub trait IdentityLock: Send + Sync {
	/// Acquire the lock for `key`, waiting at most `timeout_ms`.
	async fn acquire(&self, key: &str, timeout_ms: u64) -> Result<LockGuard, ResolveError>;
}

#[async_trait]
trait LockReleaser: Send {
	async fn release(self: Box<Self>);

	/// Synchronous best-effort release used from the guard's drop path.
	fn release_in_background(self: Box<Self>);
}

/// Scoped ownership of one identity lock. Call `release` on every exit path;
/// dropping an unreleased guard falls back to a best-effort release and logs.
pub struct LockGuard {
	key: String,
	releaser: Option<Box<dyn LockReleaser>>,
}

impl std::fmt::Debug for LockGuard {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LockGuard").field("key", &self.key).finish()
	}
}

impl LockGuard {
	pub fn key(&self) -> &str {
		&self.key
	}

	pub async fn release(mut self) {
		if let Some(releaser) = self.releaser.take() {
			releaser.release().await;
		}
	}
}

impl Drop for LockGuard {
	fn drop(&mut self) {
		if let Some(releaser) = self.releaser.take() {
			warn!("lock '{}' dropped without explicit release", self.key);
			releaser.release_in_background();
		}
	}
}

// ---------------------------------------------------------------------------
// In-process strategy
// ---------------------------------------------------------------------------

/// One `tokio` mutex per key in a concurrent map.
#[derive(Default)]
pub struct InProcessLock {
	table: DashMap<String, Arc<Mutex<()>>>,
}

impl InProcessLock {
	pub fn new() -> Self {
		Self::default()
	}
}

struct InProcessReleaser {
	_guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl LockReleaser for InProcessReleaser {
	async fn release(self: Box<Self>) {}

	fn release_in_background(self: Box<Self>) {}
}

#[async_trait]
impl IdentityLock for InProcessLock {
	async fn acquire(&self, key: &str, timeout_ms: u64) -> Result<LockGuard, ResolveError> {
		let mutex = self
			.table
			.entry(key.to_string())
			.or_insert_with(|| Arc::new(Mutex::new(())))
			.clone();

		let guard = timeout(Duration::from_millis(timeout_ms), mutex.lock_owned())
			.await
			.map_err(|_| ResolveError::LockTimeout {
				key: key.to_string(),
				timeout_ms,
			})?;

		Ok(LockGuard {
			key: key.to_string(),
			releaser: Some(Box::new(InProcessReleaser { _guard: guard })),
		})
	}
}

// ---------------------------------------------------------------------------
// Graph-backed strategy
// ---------------------------------------------------------------------------

/// Advisory lock holder id, fresh per process boot.
static PROCESS_HOLDER: Lazy<Uuid> = Lazy::new(Uuid::new_v4);

/// Advisory lock stored as a `(:Lock {key, holder, acquired_at, expires_at})`
/// node with upsert semantics. A lock whose lease expired is reclaimable.
pub struct GraphLock {
	pool: Arc<StorePool>,
	config: LockConfig,
}

impl GraphLock {
	pub fn new(pool: Arc<StorePool>, config: LockConfig) -> Self {
		Self { pool, config }
	}

	pub fn holder() -> Uuid {
		*PROCESS_HOLDER
	}

	/// One acquisition attempt: reap an expired lease, then upsert and check
	/// who holds the node.
	async fn try_acquire_once(&self, key: &str) -> Result<bool, StoreError> {
		let store = self.pool.borrow().await?;
		let now = Utc::now();
		let expires = now + chrono::Duration::milliseconds(self.config.lease_ms as i64);
		let p = params! {
			"key" => ParamValue::str(key),
			"holder" => ParamValue::str(Self::holder().to_string()),
			"now" => ParamValue::str(now.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)),
			"expires" => ParamValue::str(expires.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)),
		};

		store
			.execute(
				"MATCH (l:Lock {key: $key}) WHERE l.expires_at <= $now DELETE l",
				&p,
			)
			.await?;
		let rows = store
			.query(
				"MERGE (l:Lock {key: $key}) \
				 ON CREATE SET l.holder = $holder, l.acquired_at = $now, l.expires_at = $expires \
				 RETURN {holder: l.holder}",
				&p,
			)
			.await?;

		let held_by = rows
			.first()
			.and_then(|row| row.get("holder"))
			.and_then(|v| v.as_str())
			.map(str::to_string);
		Ok(held_by.as_deref() == Some(&Self::holder().to_string()))
	}

	async fn release_key(pool: &StorePool, key: &str) {
		let p = params! {
			"key" => ParamValue::str(key),
			"holder" => ParamValue::str(GraphLock::holder().to_string()),
		};
		let result = match pool.borrow().await {
			Ok(store) => {
				store
					.execute("MATCH (l:Lock {key: $key, holder: $holder}) DELETE l", &p)
					.await
			}
			Err(e) => Err(e),
		};
		if let Err(e) = result {
			warn!("releasing graph lock '{}' failed: {}", key, e);
		}
	}
}

struct GraphReleaser {
	pool: Arc<StorePool>,
	key: String,
}

#[async_trait]
impl LockReleaser for GraphReleaser {
	async fn release(self: Box<Self>) {
		GraphLock::release_key(&self.pool, &self.key).await;
	}

	fn release_in_background(self: Box<Self>) {
		if let Ok(handle) = tokio::runtime::Handle::try_current() {
			handle.spawn(async move {
				GraphLock::release_key(&self.pool, &self.key).await;
			});
		}
	}
}

#[async_trait]
impl IdentityLock for GraphLock {
	async fn acquire(&self, key: &str, timeout_ms: u64) -> Result<LockGuard, ResolveError> {
		let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);

		for _attempt in 0..=self.config.max_retries {
			if self.try_acquire_once(key).await? {
				return Ok(LockGuard {
					key: key.to_string(),
					releaser: Some(Box::new(GraphReleaser {
						pool: self.pool.clone(),
						key: key.to_string(),
					})),
				});
			}
			if tokio::time::Instant::now() >= deadline {
				break;
			}
			// Jittered delay so contending processes do not retry in lockstep.
			let jitter = rand::thread_rng().gen_range(0..=self.config.retry_delay_ms / 4 + 1);
			tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms + jitter)).await;
		}

		Err(ResolveError::LockTimeout {
			key: key.to_string(),
			timeout_ms,
		})
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[tokio::test]
	async fn same_key_excludes_concurrent_holders() {
		let lock = Arc::new(InProcessLock::new());
		let in_section = Arc::new(AtomicUsize::new(0));
		let max_seen = Arc::new(AtomicUsize::new(0));

		let mut tasks = Vec::new();
		for _ in 0..8 {
			let lock = lock.clone();
			let in_section = in_section.clone();
			let max_seen = max_seen.clone();
			tasks.push(tokio::spawn(async move {
				let guard = lock.acquire("COMPANY:acme", 5_000).await.unwrap();
				let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
				max_seen.fetch_max(now, Ordering::SeqCst);
				tokio::time::sleep(Duration::from_millis(5)).await;
				in_section.fetch_sub(1, Ordering::SeqCst);
				guard.release().await;
			}));
		}
		for t in tasks {
			t.await.unwrap();
		}
		assert_eq!(max_seen.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn different_keys_do_not_contend() {
		let lock = InProcessLock::new();
		let a = lock.acquire("COMPANY:acme", 100).await.unwrap();
		let b = lock.acquire("COMPANY:other", 100).await.unwrap();
		a.release().await;
		b.release().await;
	}

	#[tokio::test]
	async fn acquisition_times_out_with_typed_error() {
		let lock = InProcessLock::new();
		let held = lock.acquire("COMPANY:acme", 100).await.unwrap();

		let err = lock.acquire("COMPANY:acme", 50).await.unwrap_err();
		assert_eq!(err.kind(), "LOCK_TIMEOUT");
		held.release().await;
	}

	#[tokio::test]
	async fn release_makes_key_available_again() {
		let lock = InProcessLock::new();
		let first = lock.acquire("COMPANY:acme", 100).await.unwrap();
		first.release().await;
		let second = lock.acquire("COMPANY:acme", 100).await.unwrap();
		second.release().await;
	}

	#[test]
	fn holder_is_stable_within_process() {
		assert_eq!(GraphLock::holder(), GraphLock::holder());
	}
}
