//! Bounded pool of reusable store handles with borrow-time validation.
//!
//! Borrow blocks up to `max_wait_ms`; exhaustion raises `POOL_EXHAUSTED`.
//! Handles failing the liveness probe on borrow are closed and replaced.
//! Returned handles go back to the idle set up to `max_idle`; surplus handles
//! are closed.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use super::GraphStore;
use crate::config::PoolConfig;
use crate::error::StoreError;

/// Creates fresh store handles for the pool.
#[async_trait]
pub trait StoreFactory: Send + Sync {
	async fn create(&self) -> Result<Arc<dyn GraphStore>, StoreError>;
}

#[derive(Default)]
struct PoolCounters {
	total_created: AtomicU64,
	total_borrowed: AtomicU64,
	total_released: AtomicU64,
	active: AtomicUsize,
}

struct PoolShared {
	config: PoolConfig,
	idle: Mutex<Vec<Arc<dyn GraphStore>>>,
	counters: PoolCounters,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
	pub total: usize,
	pub active: usize,
	pub idle: usize,
	pub total_borrowed: u64,
	pub total_released: u64,
	pub total_created: u64,
}

/// Bounded store-handle pool.
pub struct StorePool {
	factory: Arc<dyn StoreFactory>,
	shared: Arc<PoolShared>,
	permits: Arc<Semaphore>,
}

impl StorePool {
	/// Build the pool and warm `min_idle` handles.
	pub async fn new(
		factory: Arc<dyn StoreFactory>,
		config: PoolConfig,
	) -> Result<Self, StoreError> {
		let pool = Self {
			permits: Arc::new(Semaphore::new(config.max_total.max(1))),
			shared: Arc::new(PoolShared {
				config,
				idle: Mutex::new(Vec::new()),
				counters: PoolCounters::default(),
			}),
			factory,
		};

		for _ in 0..pool.shared.config.min_idle {
			let handle = pool.create_handle().await?;
			pool.shared.idle.lock().push(handle);
		}
		Ok(pool)
	}

	async fn create_handle(&self) -> Result<Arc<dyn GraphStore>, StoreError> {
		let handle = self.factory.create().await?;
		self.shared
			.counters
			.total_created
			.fetch_add(1, Ordering::Relaxed);
		Ok(handle)
	}

	/// Borrow a handle, waiting up to `max_wait_ms` for capacity.
	pub async fn borrow(&self) -> Result<PooledStore, StoreError> {
		let wait = Duration::from_millis(self.shared.config.max_wait_ms);
		let permit = timeout(wait, self.permits.clone().acquire_owned())
			.await
			.map_err(|_| StoreError::PoolExhausted {
				wait_ms: self.shared.config.max_wait_ms,
			})?
			.map_err(|_| StoreError::PoolExhausted {
				wait_ms: self.shared.config.max_wait_ms,
			})?;

		let store = match self.take_valid_idle().await {
			Some(s) => s,
			None => self.create_handle().await?,
		};

		self.shared
			.counters
			.total_borrowed
			.fetch_add(1, Ordering::Relaxed);
		self.shared.counters.active.fetch_add(1, Ordering::Relaxed);

		Ok(PooledStore {
			store,
			shared: self.shared.clone(),
			_permit: permit,
		})
	}

	/// Pop idle handles until one passes validation (when enabled). Failed
	/// handles are closed and dropped; the caller creates a replacement.
	async fn take_valid_idle(&self) -> Option<Arc<dyn GraphStore>> {
		loop {
			let candidate = self.shared.idle.lock().pop()?;
			if !self.shared.config.test_on_borrow || candidate.is_connected().await {
				return Some(candidate);
			}
			debug!("pool handle failed borrow validation; closing");
			if let Err(e) = candidate.close().await {
				warn!("closing invalid pool handle failed: {}", e);
			}
		}
	}

	pub fn stats(&self) -> PoolStats {
		let idle = self.shared.idle.lock().len();
		let active = self.shared.counters.active.load(Ordering::Relaxed);
		PoolStats {
			total: idle + active,
			active,
			idle,
			total_borrowed: self.shared.counters.total_borrowed.load(Ordering::Relaxed),
			total_released: self.shared.counters.total_released.load(Ordering::Relaxed),
			total_created: self.shared.counters.total_created.load(Ordering::Relaxed),
		}
	}
}

/// A borrowed handle. Returning to the pool happens on drop, on both success
/// and error paths.
pub struct PooledStore {
	store: Arc<dyn GraphStore>,
	shared: Arc<PoolShared>,
	_permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PooledStore").finish_non_exhaustive()
	}
}

impl Deref for PooledStore {
	type Target = dyn GraphStore;

	fn deref(&self) -> &Self::Target {
		&*self.store
	}
}

impl Drop for PooledStore {
	fn drop(&mut self) {
		self.shared
			.counters
			.total_released
			.fetch_add(1, Ordering::Relaxed);
		self.shared.counters.active.fetch_sub(1, Ordering::Relaxed);

		let mut idle = self.shared.idle.lock();
		if idle.len() < self.shared.config.max_idle {
			idle.push(self.store.clone());
			return;
		}
		drop(idle);

		// Surplus handle: close it off-thread when a runtime is available.
		let store = self.store.clone();
		if let Ok(handle) = tokio::runtime::Handle::try_current() {
			handle.spawn(async move {
				if let Err(e) = store.close().await {
					warn!("closing surplus pool handle failed: {}", e);
				}
			});
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicBool;

	use super::*;
	use crate::store::{Params, Row};

	struct MockStore {
		alive: AtomicBool,
	}

	#[async_trait]
	impl GraphStore for MockStore {
		async fn execute(&self, _query: &str, _params: &Params) -> Result<(), StoreError> {
			Ok(())
		}

		async fn query(&self, _query: &str, _params: &Params) -> Result<Vec<Row>, StoreError> {
			Ok(Vec::new())
		}

		async fn create_indexes(&self) -> Result<(), StoreError> {
			Ok(())
		}

		async fn is_connected(&self) -> bool {
			self.alive.load(Ordering::Relaxed)
		}

		async fn close(&self) -> Result<(), StoreError> {
			self.alive.store(false, Ordering::Relaxed);
			Ok(())
		}
	}

	struct MockFactory;

	#[async_trait]
	impl StoreFactory for MockFactory {
		async fn create(&self) -> Result<Arc<dyn GraphStore>, StoreError> {
			Ok(Arc::new(MockStore {
				alive: AtomicBool::new(true),
			}))
		}
	}

	fn config(max_total: usize, max_wait_ms: u64) -> PoolConfig {
		PoolConfig {
			max_total,
			max_idle: max_total,
			min_idle: 0,
			max_wait_ms,
			test_on_borrow: true,
		}
	}

	#[tokio::test]
	async fn borrow_and_release_reuses_handles() {
		let pool = StorePool::new(Arc::new(MockFactory), config(4, 100))
			.await
			.unwrap();

		{
			let handle = pool.borrow().await.unwrap();
			assert!(handle.is_connected().await);
			assert_eq!(pool.stats().active, 1);
		}

		assert_eq!(pool.stats().active, 0);
		assert_eq!(pool.stats().idle, 1);

		let _again = pool.borrow().await.unwrap();
		// Reused, not recreated.
		assert_eq!(pool.stats().total_created, 1);
		assert_eq!(pool.stats().total_borrowed, 2);
	}

	#[tokio::test]
	async fn exhaustion_raises_typed_error() {
		let pool = StorePool::new(Arc::new(MockFactory), config(1, 50))
			.await
			.unwrap();

		let _held = pool.borrow().await.unwrap();
		let err = pool.borrow().await.unwrap_err();
		assert!(matches!(&err, StoreError::PoolExhausted { wait_ms: 50 }));
		// The public taxonomy maps pool exhaustion to its own kind.
		assert_eq!(crate::error::ResolveError::from(err).kind(), "POOL_EXHAUSTED");
	}

	#[tokio::test]
	async fn dead_idle_handles_are_replaced_on_borrow() {
		let pool = StorePool::new(Arc::new(MockFactory), config(2, 100))
			.await
			.unwrap();

		{
			let handle = pool.borrow().await.unwrap();
			// Kill the underlying store before it returns to the idle set.
			handle.close().await.unwrap();
		}
		assert_eq!(pool.stats().idle, 1);

		let replacement = pool.borrow().await.unwrap();
		assert!(replacement.is_connected().await);
		// The dead handle was discarded and a fresh one created.
		assert_eq!(pool.stats().total_created, 2);
	}

	#[tokio::test]
	async fn min_idle_handles_are_warmed() {
		let cfg = PoolConfig {
			min_idle: 3,
			..config(8, 100)
		};
		let pool = StorePool::new(Arc::new(MockFactory), cfg).await.unwrap();
		assert_eq!(pool.stats().idle, 3);
		assert_eq!(pool.stats().total_created, 3);
	}
}
