//! In-process webhook delivery deduplication.
//!
//! A bounded per-job LRU of recently seen delivery ids. The cache is lost on
//! restart on purpose: the store's guarded status transition already makes a
//! replayed delivery harmless, this only lets the handler answer
//! `idempotent:true` instead of silently no-opping.

use std::num::NonZeroUsize;
use std::sync::RwLock;

use lru::LruCache;
use uuid::Uuid;

const DEFAULT_JOB_CAPACITY: usize = 1024;
/// Delivery ids remembered per job.
pub const DELIVERIES_PER_JOB: usize = 32;

pub struct DeliveryCache {
    inner: RwLock<LruCache<Uuid, LruCache<String, ()>>>,
    per_job: NonZeroUsize,
}

impl DeliveryCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_JOB_CAPACITY, DELIVERIES_PER_JOB)
    }

    pub fn with_capacity(jobs: usize, per_job: usize) -> Self {
        Self {
            inner: RwLock::new(LruCache::new(
                NonZeroUsize::new(jobs.max(1)).expect("capacity is at least 1"),
            )),
            per_job: NonZeroUsize::new(per_job.max(1)).expect("capacity is at least 1"),
        }
    }

    /// Whether this delivery id was already seen for the job; records it
    /// either way.
    pub fn check_and_record(&self, job_id: Uuid, delivery_id: &str) -> bool {
        let mut cache = self.inner.write().expect("delivery cache lock poisoned");
        let seen = cache.get_or_insert_mut(job_id, || LruCache::new(self.per_job));
        seen.put(delivery_id.to_string(), ()).is_some()
    }

    /// Read-only peek, without promoting the entry.
    pub fn contains(&self, job_id: Uuid, delivery_id: &str) -> bool {
        let cache = self.inner.read().expect("delivery cache lock poisoned");
        cache
            .peek(&job_id)
            .map(|seen| seen.contains(delivery_id))
            .unwrap_or(false)
    }
}

impl Default for DeliveryCache {
    fn default() -> Self {
        Self::new()
    }
}
