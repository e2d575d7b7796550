//! Rate Limiter (C5): a counted semaphore per model.
//!
//! `acquire` is non-blocking — a model at capacity fails the request
//! immediately rather than queuing, so tail latency stays predictable and
//! all the waiting happens in the account pool instead (§4.3).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};

pub struct RateLimiter {
    default_capacity: usize,
    per_model: HashMap<String, usize>,
    semaphores: RwLock<HashMap<String, Arc<Semaphore>>>,
}

/// RAII guard: dropping it releases the slot, satisfying P1 even on
/// early-return or panic-unwind paths.
pub struct ModelSlot {
    _permit: OwnedSemaphorePermit,
}

impl RateLimiter {
    pub fn new(default_capacity: usize, per_model: HashMap<String, usize>) -> Self {
        Self {
            default_capacity,
            per_model,
            semaphores: RwLock::new(HashMap::new()),
        }
    }

    fn capacity_for(&self, model: &str) -> usize {
        self.per_model.get(model).copied().unwrap_or(self.default_capacity)
    }

    async fn semaphore_for(&self, model: &str) -> Arc<Semaphore> {
        if let Some(sem) = self.semaphores.read().await.get(model) {
            return sem.clone();
        }
        let mut semaphores = self.semaphores.write().await;
        semaphores
            .entry(model.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.capacity_for(model))))
            .clone()
    }

    /// `acquireModelSlot(model)`. Returns `None` when the model is at its
    /// concurrency cap; the caller must fail the request with 429.
    pub async fn acquire(&self, model: &str) -> Option<ModelSlot> {
        let sem = self.semaphore_for(model).await;
        sem.try_acquire_owned().ok().map(|permit| ModelSlot { _permit: permit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_succeeds_under_capacity() {
        let limiter = RateLimiter::new(2, HashMap::new());
        let a = limiter.acquire("m").await;
        let b = limiter.acquire("m").await;
        assert!(a.is_some());
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn acquire_fails_at_capacity() {
        let limiter = RateLimiter::new(1, HashMap::new());
        let _a = limiter.acquire("m").await.unwrap();
        assert!(limiter.acquire("m").await.is_none());
    }

    #[tokio::test]
    async fn releasing_a_slot_frees_capacity() {
        let limiter = RateLimiter::new(1, HashMap::new());
        let a = limiter.acquire("m").await.unwrap();
        assert!(limiter.acquire("m").await.is_none());
        drop(a);
        assert!(limiter.acquire("m").await.is_some());
    }

    #[tokio::test]
    async fn per_model_override_applies_independently() {
        let mut overrides = HashMap::new();
        overrides.insert("big".to_string(), 3usize);
        let limiter = RateLimiter::new(1, overrides);

        let _a = limiter.acquire("big").await.unwrap();
        let _b = limiter.acquire("big").await.unwrap();
        assert!(limiter.acquire("big").await.is_some());

        let _c = limiter.acquire("small").await.unwrap();
        assert!(limiter.acquire("small").await.is_none());
    }

    #[tokio::test]
    async fn distinct_models_have_independent_capacity() {
        let limiter = RateLimiter::new(1, HashMap::new());
        let _a = limiter.acquire("m1").await.unwrap();
        assert!(limiter.acquire("m2").await.is_some());
    }
}
