//! Bounded executor: admits at most `limit` guarded operations at a time.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{Error, Result};

#[derive(Clone, Debug)]
pub struct Gate {
    name: &'static str,
    permits: Arc<Semaphore>,
    limit: usize,
}

impl Gate {
    pub fn new(name: &'static str, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            name,
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Operations currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    /// Waits for a slot, then runs `fut`; the slot is released when `fut`
    /// finishes, whether it succeeded or not.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Worker(format!("{} gate closed", self.name)))?;
        fut.await
    }
}
