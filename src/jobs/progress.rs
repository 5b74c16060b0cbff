use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::JobScheduler;
use crate::storage::ProgressObserver;

/// Highest progress a job reports before it is actually completed
const MAX_RUNNING_PROGRESS: i32 = 99;

/// Turns per-artifact byte counts into a job percentage.
///
/// Artifacts are weighted by declared size. If any size is unknown every
/// artifact weighs the same and progress only moves between artifacts.
pub struct ProgressTracker {
    scheduler: Arc<JobScheduler>,
    job_id: i32,
    sizes: Vec<u64>,
    total: Option<u64>,
    item: AtomicUsize,
    last: AtomicI32,
}

impl ProgressTracker {
    pub fn new(scheduler: Arc<JobScheduler>, job_id: i32, declared: &[Option<u64>]) -> Self {
        let sizes: Vec<u64> = declared.iter().map(|s| s.unwrap_or(0)).collect();
        let total = if declared.iter().all(Option::is_some) {
            Some(sizes.iter().sum::<u64>()).filter(|t| *t > 0)
        } else {
            None
        };
        Self {
            scheduler,
            job_id,
            sizes,
            total,
            item: AtomicUsize::new(0),
            last: AtomicI32::new(-1),
        }
    }

    /// Percentage after `bytes` of artifact `item`
    pub fn percent(&self, item: usize, bytes: u64) -> i32 {
        let count = self.sizes.len().max(1) as u64;
        let pct = match self.total {
            Some(total) => {
                let before: u64 = self.sizes.iter().take(item).sum();
                let current = self.sizes.get(item).copied().unwrap_or(0);
                (before + bytes.min(current)) * 100 / total
            }
            None => (item as u64).min(count) * 100 / count,
        };
        (pct as i32).min(MAX_RUNNING_PROGRESS)
    }

    /// Move on to artifact `item`
    pub async fn start_item(&self, item: usize) {
        self.item.store(item, Ordering::SeqCst);
        self.report(self.percent(item, 0)).await;
    }

    async fn report(&self, pct: i32) {
        // Only increases reach the database
        if self.last.fetch_max(pct, Ordering::SeqCst) >= pct {
            return;
        }
        if let Err(e) = self.scheduler.set_progress(self.job_id, pct).await {
            tracing::warn!("Failed to record progress for job {}: {}", self.job_id, e);
        }
    }
}

#[async_trait]
impl ProgressObserver for ProgressTracker {
    async fn on_progress(&self, bytes: u64) {
        let item = self.item.load(Ordering::SeqCst);
        self.report(self.percent(item, bytes)).await;
    }
}
