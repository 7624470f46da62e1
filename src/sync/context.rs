use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Deadline and cancellation flag for one fleet pass.
///
/// Cloned into every chain pipeline. Stages call [`SyncContext::is_cancelled`] before
/// each unit of work; nothing in flight is interrupted.
#[derive(Debug, Clone)]
pub struct SyncContext {
    started: Instant,
    budget: Duration,
    cancelled: Arc<AtomicBool>,
}

impl SyncContext {
    pub fn new(budget: Duration, cancelled: Arc<AtomicBool>) -> Self {
        Self { started: Instant::now(), budget, cancelled }
    }

    /// Context that only trips when cancelled explicitly.
    pub fn unbounded() -> Self {
        Self::new(Duration::MAX, Arc::new(AtomicBool::new(false)))
    }

    /// Trips the shared flag once the budget is spent, so every chain sees it.
    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Relaxed) {
            return true;
        }
        if self.started.elapsed() > self.budget {
            self.cancelled.store(true, Ordering::Relaxed);
            return true;
        }
        false
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_cancel_is_shared() {
        let ctx = SyncContext::unbounded();
        let other = ctx.clone();
        assert!(!other.is_cancelled());
        ctx.cancel();
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_trips_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = SyncContext::new(Duration::from_millis(5), flag.clone());
        assert!(!ctx.is_cancelled());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ctx.is_cancelled());
        assert!(flag.load(Ordering::Relaxed));
    }
}
