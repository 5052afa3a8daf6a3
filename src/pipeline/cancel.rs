//! Cancellation tokens and per-attempt deadlines raced against every checkpoint.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::core::{PipelineError, PipelineResult};

#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        CancelToken { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any token clone, so this only ends on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `work` unless the token fires or the deadline passes first.
pub async fn guarded<F, T>(token: &CancelToken, deadline: Instant, timeout_secs: u64, work: F) -> PipelineResult<T>
where
    F: Future<Output = PipelineResult<T>>,
{
    if token.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(PipelineError::Cancelled),
        outcome = tokio::time::timeout_at(deadline, work) => {
            outcome.map_err(|_| PipelineError::TimedOut(timeout_secs))?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_guard_passes_result_through() {
        let token = CancelToken::new();
        let deadline = Instant::now() + Duration::from_secs(5);

        let value = guarded(&token, deadline, 5, async { Ok(7) }).await.unwrap();

        assert_eq!(value, 7);
    }

    #[test]
    fn test_cancelled_resolves_only_after_cancel() {
        let token = CancelToken::new();
        let mut waiting = tokio_test::task::spawn(token.cancelled());
        tokio_test::assert_pending!(waiting.poll());

        token.cancel();

        assert!(waiting.is_woken());
        tokio_test::assert_ready!(waiting.poll());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_work() {
        let token = CancelToken::new();
        let deadline = Instant::now() + Duration::from_secs(60);
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let outcome: PipelineResult<()> = guarded(&token, deadline, 60, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await;

        assert!(matches!(outcome, Err(PipelineError::Cancelled)));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_times_out() {
        let token = CancelToken::new();
        let deadline = Instant::now() + Duration::from_millis(20);

        let outcome: PipelineResult<()> = guarded(&token, deadline, 1, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await;

        assert!(matches!(outcome, Err(PipelineError::TimedOut(1))));
    }
}
