use crate::bundler::BundlerApi;
use crate::error::ExecError;
use crate::race::first_success;
use crate::types::{OperationHandle, Receipt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Polls the bundler until one of the candidate handles has a receipt.
#[derive(Clone)]
pub struct ReceiptWatcher {
    bundler: Arc<dyn BundlerApi>,
    poll_interval: Duration,
}

impl ReceiptWatcher {
    pub fn new(bundler: Arc<dyn BundlerApi>, poll_interval: Duration) -> Self {
        Self {
            bundler,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// One round over every candidate. At most one of them can land, since
    /// they all share a sender and nonce.
    pub async fn poll_once(&self, handles: &[OperationHandle]) -> Option<Receipt> {
        let polls = handles.iter().map(|h| async move {
            match self.bundler.get_receipt(h).await {
                Ok(Some(r)) => Ok(r),
                Ok(None) => Err(None),
                Err(e) => Err(Some((h.user_op_hash, e))),
            }
        });
        match first_success(polls).await {
            Some(Ok(r)) => Some(r),
            Some(Err(Some((hash, e)))) => {
                tracing::warn!(user_op_hash = ?hash, error = %e, "receipt poll failed; will retry");
                None
            }
            _ => None,
        }
    }

    /// Polls at a fixed interval until a receipt shows up, `timeout` elapses,
    /// or `cancel` fires.
    ///
    /// `handles` is re-read before every round so replacements submitted while
    /// waiting are picked up. Neither timeout nor cancellation affect the
    /// operation itself.
    pub async fn wait_until<F>(
        &self,
        handles: F,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Receipt, ExecError>
    where
        F: Fn() -> Vec<OperationHandle>,
    {
        let start = Instant::now();
        let deadline = start + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(ExecError::Cancelled);
            }
            if let Some(receipt) = self.poll_once(&handles()).await {
                return Ok(receipt);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ExecError::ReceiptTimeout {
                    waited: now - start,
                });
            }
            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(ExecError::Cancelled),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}
