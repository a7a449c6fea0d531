//! Cancellation and deadline signal carried by every adapter call.

use crate::chains::FlowError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default)]
pub struct ScanContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl ScanContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, budget: Duration) -> Self {
        self.with_deadline(Instant::now() + budget)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fails fast if the scan was cancelled or ran past its deadline.
    pub fn check(&self) -> Result<(), FlowError> {
        if self.cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(FlowError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Run `fut`, abandoning it when the scan is cancelled or the deadline passes.
    pub async fn guard<T, E, F>(&self, fut: F) -> Result<T, FlowError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<FlowError>,
    {
        self.check()?;
        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FlowError::Cancelled),
            _ = expired => Err(FlowError::DeadlineExceeded),
            res = fut => res.map_err(Into::into),
        }
    }

    /// Sleep for `delay` unless cancelled first.
    pub async fn sleep(&self, delay: Duration) -> Result<(), FlowError> {
        self.guard(async {
            tokio::time::sleep(delay).await;
            Ok::<_, FlowError>(())
        })
        .await
    }
}
