//! Cancellation and per-statement timeouts.

use crate::error::{OptimizerError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Caller-supplied controls shared by every I/O step of one engine call.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl RunContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fail with [`OptimizerError::Cancelled`] once the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(OptimizerError::Cancelled);
        }
        Ok(())
    }

    /// Run one catalog query or statement, racing it against cancellation
    /// and the timeout. Nothing is issued if the token already fired.
    pub async fn run<T, F>(&self, operation: &'static str, step: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let bounded = async {
            match self.timeout {
                Some(after) => tokio::time::timeout(after, step)
                    .await
                    .map_err(|_| OptimizerError::Timeout { operation, after })?,
                None => step.await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(OptimizerError::Cancelled),
            result = bounded => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_step_when_not_cancelled() -> anyhow::Result<()> {
        let ctx = RunContext::default();
        let value = ctx.run("step", async { Ok(7) }).await?;
        assert_eq!(value, 7);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_token_skips_step() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = RunContext::new(token);

        let mut started = false;
        let result = ctx
            .run("step", async {
                started = true;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(OptimizerError::Cancelled)));
        assert!(!started);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_step_times_out() {
        let ctx = RunContext::default().with_timeout(Some(Duration::from_secs(1)));
        let result = ctx
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(OptimizerError::Timeout {
                operation: "slow",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn cancellation_interrupts_running_step() {
        let token = CancellationToken::new();
        let ctx = RunContext::new(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let result: Result<()> = ctx
            .run("blocked", async {
                std::future::pending::<()>().await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(OptimizerError::Cancelled)));
        let _ = canceller.await;
    }
}
