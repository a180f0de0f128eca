use std::{future::Future, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::CancelReason;

/// Caller cancellation plus the request deadline, shared by every suspension point of a dispatch.
#[derive(Debug, Clone)]
pub(crate) struct Guard {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Guard {
    pub fn new(cancel: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            cancel,
            deadline: timeout.map(|timeout| Instant::now() + timeout),
        }
    }

    /// Run `future` unless the caller goes away or the deadline passes first.
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, CancelReason> {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CancelReason::CallerDisconnected),
            _ = deadline => Err(CancelReason::DeadlineExceeded),
            output = future => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::Guard;
    use crate::error::CancelReason;

    #[tokio::test]
    async fn completes_when_nothing_interrupts() {
        let guard = Guard::new(CancellationToken::new(), Some(Duration::from_secs(5)));
        assert_eq!(guard.run(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn cancellation_wins() {
        let token = CancellationToken::new();
        token.cancel();

        let guard = Guard::new(token, None);
        let result = guard.run(std::future::pending::<()>()).await;

        assert_eq!(result, Err(CancelReason::CallerDisconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let guard = Guard::new(CancellationToken::new(), Some(Duration::from_millis(50)));
        let result = guard.run(std::future::pending::<()>()).await;

        assert_eq!(result, Err(CancelReason::DeadlineExceeded));
    }
}
