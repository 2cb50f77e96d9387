use std::{future::Future, time::Duration};

use metrics::counter;
use tokio::time::sleep;
use tracing::warn;

use super::transport::TransportError;

/// Fixed-backoff retry for poll requests.
///
/// Only [`TransportError::Transient`] failures are retried; anything else is
/// returned on the first attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Debug)]
pub struct RetryFailure {
    pub attempts: u32,
    pub error: TransportError,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Runs `op` until it succeeds, fails non-transiently or runs out of
    /// retries. `op` receives the zero-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    counter!("support_poll_retries_total").increment(1);
                    warn!(attempt, error = %error, "poll failed, retrying");
                    sleep(self.backoff).await;
                }
                Err(error) => {
                    return Err(RetryFailure {
                        attempts: attempt + 1,
                        error,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    fn quick() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn succeeds_on_fourth_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = quick()
            .run(|_| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(TransportError::Transient("status 400".into()))
                    } else {
                        Ok("page")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, "page");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let failure = quick()
            .run(|_| async { Err::<(), _>(TransportError::Transient("down".into())) })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 4);
    }

    #[tokio::test]
    async fn application_errors_are_not_retried() {
        let failure = quick()
            .run(|_| async {
                Err::<(), _>(TransportError::Application {
                    status: StatusCode::NOT_FOUND,
                    message: "no such chat".into(),
                })
            })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 1);
    }
}
