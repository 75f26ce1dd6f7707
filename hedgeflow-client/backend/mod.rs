pub mod http;
pub mod sse;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::Stream;

use crate::flows::events::BackendEvent;
use crate::flows::history::LastState;
use crate::flows::request::RunRequest;

/// Ordered events of one backend execution. Dropping the stream closes the
/// underlying connection.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<BackendEvent, BackendError>> + Send>>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The request never reached the backend.
    #[error("could not connect to backend: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode backend response: {0}")]
    Decode(String),

    #[error("not found on backend: {0}")]
    NotFound(String),
}

impl BackendError {
    /// Connection failures and server-side errors are worth another attempt;
    /// anything the backend rejected outright is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Connect(_) | BackendError::Transport(_) => true,
            BackendError::Status { status, .. } => *status >= 500,
            BackendError::Decode(_) | BackendError::NotFound(_) => false,
        }
    }

    /// True only when nothing was sent, so even a non-idempotent request can
    /// be repeated.
    pub fn is_unsent(&self) -> bool {
        matches!(self, BackendError::Connect(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            BackendError::Connect(e.to_string())
        } else if e.is_decode() {
            BackendError::Decode(e.to_string())
        } else {
            BackendError::Transport(e.to_string())
        }
    }
}

/// The remote service that executes flows.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Submit a run and open its event stream.
    async fn start(&self, flow_id: &str, request: &RunRequest) -> Result<EventStream, BackendError>;

    /// Re-open the event stream of a run that is already executing.
    async fn attach(&self, flow_id: &str) -> Result<EventStream, BackendError>;

    /// Ask the backend to cancel the flow's current run.
    async fn stop(&self, flow_id: &str) -> Result<(), BackendError>;

    /// Last known run of the flow, `None` when the backend has no record.
    async fn last_state(&self, flow_id: &str) -> Result<Option<LastState>, BackendError>;
}

/// Bounded retry for opening streams and recovery queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. The last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, op: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        self.run_while(what, op, BackendError::is_retryable).await
    }

    /// Like [`run`](Self::run), but for requests that must not reach the
    /// backend twice: only connection failures are retried.
    pub async fn run_unsent<T, F, Fut>(&self, what: &str, op: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        self.run_while(what, op, BackendError::is_unsent).await
    }

    async fn run_while<T, F, Fut>(
        &self,
        what: &str,
        mut op: F,
        retry_on: fn(&BackendError) -> bool,
    ) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let max = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retry_on(&e) && attempt < max => {
                    tracing::warn!(attempt, max, error = %e, "{what} failed, retrying");
                    tokio::time::sleep(self.interval).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instant(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::ZERO)
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 30);
        assert_eq!(policy.interval, Duration::from_secs(1));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(BackendError::Connect("refused".into()).is_retryable());
        assert!(BackendError::Transport("reset".into()).is_retryable());
        assert!(BackendError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(!BackendError::Status { status: 400, body: String::new() }.is_retryable());
        assert!(!BackendError::NotFound("f1".into()).is_retryable());
        assert!(!BackendError::Decode("bad".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = BackendError::Status {
            status: 502,
            body: "bad gateway".into(),
        };
        assert_eq!(err.to_string(), "backend returned 502: bad gateway");
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = instant(5)
            .run("open stream", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(BackendError::Transport("connection refused".into()))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = instant(4)
            .run("open stream", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::Transport("down".into()))
            })
            .await;

        assert_eq!(result, Err(BackendError::Transport("down".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = instant(10)
            .run("fetch last state", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::Status { status: 422, body: "bad request".into() })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_only_connect_failures_are_unsent() {
        assert!(BackendError::Connect("refused".into()).is_unsent());
        assert!(!BackendError::Transport("reset".into()).is_unsent());
        assert!(!BackendError::Status { status: 500, body: String::new() }.is_unsent());
    }

    #[tokio::test]
    async fn test_unsent_retry_skips_server_and_transport_errors() {
        for err in [
            BackendError::Status { status: 500, body: "boom".into() },
            BackendError::Transport("connection reset".into()),
        ] {
            let calls = AtomicU32::new(0);
            let result: Result<(), _> = instant(5)
                .run_unsent("start run", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(err.clone())
                })
                .await;
            assert_eq!(result, Err(err));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_unsent_retry_repeats_connect_failures() {
        let calls = AtomicU32::new(0);
        let result = instant(5)
            .run_unsent("start run", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(BackendError::Connect("connection refused".into()))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let calls = AtomicU32::new(0);
        let _ = instant(0)
            .run("open stream", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BackendError>(())
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
