//! Transport adapters.
//!
//! A transport is split once into an outbound [`RequestSink`] and an inbound
//! [`ResponseSource`] so the two directions never wait on each other. The
//! handshake, dispatcher and correlator only ever see these two traits.

mod call;
mod framed;

pub use call::CallTransport;
pub use framed::FramedTransport;

use crate::error::LinkError;
use crate::message::{Request, Response};
use std::future::Future;
use tokio::time::{sleep, timeout, Duration};
use tonic::async_trait;

#[async_trait]
pub trait RequestSink: Send + 'static {
    async fn send_request(&mut self, request: Request) -> Result<(), LinkError>;

    /// Ends the outbound direction. Calling it twice is harmless.
    async fn close(&mut self);
}

#[async_trait]
pub trait ResponseSource: Send + 'static {
    /// Waits for the next message from the ModelServer.
    ///
    /// End of stream is reported as [`LinkError::Connection`].
    async fn next_response(&mut self) -> Result<Response, LinkError>;
}

pub trait Transport: Send + 'static {
    /// Label used on metrics and logs.
    const NAME: &'static str;

    type Sink: RequestSink;
    type Source: ResponseSource;

    fn split(self) -> (Self::Sink, Self::Source);
}

#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    pub max_retries: u32,
    pub attempt_timeout: Duration,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            attempt_timeout: Duration::from_secs(1),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

/// Runs `connect` until it succeeds, backing off with jitter between attempts.
///
/// Only for establishing a fresh connection; a session that has been torn
/// down is never revived here.
pub async fn connect_with_retry<T, F, Fut>(
    policy: &ConnectPolicy,
    mut connect: F,
) -> Result<T, LinkError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LinkError>>,
{
    let mut retry_delay = policy.initial_delay;
    let mut last_error = LinkError::Connection("no connection attempt was made".to_string());

    for attempt in 0..=policy.max_retries {
        match timeout(policy.attempt_timeout, connect()).await {
            Ok(Ok(transport)) => return Ok(transport),
            Ok(Err(e)) => {
                tracing::error!("Connection attempt {} failed: {}", attempt + 1, e);
                last_error = e;
            }
            Err(_) => {
                tracing::error!("Connection attempt {} timed out", attempt + 1);
                last_error = LinkError::Connection(format!(
                    "connection attempt timed out after {:?}",
                    policy.attempt_timeout
                ));
            }
        }

        if attempt < policy.max_retries {
            let jitter = rand::random::<f32>() * 0.2 + 0.9;
            sleep(retry_delay.mul_f32(jitter)).await;
            retry_delay = (retry_delay * 2).min(policy.max_delay);
        }
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_until_success() {
        let attempts = AtomicU32::new(0);
        let policy = ConnectPolicy::default();

        let value = connect_with_retry(&policy, || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(LinkError::Connection("refused".to_string()))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_with_last_error() {
        let attempts = AtomicU32::new(0);
        let policy = ConnectPolicy {
            max_retries: 2,
            ..ConnectPolicy::default()
        };

        let result: Result<(), LinkError> = connect_with_retry(&policy, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(LinkError::Connection("refused".to_string()))
        })
        .await;

        assert_eq!(
            result.unwrap_err(),
            LinkError::Connection("refused".to_string())
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
