//! Startup connectivity check against the registry backend.

use log::{info, warn};
use thiserror::Error;
use tokio::time::sleep;

use crate::backend::RegistryBackend;
use crate::config::{RetryAttempts, RetryPolicy};
use crate::error::BackendError;

#[derive(Debug, Error)]
#[error("Unable to connect to registry after {attempts} attempt(s): {source}")]
pub struct ConnectionError {
    pub attempts: u64,
    #[source]
    pub source: BackendError,
}

/// Pings the backend until it answers or the retry budget is spent.
///
/// `Bounded(n)` allows `n` retries after the first attempt.
pub async fn establish(
    backend: &dyn RegistryBackend,
    policy: RetryPolicy,
) -> Result<(), ConnectionError> {
    let limit = match policy.attempts {
        RetryAttempts::Bounded(n) => n.to_string(),
        RetryAttempts::Infinite => "inf".to_string(),
    };

    let mut attempt: u64 = 0;
    loop {
        info!("Connecting to backend ({}/{})", attempt, limit);
        match backend.ping().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                let exhausted = match policy.attempts {
                    RetryAttempts::Bounded(n) => attempt >= u64::from(n),
                    RetryAttempts::Infinite => false,
                };
                if exhausted {
                    return Err(ConnectionError {
                        attempts: attempt + 1,
                        source: e,
                    });
                }
                warn!("Backend not ready: {}", e);
            }
        }
        sleep(policy.interval).await;
        attempt += 1;
    }
}
