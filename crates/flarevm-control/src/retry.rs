//! Deadline and retry wrapper for hypervisor calls.

use std::future::Future;
use std::time::Duration;

use flarevm_core::VmId;

use crate::hypervisor::HypervisorError;
use crate::types::RetryPolicy;

/// Run `call` with a per-attempt deadline, retrying transient failures.
///
/// Attempts are spaced by exponential backoff capped at
/// `policy.max_backoff`. A timed-out attempt is not retried.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, the first permanent
/// error, or `HypervisorError::Timeout` when an attempt misses its deadline.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Duration,
    vm_id: &VmId,
    operation: &'static str,
    mut call: F,
) -> Result<T, HypervisorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HypervisorError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;

    loop {
        let result = match tokio::time::timeout(deadline, call()).await {
            Ok(result) => result,
            Err(_) => Err(HypervisorError::Timeout(deadline)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                tracing::warn!(
                    vm_id = %vm_id,
                    operation,
                    attempt,
                    error = %e,
                    "Transient hypervisor failure, retrying in {backoff:?}"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
