use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use super::error::DeploymentError;
use super::runtime::IsAliveResponse;

/// Pause between liveness probes.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(250);

/// Probe until alive, a fatal error, or `timeout`.
///
/// Each attempt gets `min(probe_timeout, remaining)`, so a hung probe is
/// retried and the overall deadline holds. The probe is always tried at
/// least once: with a zero budget the first attempt gets `probe_timeout`.
/// Errors are retried unless `is_fatal()`; the last failure is carried in
/// the timeout error.
pub async fn wait_until_alive<F, Fut>(
    mut probe: F,
    timeout: Duration,
    probe_timeout: Duration,
    backoff: Duration,
) -> Result<(), DeploymentError>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<IsAliveResponse, DeploymentError>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut last_error: Option<String> = None;
    let mut attempts: u32 = 0;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if attempts > 0 && remaining.is_zero() {
            return Err(DeploymentError::Timeout {
                operation: "runtime to become alive".into(),
                elapsed: start.elapsed(),
                last_error,
            });
        }
        attempts += 1;
        let budget = if remaining.is_zero() {
            probe_timeout
        } else {
            probe_timeout.min(remaining)
        };

        match tokio::time::timeout(budget, probe(budget)).await {
            Ok(Ok(resp)) if resp.is_alive => {
                tracing::debug!(
                    attempts,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "runtime is alive"
                );
                return Ok(());
            }
            Ok(Ok(resp)) => {
                last_error = Some(resp.message);
            }
            Ok(Err(e)) if e.is_fatal() => {
                tracing::warn!(error = %e, attempts, "liveness check failed fatally");
                return Err(e);
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, attempts, "liveness probe failed, retrying");
                last_error = Some(e.to_string());
            }
            Err(_) => {
                last_error = Some(format!("probe timed out after {:.1}s", budget.as_secs_f64()));
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(backoff.min(remaining)).await;
    }
}
