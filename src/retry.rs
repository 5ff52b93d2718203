//! Fixed-interval retry policies for readiness checks.
//!
//! Every wait in the bootstrap pipeline (port open, shell usable, server
//! active) is a bounded poll: try, and if the target is not ready yet, sleep
//! for `interval` and try again, up to `max_attempts` times. Individual
//! attempt failures are logged at debug level and swallowed; only the
//! aggregate [`Exhausted`] outcome is surfaced.
//!
//! The first attempt runs immediately and there is no sleep after the last
//! one, so a policy with `interval = 0` performs exactly `max_attempts`
//! back-to-back attempts.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How often and how many times to check whether something is ready.
///
/// What counts as "ready" is decided by the check passed to [`RetryPolicy::poll`];
/// the policy itself only carries timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay between two consecutive attempts
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    /// Maximum number of attempts (at least 1 attempt is always made)
    pub max_attempts: u32,
}

/// The retry budget ran out before the check succeeded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exhausted {
    /// Number of attempts made
    pub attempts: u32,
    /// Nominal waiting time, `attempts * interval`
    pub elapsed: Duration,
    /// Display form of the last attempt's failure
    pub last_error: String,
}

impl RetryPolicy {
    /// Create a policy
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Policy for waiting on a TCP port: 2s apart, 1000 attempts
    pub const fn port_default() -> Self {
        Self::new(Duration::from_secs(2), 1000)
    }

    /// Policy for waiting on a usable shell: 2s apart, 100 attempts.
    ///
    /// Guest init scripts keep running long after sshd starts listening, so
    /// this is a separate budget from the port probe.
    pub const fn shell_default() -> Self {
        Self::new(Duration::from_secs(2), 100)
    }

    /// Policy for waiting on a cloud server to become active: 5s apart, 120 attempts
    pub const fn server_active_default() -> Self {
        Self::new(Duration::from_secs(5), 120)
    }

    /// Effective attempt budget (a zero budget still makes one attempt)
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Nominal time a fully exhausted poll waits for
    pub fn budget(&self, attempts: u32) -> Duration {
        self.interval.saturating_mul(attempts)
    }

    /// Poll `check` until it returns `Ok`, or the budget is exhausted.
    ///
    /// Returns the value produced by the successful attempt together with the
    /// 1-based attempt number it succeeded on.
    pub async fn poll<T, E, F, Fut>(
        &self,
        operation_name: &str,
        mut check: F,
    ) -> Result<(T, u32), Exhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match check(attempt).await {
                Ok(value) => {
                    debug!(
                        operation = %operation_name,
                        attempt,
                        max_attempts,
                        "Ready"
                    );
                    return Ok((value, attempt));
                }
                Err(e) => {
                    debug!(
                        operation = %operation_name,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Not ready yet"
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < max_attempts && !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }
        }

        warn!(
            operation = %operation_name,
            attempts = max_attempts,
            error = %last_error,
            "Retry budget exhausted"
        );

        Err(Exhausted {
            attempts: max_attempts,
            elapsed: self.budget(max_attempts),
            last_error,
        })
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
