//! TCP readiness probe
//!
//! Waits for a port on a freshly provisioned node to accept connections.
//! Each attempt is bounded by its own connect timeout so a single hung SYN
//! cannot stretch the overall budget beyond `max_attempts` attempts.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::info;

use crate::retry::RetryPolicy;

/// The port did not accept a connection within the retry budget
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{address}:{port} unreachable after {attempts} attempts ({elapsed:?})")]
pub struct ProbeTimeout {
    /// Probed address
    pub address: String,
    /// Probed port
    pub port: u16,
    /// Attempts made
    pub attempts: u32,
    /// Nominal time waited (`attempts * interval`)
    pub elapsed: Duration,
}

/// Trait for waiting on a TCP port (allows mocking in tests)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Wait until `address:port` accepts a TCP connection
    async fn wait_for_port(
        &self,
        address: &str,
        port: u16,
        policy: &RetryPolicy,
    ) -> Result<(), ProbeTimeout>;
}

/// Probe that opens real TCP connections
#[derive(Debug, Clone)]
pub struct TcpReadinessProbe {
    connect_timeout: Duration,
}

impl TcpReadinessProbe {
    /// Create a probe with the given per-attempt connect timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn try_connect(&self, address: &str, port: u16) -> Result<(), String> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect((address, port))).await
        {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("connect timed out after {:?}", self.connect_timeout)),
        }
    }
}

impl Default for TcpReadinessProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl ReadinessProbe for TcpReadinessProbe {
    async fn wait_for_port(
        &self,
        address: &str,
        port: u16,
        policy: &RetryPolicy,
    ) -> Result<(), ProbeTimeout> {
        info!(address, port, "Waiting for port to accept connections");

        let operation = format!("port {}:{}", address, port);
        let (_, attempt) = policy
            .poll(&operation, move |_| self.try_connect(address, port))
            .await
            .map_err(|exhausted| ProbeTimeout {
                address: address.to_string(),
                port,
                attempts: exhausted.attempts,
                elapsed: exhausted.elapsed,
            })?;

        info!(address, port, attempt, "Port is reachable");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Grab a port on loopback that nothing listens on
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn open_port_is_ready_on_first_attempt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = TcpReadinessProbe::default();
        let result = probe
            .wait_for_port("127.0.0.1", port, &RetryPolicy::new(Duration::ZERO, 1))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn closed_port_times_out_after_exactly_max_attempts() {
        let port = closed_port().await;

        let probe = TcpReadinessProbe::new(Duration::from_millis(200));
        let err = probe
            .wait_for_port("127.0.0.1", port, &RetryPolicy::new(Duration::ZERO, 3))
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(err.elapsed, Duration::ZERO);
        assert_eq!(err.port, port);
    }

    #[tokio::test]
    async fn port_that_opens_later_is_picked_up() {
        let port = closed_port().await;

        let opener = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            // Keep accepting until the probe has connected
            let _ = listener.accept().await;
        });

        let probe = TcpReadinessProbe::new(Duration::from_millis(200));
        let result = probe
            .wait_for_port(
                "127.0.0.1",
                port,
                &RetryPolicy::new(Duration::from_millis(20), 100),
            )
            .await;
        assert!(result.is_ok());
        opener.await.unwrap();
    }
}
