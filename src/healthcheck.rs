//! Port readiness and health tracking for supervised processes
//!
//! Readiness is a plain TCP connect to the loopback port. The supervisor uses
//! the same probe both for the startup wait and for periodic health ticks.

use futures::future::BoxFuture;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health check configuration
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Interval between health ticks
    pub interval: Duration,
    /// Timeout for each connect attempt
    pub connect_timeout: Duration,
    /// Overall bound on a startup port wait
    pub port_wait_timeout: Duration,
    /// Consecutive failed ticks before a restart
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            connect_timeout: Duration::from_millis(100),
            port_wait_timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
        }
    }
}

/// Something that can tell whether a loopback port accepts connections
pub trait PortProbe: Send + Sync {
    fn is_open(&self, port: u16, timeout: Duration) -> BoxFuture<'_, bool>;
}

/// Probe that opens a real TCP connection to 127.0.0.1
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpPortProbe;

impl PortProbe for TcpPortProbe {
    fn is_open(&self, port: u16, timeout: Duration) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let addr = format!("127.0.0.1:{}", port);
            match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(_stream)) => true,
                Ok(Err(e)) => {
                    debug!(port, error = %e, "Port check failed (connection error)");
                    false
                }
                Err(_) => {
                    debug!(port, "Port check failed (timeout)");
                    false
                }
            }
        })
    }
}

/// Outcome of waiting for a port to open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortWait {
    Ready,
    TimedOut,
    Cancelled,
}

/// Poll `port` until it accepts a connection, `overall` elapses or `cancel` fires
pub async fn wait_for_port(
    probe: &dyn PortProbe,
    port: u16,
    overall: Duration,
    per_attempt: Duration,
    cancel: &CancellationToken,
) -> PortWait {
    let deadline = tokio::time::Instant::now() + overall;
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return PortWait::Cancelled;
        }

        attempts += 1;
        let open = tokio::select! {
            open = probe.is_open(port, per_attempt) => open,
            _ = cancel.cancelled() => return PortWait::Cancelled,
        };
        if open {
            debug!(port, attempts, "Port is accepting connections");
            return PortWait::Ready;
        }

        if tokio::time::Instant::now() >= deadline {
            warn!(port, attempts, timeout_ms = overall.as_millis() as u64, "Port did not open in time");
            return PortWait::TimedOut;
        }

        tokio::select! {
            _ = tokio::time::sleep(per_attempt) => {}
            _ = cancel.cancelled() => return PortWait::Cancelled,
        }
    }
}

/// What a tick result means for the process pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    /// Passed with no prior failures
    Healthy,
    /// Passed after `after` consecutive failures
    Recovered { after: u32 },
    /// Failed, still under the threshold
    Degraded { failures: u32 },
    /// Threshold reached
    RestartRequired { failures: u32 },
}

/// Consecutive-failure counter
#[derive(Debug, Clone)]
pub struct HealthState {
    consecutive_failures: u32,
    threshold: u32,
}

impl HealthState {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn record_success(&mut self) -> HealthTransition {
        let previous = std::mem::take(&mut self.consecutive_failures);
        if previous > 0 {
            info!(after = previous, "Health check recovered");
            HealthTransition::Recovered { after: previous }
        } else {
            HealthTransition::Healthy
        }
    }

    pub fn record_failure(&mut self) -> HealthTransition {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.threshold {
            HealthTransition::RestartRequired {
                failures: self.consecutive_failures,
            }
        } else {
            HealthTransition::Degraded {
                failures: self.consecutive_failures,
            }
        }
    }

    /// Jump straight to the threshold so the next failed tick restarts
    pub fn force_threshold(&mut self) {
        self.consecutive_failures = self.consecutive_failures.max(self.threshold);
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}
