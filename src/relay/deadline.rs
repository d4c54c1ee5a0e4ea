//! Read/write deadlines and heartbeat cadence

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::time::{Instant, Sleep};

use super::{PING_PERIOD, PONG_WAIT, WRITE_WAIT};
use crate::{RelayError, Result};

/// Deadline and heartbeat timings for one connection
///
/// Fixed when the process is configured; loops only read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlinePolicy {
    /// Maximum time to complete a single write (payload or probe)
    pub write_wait: Duration,
    /// Maximum silence tolerated from the peer
    pub pong_wait: Duration,
    /// Heartbeat probe interval
    pub ping_period: Duration,
}

impl DeadlinePolicy {
    /// 10s writes, 60s peer silence, probes every 54s
    pub const REFERENCE: Self = Self {
        write_wait: WRITE_WAIT,
        pong_wait: PONG_WAIT,
        ping_period: PING_PERIOD,
    };

    /// Build a policy probing at 9/10 of `pong_wait`
    #[must_use]
    pub fn from_pong_wait(pong_wait: Duration, write_wait: Duration) -> Self {
        Self {
            write_wait,
            pong_wait,
            ping_period: pong_wait * 9 / 10,
        }
    }

    /// Validate the policy
    ///
    /// # Errors
    ///
    /// Returns error if a duration is zero or probes would not land inside
    /// every `pong_wait` window
    pub fn validate(&self) -> Result<()> {
        if self.write_wait.is_zero() {
            return Err(RelayError::ConfigError(
                "write_wait must be greater than zero".to_string(),
            ));
        }

        if self.ping_period.is_zero() {
            return Err(RelayError::ConfigError(
                "ping_period must be greater than zero".to_string(),
            ));
        }

        if self.ping_period >= self.pong_wait {
            return Err(RelayError::ConfigError(format!(
                "ping_period ({:?}) must be less than pong_wait ({:?})",
                self.ping_period, self.pong_wait
            )));
        }

        Ok(())
    }
}

impl Default for DeadlinePolicy {
    fn default() -> Self {
        Self::REFERENCE
    }
}

/// Read deadline, re-armed only by heartbeat acknowledgments
///
/// Awaiting it resolves once the deadline has passed.
#[derive(Debug)]
pub struct ReadDeadline {
    sleep: Pin<Box<Sleep>>,
    window: Duration,
}

impl ReadDeadline {
    /// Arm the deadline at `now + window`
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep(window)),
            window,
        }
    }

    /// Push the deadline to `now + window`
    pub fn refresh(&mut self) {
        let next = Instant::now() + self.window;
        if next > self.sleep.deadline() {
            self.sleep.as_mut().reset(next);
        }
    }

    /// Current deadline
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.sleep.deadline()
    }

    /// Silence window this deadline enforces
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Future for ReadDeadline {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.sleep.as_mut().poll(cx)
    }
}

/// Write deadline shared by every frame the outbound loop sends
#[derive(Debug)]
pub struct WriteDeadline {
    at: Instant,
    wait: Duration,
}

impl WriteDeadline {
    /// Create a deadline of `now + wait`
    #[must_use]
    pub fn new(wait: Duration) -> Self {
        Self {
            at: Instant::now() + wait,
            wait,
        }
    }

    /// Push the deadline to `now + wait`
    pub fn refresh(&mut self) {
        self.at = self.at.max(Instant::now() + self.wait);
    }

    /// Current deadline
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.at
    }

    /// Drive `write` to completion unless the deadline passes first
    ///
    /// # Errors
    ///
    /// Returns `WriteTimeout` on expiry, otherwise the write's own error
    pub async fn run<F, E>(&self, write: F) -> Result<()>
    where
        F: Future<Output = std::result::Result<(), E>>,
        E: Into<RelayError>,
    {
        match tokio::time::timeout_at(self.at, write).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(RelayError::WriteTimeout(self.wait)),
        }
    }
}
