//! Reconnection backoff policy

use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for the backoff delay
    pub max_backoff: Duration,
    /// Growth factor applied after every attempt
    pub multiplier: f64,
    /// Random fraction (0.0..1.0) added on top of the base delay
    pub jitter: f64,
    /// Maximum number of reconnection attempts (None = retry forever)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,
}

/// Tracks reconnection attempts and computes the jittered backoff delay.
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Compute the delay for the next attempt and advance the schedule.
    pub fn next_delay(&mut self) -> Result<Duration, ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        let base = self.current_backoff;
        let next =
            Duration::from_secs_f64(base.as_secs_f64() * self.config.multiplier);
        self.current_backoff = next.min(self.config.max_backoff);

        let delay = if self.config.jitter > 0.0 {
            let factor = 1.0 + rand::thread_rng().gen_range(0.0..self.config.jitter);
            Duration::from_secs_f64(base.as_secs_f64() * factor)
        } else {
            base
        };

        Ok(delay.min(self.config.max_backoff))
    }

    /// Wait before the next reconnection attempt
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        let delay = self.next_delay()?;

        debug!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Waiting before reconnection attempt"
        );

        sleep(delay).await;
        Ok(())
    }

    /// Reset the schedule (call after a stable connection).
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Get current backoff duration
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}
