//! Bounded polling
//!
//! Waiting for a job is always a loop of "look, then sleep". The sleep grows
//! according to [`Backoff`] and the loop gives up with [`Error::Timeout`]
//! once the deadline passes.

use std::time::{Duration, Instant};

use livemerge_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::cancel::CancelToken;

/// Delay growth between polls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same interval every time
    #[default]
    Fixed,
    /// Interval doubles each attempt, capped at `max_interval`
    Exponential,
}

/// Parameters for a bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    /// Initial delay between polls
    pub interval: Duration,
    /// Give up after this long
    pub timeout: Duration,
    /// Delay growth
    pub backoff: Backoff,
    /// Upper bound for exponential delays
    pub max_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(10),
            backoff: Backoff::Fixed,
            max_interval: Duration::from_secs(1),
        }
    }
}

impl WaitOptions {
    /// Delay before poll number `attempt` (zero based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
                self.interval
                    .saturating_mul(factor)
                    .min(self.max_interval.max(self.interval))
            }
        }
    }
}

/// Call `probe` until it yields a value or the wait times out
///
/// Errors from `probe` end the wait immediately. A cancelled `cancel` token
/// ends the wait with a timeout error whose description says so.
pub fn poll_until<T, F>(
    what: &str,
    opts: &WaitOptions,
    cancel: Option<&CancelToken>,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Result<Option<T>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;
    loop {
        if let Some(value) = probe()? {
            return Ok(value);
        }
        let waited = start.elapsed();
        if waited >= opts.timeout {
            debug!(target: "livemerge::wait", what, attempts = attempt + 1, "Wait timed out");
            return Err(Error::Timeout {
                what: what.to_string(),
                waited_ms: waited.as_millis() as u64,
            });
        }
        let delay = opts.delay(attempt).min(opts.timeout - waited);
        trace!(target: "livemerge::wait", what, attempt, delay_ms = delay.as_millis() as u64, "Not ready");
        let slept = match cancel {
            Some(token) => token.sleep(delay),
            None => {
                std::thread::sleep(delay);
                true
            }
        };
        if !slept {
            debug!(target: "livemerge::wait", what, "Wait cancelled");
            return Err(Error::Timeout {
                what: format!("{} (wait cancelled)", what),
                waited_ms: start.elapsed().as_millis() as u64,
            });
        }
        attempt = attempt.saturating_add(1);
    }
}
