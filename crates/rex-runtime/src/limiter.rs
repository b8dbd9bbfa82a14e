// Rex Runtime - Process-wide rate limiter for agent spawns
//
// One limiter is created at the root recipe and borrowed by every
// sub-recipe; sub-recipes cannot override it. Ordering per call:
// acquire -> pacing -> back-off -> run -> release. Completion time is
// recorded when the permit drops, so release stays paired with the call
// across every exit path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

use rex_core::{BackoffConfig, RateLimitConfig};

#[derive(Debug, Default)]
struct Pacing {
    /// When the most recent call completed
    last_completion: Option<Instant>,
    /// Current adaptive back-off delay (zero = healthy)
    backoff_delay: Duration,
    consecutive_successes: u32,
}

/// Observational counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterStats {
    pub acquisitions: u64,
    pub total_wait_ms: u64,
    pub rate_limit_hits: u64,
}

/// Concurrency cap, minimum pacing, and adaptive back-off for LLM calls
pub struct RateLimiter {
    semaphore: Option<Semaphore>,
    min_delay: Duration,
    backoff: BackoffConfig,
    pacing: Mutex<Pacing>,
    acquisitions: AtomicU64,
    total_wait_ms: AtomicU64,
    rate_limit_hits: AtomicU64,
}

/// Held for the duration of one agent call. Dropping it releases the
/// concurrency slot and stamps the completion time used for pacing.
pub struct LimiterPermit<'a> {
    limiter: &'a RateLimiter,
    _permit: Option<SemaphorePermit<'a>>,
}

impl Drop for LimiterPermit<'_> {
    fn drop(&mut self) {
        self.limiter.pacing.lock().last_completion = Some(Instant::now());
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            semaphore: config.max_concurrent_llm.map(Semaphore::new),
            min_delay: Duration::from_millis(config.min_delay_ms),
            backoff: config.backoff,
            pacing: Mutex::new(Pacing::default()),
            acquisitions: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
            rate_limit_hits: AtomicU64::new(0),
        }
    }

    /// A limiter that admits everything (no config present)
    pub fn unlimited() -> Self {
        Self::new(RateLimitConfig::default())
    }

    /// Admit one agent call, honoring concurrency, pacing, and back-off
    pub async fn acquire(&self) -> LimiterPermit<'_> {
        let start = Instant::now();

        let permit = match &self.semaphore {
            // The semaphore is never closed
            Some(semaphore) => semaphore.acquire().await.ok(),
            None => None,
        };

        if !self.min_delay.is_zero() {
            let wait = {
                let pacing = self.pacing.lock();
                pacing
                    .last_completion
                    .map(|last| (last + self.min_delay).saturating_duration_since(Instant::now()))
                    .unwrap_or(Duration::ZERO)
            };
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }

        let backoff_delay = self.pacing.lock().backoff_delay;
        if !backoff_delay.is_zero() {
            debug!("Rate-limit back-off: sleeping {:?}", backoff_delay);
            tokio::time::sleep(backoff_delay).await;
        }

        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_ms
            .fetch_add(start.elapsed().as_millis() as u64, Ordering::Relaxed);

        LimiterPermit {
            limiter: self,
            _permit: permit,
        }
    }

    /// Record a successful call; enough consecutive successes clear the
    /// adaptive delay
    pub fn record_success(&self) {
        if !self.backoff.enabled {
            return;
        }
        let mut pacing = self.pacing.lock();
        pacing.consecutive_successes += 1;
        if pacing.consecutive_successes >= self.backoff.reset_after_success {
            pacing.backoff_delay = Duration::ZERO;
            pacing.consecutive_successes = 0;
        }
    }

    /// Record a rate-limit hit; sets or escalates the adaptive delay
    pub fn record_rate_limited(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        if !self.backoff.enabled {
            return;
        }
        let mut pacing = self.pacing.lock();
        let next_ms = if pacing.backoff_delay.is_zero() {
            self.backoff.initial_delay_ms
        } else {
            let escalated = pacing.backoff_delay.as_millis() as f64 * self.backoff.multiplier;
            (escalated as u64).min(self.backoff.max_delay_ms)
        };
        pacing.backoff_delay = Duration::from_millis(next_ms);
        pacing.consecutive_successes = 0;
        debug!("Rate-limit hit; back-off now {}ms", next_ms);
    }

    /// Current back-off delay (observational)
    pub fn current_backoff(&self) -> Duration {
        self.pacing.lock().backoff_delay
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ms.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
        }
    }
}
