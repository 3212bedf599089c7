//! A small, self-contained retry driver.
//!
//! An operation is retried until it succeeds, is marked fatal, the retrier's
//! global stop signal fires, or (if configured) a maximum attempt count is
//! reached. The wait between attempts is drawn from a fixed schedule: past
//! the end of the schedule the last entry repeats. Each wait is jittered to
//! `half + uniform(0, full)` of the scheduled duration, so two callers
//! retrying on the same schedule don't all wake up in lockstep.

use std::time::Duration;

use rand::Rng as _;
use tokio_util::sync::CancellationToken;

/// Wraps an operation's error with whether it should be retried.
#[derive(Debug, Clone)]
pub struct RetryError<E> {
    err: E,
    fatal: bool,
}

impl<E> RetryError<E> {
    /// A transient error: the retrier will wait and try again.
    pub fn transient(err: E) -> Self {
        Self { err, fatal: false }
    }

    /// A fatal error: the retrier gives up immediately and returns it.
    pub fn fatal(err: E) -> Self {
        Self { err, fatal: true }
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn into_inner(self) -> E {
        self.err
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Wait durations tried in order; the last entry repeats once exhausted.
    pub schedule: Vec<Duration>,
    /// 0 means unlimited attempts.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            schedule: vec![Duration::from_secs(1)],
            max_attempts: 0,
        }
    }
}

/// Drives retries for producer/consumer background tasks and doubles as
/// their shared cancellation point: [`Retrier::stop`] both aborts any
/// in-flight backoff sleep and causes every future retry to fail fast.
#[derive(Debug)]
pub struct Retrier {
    config: RetryConfig,
    cancel: CancellationToken,
}

impl Retrier {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Signals every in-flight and future `retry` call to stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs `op` until it returns `Ok`, a fatal error, the retrier is
    /// stopped, or `max_attempts` is exhausted (if nonzero).
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RetryError<E>>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    attempt += 1;
                    let exhausted = self.config.max_attempts != 0 && attempt >= self.config.max_attempts;
                    if e.is_fatal() || exhausted || self.cancel.is_cancelled() {
                        return Err(e.into_inner());
                    }

                    let wait = jittered_wait(self.schedule_entry(attempt));
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(e.into_inner()),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    fn schedule_entry(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize - 1).min(self.config.schedule.len() - 1);
        self.config.schedule[idx]
    }
}

/// `half + uniform(0, full)` of `scheduled`, i.e. a jittered wait in
/// `[scheduled/2, scheduled/2 + scheduled)`.
fn jittered_wait(scheduled: Duration) -> Duration {
    let half = scheduled / 2;
    let full_nanos = scheduled.as_nanos().max(1) as u64;
    let jitter_nanos = rand::rng().random_range(0..full_nanos);
    half + Duration::from_nanos(jitter_nanos)
}
