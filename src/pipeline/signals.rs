//! Counting signals coordinating the input and output sides
//!
//! * `ReadySignal`: a stage finished opening (filter-ready, encoder-ready).
//! * `GapSignal`: one permit per detected timestamp gap; the output side
//!   consumes one to excuse a single stall.
//! * `RetryThrottle`: bounded back-off when a stage keeps answering "try again".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// One-shot readiness signal that any number of tasks can await
pub struct ReadySignal {
    name: &'static str,
    semaphore: Semaphore,
    fired: AtomicBool,
}

impl ReadySignal {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            semaphore: Semaphore::new(0),
            fired: AtomicBool::new(false),
        }
    }

    /// Mark ready and wake every waiter; repeated calls are ignored
    pub fn signal(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            log::debug!("ReadySignal: {} ready", self.name);
            self.semaphore.add_permits(1);
        }
    }

    /// Give up on readiness; waiters return false
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_ready(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Wait until ready (true) or closed (false)
    pub async fn wait(&self) -> bool {
        if self.is_ready() {
            return true;
        }
        // the permit goes back on drop so the next waiter wakes too
        match self.semaphore.acquire().await {
            Ok(_permit) => true,
            Err(_) => self.is_ready(),
        }
    }
}

/// Counts timestamp gaps seen on the input side
pub struct GapSignal {
    semaphore: Semaphore,
}

impl GapSignal {
    pub fn new() -> Self {
        Self {
            semaphore: Semaphore::new(0),
        }
    }

    pub fn mark(&self) {
        self.semaphore.add_permits(1);
    }

    /// Take one gap permit if any is pending
    pub fn try_consume(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for GapSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded sleep-and-retry for stages starved by "try again".
///
/// Blocks the calling thread; used only on the input queue. `wake` cuts the
/// current sleep short (cancellation, or output drained).
pub struct RetryThrottle {
    limit: u32,
    delay: Duration,
    woken: Mutex<bool>,
    condvar: Condvar,
}

impl RetryThrottle {
    pub fn new(limit: u32, delay: Duration) -> Self {
        Self {
            limit,
            delay,
            woken: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Sleep before retry number `attempt` (0-based); false once the limit is reached
    pub fn backoff(&self, attempt: u32) -> bool {
        if attempt >= self.limit {
            return false;
        }
        // linear back-off capped at 8x the base delay
        let delay = self.delay * (attempt + 1).min(8);
        let Ok(mut woken) = self.woken.lock() else {
            std::thread::sleep(delay);
            return true;
        };
        if !*woken {
            woken = match self.condvar.wait_timeout(woken, delay) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *woken = false;
        true
    }

    pub fn wake(&self) {
        if let Ok(mut woken) = self.woken.lock() {
            *woken = true;
            self.condvar.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ready_signal_wakes_all_waiters() {
        let signal = Arc::new(ReadySignal::new("encoder"));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let signal = signal.clone();
                tokio::spawn(async move { signal.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.signal();
        signal.signal();
        for waiter in waiters {
            assert!(waiter.await.unwrap());
        }
        assert!(signal.is_ready());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ready_signal_close() {
        let signal = Arc::new(ReadySignal::new("filter"));
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.close();
        assert!(!waiter.await.unwrap());
    }

    #[test]
    fn test_gap_signal_is_one_shot_per_gap() {
        let gaps = GapSignal::new();
        assert!(!gaps.try_consume());
        gaps.mark();
        gaps.mark();
        assert_eq!(gaps.pending(), 2);
        assert!(gaps.try_consume());
        assert!(gaps.try_consume());
        assert!(!gaps.try_consume());
    }

    #[test]
    fn test_retry_throttle_is_bounded() {
        let throttle = RetryThrottle::new(3, Duration::from_millis(1));
        assert!(throttle.backoff(0));
        assert!(throttle.backoff(2));
        assert!(!throttle.backoff(3));
    }

    #[test]
    fn test_retry_throttle_wake_cuts_sleep() {
        let throttle = Arc::new(RetryThrottle::new(1, Duration::from_secs(10)));
        throttle.wake();
        let started = Instant::now();
        assert!(throttle.backoff(0));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
