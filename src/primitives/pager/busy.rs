use std::thread;
use std::time::Duration;

/// Decides whether a lock request that hit contention is retried.
///
/// `attempts` counts the retries already made for the current request,
/// starting at 0. Returning false makes the request fail with `Busy`.
pub trait BusyHandler: Send {
    /// Returns true to retry the lock request.
    fn on_busy(&mut self, attempts: u32) -> bool;
}

impl<F> BusyHandler for F
where
    F: FnMut(u32) -> bool + Send,
{
    fn on_busy(&mut self, attempts: u32) -> bool {
        self(attempts)
    }
}

/// Sleeps with a growing delay until a total time budget is spent.
#[derive(Clone, Debug)]
pub struct BackoffBusyHandler {
    timeout: Duration,
}

const DELAYS_MS: [u64; 12] = [1, 2, 5, 10, 15, 20, 25, 25, 25, 50, 50, 100];

impl BackoffBusyHandler {
    /// Handler that gives up once `timeout` has been spent sleeping.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn delay_for(attempts: u32) -> (Duration, Duration) {
        let idx = attempts as usize;
        let (delay, prior) = if idx < DELAYS_MS.len() {
            (DELAYS_MS[idx], DELAYS_MS[..idx].iter().sum::<u64>())
        } else {
            let last = DELAYS_MS[DELAYS_MS.len() - 1];
            let total: u64 = DELAYS_MS.iter().sum();
            (last, total + last * (idx - DELAYS_MS.len()) as u64)
        };
        (Duration::from_millis(delay), Duration::from_millis(prior))
    }
}

impl BusyHandler for BackoffBusyHandler {
    fn on_busy(&mut self, attempts: u32) -> bool {
        let (mut delay, spent) = Self::delay_for(attempts);
        if spent >= self.timeout {
            return false;
        }
        if spent + delay > self.timeout {
            delay = self.timeout - spent;
        }
        thread::sleep(delay);
        true
    }
}

/// Fails every contended request immediately.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoBusyHandler;

impl BusyHandler for NoBusyHandler {
    fn on_busy(&mut self, _attempts: u32) -> bool {
        false
    }
}
