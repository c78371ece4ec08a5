use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding-window request counter keyed by caller identity. A call is
/// admitted when fewer than `max_requests` calls landed inside the trailing
/// window; otherwise the caller must back off and resubmit.
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    calls: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_acquire(&self, caller: &str) -> bool {
        let now = Instant::now();
        let mut calls = self.calls.lock().unwrap();
        let window = calls.entry(caller.to_string()).or_default();

        while let Some(front) = window.front() {
            if now.duration_since(*front) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.max_requests {
            return false;
        }

        window.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_limit_then_rejects() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.try_acquire("analyst-1"));
        assert!(limiter.try_acquire("analyst-1"));
        assert!(limiter.try_acquire("analyst-1"));
        assert!(!limiter.try_acquire("analyst-1"));
    }

    #[test]
    fn callers_are_independent() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.try_acquire("analyst-1"));
        assert!(limiter.try_acquire("analyst-2"));
        assert!(!limiter.try_acquire("analyst-1"));
    }

    #[test]
    fn window_slides() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.try_acquire("analyst-1"));
        assert!(!limiter.try_acquire("analyst-1"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.try_acquire("analyst-1"));
    }
}
