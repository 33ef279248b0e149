//! Scheduler pacing
//!
//! The playback worker runs its fetch/tick/mix loop at a fixed real-time
//! rate. [`TimeBarrier`] paces it: sleep through most of each interval,
//! then spin the last stretch for precision. Deadlines accumulate from the
//! start instant, so oversleep in one interval is made up in the next.

use std::time::{Duration, Instant};

/// How close to the deadline the barrier stops sleeping and spins
const SPIN_WINDOW: Duration = Duration::from_micros(500);

/// Fixed-rate pacing barrier (sleep most of the interval, spin the rest)
#[derive(Debug)]
pub struct TimeBarrier {
    period: Duration,
    deadline: Option<Instant>,
}

impl TimeBarrier {
    /// Create a barrier ticking at `rate` Hz
    pub fn new(rate: u32) -> Self {
        TimeBarrier {
            period: Duration::from_secs(1) / rate.max(1),
            deadline: None,
        }
    }

    /// Arm the barrier; the first wait completes one period from now
    pub fn start(&mut self) {
        self.deadline = Some(Instant::now() + self.period);
    }

    /// Block until the current period elapses, then advance the deadline
    pub fn wait(&mut self) {
        let Some(deadline) = self.deadline else {
            return;
        };
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let left = deadline - now;
            if left > SPIN_WINDOW {
                std::thread::sleep(left - SPIN_WINDOW);
            } else {
                std::hint::spin_loop();
            }
        }
        self.deadline = Some(deadline + self.period);
    }

    /// Disarm the barrier
    pub fn stop(&mut self) {
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_paces_to_rate() {
        let mut barrier = TimeBarrier::new(200); // 5 ms period
        barrier.start();
        let start = Instant::now();
        for _ in 0..4 {
            barrier.wait();
        }
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(18),
            "4 periods at 5 ms must take about 20 ms, took {:?}",
            elapsed
        );
        assert!(
            elapsed < Duration::from_millis(200),
            "pacing must not wildly oversleep, took {:?}",
            elapsed
        );
    }

    #[test]
    fn test_wait_without_start_is_noop() {
        let mut barrier = TimeBarrier::new(10);
        let start = Instant::now();
        barrier.wait();
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
