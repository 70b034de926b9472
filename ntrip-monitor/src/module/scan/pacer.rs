use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{Instant, sleep_until};

/// Shared rate limiter for one caster. One request is in flight at a time,
/// and the next may start only `interval` after the previous one finished,
/// however many workers are waiting.
pub struct RequestPacer {
    interval: Duration,
    next_start: Mutex<Option<Instant>>,
}

/// Held for the duration of one request; dropping it starts the gap.
pub struct PacerSlot<'a> {
    next_start: MutexGuard<'a, Option<Instant>>,
    interval: Duration,
}

impl Drop for PacerSlot<'_> {
    fn drop(&mut self) {
        *self.next_start = Some(Instant::now() + self.interval);
    }
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_start: Mutex::new(None),
        }
    }

    /// Wait until the caster is free again. The first caller goes immediately.
    pub async fn acquire(&self) -> PacerSlot<'_> {
        let next_start = self.next_start.lock().await;
        if let Some(at) = *next_start {
            sleep_until(at).await;
        }
        PacerSlot {
            next_start,
            interval: self.interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_gap_is_measured_from_request_end() {
        let pacer = Arc::new(RequestPacer::new(Duration::from_millis(50)));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let pacer = pacer.clone();
                tokio::spawn(async move {
                    let _slot = pacer.acquire().await;
                    let started = Instant::now();
                    // simulated request
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    started
                })
            })
            .collect();

        let mut starts = Vec::new();
        for handle in handles {
            starts.push(handle.await.unwrap());
        }
        starts.sort();

        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(80));
        }
    }

    #[tokio::test]
    async fn test_zero_interval_never_waits() {
        let pacer = RequestPacer::new(Duration::ZERO);
        let start = Instant::now();
        for _ in 0..5 {
            let _slot = pacer.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
