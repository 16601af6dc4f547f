use crate::common::*;

/// Measures the rate of events over a minimum reporting interval.
#[derive(Debug)]
pub struct RateCounter {
    count: f64,
    instant: Instant,
    interval: Duration,
}

impl RateCounter {
    pub fn new(interval: Duration) -> Self {
        Self {
            count: 0.0,
            instant: Instant::now(),
            interval,
        }
    }

    pub fn with_second_interval() -> Self {
        Self::new(Duration::from_secs(1))
    }

    pub fn add(&mut self, addition: f64) {
        self.count += addition;
    }

    /// Returns the rate per second once the interval has elapsed, and restarts counting.
    pub fn rate(&mut self) -> Option<f64> {
        let elapsed = self.instant.elapsed();
        if elapsed >= self.interval {
            let rate = self.count / elapsed.as_secs_f64();
            self.count = 0.0;
            self.instant = Instant::now();
            Some(rate)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_counter_test() {
        let mut counter = RateCounter::new(Duration::from_secs(3600));
        counter.add(10.0);
        assert!(counter.rate().is_none());

        let mut counter = RateCounter::new(Duration::ZERO);
        counter.add(10.0);
        let rate = counter.rate().unwrap();
        assert!(rate > 0.0);
    }
}
