use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);

    fn now_secs(&self) -> i64 {
        self.now().timestamp()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn at_secs(ts: i64) -> Self {
        Self::new(DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or_default())
    }

    pub fn advance(&self, duration: Duration) {
        let step = ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::zero());
        if let Ok(mut now) = self.now.lock() {
            *now += step;
        }
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Fixed-period ticker on top of a `Clock`. The first tick fires immediately;
/// later ticks wait out the remainder of the period, skipping missed ones.
pub struct Ticker {
    clock: Arc<dyn Clock>,
    period: Duration,
    next: Option<DateTime<Utc>>,
}

impl Ticker {
    pub fn new(clock: Arc<dyn Clock>, period: Duration) -> Self {
        Self {
            clock,
            period: period.max(Duration::from_millis(1)),
            next: None,
        }
    }

    pub async fn tick(&mut self) -> DateTime<Utc> {
        let period =
            ChronoDuration::from_std(self.period).unwrap_or_else(|_| ChronoDuration::seconds(1));
        let now = self.clock.now();
        let deadline = match self.next {
            None => now,
            Some(next) => next,
        };
        if deadline > now {
            if let Ok(wait) = (deadline - now).to_std() {
                self.clock.sleep(wait).await;
            }
        }
        let fired = self.clock.now();
        let mut next = deadline + period;
        while next <= fired {
            next += period;
        }
        self.next = Some(next);
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_clock_sleep_advances_time() {
        let clock = ManualClock::at_secs(1_000);
        clock.sleep(Duration::from_secs(2)).await;
        assert_eq!(clock.now_secs(), 1_002);
    }

    #[tokio::test]
    async fn ticker_fires_immediately_then_every_period() {
        let clock = Arc::new(ManualClock::at_secs(1_000));
        let mut ticker = Ticker::new(clock.clone(), Duration::from_secs(15));
        assert_eq!(ticker.tick().await.timestamp(), 1_000);
        assert_eq!(ticker.tick().await.timestamp(), 1_015);
        // work inside a cycle eats into the wait
        clock.advance(Duration::from_secs(5));
        assert_eq!(ticker.tick().await.timestamp(), 1_030);
    }

    #[tokio::test]
    async fn ticker_skips_missed_periods() {
        let clock = Arc::new(ManualClock::at_secs(0));
        let mut ticker = Ticker::new(clock.clone(), Duration::from_secs(10));
        ticker.tick().await;
        clock.advance(Duration::from_secs(35));
        assert_eq!(ticker.tick().await.timestamp(), 35);
        assert_eq!(ticker.tick().await.timestamp(), 40);
    }
}
