use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Source of time for the tracker. Elapsed-time math and the flush tick both go through
/// this trait, so tests can substitute a scripted clock.
#[async_trait]
pub trait Clock: Sync + Send + 'static {
    /// Wall-clock time, used when attributing elapsed seconds to a domain.
    fn time(&self) -> DateTime<Utc>;

    /// Monotonic reference used for scheduling the flush tick.
    fn instant(&self) -> Instant;

    async fn sleep_until(&self, instant: Instant);
}

pub struct DefaultClock;

#[async_trait]
impl Clock for DefaultClock {
    fn time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, instant: Instant) {
        tokio::time::sleep_until(instant).await;
    }
}
