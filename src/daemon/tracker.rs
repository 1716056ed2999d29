use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{
    daemon::{
        domain::trackable_domain,
        storage::{KeyValueStore, SITE_TIME_KEY},
    },
    protocol::{DomainTimeMap, TabEvent},
    utils::clock::Clock,
};

/// Commands consumed by [TrackerModule]. Everything that can touch tracker state goes
/// through this channel, so a flush-then-transition is never interleaved with another
/// event.
#[derive(Debug)]
pub enum TrackerCommand {
    Event(TabEvent),
    Snapshot { reply: oneshot::Sender<DomainTimeMap> },
    Reset { reply: oneshot::Sender<()> },
}

/// Cloneable front for sending commands into the tracker.
#[derive(Clone)]
pub struct TrackerHandle {
    sender: mpsc::Sender<TrackerCommand>,
}

impl TrackerHandle {
    pub fn new(sender: mpsc::Sender<TrackerCommand>) -> Self {
        Self { sender }
    }

    pub async fn event(&self, event: TabEvent) -> Result<()> {
        self.send(TrackerCommand::Event(event)).await
    }

    /// Returns the accumulated totals including time elapsed up to this very call.
    pub async fn snapshot(&self) -> Result<DomainTimeMap> {
        let (reply, response) = oneshot::channel();
        self.send(TrackerCommand::Snapshot { reply }).await?;
        response
            .await
            .map_err(|_| anyhow!("Tracker dropped snapshot request"))
    }

    pub async fn reset(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(TrackerCommand::Reset { reply }).await?;
        response
            .await
            .map_err(|_| anyhow!("Tracker dropped reset request"))
    }

    async fn send(&self, command: TrackerCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| anyhow!("Tracker is no longer running"))
    }
}

/// The interval currently being accounted. Holding the domain and the checkpoint in one
/// struct keeps "checkpoint set iff a domain is active" true by construction.
struct Session {
    domain: String,
    started_at: DateTime<Utc>,
}

/// Owns the only mutable tracking state: which tab holds focus, the active session and
/// the per-domain totals. Converts wall-clock time between checkpoints into accumulated
/// seconds, with no double counting across transitions.
pub struct TrackerModule {
    receiver: mpsc::Receiver<TrackerCommand>,
    store: Box<dyn KeyValueStore>,
    clock: Box<dyn Clock>,
    flush_interval: Duration,
    site_time: DomainTimeMap,
    // The focused tab outlives the session. A tab sitting on an internal page has no
    // session, but navigating that same tab to an http url must start one.
    focused_tab: Option<u64>,
    session: Option<Session>,
}

impl TrackerModule {
    pub fn new(
        receiver: mpsc::Receiver<TrackerCommand>,
        store: Box<dyn KeyValueStore>,
        clock: Box<dyn Clock>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            receiver,
            store,
            clock,
            flush_interval,
            site_time: DomainTimeMap::new(),
            focused_tab: None,
            session: None,
        }
    }

    /// Executes the tracker event loop. Returns after the command channel closes and a
    /// final flush has been written out.
    pub async fn run(mut self) -> Result<()> {
        self.load().await;

        let mut flush_point = self.clock.instant() + self.flush_interval;
        loop {
            tokio::select! {
                command = self.receiver.recv() => {
                    match command {
                        Some(command) => {
                            debug!("Processing command {:?}", command);
                            self.handle_command(command).await;
                        }
                        // All senders are gone, the daemon is shutting down.
                        None => break,
                    }
                }
                _ = self.clock.sleep_until(flush_point) => {
                    flush_point += self.flush_interval;
                    // Bounds the amount of unpersisted time lost to an abrupt
                    // termination to one interval.
                    self.flush().await;
                }
            }
        }

        self.flush().await;
        Ok(())
    }

    async fn load(&mut self) {
        self.site_time = match self.store.get(SITE_TIME_KEY).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(map) => map,
                Err(e) => {
                    warn!("Stored site time is unreadable, starting over {e:?}");
                    DomainTimeMap::new()
                }
            },
            Ok(None) => DomainTimeMap::new(),
            Err(e) => {
                warn!("Failed to load site time {e:?}");
                DomainTimeMap::new()
            }
        };
        info!("Tracking {} previously seen domains", self.site_time.len());
    }

    async fn handle_command(&mut self, command: TrackerCommand) {
        match command {
            TrackerCommand::Event(event) => self.handle_event(event).await,
            TrackerCommand::Snapshot { reply } => {
                self.flush().await;
                let _ = reply.send(self.site_time.clone());
            }
            TrackerCommand::Reset { reply } => {
                self.site_time.clear();
                self.persist().await;
                // Tracking continues, but time elapsed before the reset must not leak
                // into the cleared map.
                if let Some(session) = self.session.as_mut() {
                    session.started_at = self.clock.time();
                }
                let _ = reply.send(());
            }
        }
    }

    async fn handle_event(&mut self, event: TabEvent) {
        match event {
            TabEvent::TabActivated { tab, url } => {
                self.flush().await;
                self.focused_tab = Some(tab);
                self.begin_session(url.as_deref());
            }
            TabEvent::TabUpdated { tab, url } => {
                if self.focused_tab != Some(tab) {
                    return;
                }
                // The producer only sets url when it actually changed.
                let Some(url) = url else { return };
                self.flush().await;
                self.begin_session(Some(&url));
            }
            TabEvent::TabRemoved { tab } => {
                if self.focused_tab != Some(tab) {
                    return;
                }
                self.flush().await;
                self.focused_tab = None;
                self.session = None;
            }
        }
    }

    fn begin_session(&mut self, url: Option<&str>) {
        self.session = url.and_then(trackable_domain).map(|domain| {
            debug!("Now tracking {domain}");
            Session {
                domain,
                started_at: self.clock.time(),
            }
        });
    }

    /// Attributes time elapsed since the last checkpoint to the active domain and moves
    /// the checkpoint to now. Safe to call any number of times, each call only accounts
    /// for time since the previous one.
    async fn flush(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let now = self.clock.time();
        let elapsed = (now - session.started_at).num_milliseconds() as f64 / 1000.;
        session.started_at = now;
        if elapsed <= 0. {
            // Nothing to account for. Negative means the wall clock stepped backwards,
            // in which case the interval is dropped.
            return;
        }

        let domain = session.domain.clone();
        *self.site_time.entry(domain).or_insert(0.) += elapsed;
        self.persist().await;
    }

    async fn persist(&mut self) {
        let value = match serde_json::to_value(&self.site_time) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to serialize site time {e:?}");
                return;
            }
        };
        // A failed write is not retried, the next flush writes the then-current map.
        if let Err(e) = self.store.set(SITE_TIME_KEY, value).await {
            warn!("Failed to persist site time, totals kept in memory {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
    use serde_json::json;
    use tokio::{sync::mpsc, task::JoinHandle, time::Instant};

    use crate::{
        daemon::storage::{InMemoryStore, KeyValueStore, MockKeyValueStore, SITE_TIME_KEY},
        protocol::TabEvent,
        utils::{clock::Clock, logging::TEST_LOGGING},
    };

    use super::{TrackerHandle, TrackerModule};

    const TEST_START_DATE: NaiveDateTime =
        NaiveDateTime::new(NaiveDate::from_ymd_opt(2018, 7, 4).unwrap(), NaiveTime::MIN);

    const TEST_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

    #[derive(Clone)]
    struct TestClock {
        start_time: DateTime<Utc>,
        reference: Instant,
    }

    impl TestClock {
        fn new() -> Self {
            Self {
                start_time: Utc.from_utc_datetime(&TEST_START_DATE),
                reference: Instant::now(),
            }
        }
    }

    #[async_trait]
    impl Clock for TestClock {
        fn time(&self) -> DateTime<Utc> {
            self.start_time + self.reference.elapsed()
        }

        fn instant(&self) -> Instant {
            Instant::now()
        }

        async fn sleep_until(&self, instant: Instant) {
            tokio::time::sleep_until(instant).await;
        }
    }

    /// A clock that only moves when told to, in either direction. Used for exercising
    /// wall-clock steps that [TestClock] cannot express.
    #[derive(Clone)]
    struct ManualClock {
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                now: Arc::new(Mutex::new(Utc.from_utc_datetime(&TEST_START_DATE))),
            }
        }

        fn shift(&self, duration: chrono::Duration) {
            *self.now.lock().unwrap() += duration;
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn time(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }

        fn instant(&self) -> Instant {
            Instant::now()
        }

        async fn sleep_until(&self, instant: Instant) {
            tokio::time::sleep_until(instant).await;
        }
    }

    fn start_tracker(store: Box<dyn KeyValueStore>) -> (TrackerHandle, JoinHandle<Result<()>>) {
        start_tracker_with_clock(store, TestClock::new())
    }

    fn start_tracker_with_clock(
        store: Box<dyn KeyValueStore>,
        clock: impl Clock,
    ) -> (TrackerHandle, JoinHandle<Result<()>>) {
        *TEST_LOGGING;
        let (sender, receiver) = mpsc::channel(16);
        let tracker = TrackerModule::new(receiver, store, Box::new(clock), TEST_FLUSH_INTERVAL);
        (TrackerHandle::new(sender), tokio::spawn(tracker.run()))
    }

    /// Waits until all previously sent commands went through the tracker. Snapshots
    /// flush, but a zero elapsed flush accounts nothing, so this is side effect free.
    async fn settle(handle: &TrackerHandle) -> Result<()> {
        handle.snapshot().await?;
        Ok(())
    }

    async fn advance(duration: Duration) {
        tokio::time::advance(duration).await;
    }

    fn activated(tab: u64, url: &str) -> TabEvent {
        TabEvent::TabActivated {
            tab,
            url: Some(url.into()),
        }
    }

    fn updated(tab: u64, url: &str) -> TabEvent {
        TabEvent::TabUpdated {
            tab,
            url: Some(url.into()),
        }
    }

    fn assert_seconds(map: &crate::protocol::DomainTimeMap, domain: &str, expected: f64) {
        let actual = map.get(domain).copied().unwrap_or_default();
        assert!(
            (actual - expected).abs() < 0.01,
            "expected {expected}s for {domain}, got {actual}s in {map:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_follows_navigation() -> Result<()> {
        let (handle, _) = start_tracker(Box::new(InMemoryStore::default()));

        handle.event(activated(1, "https://example.com/page1")).await?;
        settle(&handle).await?;
        advance(Duration::from_secs(10)).await;

        let snapshot = handle.snapshot().await?;
        assert_eq!(snapshot.len(), 1);
        assert_seconds(&snapshot, "example.com", 10.);

        handle.event(updated(1, "https://other.com")).await?;
        settle(&handle).await?;
        advance(Duration::from_secs(15)).await;

        let snapshot = handle.snapshot().await?;
        assert_eq!(snapshot.len(), 2);
        assert_seconds(&snapshot, "example.com", 10.);
        assert_seconds(&snapshot, "other.com", 15.);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_elapsed_flush_accounts_nothing() -> Result<()> {
        let store = InMemoryStore::default();
        let observer = store.clone();
        let (handle, _) = start_tracker(Box::new(store));

        handle.event(activated(1, "https://example.com")).await?;

        // Back to back snapshots with no time in between. Each one flushes, none of them
        // may add seconds or create entries.
        let first = handle.snapshot().await?;
        let second = handle.snapshot().await?;
        assert!(first.is_empty());
        assert_eq!(first, second);
        // Nothing was ever persisted either.
        assert_eq!(observer.get(SITE_TIME_KEY).await?, None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_http_navigation_stops_accounting() -> Result<()> {
        let (handle, _) = start_tracker(Box::new(InMemoryStore::default()));

        handle.event(activated(1, "https://a.com")).await?;
        settle(&handle).await?;
        advance(Duration::from_secs(5)).await;

        handle.event(updated(1, "chrome://settings")).await?;
        settle(&handle).await?;
        advance(Duration::from_secs(30)).await;

        let snapshot = handle.snapshot().await?;
        assert_eq!(snapshot.len(), 1);
        assert_seconds(&snapshot, "a.com", 5.);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_tab_removal_stops_accounting() -> Result<()> {
        let (handle, _) = start_tracker(Box::new(InMemoryStore::default()));

        handle.event(activated(1, "https://example.com")).await?;
        settle(&handle).await?;
        advance(Duration::from_secs(7)).await;

        handle.event(TabEvent::TabRemoved { tab: 1 }).await?;
        settle(&handle).await?;

        // Let a periodic tick fire with no active session.
        advance(Duration::from_secs(12)).await;

        let snapshot = handle.snapshot().await?;
        assert_eq!(snapshot.len(), 1);
        assert_seconds(&snapshot, "example.com", 7.);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_for_unfocused_tabs_are_ignored() -> Result<()> {
        let (handle, _) = start_tracker(Box::new(InMemoryStore::default()));

        handle.event(activated(1, "https://example.com")).await?;
        handle.event(updated(2, "https://other.com")).await?;
        handle.event(TabEvent::TabRemoved { tab: 2 }).await?;
        settle(&handle).await?;
        advance(Duration::from_secs(4)).await;

        let snapshot = handle.snapshot().await?;
        assert_eq!(snapshot.len(), 1);
        assert_seconds(&snapshot, "example.com", 4.);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_without_url_change_keeps_session() -> Result<()> {
        let (handle, _) = start_tracker(Box::new(InMemoryStore::default()));

        handle.event(activated(1, "https://example.com")).await?;
        settle(&handle).await?;
        advance(Duration::from_secs(5)).await;

        handle.event(TabEvent::TabUpdated { tab: 1, url: None }).await?;
        settle(&handle).await?;
        advance(Duration::from_secs(5)).await;

        let snapshot = handle.snapshot().await?;
        assert_seconds(&snapshot, "example.com", 10.);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_focused_internal_tab_can_navigate_to_trackable_url() -> Result<()> {
        let (handle, _) = start_tracker(Box::new(InMemoryStore::default()));

        // Focus lands on an internal page, nothing is tracked.
        handle.event(activated(1, "chrome://newtab")).await?;
        settle(&handle).await?;
        advance(Duration::from_secs(8)).await;
        assert!(handle.snapshot().await?.is_empty());

        // The same tab then navigates somewhere trackable.
        handle.event(updated(1, "https://example.com")).await?;
        settle(&handle).await?;
        advance(Duration::from_secs(3)).await;

        let snapshot = handle.snapshot().await?;
        assert_eq!(snapshot.len(), 1);
        assert_seconds(&snapshot, "example.com", 3.);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_without_url_clears_session() -> Result<()> {
        let (handle, _) = start_tracker(Box::new(InMemoryStore::default()));

        handle.event(activated(1, "https://a.com")).await?;
        settle(&handle).await?;
        advance(Duration::from_secs(6)).await;

        // Tab lookup failed on the producer side.
        handle.event(TabEvent::TabActivated { tab: 2, url: None }).await?;
        settle(&handle).await?;
        advance(Duration::from_secs(6)).await;

        let snapshot = handle.snapshot().await?;
        assert_eq!(snapshot.len(), 1);
        assert_seconds(&snapshot, "a.com", 6.);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_totals_but_keeps_tracking() -> Result<()> {
        let store = InMemoryStore::default();
        let observer = store.clone();
        let (handle, _) = start_tracker(Box::new(store));

        handle.event(activated(1, "https://a.com")).await?;
        settle(&handle).await?;
        advance(Duration::from_secs(10)).await;

        handle.reset().await?;
        assert!(handle.snapshot().await?.is_empty());
        assert_eq!(observer.get(SITE_TIME_KEY).await?, Some(json!({})));

        // The session survived the reset and keeps accumulating from the reset point.
        advance(Duration::from_secs(4)).await;
        let snapshot = handle.snapshot().await?;
        assert_eq!(snapshot.len(), 1);
        assert_seconds(&snapshot, "a.com", 4.);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_backwards_clock_step_drops_interval() -> Result<()> {
        let clock = ManualClock::new();
        let (handle, _) =
            start_tracker_with_clock(Box::new(InMemoryStore::default()), clock.clone());

        handle.event(activated(1, "https://a.com")).await?;
        settle(&handle).await?;

        // The wall clock steps backwards, e.g. an ntp correction. The interval is
        // dropped rather than accounted negative.
        clock.shift(chrono::Duration::seconds(-60));
        assert!(handle.snapshot().await?.is_empty());

        // The checkpoint moved to the rewound time, so forward time accrues from there.
        clock.shift(chrono::Duration::seconds(3));
        let snapshot = handle.snapshot().await?;
        assert_eq!(snapshot.len(), 1);
        assert_seconds(&snapshot, "a.com", 3.);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_totals_are_loaded_from_store() -> Result<()> {
        let mut store = InMemoryStore::default();
        store.set(SITE_TIME_KEY, json!({"x.com": 30.0})).await?;
        let (handle, _) = start_tracker(Box::new(store));

        handle.event(activated(1, "https://x.com")).await?;
        settle(&handle).await?;
        advance(Duration::from_secs(2)).await;

        let snapshot = handle.snapshot().await?;
        assert_seconds(&snapshot, "x.com", 32.);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_stored_totals_start_over() -> Result<()> {
        let mut store = InMemoryStore::default();
        store.set(SITE_TIME_KEY, json!("definitely not a map")).await?;
        let (handle, _) = start_tracker(Box::new(store));

        assert!(handle.snapshot().await?.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush_persists_without_requests() -> Result<()> {
        let store = InMemoryStore::default();
        let observer = store.clone();
        let (handle, _) = start_tracker(Box::new(store));

        handle.event(activated(1, "https://example.com")).await?;
        settle(&handle).await?;
        advance(Duration::from_secs(6)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        let persisted = observer
            .get(SITE_TIME_KEY)
            .await?
            .expect("Tick should have persisted the totals");
        let persisted: crate::protocol::DomainTimeMap = serde_json::from_value(persisted)?;
        assert_seconds(&persisted, "example.com", 6.);

        // The tick and the snapshot flush must not double count.
        let snapshot = handle.snapshot().await?;
        assert_seconds(&snapshot, "example.com", 6.);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_store_degrades_to_memory_only() -> Result<()> {
        let mut store = MockKeyValueStore::new();
        store.expect_get().returning(|_| Ok(None));
        store
            .expect_set()
            .returning(|_, _| Err(anyhow!("store unavailable")));
        let (handle, _) = start_tracker(Box::new(store));

        handle.event(activated(1, "https://a.com")).await?;
        settle(&handle).await?;
        advance(Duration::from_secs(9)).await;

        // Writes fail, in-memory totals still accumulate.
        let snapshot = handle.snapshot().await?;
        assert_seconds(&snapshot, "a.com", 9.);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_performs_final_flush() -> Result<()> {
        let store = InMemoryStore::default();
        let observer = store.clone();
        let (handle, tracker) = start_tracker(Box::new(store));

        handle.event(activated(1, "https://example.com")).await?;
        settle(&handle).await?;
        advance(Duration::from_secs(3)).await;

        drop(handle);
        tracker.await??;

        let persisted: crate::protocol::DomainTimeMap = serde_json::from_value(
            observer
                .get(SITE_TIME_KEY)
                .await?
                .expect("Final flush should persist totals"),
        )?;
        assert_seconds(&persisted, "example.com", 3.);
        Ok(())
    }
}
