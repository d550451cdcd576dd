use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, Notify, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};

use crate::config::{LeaderboardConfig, MAX_LEADERBOARD_SIZE};
use crate::errors::Result;
use crate::metrics::{RefreshTimer, SyncMetrics};
use crate::realtime::bus::{BusMessage, EventBus};
use crate::realtime::subscription::{Subscription, Watchers};
use crate::realtime::topic::{Period, Topic};
use crate::realtime::types::{DomainEvent, LeaderboardSnapshot, ScoreEntry};
use crate::store::ScoreStore;
use crate::utils::time_utils::in_period;

/// Ranked top-N list.
///
/// Ordered by score descending, then earliest submission; entries that tie
/// on both keep arrival order.
#[derive(Clone, Debug, PartialEq)]
pub struct Board {
    size: usize,
    entries: Vec<ScoreEntry>,
}

impl Board {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            entries: Vec::with_capacity(size.min(MAX_LEADERBOARD_SIZE)),
        }
    }

    /// Build from an unordered list, keeping the best `size` entries.
    pub fn from_entries(size: usize, mut entries: Vec<ScoreEntry>) -> Self {
        entries.sort_by(ScoreEntry::rank_cmp);
        entries.truncate(size);
        Self { size, entries }
    }

    /// Returns whether the board changed.
    pub fn insert(&mut self, entry: ScoreEntry) -> bool {
        let pos = self
            .entries
            .partition_point(|e| e.rank_cmp(&entry) != CmpOrdering::Greater);
        if pos >= self.size {
            return false;
        }
        self.entries.insert(pos, entry);
        self.entries.truncate(self.size);
        true
    }

    pub fn contains(&self, entry: &ScoreEntry) -> bool {
        self.entries.contains(entry)
    }

    pub fn entries(&self) -> &[ScoreEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Board plus the bookkeeping needed to reconcile it with the store.
///
/// While a refresh is in flight every live entry is also journaled; when
/// the fetched list lands it replaces the board and the journaled entries
/// it does not already contain are merged back in.
#[derive(Debug)]
pub struct BoardState {
    board: Board,
    generation: u64,
    journal: Option<Vec<ScoreEntry>>,
}

impl BoardState {
    pub fn new(size: usize) -> Self {
        Self {
            board: Board::new(size),
            generation: 0,
            journal: None,
        }
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn apply(&mut self, entry: ScoreEntry) -> bool {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(entry.clone());
        }
        self.board.insert(entry)
    }

    /// Start a refresh and return its generation.
    pub fn begin_refresh(&mut self) -> u64 {
        self.generation += 1;
        // An overlapping refresh keeps the older journal; it is a superset
        self.journal.get_or_insert_with(Vec::new);
        self.generation
    }

    /// Install a fetched list. Returns `None` when `generation` has been
    /// superseded, otherwise whether the board changed.
    pub fn finish_refresh(&mut self, generation: u64, fetched: Vec<ScoreEntry>) -> Option<bool> {
        if generation != self.generation {
            return None;
        }
        let mut board = Board::from_entries(self.board.size, fetched);
        for entry in self.journal.take().unwrap_or_default() {
            if !board.contains(&entry) {
                board.insert(entry);
            }
        }
        let changed = board != self.board;
        self.board = board;
        Some(changed)
    }

    /// Abandon a failed refresh; the current board stays.
    pub fn fail_refresh(&mut self, generation: u64) {
        if generation == self.generation {
            self.journal = None;
        }
    }
}

struct Aggregator {
    game_id: String,
    period: Period,
    state: Mutex<BoardState>,
    /// Serializes snapshot fan-out so subscribers never see an older
    /// snapshot after a newer one
    dispatch: ReentrantMutex<()>,
    watchers: Watchers<LeaderboardSnapshot>,
    refs: AtomicUsize,
    /// Set once the feed is open and the seed fetch has settled
    opened: OnceCell<()>,
    refresh: Notify,
    feed: Mutex<Option<Subscription>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Aggregator {
    fn snapshot_of(&self, board: &Board) -> LeaderboardSnapshot {
        LeaderboardSnapshot {
            game_id: self.game_id.clone(),
            period: self.period,
            entries: board.entries().to_vec(),
            as_of: Utc::now(),
        }
    }

    fn snapshot(&self) -> LeaderboardSnapshot {
        self.snapshot_of(self.state.lock().board())
    }

    /// Run `change` on the state and fan out the snapshot if it reports one.
    fn update(&self, metrics: &SyncMetrics, change: impl FnOnce(&mut BoardState) -> bool) -> bool {
        let _order = self.dispatch.lock();
        let snapshot = {
            let mut state = self.state.lock();
            if !change(&mut state) {
                return false;
            }
            self.snapshot_of(state.board())
        };
        self.watchers.emit(&snapshot, metrics);
        true
    }
}

/// A board reference taken by [`LeaderboardService::acquire`], given back
/// if the caller fails or goes away before it is handed out.
struct Lease<'a> {
    service: &'a LeaderboardService,
    aggregator: Option<Arc<Aggregator>>,
}

impl Lease<'_> {
    fn disarm(mut self) {
        self.aggregator = None;
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(aggregator) = self.aggregator.take() {
            self.service.release(aggregator);
        }
    }
}

/// Live top-N leaderboards per `(gameId, period)`.
///
/// One aggregator per key is shared by every subscriber in the process. It
/// is seeded from the [`ScoreStore`], follows `ScoreSubmitted` events on
/// the game's event topic and re-fetches from the store periodically, on
/// any sequence gap and when asked through [`LeaderboardService::refresh_all`].
pub struct LeaderboardService {
    events: EventBus,
    store: Arc<dyn ScoreStore>,
    config: LeaderboardConfig,
    snapshot_timeout: Duration,
    metrics: Arc<SyncMetrics>,
    boards: AsyncMutex<HashMap<(String, Period), Arc<Aggregator>>>,
    runtime: Handle,
    this: Weak<LeaderboardService>,
}

impl LeaderboardService {
    /// Must be called from within a tokio runtime.
    pub fn new(
        events: EventBus,
        store: Arc<dyn ScoreStore>,
        config: LeaderboardConfig,
        snapshot_timeout: Duration,
        metrics: Arc<SyncMetrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            events,
            store,
            config,
            snapshot_timeout,
            metrics,
            boards: AsyncMutex::new(HashMap::new()),
            runtime: Handle::current(),
            this: this.clone(),
        })
    }

    /// Follow the `period` leaderboard of `game_id`.
    ///
    /// `callback` receives the current snapshot before this returns and a
    /// fresh snapshot after every change.
    pub async fn subscribe(
        &self,
        game_id: &str,
        period: Period,
        callback: impl Fn(&LeaderboardSnapshot) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        let topic = Topic::leaderboard(game_id, period)?;
        let aggregator = self.acquire(game_id, period).await?;
        let (watcher, gate) = {
            let _order = aggregator.dispatch.lock();
            let (watcher, gate) = aggregator.watchers.add(Arc::new(callback));
            aggregator
                .watchers
                .emit_to(watcher, &aggregator.snapshot(), &self.metrics);
            (watcher, gate)
        };
        let service = self.this.clone();
        Ok(Subscription::new(topic, gate).on_close(move || {
            aggregator.watchers.remove(watcher);
            if let Some(service) = service.upgrade() {
                service.release(aggregator);
            }
        }))
    }

    /// Current snapshot if the board is followed in this process.
    pub async fn current(&self, game_id: &str, period: Period) -> Option<LeaderboardSnapshot> {
        let boards = self.boards.lock().await;
        boards
            .get(&(game_id.to_string(), period))
            .filter(|a| a.opened.initialized())
            .map(|a| a.snapshot())
    }

    /// Schedule a store refresh of every followed board.
    pub async fn refresh_all(&self) {
        let boards = self.boards.lock().await;
        for aggregator in boards.values() {
            aggregator.refresh.notify_one();
        }
        if !boards.is_empty() {
            log::debug!("scheduled refresh of {} leaderboard(s)", boards.len());
        }
    }

    pub async fn open_boards(&self) -> usize {
        self.boards.lock().await.len()
    }

    /// Stop every refresh worker and drop the event feeds.
    pub async fn shutdown(&self) {
        let mut boards = self.boards.lock().await;
        for (_, aggregator) in boards.drain() {
            if let Some(worker) = aggregator.worker.lock().take() {
                worker.abort();
            }
            let feed = aggregator.feed.lock().take();
            drop(feed);
        }
    }

    /// Take a reference on the board, opening it on first use.
    ///
    /// The service lock only covers the map lookup. The first caller opens
    /// the board; later callers for the same key wait for that to settle
    /// while other boards stay available.
    async fn acquire(&self, game_id: &str, period: Period) -> Result<Arc<Aggregator>> {
        let aggregator = {
            let key = (game_id.to_string(), period);
            let mut boards = self.boards.lock().await;
            match boards.get(&key) {
                Some(aggregator) => {
                    aggregator.refs.fetch_add(1, Ordering::AcqRel);
                    aggregator.clone()
                }
                None => {
                    let aggregator = Arc::new(Aggregator {
                        game_id: game_id.to_string(),
                        period,
                        state: Mutex::new(BoardState::new(self.config.size)),
                        dispatch: ReentrantMutex::new(()),
                        watchers: Watchers::new(),
                        refs: AtomicUsize::new(1),
                        opened: OnceCell::new(),
                        refresh: Notify::new(),
                        feed: Mutex::new(None),
                        worker: Mutex::new(None),
                    });
                    boards.insert(key, aggregator.clone());
                    aggregator
                }
            }
        };
        let lease = Lease {
            service: self,
            aggregator: Some(aggregator.clone()),
        };
        aggregator.opened.get_or_try_init(|| self.open(&aggregator)).await?;
        lease.disarm();
        Ok(aggregator)
    }

    async fn open(&self, aggregator: &Arc<Aggregator>) -> Result<()> {
        // Journal from before the feed opens so nothing slips between the
        // seed fetch and the first live event
        let seed = aggregator.state.lock().begin_refresh();
        let feed = self
            .events
            .subscribe(&aggregator.game_id, self.feed_handler(aggregator))
            .await?;
        *aggregator.feed.lock() = Some(feed);
        self.fetch(aggregator, seed).await;
        if let Some(stale) = aggregator.worker.lock().replace(self.spawn_worker(aggregator)) {
            stale.abort();
        }
        log::debug!("leaderboard {}:{} opened", aggregator.game_id, aggregator.period);
        Ok(())
    }

    fn release(&self, aggregator: Arc<Aggregator>) {
        if aggregator.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let Some(service) = self.this.upgrade() else {
            return;
        };
        self.runtime.spawn(async move {
            let mut boards = service.boards.lock().await;
            if aggregator.refs.load(Ordering::Acquire) != 0 {
                return;
            }
            let key = (aggregator.game_id.clone(), aggregator.period);
            if boards.get(&key).is_some_and(|a| Arc::ptr_eq(a, &aggregator)) {
                boards.remove(&key);
            }
            drop(boards);
            if let Some(worker) = aggregator.worker.lock().take() {
                worker.abort();
            }
            let feed = aggregator.feed.lock().take();
            drop(feed);
            log::debug!("leaderboard {}:{} closed", aggregator.game_id, aggregator.period);
        });
    }

    fn feed_handler(&self, aggregator: &Arc<Aggregator>) -> impl Fn(&BusMessage) + Send + Sync + 'static {
        let weak = Arc::downgrade(aggregator);
        let metrics = self.metrics.clone();
        move |message| {
            let Some(aggregator) = weak.upgrade() else {
                return;
            };
            match message {
                BusMessage::Event(sequenced) => {
                    let DomainEvent::ScoreSubmitted(score) = &sequenced.event else {
                        return;
                    };
                    let entry = score.entry(sequenced.ts);
                    if !in_period(aggregator.period, entry.submitted_at, Utc::now()) {
                        return;
                    }
                    aggregator.update(&metrics, |state| state.apply(entry));
                }
                BusMessage::Gap(gap) => {
                    log::debug!("refreshing {}:{} after gap {:?}", aggregator.game_id, aggregator.period, gap.cause);
                    aggregator.refresh.notify_one();
                }
            }
        }
    }

    fn spawn_worker(&self, aggregator: &Arc<Aggregator>) -> JoinHandle<()> {
        let weak = Arc::downgrade(aggregator);
        let service = self.this.clone();
        let period = self.config.refresh_interval();
        self.runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                let Some(notified) = weak.upgrade() else {
                    return;
                };
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = notified.refresh.notified() => {}
                }
                drop(notified);
                let (Some(aggregator), Some(service)) = (weak.upgrade(), service.upgrade()) else {
                    return;
                };
                let generation = aggregator.state.lock().begin_refresh();
                service.fetch(&aggregator, generation).await;
            }
        })
    }

    /// Fetch the board from the store and install it as `generation`.
    async fn fetch(&self, aggregator: &Aggregator, generation: u64) {
        let mut timer = RefreshTimer::new(&self.metrics);
        let fetched = timeout(
            self.snapshot_timeout,
            self.store
                .get_top_scores(&aggregator.game_id, aggregator.period, self.config.size),
        )
        .await;
        match fetched {
            Ok(Ok(entries)) => {
                timer.mark_success();
                let mut superseded = false;
                aggregator.update(&self.metrics, |state| match state.finish_refresh(generation, entries) {
                    Some(changed) => changed,
                    None => {
                        superseded = true;
                        false
                    }
                });
                if superseded {
                    log::debug!("discarded superseded refresh of {}:{}", aggregator.game_id, aggregator.period);
                }
            }
            Ok(Err(e)) => {
                log::warn!(
                    "leaderboard refresh of {}:{} failed, keeping last state: {}",
                    aggregator.game_id,
                    aggregator.period,
                    e
                );
                aggregator.state.lock().fail_refresh(generation);
            }
            Err(_) => {
                log::warn!(
                    "leaderboard refresh of {}:{} timed out after {:?}, keeping last state",
                    aggregator.game_id,
                    aggregator.period,
                    self.snapshot_timeout
                );
                aggregator.state.lock().fail_refresh(generation);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::realtime::envelope::Envelope;
    use crate::realtime::registry::ChannelRegistry;
    use crate::realtime::transport::scripted::ScriptedTransport;
    use crate::realtime::transport::{LocalBus, Transport, TransportKind};
    use crate::realtime::types::{ScoreSubmission, ScoreSubmitted, SessionId};
    use crate::store::MemoryScoreStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicBool;

    fn entry(name: &str, score: i64, secs: i64) -> ScoreEntry {
        ScoreEntry::new(name, score, Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap())
    }

    fn names(entries: &[ScoreEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.player_name.as_str()).collect()
    }

    #[test]
    fn board_keeps_top_n_in_rank_order() {
        let mut board = Board::new(3);
        assert!(board.insert(entry("P1", 500, 0)));
        assert!(board.insert(entry("P2", 300, 1)));
        assert!(board.insert(entry("P3", 450, 2)));
        assert!(!board.insert(entry("P4", 100, 3)));
        assert_eq!(names(board.entries()), vec!["P1", "P3", "P2"]);
    }

    #[test]
    fn oversized_board_does_not_preallocate() {
        let mut board = Board::new(usize::MAX);
        assert!(board.insert(entry("P1", 500, 0)));
        assert_eq!(board.entries().len(), 1);
    }

    #[test]
    fn full_ties_keep_arrival_order() {
        let mut board = Board::new(5);
        board.insert(entry("first", 100, 0));
        board.insert(entry("second", 100, 0));
        board.insert(entry("early", 100, -1));
        assert_eq!(names(board.entries()), vec!["early", "first", "second"]);
    }

    #[test]
    fn refresh_merges_entries_seen_while_in_flight() {
        let mut state = BoardState::new(3);
        state.apply(entry("old", 10, 0));
        let generation = state.begin_refresh();
        state.apply(entry("live", 400, 5));
        state.apply(entry("both", 300, 4));

        let changed = state
            .finish_refresh(generation, vec![entry("both", 300, 4), entry("stored", 350, 1)])
            .unwrap();
        assert!(changed);
        assert_eq!(names(state.board().entries()), vec!["live", "stored", "both"]);

        // Journal is gone once the refresh lands
        state.apply(entry("after", 1, 9));
        let generation = state.begin_refresh();
        state.finish_refresh(generation, vec![]).unwrap();
        assert_eq!(names(state.board().entries()), vec!["after"]);
    }

    #[test]
    fn superseded_refresh_is_discarded() {
        let mut state = BoardState::new(3);
        let older = state.begin_refresh();
        let newer = state.begin_refresh();
        assert_eq!(state.finish_refresh(older, vec![entry("stale", 1, 0)]), None);
        assert!(state.board().is_empty());
        assert_eq!(state.finish_refresh(newer, vec![entry("fresh", 2, 0)]), Some(true));
        assert_eq!(names(state.board().entries()), vec!["fresh"]);
    }

    #[test]
    fn failed_refresh_keeps_board() {
        let mut state = BoardState::new(3);
        state.apply(entry("kept", 50, 0));
        let generation = state.begin_refresh();
        state.fail_refresh(generation);
        assert_eq!(names(state.board().entries()), vec!["kept"]);
    }

    proptest! {
        #[test]
        fn inserts_match_sorting_everything(
            size in 1usize..8,
            scores in prop::collection::vec((0i64..50, 0i64..5), 0..40),
        ) {
            let all: Vec<ScoreEntry> = scores
                .iter()
                .enumerate()
                .map(|(i, (score, secs))| entry(&format!("p{i}"), *score, *secs))
                .collect();
            let mut board = Board::new(size);
            for e in &all {
                board.insert(e.clone());
            }
            let expected = Board::from_entries(size, all.clone());
            prop_assert_eq!(board.entries(), expected.entries());
            prop_assert!(board.len() <= size);
            prop_assert!(board.entries().windows(2).all(|w| w[0].rank_cmp(&w[1]) != CmpOrdering::Greater));
            // Nothing dropped outranks anything kept
            if let Some(last) = board.entries().last() {
                for e in all.iter().filter(|e| !board.contains(e)) {
                    prop_assert!(e.score <= last.score);
                }
            }
        }
    }

    /// Store that can be switched into failing and counts fetches.
    struct FlakyStore {
        inner: MemoryScoreStore,
        failing: AtomicBool,
        fetches: AtomicUsize,
    }

    impl FlakyStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryScoreStore::new(),
                failing: AtomicBool::new(false),
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ScoreStore for FlakyStore {
        async fn get_top_scores(&self, game_id: &str, period: Period, limit: usize) -> Result<Vec<ScoreEntry>, StoreError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Status(503));
            }
            self.inner.get_top_scores(game_id, period, limit).await
        }

        async fn get_personal_best(&self, game_id: &str, session_id: &SessionId) -> Result<Option<ScoreEntry>, StoreError> {
            self.inner.get_personal_best(game_id, session_id).await
        }

        async fn save_score(&self, game_id: &str, submission: &ScoreSubmission) -> Result<ScoreEntry, StoreError> {
            self.inner.save_score(game_id, submission).await
        }
    }

    /// Holds top-score fetches for one game until released.
    struct GatedStore {
        inner: MemoryScoreStore,
        held_game: &'static str,
        open: Notify,
    }

    #[async_trait]
    impl ScoreStore for GatedStore {
        async fn get_top_scores(&self, game_id: &str, period: Period, limit: usize) -> Result<Vec<ScoreEntry>, StoreError> {
            if game_id == self.held_game {
                self.open.notified().await;
            }
            self.inner.get_top_scores(game_id, period, limit).await
        }

        async fn get_personal_best(&self, game_id: &str, session_id: &SessionId) -> Result<Option<ScoreEntry>, StoreError> {
            self.inner.get_personal_best(game_id, session_id).await
        }

        async fn save_score(&self, game_id: &str, submission: &ScoreSubmission) -> Result<ScoreEntry, StoreError> {
            self.inner.save_score(game_id, submission).await
        }
    }

    fn service(transport: Arc<dyn Transport>, store: Arc<dyn ScoreStore>, size: usize) -> (Arc<LeaderboardService>, EventBus) {
        let metrics = Arc::new(SyncMetrics::new());
        let (registry, _) = ChannelRegistry::new(None, transport, metrics.clone(), Duration::from_millis(20));
        let events = EventBus::new(registry, metrics.clone());
        let config = LeaderboardConfig {
            size,
            refresh_interval_ms: 60_000,
        };
        let service = LeaderboardService::new(events.clone(), store, config, Duration::from_secs(1), metrics);
        (service, events)
    }

    fn submitted(name: &str, score: i64) -> DomainEvent {
        DomainEvent::ScoreSubmitted(ScoreSubmitted {
            session_id: SessionId::from(name),
            display_name: name.into(),
            score,
            metadata: Default::default(),
            submitted_at: None,
        })
    }

    fn recorder() -> (Arc<Mutex<Vec<LeaderboardSnapshot>>>, impl Fn(&LeaderboardSnapshot) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |s: &LeaderboardSnapshot| sink.lock().push(s.clone()))
    }

    fn last_names(seen: &Mutex<Vec<LeaderboardSnapshot>>) -> Vec<String> {
        seen.lock()
            .last()
            .map(|s| s.entries.iter().map(|e| e.player_name.clone()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn live_scores_update_the_daily_board() {
        let (service, events) = service(LocalBus::new(64), Arc::new(MemoryScoreStore::new()), 3);
        let (seen, cb) = recorder();
        let _sub = service.subscribe("snake", Period::Daily, cb).await.unwrap();
        assert!(seen.lock()[0].entries.is_empty());

        for (name, score) in [("P1", 500), ("P2", 300), ("P3", 450), ("P4", 100)] {
            events.publish("snake", submitted(name, score)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(last_names(&seen), vec!["P1", "P3", "P2"]);
        // P4 never made the board, so it caused no extra snapshot
        assert_eq!(seen.lock().len(), 4);
        let current = service.current("snake", Period::Daily).await.unwrap();
        assert_eq!(current.entries.len(), 3);
    }

    #[tokio::test]
    async fn seeds_from_store_and_shares_one_aggregator() {
        let store = Arc::new(MemoryScoreStore::new());
        store.insert("snake", "s1".into(), ScoreEntry::new("Stored", 900, Utc::now()));
        let (service, _) = service(LocalBus::new(64), store, 3);

        let (first, cb) = recorder();
        let a = service.subscribe("snake", Period::AllTime, cb).await.unwrap();
        let (second, cb) = recorder();
        let b = service.subscribe("snake", Period::AllTime, cb).await.unwrap();
        assert_eq!(last_names(&first), vec!["Stored"]);
        assert_eq!(last_names(&second), vec!["Stored"]);
        assert_eq!(service.open_boards().await, 1);

        drop(a);
        drop(b);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.open_boards().await, 0);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_last_known_board() {
        let store = FlakyStore::new();
        store.inner.insert("snake", "s1".into(), ScoreEntry::new("Seeded", 50, Utc::now()));
        let (service, _) = service(LocalBus::new(64), store.clone(), 3);
        let (seen, cb) = recorder();
        let _sub = service.subscribe("snake", Period::AllTime, cb).await.unwrap();

        store.failing.store(true, Ordering::SeqCst);
        service.refresh_all().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(last_names(&seen), vec!["Seeded"]);
    }

    #[tokio::test]
    async fn gaps_trigger_a_refresh() {
        let scripted = ScriptedTransport::new(TransportKind::Fallback);
        let store = FlakyStore::new();
        let (service, _) = service(scripted.clone(), store.clone(), 3);
        let (seen, cb) = recorder();
        let _sub = service.subscribe("snake", Period::AllTime, cb).await.unwrap();
        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);

        store.inner.insert("snake", "s9".into(), ScoreEntry::new("Missed", 700, Utc::now()));
        let topic = Topic::events("snake").unwrap();
        for seq in [1, 4] {
            let mut env = Envelope::event(topic.clone(), &submitted("Seen", 10)).unwrap();
            env.seq = seq;
            scripted.push(env);
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
        // The store is authoritative: unstored live entries seen before the
        // refresh began are replaced
        assert_eq!(last_names(&seen), vec!["Missed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_on_the_interval() {
        let store = FlakyStore::new();
        let (service, _) = service(LocalBus::new(64), store.clone(), 3);
        let _sub = service.subscribe("snake", Period::Weekly, |_| {}).await.unwrap();
        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(store.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn announced_scores_carry_the_stored_timestamp() {
        let store = Arc::new(MemoryScoreStore::new());
        let (service, events) = service(LocalBus::new(64), store.clone(), 3);
        let (seen, cb) = recorder();
        let _sub = service.subscribe("snake", Period::AllTime, cb).await.unwrap();

        let submission = ScoreSubmission {
            session_id: "s1".into(),
            display_name: "P1".into(),
            score: 42,
            metadata: Default::default(),
        };
        let stored = store.save_score("snake", &submission).await.unwrap();
        let mut event = ScoreSubmitted::from(submission);
        event.submitted_at = Some(stored.submitted_at);
        events.publish("snake", DomainEvent::ScoreSubmitted(event)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().last().unwrap().entries, vec![stored.clone()]);

        service.refresh_all().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().last().unwrap().entries, vec![stored]);
    }

    #[tokio::test]
    async fn slow_seed_does_not_block_other_boards() {
        let store = Arc::new(GatedStore {
            inner: MemoryScoreStore::new(),
            held_game: "tetris",
            open: Notify::new(),
        });
        store.inner.insert("tetris", "s1".into(), ScoreEntry::new("Stored", 900, Utc::now()));
        let (service, _) = service(LocalBus::new(64), store.clone(), 3);

        let mut waiting = Vec::new();
        let mut seen = Vec::new();
        for _ in 0..2 {
            let (board, cb) = recorder();
            let service = service.clone();
            seen.push(board);
            waiting.push(tokio::spawn(async move {
                service.subscribe("tetris", Period::AllTime, cb).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (snake, cb) = recorder();
        let _snake = timeout(Duration::from_millis(500), service.subscribe("snake", Period::AllTime, cb))
            .await
            .expect("snake board blocked behind tetris")
            .unwrap();
        assert_eq!(snake.lock().len(), 1);
        assert!(service.current("tetris", Period::AllTime).await.is_none());

        store.open.notify_one();
        let mut subs = Vec::new();
        for task in waiting {
            subs.push(task.await.unwrap().unwrap());
        }
        // Both tetris subscribers start from the seeded board
        for board in &seen {
            assert_eq!(board.lock()[0].entries.len(), 1);
        }
        assert_eq!(service.open_boards().await, 2);
    }

    #[tokio::test]
    async fn abandoned_subscribe_releases_the_board() {
        let store = Arc::new(GatedStore {
            inner: MemoryScoreStore::new(),
            held_game: "tetris",
            open: Notify::new(),
        });
        let (service, _) = service(LocalBus::new(64), store, 3);
        let abandoned = timeout(
            Duration::from_millis(20),
            service.subscribe("tetris", Period::AllTime, |_| {}),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.open_boards().await, 0);
    }
}
