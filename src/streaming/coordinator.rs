// =============================================================================
// Streaming Coordinator — session lifecycle for one symbol/timeframe
// =============================================================================
//
// Lifecycle:
//   Idle → Initializing → LoadingHistory → Streaming → ShuttingDown
//   Initializing / parameter change → Failed   (symbol rejected; terminal)
//
// One tokio task owns the feed handle, the aggregator, the first-load buffer
// and the indicator engine.  Everything that happens to the session (polls,
// history retries, the first-load deadline, parameter changes, shutdown) is a
// branch of a single `select!`, so no state is ever shared or locked.
//
// History load:
//   1. range request [current_slot - lookback_days, current_slot]
//   2. empty → fixed-depth fallback
//   3. last bar more than `stale_slots` slots old → fixed-depth fallback again
//   4. still empty → retry with backoff up to `history_retry_limit` times,
//      streaming starts regardless
//
// Per poll:
//   tick → guard (price / spike / late / duplicate) → aggregator
//   slot > open_slot + width → close the open bar, reseed at the tick's slot
//   every resulting bar → first-load buffer → BarUpdate + IndicatorPatch
// =============================================================================

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::first_load::{FirstLoadBuffer, Release};
use super::tick_guard::TickGuard;
use crate::indicator_engine::{IndicatorBatch, IndicatorEngine, IndicatorPatch, IndicatorSnapshot};
use crate::market_data::{CandleAggregator, MarketFeed};
use crate::runtime_config::{RuntimeConfig, StreamParams};
use crate::types::{Bar, Tick, Timeframe};

// =============================================================================
// Public surface
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinatorState {
    Idle,
    Initializing,
    LoadingHistory,
    Streaming,
    ShuttingDown,
    Failed,
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Everything the coordinator publishes to its consumer, in emission order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum StreamEvent {
    /// Full bar history (initial flush or reload after a parameter change).
    HistoryBatch(Vec<Bar>),
    /// One new or revised bar.
    BarUpdate(Bar),
    IndicatorBatch(IndicatorBatch),
    IndicatorPatch(IndicatorPatch),
    Snapshot(IndicatorSnapshot),
    /// Last event of the session, carrying the final state.
    Finished(CoordinatorState),
}

#[derive(Debug, Clone)]
enum Command {
    SetParams { symbol: String, timeframe: Timeframe },
}

/// Control side of a running coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl CoordinatorHandle {
    /// Switch symbol and/or timeframe. Same values are a no-op.
    pub fn set_params(&self, symbol: impl Into<String>, timeframe: Timeframe) -> Result<()> {
        self.commands
            .send(Command::SetParams {
                symbol: symbol.into(),
                timeframe,
            })
            .map_err(|_| anyhow!("streaming coordinator has stopped"))
    }

    /// Ask the session to stop. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

// =============================================================================
// StreamingCoordinator
// =============================================================================

pub struct StreamingCoordinator {
    feed: Arc<dyn MarketFeed>,
    stream: StreamParams,
    state: CoordinatorState,
    connected: bool,
    aggregator: CandleAggregator,
    guard: TickGuard,
    first_load: FirstLoadBuffer,
    engine: IndicatorEngine,
    seed_bar: Option<Bar>,
    history_attempts: u32,
    retry_at: Option<Instant>,
    events: mpsc::UnboundedSender<StreamEvent>,
    shutdown: watch::Receiver<bool>,
}

impl StreamingCoordinator {
    /// Start a session on its own task.
    ///
    /// The join handle resolves to the final state once `Finished` has been
    /// emitted.
    pub fn spawn(
        feed: Arc<dyn MarketFeed>,
        config: RuntimeConfig,
    ) -> (
        CoordinatorHandle,
        mpsc::UnboundedReceiver<StreamEvent>,
        JoinHandle<CoordinatorState>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let coordinator = Self::new(feed, config, event_tx, shutdown_rx);
        let task = tokio::spawn(coordinator.run(command_rx));

        let handle = CoordinatorHandle {
            commands: command_tx,
            shutdown: Arc::new(shutdown_tx),
        };
        (handle, event_rx, task)
    }

    fn new(
        feed: Arc<dyn MarketFeed>,
        config: RuntimeConfig,
        events: mpsc::UnboundedSender<StreamEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let RuntimeConfig { stream, indicators } = config;
        Self {
            aggregator: CandleAggregator::new(stream.timeframe.seconds()),
            guard: TickGuard::new(stream.spike_threshold),
            first_load: FirstLoadBuffer::new(
                stream.first_load_min_bars,
                stream.first_load_timeout(),
            ),
            engine: IndicatorEngine::new(indicators),
            feed,
            stream,
            state: CoordinatorState::Idle,
            connected: false,
            seed_bar: None,
            history_attempts: 0,
            retry_at: None,
            events,
            shutdown,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> CoordinatorState {
        if self.start().await {
            let mut poll = interval(self.stream.poll_interval());
            poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut shutdown = self.shutdown.clone();

            loop {
                if *shutdown.borrow() {
                    break;
                }
                let streaming = self.state == CoordinatorState::Streaming;
                let retry_at = self.retry_at;
                let flush_at = self.first_load.deadline();

                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    command = commands.recv() => match command {
                        Some(Command::SetParams { symbol, timeframe }) => {
                            if !self.apply_params(symbol, timeframe).await {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = poll.tick(), if streaming => self.poll_tick().await,
                    _ = sleep_until_opt(retry_at), if retry_at.is_some() => {
                        self.retry_at = None;
                        self.load_history().await;
                    }
                    _ = sleep_until_opt(flush_at), if flush_at.is_some() => {
                        self.expire_first_load();
                    }
                }
            }
        }

        self.finish().await
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    async fn start(&mut self) -> bool {
        self.state = CoordinatorState::Initializing;
        info!(
            symbol = %self.stream.symbol,
            timeframe = %self.stream.timeframe,
            "initializing market feed"
        );

        if let Err(e) = self.feed.initialize().await {
            error!(error = %e, "market feed initialization failed");
            self.state = CoordinatorState::Failed;
            return false;
        }
        self.connected = true;

        if !self.select_symbol().await {
            self.state = CoordinatorState::Failed;
            return false;
        }

        self.first_load.arm(Instant::now());
        self.history_attempts = 0;
        self.load_history().await;
        self.start_stream();
        true
    }

    async fn apply_params(&mut self, symbol: String, timeframe: Timeframe) -> bool {
        if symbol == self.stream.symbol && timeframe == self.stream.timeframe {
            debug!(%symbol, %timeframe, "parameters unchanged");
            return true;
        }

        info!(
            from_symbol = %self.stream.symbol,
            from_timeframe = %self.stream.timeframe,
            to_symbol = %symbol,
            to_timeframe = %timeframe,
            "switching stream parameters"
        );
        self.state = CoordinatorState::Idle;
        self.stream.symbol = symbol;
        self.stream.timeframe = timeframe;
        self.first_load.clear_pending();
        self.seed_bar = None;
        self.retry_at = None;
        self.history_attempts = 0;

        if !self.select_symbol().await {
            self.state = CoordinatorState::Failed;
            return false;
        }

        // Bars of the previous parameters must not leak into the new series.
        if self.load_history().await == HistoryOutcome::Empty && self.first_load.is_flushed() {
            info!(
                symbol = %self.stream.symbol,
                timeframe = %self.stream.timeframe,
                "no history for new parameters, clearing indicator state"
            );
            self.publish_history(Vec::new());
        }
        self.start_stream();
        true
    }

    async fn select_symbol(&mut self) -> bool {
        let symbol = self.stream.symbol.as_str();
        match self.feed.select_symbol(symbol).await {
            Ok(true) => {
                debug!(symbol, "symbol selected");
                true
            }
            Ok(false) => {
                error!(symbol, "symbol rejected by market feed");
                false
            }
            Err(e) => {
                error!(symbol, error = %e, "symbol selection failed");
                false
            }
        }
    }

    fn start_stream(&mut self) {
        self.aggregator = CandleAggregator::new(self.stream.timeframe.seconds());
        if let Some(seed) = self.seed_bar.take() {
            debug!(slot = seed.time, close = seed.close, "aggregator seeded");
            self.aggregator.seed(seed);
        }
        self.guard.reset();
        self.state = CoordinatorState::Streaming;
        info!(
            symbol = %self.stream.symbol,
            timeframe = %self.stream.timeframe,
            "streaming started"
        );
    }

    async fn finish(mut self) -> CoordinatorState {
        if self.state != CoordinatorState::Failed {
            self.state = CoordinatorState::ShuttingDown;
        }
        if self.connected {
            self.feed.shutdown().await;
        }
        info!(state = %self.state, "streaming coordinator finished");
        self.emit(StreamEvent::Finished(self.state));
        self.state
    }

    // -------------------------------------------------------------------------
    // History
    // -------------------------------------------------------------------------

    async fn load_history(&mut self) -> HistoryOutcome {
        let was_streaming = self.state == CoordinatorState::Streaming;
        self.state = CoordinatorState::LoadingHistory;

        let mut shutdown = self.shutdown.clone();
        let fetched = tokio::select! {
            fetched = fetch_history(self.feed.as_ref(), &self.stream) => fetched,
            _ = wait_for_shutdown(&mut shutdown) => {
                debug!("discarding in-flight history request after shutdown");
                return HistoryOutcome::Discarded;
            }
        };

        if was_streaming {
            self.state = CoordinatorState::Streaming;
        }

        let HistoryFetch {
            mut bars,
            tick,
            current_slot,
        } = fetched;

        if bars.is_empty() {
            if self.history_attempts < self.stream.history_retry_limit {
                self.history_attempts += 1;
                let backoff = self.stream.history_retry_backoff();
                warn!(
                    symbol = %self.stream.symbol,
                    attempt = self.history_attempts,
                    limit = self.stream.history_retry_limit,
                    backoff_ms = backoff.as_millis() as u64,
                    "history unavailable, scheduling retry"
                );
                self.retry_at = Some(Instant::now() + backoff);
            } else {
                warn!(
                    symbol = %self.stream.symbol,
                    attempts = self.history_attempts,
                    "history still unavailable, continuing with live bars only"
                );
            }
            return HistoryOutcome::Empty;
        }
        self.history_attempts = 0;

        if let (Some(tick), Some(last)) = (tick, bars.last().copied()) {
            if current_slot > last.time && tick.price > 0.0 {
                debug!(
                    slot = current_slot,
                    price = tick.price,
                    "appending stub bar for current slot"
                );
                bars.push(Bar::flat(current_slot, tick.price, 0.0));
            }
        }

        let Some(seed) = bars.last().copied() else {
            return HistoryOutcome::Empty;
        };
        info!(
            symbol = %self.stream.symbol,
            timeframe = %self.stream.timeframe,
            bars = bars.len(),
            last = seed.time,
            "history loaded"
        );

        if was_streaming {
            // Late retry: only move the aggregator forward.
            if self.aggregator.open_slot().map_or(true, |slot| slot < seed.time) {
                debug!(slot = seed.time, "reseeding aggregator from retried history");
                self.aggregator.seed(seed);
            }
        } else {
            self.seed_bar = Some(seed);
        }

        match self.first_load.offer_history(bars) {
            Release::Held => {
                debug!(
                    pending = self.first_load.pending(),
                    "history held for first load"
                );
                HistoryOutcome::Held
            }
            Release::Batch(bars) | Release::Direct(bars) => {
                self.publish_history(bars);
                HistoryOutcome::Published
            }
        }
    }

    fn expire_first_load(&mut self) {
        match self.first_load.expire() {
            Some(bars) => {
                info!(bars = bars.len(), "first-load timeout, flushing partial buffer");
                self.publish_history(bars);
            }
            None => debug!("first-load timeout with nothing buffered"),
        }
    }

    // -------------------------------------------------------------------------
    // Live ticks
    // -------------------------------------------------------------------------

    async fn poll_tick(&mut self) {
        let tick = match self.feed.latest_tick(&self.stream.symbol).await {
            Ok(Some(tick)) => tick,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "tick poll failed");
                return;
            }
        };

        if let Err(reason) = self.guard.check(&tick, &self.aggregator) {
            debug!(time = tick.time, price = tick.price, %reason, "tick rejected");
            return;
        }
        self.guard.accept(&tick);

        let slot = self.aggregator.slot_of(tick.time);
        let (closed, current) = match self.aggregator.open_slot() {
            Some(open) if slot > open + self.aggregator.width() => {
                debug!(from = open, to = slot, "slot gap, reseeding aggregator");
                self.aggregator.jump_to(tick.time, tick.price, tick.volume)
            }
            _ => self.aggregator.push_tick(tick.time, tick.price, tick.volume),
        };

        if let Some(closed) = closed {
            self.publish_bar(closed);
        }
        self.publish_bar(current);
    }

    // -------------------------------------------------------------------------
    // Publishing
    // -------------------------------------------------------------------------

    fn publish_bar(&mut self, bar: Bar) {
        match self.first_load.offer_bar(bar) {
            Release::Held => {}
            Release::Batch(bars) => {
                info!(bars = bars.len(), "first-load threshold reached");
                self.publish_history(bars);
            }
            Release::Direct(bar) => {
                self.emit(StreamEvent::BarUpdate(bar));
                if let Some(patch) = self.engine.on_bar(bar) {
                    if !patch.markers.is_empty() {
                        info!(
                            time = bar.time,
                            trend_rider = patch.markers.trend_rider.len(),
                            vol_breakout = patch.markers.vol_breakout.len(),
                            "signal markers fired"
                        );
                    }
                    self.emit(StreamEvent::IndicatorPatch(patch));
                    self.emit(StreamEvent::Snapshot(self.engine.latest_snapshot()));
                }
            }
        }
    }

    fn publish_history(&mut self, bars: Vec<Bar>) {
        self.engine.set_history(&bars);
        self.emit(StreamEvent::HistoryBatch(bars));
        self.emit(StreamEvent::IndicatorBatch(self.engine.batch()));
        self.emit(StreamEvent::Snapshot(self.engine.latest_snapshot()));
    }

    fn emit(&self, event: StreamEvent) {
        if self.events.send(event).is_err() {
            debug!("stream event dropped, no consumer");
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryOutcome {
    Published,
    Held,
    Empty,
    Discarded,
}

struct HistoryFetch {
    bars: Vec<Bar>,
    tick: Option<Tick>,
    current_slot: i64,
}

async fn fetch_history(feed: &dyn MarketFeed, params: &StreamParams) -> HistoryFetch {
    let symbol = params.symbol.as_str();
    let timeframe = params.timeframe;
    let width = timeframe.seconds().max(1);

    let tick = match feed.latest_tick(symbol).await {
        Ok(tick) => tick,
        Err(e) => {
            warn!(symbol, error = %e, "latest tick unavailable, using wall clock");
            None
        }
    };
    let now = tick.map_or_else(|| Utc::now().timestamp(), |t| t.time);
    let current_slot = now.div_euclid(width) * width;
    let start = current_slot - i64::from(params.history_lookback_days) * 86_400;

    let mut bars = match feed
        .historical_range(symbol, timeframe, start, current_slot)
        .await
    {
        Ok(bars) => bars,
        Err(e) => {
            warn!(symbol, error = %e, "range history request failed");
            Vec::new()
        }
    };

    if bars.is_empty() {
        warn!(
            symbol,
            %timeframe,
            start,
            end = current_slot,
            "range history empty, falling back to depth request"
        );
        bars = fetch_depth(feed, params).await;
    }

    let stale_before = current_slot - params.stale_slots * width;
    if let Some(last) = bars.last().map(|b| b.time) {
        if last < stale_before {
            warn!(symbol, last, current_slot, "history is stale, refetching by depth");
            let refreshed = fetch_depth(feed, params).await;
            if !refreshed.is_empty() {
                bars = refreshed;
            }
        }
    }

    HistoryFetch {
        bars,
        tick,
        current_slot,
    }
}

async fn fetch_depth(feed: &dyn MarketFeed, params: &StreamParams) -> Vec<Bar> {
    let count = params.fallback_depth();
    match feed
        .historical_depth(&params.symbol, params.timeframe, count)
        .await
    {
        Ok(bars) => bars,
        Err(e) => {
            warn!(symbol = %params.symbol, count, error = %e, "depth history request failed");
            Vec::new()
        }
    }
}

/// Resolves once shutdown is requested or the handle is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn sleep_until_opt(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FeedError;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Ticks are queued per symbol; the last one repeats once a queue drains.
    struct ScriptedFeed {
        known: Vec<&'static str>,
        empty_history: Vec<&'static str>,
        history: Vec<Bar>,
        depth_history: Option<Vec<Bar>>,
        range_delay: Option<Duration>,
        ticks: Mutex<HashMap<String, VecDeque<Tick>>>,
        last_tick: Mutex<HashMap<String, Tick>>,
        selected: Mutex<Vec<String>>,
        range_calls: AtomicUsize,
        depth_calls: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    impl ScriptedFeed {
        fn build(known: Vec<&'static str>, history: Vec<Bar>, ticks: Vec<Tick>) -> Self {
            let mut queues = HashMap::new();
            queues.insert("BTCUSDT".to_string(), VecDeque::from(ticks));
            Self {
                known,
                empty_history: Vec::new(),
                history,
                depth_history: None,
                range_delay: None,
                ticks: Mutex::new(queues),
                last_tick: Mutex::new(HashMap::new()),
                selected: Mutex::new(Vec::new()),
                range_calls: AtomicUsize::new(0),
                depth_calls: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
            }
        }

        fn new(known: Vec<&'static str>, history: Vec<Bar>, ticks: Vec<Tick>) -> Arc<Self> {
            Arc::new(Self::build(known, history, ticks))
        }

        fn push_ticks(&self, symbol: &str, ticks: impl IntoIterator<Item = Tick>) {
            self.ticks
                .lock()
                .unwrap()
                .entry(symbol.to_string())
                .or_default()
                .extend(ticks);
        }

        fn history_for(&self, symbol: &str) -> Vec<Bar> {
            if self.empty_history.iter().any(|empty| *empty == symbol) {
                Vec::new()
            } else {
                self.history.clone()
            }
        }
    }

    #[async_trait]
    impl MarketFeed for ScriptedFeed {
        async fn select_symbol(&self, symbol: &str) -> Result<bool, FeedError> {
            self.selected.lock().unwrap().push(symbol.to_string());
            Ok(self.known.iter().any(|known| *known == symbol))
        }

        async fn latest_tick(&self, symbol: &str) -> Result<Option<Tick>, FeedError> {
            let next = self
                .ticks
                .lock()
                .unwrap()
                .get_mut(symbol)
                .and_then(|queue| queue.pop_front());
            let mut last = self.last_tick.lock().unwrap();
            if let Some(tick) = next {
                last.insert(symbol.to_string(), tick);
            }
            Ok(last.get(symbol).copied())
        }

        async fn historical_range(
            &self,
            symbol: &str,
            _timeframe: Timeframe,
            _start: i64,
            _end: i64,
        ) -> Result<Vec<Bar>, FeedError> {
            self.range_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.range_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.history_for(symbol))
        }

        async fn historical_depth(
            &self,
            symbol: &str,
            _timeframe: Timeframe,
            _count: usize,
        ) -> Result<Vec<Bar>, FeedError> {
            self.depth_calls.fetch_add(1, Ordering::SeqCst);
            match &self.depth_history {
                Some(bars) => Ok(bars.clone()),
                None => Ok(self.history_for(symbol)),
            }
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(min_bars: usize) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.stream.symbol = "BTCUSDT".to_string();
        config.stream.timeframe = Timeframe::M1;
        config.stream.first_load_min_bars = min_bars;
        config
    }

    fn history() -> Vec<Bar> {
        (0..5).map(|k| Bar::flat(k * 60, 1.0, 1.0)).collect()
    }

    fn tick(time: i64, price: f64) -> Tick {
        Tick {
            time,
            price,
            volume: 1.0,
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn bar_updates(events: &[StreamEvent]) -> Vec<Bar> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::BarUpdate(bar) => Some(*bar),
                _ => None,
            })
            .collect()
    }

    fn history_batches(events: &[StreamEvent]) -> Vec<Vec<Bar>> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::HistoryBatch(bars) => Some(bars.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_symbol_fails_before_streaming() {
        let feed = ScriptedFeed::new(vec![], history(), vec![tick(300, 1.0)]);
        let (_handle, mut events, task) = StreamingCoordinator::spawn(feed.clone(), config(3));

        assert_eq!(task.await.unwrap(), CoordinatorState::Failed);
        let events = drain(&mut events);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            StreamEvent::Finished(CoordinatorState::Failed)
        ));
        assert_eq!(feed.range_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn streams_history_then_guarded_bar_updates() {
        let ticks = vec![
            tick(300, 1.000), // consumed by the history load (stub bar)
            tick(310, 1.001),
            tick(320, 1.200), // spike, rejected
            tick(330, 1.002),
            tick(500, 1.003), // two slots skipped
        ];
        let feed = ScriptedFeed::new(vec!["BTCUSDT"], history(), ticks);
        let (handle, mut events, task) = StreamingCoordinator::spawn(feed.clone(), config(3));

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.shutdown();
        assert_eq!(task.await.unwrap(), CoordinatorState::ShuttingDown);
        assert_eq!(feed.shutdowns.load(Ordering::SeqCst), 1);

        let events = drain(&mut events);
        assert!(matches!(events[0], StreamEvent::HistoryBatch(_)));
        assert!(matches!(events[1], StreamEvent::IndicatorBatch(_)));
        assert!(matches!(events[2], StreamEvent::Snapshot(_)));
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Finished(CoordinatorState::ShuttingDown))
        ));

        let batches = history_batches(&events);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 6);
        assert_eq!(batches[0][5], Bar::flat(300, 1.0, 0.0));

        let updates = bar_updates(&events);
        let times: Vec<i64> = updates.iter().map(|b| b.time).collect();
        assert_eq!(times, vec![300, 300, 300, 480]);
        let closes: Vec<f64> = updates.iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![1.001, 1.002, 1.002, 1.003]);
        assert_eq!(updates[3], Bar::flat(480, 1.003, 1.0));
        assert!(updates.iter().all(|b| b.high < 1.1));

        let patches = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::IndicatorPatch(_)))
            .count();
        assert_eq!(patches, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn first_load_timeout_flushes_coalesced_buffer() {
        let mut ticks = vec![tick(300, 1.0), tick(310, 1.001)];
        ticks.extend(std::iter::repeat(tick(310, 1.001)).take(30));
        ticks.push(tick(340, 1.004));
        let feed = ScriptedFeed::new(vec!["BTCUSDT"], history(), ticks);
        let (handle, mut events, task) = StreamingCoordinator::spawn(feed, config(120));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(drain(&mut events).is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.shutdown();
        task.await.unwrap();

        let events = drain(&mut events);
        assert!(matches!(events[0], StreamEvent::HistoryBatch(_)));
        let batches = history_batches(&events);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 6);
        assert_eq!(batches[0][5].time, 300);
        assert_eq!(batches[0][5].close, 1.001);

        let updates = bar_updates(&events);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].time, 300);
        assert_eq!(updates[0].close, 1.004);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_history_retries_up_to_limit() {
        let feed = ScriptedFeed::new(
            vec!["BTCUSDT"],
            Vec::new(),
            vec![tick(300, 1.0), tick(310, 1.001), tick(330, 1.002)],
        );
        let (handle, mut events, task) = StreamingCoordinator::spawn(feed.clone(), config(120));

        tokio::time::sleep(Duration::from_secs(10)).await;
        handle.shutdown();
        assert_eq!(task.await.unwrap(), CoordinatorState::ShuttingDown);

        // Initial attempt plus six retries, each falling back to depth.
        assert_eq!(feed.range_calls.load(Ordering::SeqCst), 7);
        assert_eq!(feed.depth_calls.load(Ordering::SeqCst), 7);

        // Live bars alone are flushed at the first-load deadline.
        let events = drain(&mut events);
        let batches = history_batches(&events);
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0],
            vec![Bar {
                time: 300,
                open: 1.001,
                high: 1.002,
                low: 1.001,
                close: 1.002,
                volume: 2.0,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn parameter_change_reloads_history() {
        let feed = ScriptedFeed::new(
            vec!["BTCUSDT", "ETHUSDT"],
            history(),
            vec![tick(300, 1.0)],
        );
        let (handle, mut events, task) = StreamingCoordinator::spawn(feed.clone(), config(3));

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.set_params("BTCUSDT", Timeframe::M1).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.set_params("ETHUSDT", Timeframe::M1).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.shutdown();
        task.await.unwrap();

        assert_eq!(
            *feed.selected.lock().unwrap(),
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
        );
        let batches = history_batches(&drain(&mut events));
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_parameter_change_is_terminal() {
        let feed = ScriptedFeed::new(vec!["BTCUSDT"], history(), vec![tick(300, 1.0)]);
        let (handle, mut events, task) = StreamingCoordinator::spawn(feed.clone(), config(3));

        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.set_params("NOPE", Timeframe::M5).unwrap();
        assert_eq!(task.await.unwrap(), CoordinatorState::Failed);
        assert!(matches!(
            drain(&mut events).last(),
            Some(StreamEvent::Finished(CoordinatorState::Failed))
        ));
        assert!(handle.set_params("BTCUSDT", Timeframe::M5).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn switch_to_symbol_without_history_clears_indicators() {
        let btc: Vec<Bar> = (0..30).map(|k| Bar::flat(k * 60, 100.0, 1.0)).collect();
        let feed = Arc::new(ScriptedFeed {
            empty_history: vec!["ETHUSDT"],
            ..ScriptedFeed::build(vec!["BTCUSDT", "ETHUSDT"], btc, vec![tick(1800, 100.0)])
        });
        feed.push_ticks("ETHUSDT", [2400, 2410, 2420, 2470, 2530].map(|t| tick(t, 5.0)));
        let (handle, mut events, task) = StreamingCoordinator::spawn(feed.clone(), config(3));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let before = drain(&mut events);
        assert!(matches!(
            before.iter().rev().find(|e| matches!(e, StreamEvent::Snapshot(_))),
            Some(StreamEvent::Snapshot(snapshot)) if snapshot.ema20.is_some()
        ));

        handle.set_params("ETHUSDT", Timeframe::M1).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.shutdown();
        assert_eq!(task.await.unwrap(), CoordinatorState::ShuttingDown);

        let after = drain(&mut events);
        assert!(matches!(&after[0], StreamEvent::HistoryBatch(bars) if bars.is_empty()));
        assert!(matches!(&after[1], StreamEvent::IndicatorBatch(batch) if batch.ema20.is_empty()));

        let updates = bar_updates(&after);
        assert!(!updates.is_empty());
        assert!(updates.iter().all(|b| b.close == 5.0));

        let mut patches = 0;
        for event in &after {
            match event {
                StreamEvent::IndicatorPatch(patch) => {
                    patches += 1;
                    assert_eq!(patch.ema20.value, None);
                }
                StreamEvent::Snapshot(snapshot) => assert_eq!(snapshot.ema20, None),
                _ => {}
            }
        }
        assert!(patches > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_range_history_is_replaced_by_depth() {
        let recent: Vec<Bar> = (5..10).map(|k| Bar::flat(k * 60, 1.0, 1.0)).collect();
        let feed = Arc::new(ScriptedFeed {
            depth_history: Some(recent),
            ..ScriptedFeed::build(vec!["BTCUSDT"], history(), vec![tick(600, 1.0)])
        });
        let (handle, mut events, task) = StreamingCoordinator::spawn(feed.clone(), config(3));

        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.shutdown();
        task.await.unwrap();

        // Range history ends at 240, more than three slots before 600.
        assert_eq!(feed.range_calls.load(Ordering::SeqCst), 1);
        assert_eq!(feed.depth_calls.load(Ordering::SeqCst), 1);

        let batches = history_batches(&drain(&mut events));
        assert_eq!(batches.len(), 1);
        let times: Vec<i64> = batches[0].iter().map(|b| b.time).collect();
        assert_eq!(times, vec![300, 360, 420, 480, 540, 600]);
    }

    #[tokio::test(start_paused = true)]
    async fn history_arriving_after_shutdown_is_discarded() {
        let feed = Arc::new(ScriptedFeed {
            range_delay: Some(Duration::from_secs(5)),
            ..ScriptedFeed::build(vec!["BTCUSDT"], history(), vec![tick(300, 1.0)])
        });
        let (handle, mut events, task) = StreamingCoordinator::spawn(feed.clone(), config(3));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(feed.range_calls.load(Ordering::SeqCst), 1);
        handle.shutdown();
        assert_eq!(task.await.unwrap(), CoordinatorState::ShuttingDown);
        assert_eq!(feed.shutdowns.load(Ordering::SeqCst), 1);

        let events = drain(&mut events);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            StreamEvent::Finished(CoordinatorState::ShuttingDown)
        ));
        assert_eq!(feed.depth_calls.load(Ordering::SeqCst), 0);
    }
}
