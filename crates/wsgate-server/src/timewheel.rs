//! Hashed timing wheel for idle-connection checks.
//!
//! A ring of `slots` buckets with a pointer that advances one bucket per
//! `tick_interval`. A task due in more than one revolution carries a circle
//! count that is decremented each time the pointer passes its bucket. Each
//! tick touches only the bucket under the pointer, so the cost of a tick is
//! independent of the number of scheduled timers.
//!
//! Placement is measured from the next pending tick rather than from the
//! current one, which keeps every firing inside `[delay, delay + tick)`.
//!
//! The wheel is split in two:
//!
//! - [`WheelState`]: the synchronous ring, index and placement arithmetic
//! - [`TimeWheel`]: the background task that owns a `WheelState`, applies
//!   [`TimerHandle`] commands in arrival order and ticks on a tokio clock
//!
//! Due payloads run as spawned jobs, at most `max_jobs` at a time. A payload
//! that finds every job slot taken is put back for the next tick.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::counter;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use wsgate_core::errors::TimerConfigError;

use crate::metrics::TIMER_JOBS_DEFERRED_TOTAL;

/// Callback invoked with the payload of every timer that fires.
pub type Job<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wheel parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeWheelConfig {
    /// Time between two pointer advances.
    pub tick_interval: Duration,
    /// Number of buckets in the ring.
    pub slots: usize,
    /// Capacity of the add/remove command queue.
    pub queue_capacity: usize,
    /// Jobs allowed to run at the same time.
    pub max_jobs: usize,
}

impl Default for TimeWheelConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            slots: 60,
            queue_capacity: 1024,
            max_jobs: 1024,
        }
    }
}

impl TimeWheelConfig {
    /// Reject parameters the wheel cannot run with.
    pub fn validate(&self) -> Result<(), TimerConfigError> {
        if self.tick_interval.is_zero() {
            return Err(TimerConfigError::ZeroInterval(self.tick_interval));
        }
        if self.slots == 0 {
            return Err(TimerConfigError::ZeroSlots);
        }
        if self.queue_capacity == 0 {
            return Err(TimerConfigError::ZeroQueue);
        }
        if self.max_jobs == 0 {
            return Err(TimerConfigError::ZeroJobs);
        }
        Ok(())
    }

    /// Length of one full revolution.
    pub fn revolution(&self) -> Duration {
        self.tick_interval
            .saturating_mul(u32::try_from(self.slots).unwrap_or(u32::MAX))
    }
}

struct TimerTask<K, T> {
    delay: Duration,
    circle: usize,
    key: Option<K>,
    payload: T,
}

/// The ring itself, without any clock.
///
/// `current` is the bucket the next tick will process.
pub struct WheelState<K, T> {
    interval: Duration,
    slots: Vec<Vec<TimerTask<K, T>>>,
    index: HashMap<K, usize>,
    current: usize,
}

impl<K, T> WheelState<K, T>
where
    K: Eq + Hash + Clone,
{
    /// Empty ring of `slots` buckets advancing every `interval`.
    pub fn new(interval: Duration, slots: usize) -> Result<Self, TimerConfigError> {
        if interval.is_zero() {
            return Err(TimerConfigError::ZeroInterval(interval));
        }
        if slots == 0 {
            return Err(TimerConfigError::ZeroSlots);
        }
        Ok(Self {
            interval,
            slots: (0..slots).map(|_| Vec::new()).collect(),
            index: HashMap::new(),
            current: 0,
        })
    }

    /// Schedule `payload` to fire `delay` from now, where the next tick is
    /// `until_next` away.
    ///
    /// A keyed task replaces any pending task with the same key. A zero delay
    /// is not placed at all: the payload is handed back for immediate firing.
    pub fn add(
        &mut self,
        delay: Duration,
        key: Option<K>,
        payload: T,
        until_next: Duration,
    ) -> Option<T> {
        if let Some(key) = &key {
            let _ = self.remove(key);
        }
        if delay.is_zero() {
            return Some(payload);
        }

        let ticks = self.ticks_for(delay, until_next);
        let slot_count = self.slots.len();
        let slot = (self.current + ticks % slot_count) % slot_count;
        let circle = ticks / slot_count;

        if let Some(key) = &key {
            let _ = self.index.insert(key.clone(), slot);
        }
        self.slots[slot].push(TimerTask {
            delay,
            circle,
            key,
            payload,
        });
        None
    }

    /// Cancel the task registered under `key`. Returns whether one was found.
    pub fn remove(&mut self, key: &K) -> bool {
        let Some(slot) = self.index.remove(key) else {
            return false;
        };
        let bucket = &mut self.slots[slot];
        let before = bucket.len();
        bucket.retain(|task| task.key.as_ref() != Some(key));
        bucket.len() != before
    }

    /// Process the bucket under the pointer and advance it.
    ///
    /// Returns the payloads that are due, in insertion order.
    pub fn tick(&mut self) -> Vec<T> {
        self.tick_keyed()
            .into_iter()
            .map(|(_, payload)| payload)
            .collect()
    }

    /// Like [`WheelState::tick`], keeping each payload's key.
    pub fn tick_keyed(&mut self) -> Vec<(Option<K>, T)> {
        let bucket = std::mem::take(&mut self.slots[self.current]);
        let mut due = Vec::new();
        for mut task in bucket {
            if task.circle > 0 {
                task.circle -= 1;
                self.slots[self.current].push(task);
                continue;
            }
            if let Some(key) = &task.key {
                let _ = self.index.remove(key);
            }
            debug!(delay_ms = task.delay.as_millis(), "timer due");
            due.push((task.key, task.payload));
        }
        self.current = (self.current + 1) % self.slots.len();
        due
    }

    /// Whether a task with `key` is pending.
    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    /// Whether no task is pending.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Vec::is_empty)
    }

    /// Whole ticks needed after the next one so the firing tick is at or
    /// past `delay`.
    fn ticks_for(&self, delay: Duration, until_next: Duration) -> usize {
        if delay <= until_next {
            return 0;
        }
        let rest = (delay - until_next).as_nanos();
        usize::try_from(rest.div_ceil(self.interval.as_nanos())).unwrap_or(usize::MAX)
    }
}

impl<K, T> fmt::Debug for WheelState<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WheelState")
            .field("interval", &self.interval)
            .field("slots", &self.slots.len())
            .field("current", &self.current)
            .field("indexed", &self.index.len())
            .finish_non_exhaustive()
    }
}

enum Command<K, T> {
    Add {
        delay: Duration,
        key: Option<K>,
        payload: T,
    },
    Remove(K),
}

/// Cloneable sender side of a [`TimeWheel`].
pub struct TimerHandle<K, T> {
    tx: mpsc::Sender<Command<K, T>>,
}

impl<K, T> Clone for TimerHandle<K, T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<K, T> fmt::Debug for TimerHandle<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<K, T> TimerHandle<K, T>
where
    K: Send + fmt::Debug,
    T: Send,
{
    /// Schedule `payload` for delivery to the job after `delay`.
    ///
    /// Suspends while the command queue is full.
    pub async fn add_timer(&self, delay: Duration, key: Option<K>, payload: T) {
        if self
            .tx
            .send(Command::Add {
                delay,
                key,
                payload,
            })
            .await
            .is_err()
        {
            warn!("time wheel stopped, timer dropped");
        }
    }

    /// Cancel the timer registered under `key`. No-op if absent or fired.
    pub async fn remove_timer(&self, key: K) {
        if let Err(err) = self.tx.send(Command::Remove(key)).await {
            let Command::Remove(key) = err.0 else {
                return;
            };
            debug!(?key, "time wheel stopped, remove ignored");
        }
    }
}

/// A timer wheel bound to a job, ready to be started.
pub struct TimeWheel<K, T> {
    config: TimeWheelConfig,
    state: WheelState<K, T>,
    job: Job<T>,
    rx: mpsc::Receiver<Command<K, T>>,
    handle: TimerHandle<K, T>,
}

impl<K, T> fmt::Debug for TimeWheel<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeWheel")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<K, T> TimeWheel<K, T>
where
    K: Eq + Hash + Clone + Send + fmt::Debug + 'static,
    T: Send + 'static,
{
    /// Build a wheel; parameters are validated, never coerced.
    pub fn new(config: TimeWheelConfig, job: Job<T>) -> Result<Self, TimerConfigError> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        Ok(Self {
            state: WheelState::new(config.tick_interval, config.slots)?,
            config,
            job,
            rx,
            handle: TimerHandle { tx },
        })
    }

    /// Command handle for scheduling and cancelling timers.
    pub fn handle(&self) -> TimerHandle<K, T> {
        self.handle.clone()
    }

    /// Wheel parameters.
    pub fn config(&self) -> &TimeWheelConfig {
        &self.config
    }

    /// Spawn the ticking loop. Cancelling `cancel` stops it; pending timers
    /// are discarded.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        let Self {
            config,
            state,
            job,
            mut rx,
            handle,
        } = self;
        // Keeps the queue open for the lifetime of the loop.
        let _handle = handle;
        let interval = config.tick_interval;
        let mut runner = Runner {
            state,
            job,
            jobs: Arc::new(Semaphore::new(config.max_jobs)),
            interval,
            next_tick: Instant::now() + interval,
        };

        debug!(
            tick_ms = interval.as_millis(),
            slots = config.slots,
            max_jobs = config.max_jobs,
            "time wheel started"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = time::sleep_until(runner.next_tick) => {
                    // Commands queued before the tick was due apply first,
                    // bounded so a busy producer cannot hold the tick back.
                    for _ in 0..config.queue_capacity {
                        let Ok(command) = rx.try_recv() else { break };
                        runner.apply(command);
                    }
                    runner.tick();
                }
                Some(command) = rx.recv() => runner.apply(command),
            }
        }

        debug!(pending = runner.state.len(), "time wheel stopped");
    }
}

/// Loop-local state of a running wheel.
struct Runner<K, T> {
    state: WheelState<K, T>,
    job: Job<T>,
    jobs: Arc<Semaphore>,
    interval: Duration,
    next_tick: Instant,
}

impl<K, T> Runner<K, T>
where
    K: Eq + Hash + Clone + Send + fmt::Debug + 'static,
    T: Send + 'static,
{
    fn apply(&mut self, command: Command<K, T>) {
        match command {
            Command::Add {
                delay,
                key,
                payload,
            } => {
                let until_next = self.next_tick.saturating_duration_since(Instant::now());
                if let Some(payload) = self.state.add(delay, key.clone(), payload, until_next) {
                    self.fire(key, payload);
                }
            }
            Command::Remove(key) => {
                let _ = self.state.remove(&key);
            }
        }
    }

    fn tick(&mut self) {
        self.next_tick += self.interval;
        for (key, payload) in self.state.tick_keyed() {
            self.fire(key, payload);
        }
    }

    /// Spawn the job for `payload`, or put it back for the next tick when
    /// `max_jobs` are already running.
    fn fire(&mut self, key: Option<K>, payload: T) {
        let Ok(permit) = Arc::clone(&self.jobs).try_acquire_owned() else {
            warn!(?key, "timer jobs saturated, deferred to next tick");
            counter!(TIMER_JOBS_DEFERRED_TOTAL).increment(1);
            let until_next = self
                .next_tick
                .saturating_duration_since(Instant::now())
                .max(Duration::from_nanos(1));
            let _ = self.state.add(until_next, key, payload, until_next);
            return;
        };
        let fut = (self.job)(payload);
        let _ = tokio::spawn(async move {
            if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                error!("timer job panicked");
            }
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    const SEC: Duration = Duration::from_secs(1);

    /// Ticks until `key` fires, counting the first tick as 1.
    fn ticks_until_fired(state: &mut WheelState<u32, u32>, payload: u32, limit: usize) -> usize {
        for n in 1..=limit {
            if state.tick().contains(&payload) {
                return n;
            }
        }
        panic!("payload {payload} never fired within {limit} ticks");
    }

    fn recording_job() -> (Job<u32>, mpsc::UnboundedReceiver<(u32, Instant)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let job: Job<u32> = Arc::new(move |payload| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((payload, Instant::now()));
            }
            .boxed()
        });
        (job, rx)
    }

    fn config(tick: Duration, slots: usize) -> TimeWheelConfig {
        TimeWheelConfig {
            tick_interval: tick,
            slots,
            queue_capacity: 64,
            max_jobs: 16,
        }
    }

    #[test]
    fn zero_interval_rejected() {
        let (job, _rx) = recording_job();
        let result = TimeWheel::<u32, u32>::new(config(Duration::ZERO, 8), job);
        assert_matches!(result, Err(TimerConfigError::ZeroInterval(_)));
    }

    #[test]
    fn zero_slots_rejected() {
        let (job, _rx) = recording_job();
        let result = TimeWheel::<u32, u32>::new(config(SEC, 0), job);
        assert_matches!(result, Err(TimerConfigError::ZeroSlots));
    }

    #[test]
    fn zero_queue_rejected() {
        let cfg = TimeWheelConfig {
            queue_capacity: 0,
            ..TimeWheelConfig::default()
        };
        assert_eq!(cfg.validate(), Err(TimerConfigError::ZeroQueue));
    }

    #[test]
    fn zero_jobs_rejected() {
        let cfg = TimeWheelConfig {
            max_jobs: 0,
            ..TimeWheelConfig::default()
        };
        assert_eq!(cfg.validate(), Err(TimerConfigError::ZeroJobs));
    }

    #[test]
    fn state_rejects_zero_parameters() {
        assert_matches!(
            WheelState::<u32, u32>::new(Duration::ZERO, 4),
            Err(TimerConfigError::ZeroInterval(_))
        );
        assert_matches!(
            WheelState::<u32, u32>::new(SEC, 0),
            Err(TimerConfigError::ZeroSlots)
        );
    }

    #[test]
    fn revolution_length() {
        assert_eq!(config(SEC, 60).revolution(), Duration::from_secs(60));
    }

    #[test]
    fn zero_delay_is_handed_back() {
        let mut state = WheelState::<u32, u32>::new(SEC, 4).unwrap();
        assert_eq!(state.add(Duration::ZERO, Some(1), 10, SEC), Some(10));
        assert!(state.is_empty());
        assert!(!state.contains(&1));
    }

    #[test]
    fn delay_within_first_tick_fires_next_tick() {
        let mut state = WheelState::<u32, u32>::new(SEC, 4).unwrap();
        assert!(state.add(Duration::from_millis(300), None, 7, SEC).is_none());
        assert_eq!(state.tick(), vec![7]);
    }

    #[test]
    fn multi_revolution_task_survives_first_pass() {
        // 12 ticks on a 5-slot ring: passes its bucket twice before firing.
        let mut state = WheelState::<u32, u32>::new(SEC, 5).unwrap();
        let _ = state.add(Duration::from_secs(13), Some(1), 1, SEC);
        for _ in 0..12 {
            assert!(state.tick().is_empty());
            assert!(state.contains(&1));
        }
        assert_eq!(state.tick(), vec![1]);
        assert!(state.is_empty());
    }

    #[test]
    fn remove_before_fire_prevents_it() {
        let mut state = WheelState::<u32, u32>::new(SEC, 4).unwrap();
        let _ = state.add(Duration::from_secs(2), Some(9), 9, SEC);
        assert!(state.remove(&9));
        for _ in 0..8 {
            assert!(state.tick().is_empty());
        }
    }

    #[test]
    fn remove_after_fire_is_noop() {
        let mut state = WheelState::<u32, u32>::new(SEC, 4).unwrap();
        let _ = state.add(SEC, Some(3), 3, SEC);
        assert_eq!(state.tick(), vec![3]);
        assert!(!state.remove(&3));
    }

    #[test]
    fn same_key_replaces_pending_task() {
        let mut state = WheelState::<u32, u32>::new(SEC, 4).unwrap();
        let _ = state.add(SEC, Some(5), 100, SEC);
        let _ = state.add(Duration::from_secs(3), Some(5), 200, SEC);
        assert_eq!(state.len(), 1);
        assert!(state.tick().is_empty());
        assert!(state.tick().is_empty());
        assert_eq!(state.tick(), vec![200]);
    }

    #[test]
    fn same_slot_fires_in_insertion_order() {
        let mut state = WheelState::<u32, u32>::new(SEC, 4).unwrap();
        for payload in [1, 2, 3] {
            let _ = state.add(Duration::from_secs(2), None, payload, SEC);
        }
        assert!(state.tick().is_empty());
        assert_eq!(state.tick(), vec![1, 2, 3]);
    }

    proptest! {
        #[test]
        fn firing_time_within_one_tick_of_delay(
            delay_ms in 1u64..20_000,
            tick_ms in 1u64..1_000,
            slots in 1usize..32,
            offset in 0u64..1_000,
        ) {
            let tick = Duration::from_millis(tick_ms);
            let delay = Duration::from_millis(delay_ms);
            // Time left until the pending tick, in (0, tick].
            let until_next = Duration::from_millis(offset % tick_ms + 1);
            let mut state = WheelState::<u32, u32>::new(tick, slots).unwrap();
            prop_assert!(state.add(delay, Some(0), 42u32, until_next).is_none());

            let limit = usize::try_from(delay_ms / tick_ms).unwrap() + 2;
            let fired_on = ticks_until_fired(&mut state, 42, limit);
            let fired_at = until_next + tick * u32::try_from(fired_on - 1).unwrap();
            prop_assert!(fired_at >= delay, "fired at {fired_at:?} before {delay:?}");
            prop_assert!(fired_at < delay + tick, "fired at {fired_at:?}, late for {delay:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_within_window_on_tokio_clock() {
        let (job, mut rx) = recording_job();
        let wheel = TimeWheel::<u32, u32>::new(config(SEC, 8), job).unwrap();
        let handle = wheel.handle();
        let cancel = CancellationToken::new();
        let task = wheel.start(cancel.clone());

        let start = Instant::now();
        handle.add_timer(Duration::from_millis(2500), Some(1), 1).await;
        let (payload, at) = rx.recv().await.unwrap();
        assert_eq!(payload, 1);
        let elapsed = at - start;
        assert!(elapsed >= Duration::from_millis(2500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3500), "{elapsed:?}");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_fires_immediately() {
        let (job, mut rx) = recording_job();
        let wheel = TimeWheel::<u32, u32>::new(config(SEC, 8), job).unwrap();
        let handle = wheel.handle();
        let cancel = CancellationToken::new();
        let _task = wheel.start(cancel.clone());

        let start = Instant::now();
        handle.add_timer(Duration::ZERO, None, 5).await;
        let (payload, at) = rx.recv().await.unwrap();
        assert_eq!(payload, 5);
        assert_eq!(at, start);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn removal_queued_before_tick_wins() {
        let (job, mut rx) = recording_job();
        let wheel = TimeWheel::<u32, u32>::new(config(SEC, 4), job).unwrap();
        let handle = wheel.handle();
        let cancel = CancellationToken::new();
        let _task = wheel.start(cancel.clone());

        handle.add_timer(Duration::from_secs(2), Some(7), 7).await;
        handle.add_timer(Duration::from_secs(3), Some(8), 8).await;
        handle.remove_timer(7).await;

        let (payload, _) = rx.recv().await.unwrap();
        assert_eq!(payload, 8);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn long_delay_spans_revolutions() {
        let (job, mut rx) = recording_job();
        let wheel = TimeWheel::<u32, u32>::new(config(SEC, 5), job).unwrap();
        let handle = wheel.handle();
        let cancel = CancellationToken::new();
        let _task = wheel.start(cancel.clone());

        let start = Instant::now();
        handle.add_timer(Duration::from_secs(12), None, 12).await;
        let (_, at) = rx.recv().await.unwrap();
        let elapsed = at - start;
        assert!(elapsed >= Duration::from_secs(12) && elapsed < Duration::from_secs(13));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_job_does_not_stop_wheel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job: Job<u32> = Arc::new(move |payload| {
            let tx = tx.clone();
            async move {
                assert!(payload != 0, "boom");
                let _ = tx.send(payload);
            }
            .boxed()
        });
        let wheel = TimeWheel::<u32, u32>::new(config(SEC, 4), job).unwrap();
        let handle = wheel.handle();
        let cancel = CancellationToken::new();
        let _task = wheel.start(cancel.clone());

        handle.add_timer(SEC, None, 0).await;
        handle.add_timer(Duration::from_secs(2), None, 2).await;
        assert_eq!(rx.recv().await, Some(2));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_loop() {
        let (job, _rx) = recording_job();
        let wheel = TimeWheel::<u32, u32>::new(config(SEC, 4), job).unwrap();
        let handle = wheel.handle();
        let cancel = CancellationToken::new();
        let task = wheel.start(cancel.clone());
        cancel.cancel();
        task.await.unwrap();
        // Commands after stop are dropped without blocking.
        handle.remove_timer(1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_jobs_defer_to_next_tick() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job: Job<u32> = {
            let gate = Arc::clone(&gate);
            Arc::new(move |payload| {
                let gate = Arc::clone(&gate);
                let tx = tx.clone();
                async move {
                    if payload == 1 {
                        gate.notified().await;
                    }
                    let _ = tx.send((payload, Instant::now()));
                }
                .boxed()
            })
        };
        let wheel = TimeWheel::<u32, u32>::new(
            TimeWheelConfig {
                max_jobs: 1,
                ..config(SEC, 8)
            },
            job,
        )
        .unwrap();
        let handle = wheel.handle();
        let cancel = CancellationToken::new();
        let _task = wheel.start(cancel.clone());

        handle.add_timer(SEC, Some(1), 1).await;
        handle.add_timer(SEC, Some(2), 2).await;

        // The first job holds the only slot; the second keeps being put back.
        time::sleep(Duration::from_millis(3500)).await;
        assert!(rx.try_recv().is_err());

        let released_at = Instant::now();
        gate.notify_one();
        assert_eq!(rx.recv().await.map(|(payload, _)| payload), Some(1));
        let (payload, at) = rx.recv().await.unwrap();
        assert_eq!(payload, 2);
        assert!(at > released_at && at <= released_at + SEC, "{at:?}");
        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tick_not_starved_by_command_stream() {
        let (job, mut rx) = recording_job();
        let wheel = TimeWheel::<u32, u32>::new(config(Duration::from_millis(10), 8), job).unwrap();
        let handle = wheel.handle();
        let cancel = CancellationToken::new();
        let _task = wheel.start(cancel.clone());

        let flood = {
            let handle = handle.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                while !cancel.is_cancelled() {
                    handle.remove_timer(999).await;
                }
            })
        };

        handle.add_timer(Duration::from_millis(50), Some(1), 1).await;
        let fired = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_matches!(fired, Ok(Some((1, _))));

        cancel.cancel();
        flood.await.unwrap();
    }
}
