//! Track Coordinator (C6): the state machine driving one track end to end —
//! acquire the track's lease, stream events from the puller into the
//! position store and writer, and drain cleanly on cancellation or lease
//! loss.
//!
//! ```text
//! Idle -> Leased -> Streaming -> Draining -> Terminal
//! ```
//!
//! A lease-renewal task and a flush-timer task run alongside the main
//! streaming loop; either one signalling lease loss, or the outer
//! cancellation token firing, drives the transition into `Draining`. The
//! whole state machine is wrapped in a supervised restart loop with bounded
//! exponential backoff, so a transient failure (e.g. a pull error) restarts
//! the track instead of killing it, while repeated state conflicts against
//! the same lease eventually give up into `Terminal`.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use evlog_lock::{DistributedLock, Lease, LockError};
use evlog_objstore::ObjectStore;
use evlog_position::{PositionError, PositionStore};
use evlog_puller::{ChronologicalPuller, GraphQlTransport, PullError};
use evlog_schemas::{Cursor, Event, TrackDef};
use evlog_writer::{BufferedWriter, WriteError};
use tokio_util::sync::CancellationToken;

/// Retry policy for transient transport errors inside a single poll call
/// (§4.4 step 4). Protocol errors are never retried here — they surface
/// immediately for the coordinator's own coarser restart backoff to handle.
const PULL_RETRY_BASE: Duration = Duration::from_secs(1);
const PULL_RETRY_CAP: Duration = Duration::from_secs(30);
const PULL_RETRY_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug)]
pub enum CoordinatorError {
    Lock(LockError),
    Pull(PullError),
    Write(WriteError),
    Position(PositionError),
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorError::Lock(e) => write!(f, "{e}"),
            CoordinatorError::Pull(e) => write!(f, "{e}"),
            CoordinatorError::Write(e) => write!(f, "{e}"),
            CoordinatorError::Position(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<LockError> for CoordinatorError {
    fn from(e: LockError) -> Self {
        CoordinatorError::Lock(e)
    }
}
impl From<PullError> for CoordinatorError {
    fn from(e: PullError) -> Self {
        CoordinatorError::Pull(e)
    }
}
impl From<WriteError> for CoordinatorError {
    fn from(e: WriteError) -> Self {
        CoordinatorError::Write(e)
    }
}
impl From<PositionError> for CoordinatorError {
    fn from(e: PositionError) -> Self {
        CoordinatorError::Position(e)
    }
}

/// Coarse lifecycle state, exposed over a `watch` channel purely for
/// observability (tests, health checks) — nothing outside this module reads
/// it to drive control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Leased,
    Streaming,
    Draining,
    Terminal,
}

pub struct CoordinatorConfig {
    pub holder_id: String,
    pub lease_ttl_secs: u64,
    pub poll_interval: Duration,
    pub flush_interval: chrono::Duration,
    /// Cap on consecutive restart attempts before giving up into `Terminal`.
    pub max_restart_attempts: u32,
}

/// Drives one track's lifecycle. `T` is the GraphQL transport used by the
/// embedded puller, generic so tests and `evlog-testkit` can substitute a
/// fake.
pub struct Coordinator<T: GraphQlTransport + 'static> {
    track: TrackDef,
    lock: Arc<DistributedLock>,
    puller: Arc<ChronologicalPuller<T>>,
    writer: Arc<BufferedWriter>,
    config: CoordinatorConfig,
    cancel: CancellationToken,
    state_tx: tokio::sync::watch::Sender<State>,
    invalid_events: AtomicU64,
    logged_invalid_shapes: StdMutex<HashSet<String>>,
}

impl<T: GraphQlTransport + 'static> Coordinator<T> {
    pub fn new(
        track: TrackDef,
        lock: Arc<DistributedLock>,
        puller: Arc<ChronologicalPuller<T>>,
        writer: Arc<BufferedWriter>,
        config: CoordinatorConfig,
        cancel: CancellationToken,
    ) -> (Self, tokio::sync::watch::Receiver<State>) {
        let (state_tx, state_rx) = tokio::sync::watch::channel(State::Idle);
        (
            Self {
                track,
                lock,
                puller,
                writer,
                config,
                cancel,
                state_tx,
                invalid_events: AtomicU64::new(0),
                logged_invalid_shapes: StdMutex::new(HashSet::new()),
            },
            state_rx,
        )
    }

    fn set_state(&self, state: State) {
        let _ = self.state_tx.send(state);
    }

    /// Count of events dropped by [`Event::is_valid`] since this coordinator
    /// was constructed, exposed for metrics/tests.
    pub fn invalid_event_count(&self) -> u64 {
        self.invalid_events.load(Ordering::Relaxed)
    }

    /// Drops an invalid event, bumping the counter and logging once per
    /// distinct combination of violated fields (§7 Validation).
    fn reject_invalid_event(&self, event: &Event) {
        self.invalid_events.fetch_add(1, Ordering::Relaxed);
        let shape = invalid_event_shape(event);
        let mut logged = self.logged_invalid_shapes.lock().unwrap();
        if logged.insert(shape.clone()) {
            tracing::warn!(
                track_id = %self.track.track_id,
                shape = %shape,
                "dropping invalid event"
            );
        }
    }

    /// `poll_once`, retrying `PullError::Transport` in place with exponential
    /// backoff (§4.4 step 4). `PullError::Protocol` is never retried here —
    /// it surfaces immediately to the caller. Interruptible by cancellation.
    async fn poll_with_retry(&self, cursor: Cursor, window: i64) -> Result<Vec<Event>, PullError> {
        let mut attempt = 0u32;
        loop {
            match self.puller.poll_once(cursor, window).await {
                Ok(events) => return Ok(events),
                Err(PullError::Protocol(msg)) => return Err(PullError::Protocol(msg)),
                Err(PullError::Transport(msg)) => {
                    attempt += 1;
                    if attempt >= PULL_RETRY_MAX_ATTEMPTS {
                        return Err(PullError::Transport(msg));
                    }
                    let delay = pull_retry_delay(attempt);
                    tracing::warn!(
                        track_id = %self.track.track_id,
                        attempt,
                        error = %msg,
                        "pull_error"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(PullError::Transport(msg)),
                    }
                }
            }
        }
    }

    /// Runs the track forever (until cancellation), supervising the
    /// underlying state machine with bounded exponential backoff on
    /// transient failure.
    pub async fn run(&self, position: &mut PositionStore) -> Result<(), CoordinatorError> {
        let mut attempt = 0u32;

        while !self.cancel.is_cancelled() {
            match self.run_once(position).await {
                Ok(()) => {
                    self.set_state(State::Terminal);
                    return Ok(());
                }
                Err(err) => {
                    attempt += 1;
                    tracing::warn!(
                        track_id = %self.track.track_id,
                        attempt,
                        error = %err,
                        "coordinator restart"
                    );
                    if attempt >= self.config.max_restart_attempts {
                        self.set_state(State::Terminal);
                        return Err(err);
                    }
                    let backoff = backoff_delay(attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.cancel.cancelled() => return Ok(()),
                    }
                }
            }
        }

        self.set_state(State::Terminal);
        Ok(())
    }

    /// One full pass through `Idle -> Leased -> Streaming -> Draining`.
    /// Returns `Ok(())` on clean cancellation-driven shutdown; any other
    /// exit is a failure the caller's restart loop should act on.
    async fn run_once(&self, position: &mut PositionStore) -> Result<(), CoordinatorError> {
        self.set_state(State::Idle);

        let lease = loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            match self
                .lock
                .acquire(&self.track.track_id, &self.config.holder_id, self.config.lease_ttl_secs, Utc::now())
                .await
            {
                Ok(lease) => break lease,
                Err(LockError::Busy) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = self.cancel.cancelled() => return Ok(()),
                    }
                }
                Err(other) => return Err(other.into()),
            }
        };

        tracing::info!(track_id = %self.track.track_id, fencing_token = lease.fencing_token, "lease_acquired");
        self.set_state(State::Leased);

        let result = self.stream(position, lease.clone()).await;

        self.set_state(State::Draining);
        let flush_result = self.writer.flush().await;
        let position_result = position.flush().await;
        let _ = self.lock.release(&lease).await;

        result?;
        flush_result?;
        position_result?;
        Ok(())
    }

    async fn stream(&self, position: &mut PositionStore, lease: Lease) -> Result<(), CoordinatorError> {
        self.set_state(State::Streaming);

        let (lost_tx, mut lost_rx) = tokio::sync::watch::channel(false);
        let renew_lock = Arc::clone(&self.lock);
        let renew_ttl = self.config.lease_ttl_secs;
        let mut current_lease = lease;

        let renew_interval = Duration::from_secs((renew_ttl / 3).max(1));
        let mut ticker = tokio::time::interval(renew_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // The periodic flush is its own task (a third thread alongside the
        // event pump and the lease renewer), so a slow poll cycle never
        // delays flushing whatever is already buffered.
        let flush_writer = Arc::clone(&self.writer);
        let flush_cancel = self.cancel.clone();
        let flush_interval_cfg = self.config.flush_interval;
        let flush_interval_std = flush_interval_cfg
            .to_std()
            .unwrap_or(Duration::from_secs(30));
        let flush_handle = tokio::spawn(async move {
            let mut flush_ticker = tokio::time::interval(flush_interval_std);
            flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = flush_ticker.tick() => {
                        if let Err(err) = flush_writer.flush_if_due(Utc::now(), flush_interval_cfg).await {
                            tracing::warn!(error = %err, "flush_failed");
                        }
                    }
                    _ = flush_cancel.cancelled() => break,
                }
            }
        });

        let result: Result<(), CoordinatorError> = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    break Ok(());
                }

                changed = lost_rx.changed() => {
                    if changed.is_ok() && *lost_rx.borrow() {
                        break Err(LockError::Lost.into());
                    }
                }

                _ = ticker.tick() => {
                    match renew_lock.renew(&current_lease, renew_ttl, Utc::now()).await {
                        Ok(updated) => current_lease = updated,
                        Err(_) => {
                            let _ = lost_tx.send(true);
                        }
                    }
                }

                poll_result = self.poll_with_retry(position.state().cursor(), self.track.window) => {
                    let events = match poll_result {
                        Ok(events) => events,
                        Err(err) => break Err(err.into()),
                    };
                    let mut step_err = None;
                    for event in &events {
                        if !event.is_valid() {
                            self.reject_invalid_event(event);
                            continue;
                        }
                        if let Err(err) = self.writer.write(event).await {
                            step_err = Some(err.into());
                            break;
                        }
                        if let Err(err) = position.advance(event.epoch, event.height, event.tx_index, Utc::now()).await {
                            step_err = Some(err.into());
                            break;
                        }
                    }
                    if let Some(err) = step_err {
                        break Err(err);
                    }

                    if events.is_empty() {
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.poll_interval) => {}
                            _ = self.cancel.cancelled() => break Ok(()),
                        }
                    }
                }
            }
        };

        flush_handle.abort();
        result
    }
}

/// Exponential backoff with jitter, capped at 60s, starting at 1s.
fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1);
    let capped_exp = attempt.min(6);
    let scaled = base * 2u32.pow(capped_exp);
    let capped = scaled.min(Duration::from_secs(60));
    let jitter_ms = rand::random::<u64>() % 250;
    capped + Duration::from_millis(jitter_ms)
}

/// Exponential backoff for in-place transport-error retries, capped at 30s,
/// starting at 1s, no jitter (§4.4 step 4).
fn pull_retry_delay(attempt: u32) -> Duration {
    let scaled = PULL_RETRY_BASE * 2u32.pow(attempt.min(5));
    scaled.min(PULL_RETRY_CAP)
}

/// A stable label for which required fields an invalid event is missing,
/// used to log each distinct shape only once (§7 Validation).
fn invalid_event_shape(event: &Event) -> String {
    let mut violations = Vec::new();
    if event.epoch <= 0 {
        violations.push("epoch<=0");
    }
    if event.height <= 0 {
        violations.push("height<=0");
    }
    if event.event_type.is_empty() {
        violations.push("event_type_empty");
    }
    if event.pkg_path.is_empty() {
        violations.push("pkg_path_empty");
    }
    violations.join(",")
}
