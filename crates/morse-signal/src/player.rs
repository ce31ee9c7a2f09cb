//! ---
//! morse_section: "03-signal-rendering"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Encoding table, pulse timing and indicator playback."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
//! Preemptible playback of signal codes onto an [`Indicator`].
//!
//! Every `submit`, `abort` and `abort_and_hold` bumps a generation counter.
//! A playback task owns one generation and re-checks it under the player lock
//! before each indicator write, so once one of those calls returns no older
//! task can touch the indicator again. The counter is also published on a
//! watch channel, which wakes a sleeping task the moment it is superseded.
//!
//! While a hold is active every off phase shows the held state, so a code
//! played during a hold never looks like an idle indicator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::indicator::{Indicator, IndicatorState};
use crate::timing::{Plan, PulseTiming};

/// Point-in-time view of the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerSnapshot {
    /// Current generation.
    pub generation: u64,
    /// Whether a playback is in progress.
    pub active: bool,
    /// Index into the playing code, `0` when idle.
    pub position: usize,
    /// State the indicator returns to when idle.
    pub rest: IndicatorState,
}

/// Lifetime playback counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayerStats {
    /// Playbacks started by `submit`.
    pub started: u64,
    /// Playbacks that ran to the end.
    pub completed: u64,
    /// Playbacks cut short by a newer `submit`.
    pub preempted: u64,
    /// Playbacks cut short by `abort`/`abort_and_hold`.
    pub aborted: u64,
    /// Code characters that were not `.`, `-` or space.
    pub skipped_symbols: u64,
}

#[derive(Debug)]
enum Activity {
    Idle,
    Playing { position: usize, generation: u64 },
}

#[derive(Debug)]
struct PlayerState {
    generation: u64,
    activity: Activity,
    rest: IndicatorState,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    completed: AtomicU64,
    preempted: AtomicU64,
    aborted: AtomicU64,
    skipped_symbols: AtomicU64,
}

struct Shared {
    indicator: Arc<dyn Indicator>,
    state: Mutex<PlayerState>,
    generation: watch::Sender<u64>,
    counters: Counters,
}

impl Shared {
    /// Stop whatever is playing. Caller holds the lock.
    fn supersede(&self, state: &mut PlayerState) -> (u64, bool) {
        let was_playing = matches!(state.activity, Activity::Playing { .. });
        state.generation += 1;
        state.activity = Activity::Idle;
        self.generation.send_replace(state.generation);
        (state.generation, was_playing)
    }
}

/// Plays signal codes on an indicator, one at a time, newest wins.
pub struct SignalPlayer {
    shared: Arc<Shared>,
    timing: PulseTiming,
}

impl SignalPlayer {
    /// Player driving `indicator`, which is reset to off.
    pub fn new(indicator: Arc<dyn Indicator>, timing: PulseTiming) -> Self {
        indicator.set_state(IndicatorState::Off);
        let (generation, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                indicator,
                state: Mutex::new(PlayerState {
                    generation: 0,
                    activity: Activity::Idle,
                    rest: IndicatorState::Off,
                }),
                generation,
                counters: Counters::default(),
            }),
            timing,
        }
    }

    /// Timing used for new playbacks.
    pub fn timing(&self) -> PulseTiming {
        self.timing
    }

    /// Start playing `code`, preempting any playback in progress.
    ///
    /// Must be called from within a Tokio runtime. Returns the generation that
    /// owns the new playback.
    pub fn submit(&self, code: &str) -> u64 {
        let plan = self.timing.plan(code);
        if !plan.skipped.is_empty() {
            warn!(skipped = ?plan.skipped, "unsupported symbols skipped");
            self.shared
                .counters
                .skipped_symbols
                .fetch_add(plan.skipped.len() as u64, Ordering::Relaxed);
        }

        let mut state = self.shared.state.lock();
        let (generation, preempted) = self.shared.supersede(&mut state);
        if preempted {
            self.shared.counters.preempted.fetch_add(1, Ordering::Relaxed);
            self.shared.indicator.set_state(state.rest);
            debug!(generation, "playback preempted");
        }
        self.shared.counters.started.fetch_add(1, Ordering::Relaxed);

        if plan.is_empty() {
            self.shared.indicator.set_state(state.rest);
            self.shared.counters.completed.fetch_add(1, Ordering::Relaxed);
            return generation;
        }

        state.activity = Activity::Playing {
            position: 0,
            generation,
        };
        drop(state);
        trace!(generation, duration_ms = plan.total_duration().as_millis() as u64, "playback scheduled");
        tokio::spawn(play(self.shared.clone(), plan, generation));
        generation
    }

    /// Stop playback and return the indicator to off.
    pub fn abort(&self) {
        self.abort_and_hold(IndicatorState::Off);
    }

    /// Stop playback and park the indicator in `state` until released.
    pub fn abort_and_hold(&self, state: IndicatorState) {
        let mut guard = self.shared.state.lock();
        let (generation, interrupted) = self.shared.supersede(&mut guard);
        if interrupted {
            self.shared.counters.aborted.fetch_add(1, Ordering::Relaxed);
        }
        guard.rest = state;
        self.shared.indicator.set_state(state);
        debug!(generation, interrupted, state = ?state, "playback aborted");
    }

    /// Return the resting state to off without interrupting playback.
    pub fn release(&self) {
        let mut guard = self.shared.state.lock();
        guard.rest = IndicatorState::Off;
        if matches!(guard.activity, Activity::Idle) {
            self.shared.indicator.set_state(IndicatorState::Off);
        }
    }

    /// Current generation, activity and position.
    pub fn snapshot(&self) -> PlayerSnapshot {
        let guard = self.shared.state.lock();
        let (active, position) = match guard.activity {
            Activity::Idle => (false, 0),
            Activity::Playing { position, .. } => (true, position),
        };
        PlayerSnapshot {
            generation: guard.generation,
            active,
            position,
            rest: guard.rest,
        }
    }

    /// Lifetime counters.
    pub fn stats(&self) -> PlayerStats {
        let counters = &self.shared.counters;
        PlayerStats {
            started: counters.started.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            preempted: counters.preempted.load(Ordering::Relaxed),
            aborted: counters.aborted.load(Ordering::Relaxed),
            skipped_symbols: counters.skipped_symbols.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SignalPlayer {
    fn drop(&mut self) {
        // Orphaned tasks stop at their next check without writing.
        let mut guard = self.shared.state.lock();
        self.shared.supersede(&mut guard);
    }
}

async fn play(shared: Arc<Shared>, plan: Plan, generation: u64) {
    let mut wake = shared.generation.subscribe();
    let mut deadline = Instant::now();
    for pulse in plan.pulses {
        {
            let mut state = shared.state.lock();
            match &mut state.activity {
                Activity::Playing {
                    position,
                    generation: owner,
                } if *owner == generation => *position = pulse.position,
                _ => return,
            }
            let shown = match pulse.state {
                IndicatorState::Off => state.rest,
                other => other,
            };
            shared.indicator.set_state(shown);
        }
        deadline += pulse.duration;
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = superseded(&mut wake, generation) => {
                trace!(generation, "stale playback stopped");
                return;
            }
        }
    }

    let mut state = shared.state.lock();
    if state.generation != generation {
        return;
    }
    state.activity = Activity::Idle;
    shared.indicator.set_state(state.rest);
    shared.counters.completed.fetch_add(1, Ordering::Relaxed);
    trace!(generation, "playback completed");
}

async fn superseded(wake: &mut watch::Receiver<u64>, generation: u64) {
    loop {
        if *wake.borrow_and_update() != generation {
            return;
        }
        if wake.changed().await.is_err() {
            return;
        }
    }
}
