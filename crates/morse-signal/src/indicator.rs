//! ---
//! morse_section: "03-signal-rendering"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Encoding table, pulse timing and indicator playback."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
use std::io::Write;
use std::sync::Arc;

use crossterm::cursor::MoveToColumn;
use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use crossterm::terminal::{Clear, ClearType};
use morse_common::config::IndicatorKind;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Visible state of the output indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorState {
    /// Signal element being keyed.
    On,
    /// Neutral baseline.
    Off,
    /// An upstream stage is offline.
    UpstreamDown,
}

/// Output device driven by the signal player.
///
/// Implementations must return quickly; they are called with the player lock
/// held.
pub trait Indicator: Send + Sync {
    /// Display `state`.
    fn set_state(&self, state: IndicatorState);
}

/// Build the indicator selected in configuration.
pub fn from_kind(kind: IndicatorKind) -> Arc<dyn Indicator> {
    match kind {
        IndicatorKind::Console => Arc::new(ConsoleIndicator::default()),
        IndicatorKind::Log => Arc::new(LogIndicator),
    }
}

/// Terminal lamp drawn in place on stdout.
#[derive(Debug, Default)]
pub struct ConsoleIndicator {
    last: Mutex<Option<IndicatorState>>,
}

impl ConsoleIndicator {
    fn draw(&self, state: IndicatorState) -> std::io::Result<()> {
        let (color, label) = match state {
            IndicatorState::On => (Color::Yellow, "● ON "),
            IndicatorState::Off => (Color::DarkGrey, "○ off"),
            IndicatorState::UpstreamDown => (Color::Red, "✖ upstream down"),
        };
        let mut stdout = std::io::stdout().lock();
        crossterm::queue!(
            stdout,
            MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            SetForegroundColor(color),
            Print(label),
            ResetColor
        )?;
        stdout.flush()
    }
}

impl Indicator for ConsoleIndicator {
    fn set_state(&self, state: IndicatorState) {
        let mut last = self.last.lock();
        if *last == Some(state) {
            return;
        }
        *last = Some(state);
        if let Err(err) = self.draw(state) {
            debug!(error = %err, "console indicator write failed");
        }
    }
}

/// Indicator that reports state changes as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogIndicator;

impl Indicator for LogIndicator {
    fn set_state(&self, state: IndicatorState) {
        info!(target: "morse_signal::indicator", state = ?state, "indicator");
    }
}

/// Indicator that keeps a timestamped history of every write.
///
/// Timestamps come from the Tokio clock, so paused-clock tests observe exact
/// pulse boundaries.
#[derive(Debug, Default)]
pub struct RecordingIndicator {
    events: Mutex<Vec<(Instant, IndicatorState)>>,
}

impl RecordingIndicator {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write so far.
    pub fn events(&self) -> Vec<(Instant, IndicatorState)> {
        self.events.lock().clone()
    }

    /// States written so far, without timestamps.
    pub fn states(&self) -> Vec<IndicatorState> {
        self.events.lock().iter().map(|(_, state)| *state).collect()
    }

    /// Most recent write.
    pub fn last(&self) -> Option<IndicatorState> {
        self.events.lock().last().map(|(_, state)| *state)
    }

    /// Drop the history.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Indicator for RecordingIndicator {
    fn set_state(&self, state: IndicatorState) {
        self.events.lock().push((Instant::now(), state));
    }
}
