//! ---
//! morse_section: "03-signal-rendering"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Encoding table, pulse timing and indicator playback."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
//! Signal side of the relay: text to code encoding, unit based pulse timing,
//! indicator outputs and the preemptible [`SignalPlayer`].

pub mod code;
pub mod indicator;
pub mod player;
pub mod timing;

/// Result alias for signal operations.
pub type Result<T> = std::result::Result<T, SignalError>;

/// Errors raised while configuring signal timing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignalError {
    /// The base unit must be positive.
    #[error("timing unit must be greater than zero")]
    InvalidUnit,
    /// Words per minute must be positive.
    #[error("invalid speed of {0} wpm")]
    InvalidWpm(u32),
}

pub use code::{encode, lookup};
pub use indicator::{
    ConsoleIndicator, Indicator, IndicatorState, LogIndicator, RecordingIndicator,
};
pub use player::{PlayerSnapshot, PlayerStats, SignalPlayer};
pub use timing::{Plan, Pulse, PulseTiming, Symbol};
