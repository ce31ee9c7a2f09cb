//! ---
//! morse_section: "01-core-functionality"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Shared primitives for every pipeline stage."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
//! Shared primitives for the Morse relay workspace.
//! This crate exposes configuration loading and tracing initialisation
//! consumed by the stage runner and the `morsed` binary.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, BrokerConfig, DisplayConfig, IndicatorKind, LoggingConfig, MetricsConfig,
    ProducerConfig, TimingConfig, TopicConfig, TransformerConfig, WireFormat,
};
pub use logging::{init_tracing, LogFormat};
