//! ---
//! morse_section: "01-core-functionality"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Stage lifecycle and message handling."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
//! Stage lifecycle for the relay: topic plans, stage behaviours and the
//! message-driven runner that ties them to a broker session.

pub mod plan;
pub mod runner;
pub mod stage;

pub use plan::{StageKind, StagePlan, WatchedUpstream};
pub use runner::{StageRunner, StageStats};
pub use stage::{Encoder, Passthrough, PresenceEffect, Renderer, Stage};
