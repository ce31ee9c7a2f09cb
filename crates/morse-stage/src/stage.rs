//! ---
//! morse_section: "01-core-functionality"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Stage lifecycle and message handling."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
use std::collections::BTreeSet;

use anyhow::Result;
use morse_metrics::StageMetrics;
use morse_msg::Status;
use morse_signal::{IndicatorState, PlayerStats, SignalPlayer};
use tracing::{debug, info, warn};

/// What the runner should do after a presence change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEffect {
    None,
    /// Publish `Status` on the stage's own status topic.
    Announce(Status),
}

/// Behaviour plugged into a [`StageRunner`](crate::StageRunner).
pub trait Stage: Send {
    fn name(&self) -> &'static str;

    /// Turn an accepted payload into the payload to publish, if any.
    fn transform(&mut self, payload: &str) -> Result<Option<String>>;

    /// React to a watched upstream changing state.
    fn on_presence(&mut self, _upstream: &str, _status: Status) -> PresenceEffect {
        PresenceEffect::None
    }

    /// Called once before the runner announces `Offline` and disconnects.
    fn on_shutdown(&mut self) {}

    fn record_metrics(&mut self, _metrics: &StageMetrics) {}
}

/// Producer behaviour: local lines go out unchanged.
#[derive(Debug, Default)]
pub struct Passthrough;

impl Stage for Passthrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn transform(&mut self, payload: &str) -> Result<Option<String>> {
        if payload.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(payload.to_owned()))
    }
}

/// Transformer behaviour: text in, signal code out.
#[derive(Debug)]
pub struct Encoder {
    mirror_upstream: bool,
}

impl Encoder {
    /// `mirror_upstream` makes the stage follow its producer's presence on its
    /// own status topic.
    pub fn new(mirror_upstream: bool) -> Self {
        Self { mirror_upstream }
    }
}

impl Stage for Encoder {
    fn name(&self) -> &'static str {
        "encoder"
    }

    fn transform(&mut self, payload: &str) -> Result<Option<String>> {
        let code = morse_signal::encode(payload);
        if code.is_empty() {
            debug!(len = payload.len(), "nothing encodable in payload");
            return Ok(None);
        }
        Ok(Some(code))
    }

    fn on_presence(&mut self, upstream: &str, status: Status) -> PresenceEffect {
        match status {
            Status::Offline => warn!(upstream, "input source is offline, waiting for it to return"),
            Status::Online => info!(upstream, "input source is back online"),
        }
        if self.mirror_upstream {
            PresenceEffect::Announce(status)
        } else {
            PresenceEffect::None
        }
    }
}

/// Display behaviour: codes are played on the indicator.
pub struct Renderer {
    player: SignalPlayer,
    down: BTreeSet<String>,
    reported: PlayerStats,
    held_back: u64,
    held_back_reported: u64,
}

impl Renderer {
    pub fn new(player: SignalPlayer) -> Self {
        Self {
            player,
            down: BTreeSet::new(),
            reported: PlayerStats::default(),
            held_back: 0,
            held_back_reported: 0,
        }
    }

    pub fn player(&self) -> &SignalPlayer {
        &self.player
    }

    /// Upstreams currently known to be offline.
    pub fn down(&self) -> impl Iterator<Item = &str> {
        self.down.iter().map(String::as_str)
    }

    /// Codes dropped because an upstream was offline when they arrived.
    pub fn held_back(&self) -> u64 {
        self.held_back
    }
}

impl Stage for Renderer {
    fn name(&self) -> &'static str {
        "renderer"
    }

    fn transform(&mut self, payload: &str) -> Result<Option<String>> {
        if !self.down.is_empty() {
            self.held_back += 1;
            warn!(
                down = ?self.down,
                len = payload.len(),
                "upstream offline, code not played"
            );
            return Ok(None);
        }
        let generation = self.player.submit(payload);
        debug!(generation, "signal submitted");
        Ok(None)
    }

    fn on_presence(&mut self, upstream: &str, status: Status) -> PresenceEffect {
        match status {
            Status::Offline => {
                self.down.insert(upstream.to_owned());
                warn!(upstream, "upstream offline, holding indicator");
                self.player.abort_and_hold(IndicatorState::UpstreamDown);
            }
            Status::Online => {
                self.down.remove(upstream);
                if self.down.is_empty() {
                    info!(upstream, "all upstreams online, indicator released");
                    self.player.release();
                }
            }
        }
        PresenceEffect::None
    }

    fn on_shutdown(&mut self) {
        self.player.abort();
    }

    fn record_metrics(&mut self, metrics: &StageMetrics) {
        let current = self.player.stats();
        let previous = std::mem::replace(&mut self.reported, current);
        metrics.add_playback("started", current.started - previous.started);
        metrics.add_playback("completed", current.completed - previous.completed);
        metrics.add_playback("preempted", current.preempted - previous.preempted);
        metrics.add_playback("aborted", current.aborted - previous.aborted);
        metrics.add_playback(
            "skipped_symbols",
            current.skipped_symbols - previous.skipped_symbols,
        );
        let held_back = std::mem::replace(&mut self.held_back_reported, self.held_back);
        metrics.add_playback("held_back", self.held_back - held_back);
    }
}
