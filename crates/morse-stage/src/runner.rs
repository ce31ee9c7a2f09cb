//! ---
//! morse_section: "01-core-functionality"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Stage lifecycle and message handling."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
//! Message-driven lifecycle shared by every stage.
//!
//! A runner owns one broker session. It announces the stage's status on every
//! (re)connect, subscribes to the plan's topics and then handles one event at a
//! time: status deliveries feed the presence trackers, event deliveries go
//! through the dedup gate and the stage transform, and results are published
//! with fresh ids. Shutdown announces `Offline` before disconnecting so peers
//! see a graceful exit rather than the last-will.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use morse_common::config::WireFormat;
use morse_metrics::StageMetrics;
use morse_msg::{
    decode_envelope, encode_envelope, log_message, DedupGate, Delivery, Envelope,
    MessageDirection, PresenceTracker, Status, Transport, TransportEvent,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::plan::StagePlan;
use crate::stage::{PresenceEffect, Stage};

/// How often stage-side counters are pushed to metrics between events.
const METRICS_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Lifetime counters of a runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageStats {
    /// Frames delivered on event topics.
    pub received: u64,
    /// Envelopes that passed the dedup gate, plus local input lines.
    pub accepted: u64,
    pub duplicates: u64,
    /// Undecodable frames and unparsable status payloads.
    pub malformed: u64,
    /// Deliveries on topics the plan does not name.
    pub unexpected: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub transform_failures: u64,
    /// Sessions established, including reconnects.
    pub connects: u64,
    pub presence_changes: u64,
}

enum Step {
    Shutdown(&'static str),
    Local(String),
    Transport(TransportEvent),
    SessionLost,
    MetricsTick,
}

/// Drives one stage over one transport session.
pub struct StageRunner<T, S> {
    plan: StagePlan,
    transport: T,
    stage: S,
    wire_format: WireFormat,
    dedup: DedupGate,
    presence: HashMap<String, PresenceTracker>,
    desired: Status,
    stats: StageStats,
    metrics: Option<StageMetrics>,
}

impl<T: Transport, S: Stage> StageRunner<T, S> {
    pub fn new(plan: StagePlan, transport: T, stage: S, wire_format: WireFormat) -> Self {
        let presence = plan
            .watched
            .iter()
            .map(|w| (w.status_topic.clone(), PresenceTracker::new(w.label.clone())))
            .collect();
        Self {
            plan,
            transport,
            stage,
            wire_format,
            dedup: DedupGate::new(),
            presence,
            desired: Status::Online,
            stats: StageStats::default(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: StageMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn stats(&self) -> StageStats {
        self.stats
    }

    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    /// Run until `shutdown` fires, local input ends or the session is lost.
    ///
    /// `input` carries local lines for stages fed from outside the broker.
    pub async fn run(
        mut self,
        mut input: Option<mpsc::Receiver<String>>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<StageStats> {
        info!(
            stage = %self.plan.kind,
            client_id = %self.plan.client_id,
            transport = self.transport.name(),
            behaviour = self.stage.name(),
            "stage starting"
        );

        let metered = self.metrics.is_some();
        let mut metrics_tick = tokio::time::interval(METRICS_FLUSH_INTERVAL);
        metrics_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                _ = shutdown.recv() => Step::Shutdown("shutdown requested"),
                _ = metrics_tick.tick(), if metered => Step::MetricsTick,
                line = next_line(&mut input) => match line {
                    Some(line) => Step::Local(line),
                    None => Step::Shutdown("local input closed"),
                },
                event = self.transport.poll() => match event {
                    Some(event) => Step::Transport(event),
                    None => Step::SessionLost,
                },
            };

            match step {
                Step::Shutdown(reason) => {
                    info!(stage = %self.plan.kind, reason, "stage stopping");
                    self.shutdown().await;
                    break;
                }
                Step::Local(line) => {
                    if self.is_quit(&line) {
                        info!(stage = %self.plan.kind, "quit command received");
                        self.shutdown().await;
                        break;
                    }
                    self.stats.accepted += 1;
                    self.process(&line).await;
                }
                Step::Transport(event) => self.handle_event(event).await,
                Step::SessionLost => {
                    warn!(stage = %self.plan.kind, "broker session lost");
                    self.stage.on_shutdown();
                    break;
                }
                Step::MetricsTick => {}
            }
            if let Some(metrics) = &self.metrics {
                self.stage.record_metrics(metrics);
            }
        }

        info!(stage = %self.plan.kind, stats = ?self.stats, "stage stopped");
        Ok(self.stats)
    }

    fn is_quit(&self, line: &str) -> bool {
        self.plan
            .quit_command
            .as_deref()
            .is_some_and(|quit| line.trim() == quit)
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { reconnect } => self.on_connected(reconnect).await,
            TransportEvent::Delivery(delivery) => self.on_delivery(delivery).await,
            TransportEvent::Disconnected(reason) => {
                warn!(stage = %self.plan.kind, reason = %reason, "broker connection lost, awaiting reconnect");
            }
        }
    }

    async fn on_connected(&mut self, reconnect: bool) {
        self.stats.connects += 1;
        if let Some(metrics) = &self.metrics {
            metrics.inc_connect();
        }
        info!(stage = %self.plan.kind, reconnect, "connected to broker");

        // A last-will may have fired while we were away; restate our status.
        self.announce(self.desired).await;

        let topics: Vec<String> = self.plan.subscriptions().map(str::to_owned).collect();
        for topic in topics {
            if let Err(err) = self.transport.subscribe(&topic).await {
                error!(stage = %self.plan.kind, topic = %topic, error = %err, "subscribe failed");
            }
        }
    }

    async fn on_delivery(&mut self, delivery: Delivery) {
        if let Some(upstream) = self.plan.watched_label(&delivery.topic).map(str::to_owned) {
            self.on_status(&upstream, &delivery.topic, &delivery.payload).await;
        } else if self.plan.is_event_input(&delivery.topic) {
            self.on_envelope(&delivery.topic, &delivery.payload).await;
        } else {
            self.stats.unexpected += 1;
            warn!(stage = %self.plan.kind, topic = %delivery.topic, "message on unexpected topic ignored");
        }
    }

    async fn on_status(&mut self, upstream: &str, topic: &str, payload: &[u8]) {
        let status = match Status::from_payload(payload) {
            Ok(status) => status,
            Err(err) => {
                self.stats.malformed += 1;
                warn!(stage = %self.plan.kind, topic, error = %err, "ignoring status payload");
                return;
            }
        };
        let Some(tracker) = self.presence.get_mut(topic) else {
            return;
        };
        let Some(transition) = tracker.on_status_message(status) else {
            debug!(stage = %self.plan.kind, topic, status = %status, "status unchanged");
            return;
        };
        self.stats.presence_changes += 1;
        if let Some(metrics) = &self.metrics {
            metrics.set_upstream_online(upstream, transition.to == Status::Online);
        }
        if let PresenceEffect::Announce(status) = self.stage.on_presence(upstream, transition.to) {
            if status != self.desired {
                self.desired = status;
                self.announce(status).await;
            }
        }
    }

    async fn on_envelope(&mut self, topic: &str, frame: &[u8]) {
        self.stats.received += 1;
        if let Some(metrics) = &self.metrics {
            metrics.inc_received();
        }
        let envelope = match decode_envelope(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.stats.malformed += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.inc_malformed();
                }
                warn!(stage = %self.plan.kind, topic, error = %err, "dropping malformed envelope");
                return;
            }
        };
        if !self.dedup.accept(topic, &envelope.id) {
            self.stats.duplicates += 1;
            if let Some(metrics) = &self.metrics {
                metrics.inc_duplicate();
            }
            log_message(MessageDirection::Duplicate, topic, &envelope);
            return;
        }
        self.stats.accepted += 1;
        log_message(MessageDirection::Inbound, topic, &envelope);
        self.process(&envelope.payload).await;
    }

    async fn process(&mut self, payload: &str) {
        let stage = &mut self.stage;
        let outcome = catch_unwind(AssertUnwindSafe(|| stage.transform(payload)));
        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                self.record_transform_failure();
                warn!(stage = %self.plan.kind, error = %err, "transform failed, envelope dropped");
                return;
            }
            Err(panic) => {
                self.record_transform_failure();
                error!(stage = %self.plan.kind, panic = %panic_message(panic.as_ref()), "transform panicked, envelope dropped");
                return;
            }
        };
        if let (Some(payload), Some(topic)) = (output, self.plan.output_topic.clone()) {
            self.publish_event(&topic, Envelope::new(payload)).await;
        }
    }

    fn record_transform_failure(&mut self) {
        self.stats.transform_failures += 1;
        if let Some(metrics) = &self.metrics {
            metrics.inc_transform_failure();
        }
    }

    async fn publish_event(&mut self, topic: &str, envelope: Envelope) {
        let frame = match encode_envelope(&envelope, self.wire_format) {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.publish_failures += 1;
                error!(stage = %self.plan.kind, error = %err, "failed to encode envelope");
                return;
            }
        };
        match self.transport.publish(topic, frame, false).await {
            Ok(()) => {
                self.stats.published += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.inc_published();
                }
                log_message(MessageDirection::Outbound, topic, &envelope);
            }
            Err(err) => {
                self.stats.publish_failures += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.inc_publish_failure();
                }
                warn!(stage = %self.plan.kind, topic, error = %err, "publish failed, envelope dropped");
            }
        }
    }

    async fn announce(&mut self, status: Status) {
        let Some(topic) = self.plan.status_topic.clone() else {
            return;
        };
        let payload = Bytes::from_static(status.as_str().as_bytes());
        match self.transport.publish(&topic, payload, true).await {
            Ok(()) => info!(stage = %self.plan.kind, topic = %topic, status = %status, "status announced"),
            Err(err) => {
                self.stats.publish_failures += 1;
                warn!(stage = %self.plan.kind, topic = %topic, error = %err, "status announcement failed");
            }
        }
    }

    async fn shutdown(&mut self) {
        self.stage.on_shutdown();
        self.announce(Status::Offline).await;
        if let Err(err) = self.transport.disconnect().await {
            warn!(stage = %self.plan.kind, error = %err, "disconnect failed");
        }
    }
}

async fn next_line(input: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match input {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
