//! ---
//! morse_section: "01-core-functionality"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Stage lifecycle and message handling."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
use std::fmt;

use morse_common::AppConfig;
use morse_msg::ConnectOptions;
use serde::{Deserialize, Serialize};

/// Role of a process in the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Reads local text and publishes source events.
    Producer,
    /// Encodes source events into signal codes.
    Transformer,
    /// Plays signal codes on an indicator.
    Consumer,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Producer => "producer",
            StageKind::Transformer => "transformer",
            StageKind::Consumer => "display",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream stage whose status topic is watched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedUpstream {
    /// Label used in logs and metrics, the upstream's client id.
    pub label: String,
    /// Status topic the upstream publishes on.
    pub status_topic: String,
}

/// Topic wiring of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    pub kind: StageKind,
    pub client_id: String,
    /// Own retained status topic, also carrying the last-will. Stages with
    /// nothing downstream announce nothing.
    pub status_topic: Option<String>,
    /// Topic transform results are published on.
    pub output_topic: Option<String>,
    /// Event topics passed through the dedup gate and the transform.
    pub event_inputs: Vec<String>,
    pub watched: Vec<WatchedUpstream>,
    /// Local input line that ends the stage.
    pub quit_command: Option<String>,
}

impl StagePlan {
    pub fn producer(config: &AppConfig) -> Self {
        Self {
            kind: StageKind::Producer,
            client_id: config.producer.client_id.clone(),
            status_topic: Some(config.topics.source_status.clone()),
            output_topic: Some(config.topics.source_event.clone()),
            event_inputs: Vec::new(),
            watched: Vec::new(),
            quit_command: Some(config.producer.quit_command.clone()),
        }
    }

    pub fn transformer(config: &AppConfig) -> Self {
        Self {
            kind: StageKind::Transformer,
            client_id: config.transformer.client_id.clone(),
            status_topic: Some(config.topics.encoded_status.clone()),
            output_topic: Some(config.topics.encoded_event.clone()),
            event_inputs: vec![config.topics.source_event.clone()],
            watched: vec![WatchedUpstream {
                label: config.producer.client_id.clone(),
                status_topic: config.topics.source_status.clone(),
            }],
            quit_command: None,
        }
    }

    pub fn consumer(config: &AppConfig) -> Self {
        let mut watched = vec![WatchedUpstream {
            label: config.transformer.client_id.clone(),
            status_topic: config.topics.encoded_status.clone(),
        }];
        if config.display.watch_source_status {
            watched.push(WatchedUpstream {
                label: config.producer.client_id.clone(),
                status_topic: config.topics.source_status.clone(),
            });
        }
        Self {
            kind: StageKind::Consumer,
            client_id: config.display.client_id.clone(),
            status_topic: None,
            output_topic: None,
            event_inputs: vec![config.topics.encoded_event.clone()],
            watched,
            quit_command: None,
        }
    }

    pub fn for_kind(kind: StageKind, config: &AppConfig) -> Self {
        match kind {
            StageKind::Producer => Self::producer(config),
            StageKind::Transformer => Self::transformer(config),
            StageKind::Consumer => Self::consumer(config),
        }
    }

    /// Every topic the stage subscribes to after connecting.
    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.event_inputs
            .iter()
            .map(String::as_str)
            .chain(self.watched.iter().map(|w| w.status_topic.as_str()))
    }

    /// Session options, with the retained `Offline` will on the status topic
    /// when the stage has one.
    pub fn connect_options(&self) -> ConnectOptions {
        match &self.status_topic {
            Some(topic) => ConnectOptions::with_offline_will(self.client_id.clone(), topic.clone()),
            None => ConnectOptions {
                client_id: self.client_id.clone(),
                last_will: None,
            },
        }
    }

    pub(crate) fn watched_label(&self, topic: &str) -> Option<&str> {
        self.watched
            .iter()
            .find(|w| w.status_topic == topic)
            .map(|w| w.label.as_str())
    }

    pub(crate) fn is_event_input(&self, topic: &str) -> bool {
        self.event_inputs.iter().any(|t| t == topic)
    }
}
