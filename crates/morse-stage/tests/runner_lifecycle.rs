//! ---
//! morse_section: "15-testing-qa-runbook"
//! morse_subsection: "integration-tests"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Stage runner lifecycle over the in-process broker."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;
use morse_common::config::WireFormat;
use morse_common::AppConfig;
use morse_msg::{
    decode_envelope, encode_envelope, ConnectOptions, Envelope, InMemoryBroker, InMemorySession,
    Transport, TransportEvent,
};
use morse_metrics::{new_registry, render, StageMetrics};
use morse_signal::{PulseTiming, RecordingIndicator, SignalPlayer};
use morse_stage::{Encoder, Passthrough, Renderer, Stage, StagePlan, StageRunner, StageStats};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

async fn probe(broker: &InMemoryBroker, topics: &[&str]) -> InMemorySession {
    let mut session = broker.connect(ConnectOptions {
        client_id: "probe".into(),
        last_will: None,
    });
    for topic in topics {
        session.subscribe(topic).await.expect("probe subscribe");
    }
    session
}

async fn next(session: &mut InMemorySession) -> (String, Bytes) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(1), session.poll())
            .await
            .expect("delivery within a second")
            .expect("probe session open");
        if let TransportEvent::Delivery(delivery) = event {
            return (delivery.topic, delivery.payload);
        }
    }
}

async fn expect_status(session: &mut InMemorySession, topic: &str, status: &str) {
    let (got_topic, payload) = next(session).await;
    assert_eq!(got_topic, topic);
    assert_eq!(payload, Bytes::copy_from_slice(status.as_bytes()));
}

fn frame(payload: &str, id: &str) -> Bytes {
    encode_envelope(&Envelope::with_id(payload, id), WireFormat::Marker).expect("encode")
}

fn spawn<S: Stage + 'static>(
    broker: &InMemoryBroker,
    plan: StagePlan,
    stage: S,
    input: Option<mpsc::Receiver<String>>,
) -> (broadcast::Sender<()>, JoinHandle<Result<StageStats>>) {
    let session = broker.connect(plan.connect_options());
    let runner = StageRunner::new(plan, session, stage, WireFormat::Marker);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    (shutdown_tx, tokio::spawn(runner.run(input, shutdown_rx)))
}

#[tokio::test]
async fn transformer_encodes_each_envelope_once() -> Result<()> {
    let config = AppConfig::default();
    let broker = InMemoryBroker::new();
    let mut probe = probe(&broker, &["S/textInMorse", "E/textInMorse"]).await;
    let (shutdown, handle) = spawn(&broker, StagePlan::transformer(&config), Encoder::new(true), None);

    expect_status(&mut probe, "S/textInMorse", "Online").await;
    broker.publish_raw("E/KeyboardEvent", frame("sos", "a1"), false);
    broker.publish_raw("E/KeyboardEvent", frame("sos", "a1"), false);
    broker.publish_raw("E/KeyboardEvent", "not an envelope", false);
    broker.publish_raw("E/KeyboardEvent", frame("hi", "a2"), false);

    let (topic, payload) = next(&mut probe).await;
    assert_eq!(topic, "E/textInMorse");
    let first = decode_envelope(&payload)?;
    assert_eq!(first.payload, "... --- ...");
    assert_ne!(first.id.as_str(), "a1");
    let (_, payload) = next(&mut probe).await;
    assert_eq!(decode_envelope(&payload)?.payload, ".... ..");

    shutdown.send(()).ok();
    let stats = handle.await??;
    assert_eq!(stats.received, 4);
    assert_eq!(stats.accepted, 2);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.published, 2);
    assert_eq!(broker.retained("S/textInMorse"), Some(Bytes::from_static(b"Offline")));
    assert!(!broker.is_connected("textToMorse"));
    Ok(())
}

#[tokio::test]
async fn transformer_mirrors_producer_presence() -> Result<()> {
    let config = AppConfig::default();
    let broker = InMemoryBroker::new();
    let mut probe = probe(&broker, &["S/textInMorse"]).await;
    let (shutdown, handle) = spawn(&broker, StagePlan::transformer(&config), Encoder::new(true), None);
    expect_status(&mut probe, "S/textInMorse", "Online").await;

    broker.publish_raw("S/KeyboardEvent", "Offline", true);
    expect_status(&mut probe, "S/textInMorse", "Offline").await;
    // A repeated report is not a transition.
    broker.publish_raw("S/KeyboardEvent", "Offline", true);
    broker.publish_raw("S/KeyboardEvent", "Online", true);
    expect_status(&mut probe, "S/textInMorse", "Online").await;

    shutdown.send(()).ok();
    let stats = handle.await??;
    assert_eq!(stats.presence_changes, 2);
    Ok(())
}

#[tokio::test]
async fn reconnect_restates_status_and_resubscribes() -> Result<()> {
    let config = AppConfig::default();
    let broker = InMemoryBroker::new();
    let mut probe = probe(&broker, &["S/textInMorse", "E/textInMorse"]).await;
    let (shutdown, handle) = spawn(&broker, StagePlan::transformer(&config), Encoder::new(true), None);
    expect_status(&mut probe, "S/textInMorse", "Online").await;

    assert!(broker.sever("textToMorse"));
    expect_status(&mut probe, "S/textInMorse", "Offline").await;
    expect_status(&mut probe, "S/textInMorse", "Online").await;

    broker.publish_raw("E/KeyboardEvent", frame("e", "b1"), false);
    let (topic, payload) = next(&mut probe).await;
    assert_eq!(topic, "E/textInMorse");
    assert_eq!(decode_envelope(&payload)?.payload, ".");

    shutdown.send(()).ok();
    assert_eq!(handle.await??.connects, 2);
    Ok(())
}

#[tokio::test]
async fn producer_publishes_lines_until_quit() -> Result<()> {
    let config = AppConfig::default();
    let broker = InMemoryBroker::new();
    let mut probe = probe(&broker, &["S/KeyboardEvent", "E/KeyboardEvent"]).await;
    let (tx, rx) = mpsc::channel(8);
    let (_shutdown, handle) = spawn(&broker, StagePlan::producer(&config), Passthrough, Some(rx));
    expect_status(&mut probe, "S/KeyboardEvent", "Online").await;

    tx.send("hello world".into()).await?;
    tx.send("   ".into()).await?;
    tx.send("quit".into()).await?;

    let (topic, payload) = next(&mut probe).await;
    assert_eq!(topic, "E/KeyboardEvent");
    assert_eq!(decode_envelope(&payload)?.payload, "hello world");
    expect_status(&mut probe, "S/KeyboardEvent", "Offline").await;

    let stats = handle.await??;
    assert_eq!(stats.published, 1);
    Ok(())
}

struct Fragile;

impl Stage for Fragile {
    fn name(&self) -> &'static str {
        "fragile"
    }

    fn transform(&mut self, payload: &str) -> Result<Option<String>> {
        match payload {
            "panic" => panic!("transform blew up"),
            "error" => bail!("transform refused"),
            other => Ok(Some(other.to_uppercase())),
        }
    }
}

#[tokio::test]
async fn transform_failures_drop_only_the_offending_envelope() -> Result<()> {
    let config = AppConfig::default();
    let broker = InMemoryBroker::new();
    let mut probe = probe(&broker, &["S/textInMorse", "E/textInMorse"]).await;
    let (shutdown, handle) = spawn(&broker, StagePlan::transformer(&config), Fragile, None);
    expect_status(&mut probe, "S/textInMorse", "Online").await;

    broker.publish_raw("E/KeyboardEvent", frame("panic", "c1"), false);
    broker.publish_raw("E/KeyboardEvent", frame("error", "c2"), false);
    broker.publish_raw("E/KeyboardEvent", frame("ok", "c3"), false);
    let (_, payload) = next(&mut probe).await;
    assert_eq!(decode_envelope(&payload)?.payload, "OK");

    shutdown.send(()).ok();
    let stats = handle.await??;
    assert_eq!(stats.transform_failures, 2);
    assert_eq!(stats.published, 1);
    Ok(())
}

#[tokio::test]
async fn killed_session_ends_the_runner_with_last_will() -> Result<()> {
    let config = AppConfig::default();
    let broker = InMemoryBroker::new();
    let mut probe = probe(&broker, &["S/textInMorse"]).await;
    let (_shutdown, handle) = spawn(&broker, StagePlan::transformer(&config), Encoder::new(true), None);
    expect_status(&mut probe, "S/textInMorse", "Online").await;

    assert!(broker.kill("textToMorse"));
    expect_status(&mut probe, "S/textInMorse", "Offline").await;
    let stats = tokio::time::timeout(Duration::from_secs(1), handle).await???;
    assert_eq!(stats.connects, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn playback_outcomes_reach_metrics_on_an_idle_display() -> Result<()> {
    let config = AppConfig::default();
    let broker = InMemoryBroker::new();
    let registry = new_registry();
    let metrics = StageMetrics::new(&registry, "display")?;
    let indicator = Arc::new(RecordingIndicator::new());
    let player = SignalPlayer::new(indicator, PulseTiming::new(Duration::from_millis(100))?);
    let plan = StagePlan::consumer(&config);
    let session = broker.connect(plan.connect_options());
    let runner = StageRunner::new(plan, session, Renderer::new(player), WireFormat::Marker)
        .with_metrics(metrics);
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(runner.run(None, shutdown_rx));
    tokio::time::sleep(Duration::from_millis(10)).await;

    broker.publish_raw("E/textInMorse", frame(".", "d1"), false);
    // No broker traffic after the code; the playback ends on its own.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let body = render(&registry)?;
    assert!(body.contains("morse_playback_events_total{outcome=\"started\",stage=\"display\"} 1"));
    assert!(body.contains("morse_playback_events_total{outcome=\"completed\",stage=\"display\"} 1"));

    shutdown.send(()).ok();
    handle.await??;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn display_drops_codes_while_upstream_is_offline() -> Result<()> {
    let config = AppConfig::default();
    let broker = InMemoryBroker::new();
    let indicator = Arc::new(RecordingIndicator::new());
    let player = SignalPlayer::new(indicator.clone(), PulseTiming::new(Duration::from_millis(100))?);
    let plan = StagePlan::consumer(&config);
    let session = broker.connect(plan.connect_options());
    let runner = StageRunner::new(plan, session, Renderer::new(player), WireFormat::Marker);
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(runner.run(None, shutdown_rx));
    tokio::time::sleep(Duration::from_millis(10)).await;

    broker.publish_raw("S/textInMorse", "Offline", true);
    tokio::time::sleep(Duration::from_millis(10)).await;
    indicator.clear();
    broker.publish_raw("E/textInMorse", frame("..", "e1"), false);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(indicator.states().is_empty(), "code played while upstream offline");

    broker.publish_raw("S/textInMorse", "Online", true);
    broker.publish_raw("E/textInMorse", frame(".", "e2"), false);
    tokio::time::sleep(Duration::from_secs(1)).await;
    use morse_signal::IndicatorState::{Off, On};
    assert_eq!(indicator.states(), vec![Off, On, Off]);

    shutdown.send(()).ok();
    let stats = handle.await??;
    assert_eq!(stats.accepted, 2);
    Ok(())
}
