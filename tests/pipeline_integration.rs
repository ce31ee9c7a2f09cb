//! ---
//! morse_section: "15-testing-qa-runbook"
//! morse_subsection: "integration-tests"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "End-to-end relay scenarios over the in-process broker."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use morse_common::config::WireFormat;
use morse_common::AppConfig;
use morse_msg::{
    decode_envelope, encode_envelope, ConnectOptions, Envelope, InMemoryBroker, InMemorySession,
    Transport, TransportEvent,
};
use morse_signal::{IndicatorState, PulseTiming, RecordingIndicator, SignalPlayer};
use morse_stage::{
    Encoder, Passthrough, Renderer, Stage, StagePlan, StageRunner, StageStats,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

const UNIT: Duration = Duration::from_millis(100);
const SETTLE: Duration = Duration::from_millis(10);

struct Running {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<Result<StageStats>>,
}

impl Running {
    async fn stop(self) -> StageStats {
        let _ = self.shutdown.send(());
        self.handle
            .await
            .expect("stage task joins")
            .expect("stage exits cleanly")
    }
}

fn start<S: Stage + 'static>(
    broker: &InMemoryBroker,
    plan: StagePlan,
    stage: S,
    input: Option<mpsc::Receiver<String>>,
) -> Running {
    let session = broker.connect(plan.connect_options());
    let runner = StageRunner::new(plan, session, stage, WireFormat::Marker);
    let (shutdown, rx) = broadcast::channel(1);
    Running {
        shutdown,
        handle: tokio::spawn(runner.run(input, rx)),
    }
}

struct Relay {
    broker: InMemoryBroker,
    config: AppConfig,
    indicator: Arc<RecordingIndicator>,
}

impl Relay {
    fn new(config: AppConfig) -> Self {
        Self {
            broker: InMemoryBroker::new(),
            config,
            indicator: Arc::new(RecordingIndicator::new()),
        }
    }

    fn producer(&self) -> (mpsc::Sender<String>, Running) {
        let (tx, rx) = mpsc::channel(8);
        let running = start(
            &self.broker,
            StagePlan::producer(&self.config),
            Passthrough,
            Some(rx),
        );
        (tx, running)
    }

    fn transformer(&self) -> Running {
        start(
            &self.broker,
            StagePlan::transformer(&self.config),
            Encoder::new(self.config.transformer.mirror_upstream_offline),
            None,
        )
    }

    fn display(&self) -> Running {
        let player = SignalPlayer::new(
            self.indicator.clone(),
            PulseTiming::new(UNIT).expect("unit"),
        );
        start(
            &self.broker,
            StagePlan::consumer(&self.config),
            Renderer::new(player),
            None,
        )
    }

    async fn probe(&self, topics: &[&str]) -> InMemorySession {
        let mut session = self.broker.connect(ConnectOptions {
            client_id: "probe".into(),
            last_will: None,
        });
        for topic in topics {
            session.subscribe(topic).await.expect("probe subscribe");
        }
        session
    }
}

/// Deliveries queued on the probe right now, without waiting.
async fn drain(session: &mut InMemorySession) -> Vec<(String, Bytes)> {
    let mut deliveries = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(SETTLE, session.poll()).await {
        if let TransportEvent::Delivery(delivery) = event {
            deliveries.push((delivery.topic, delivery.payload));
        }
    }
    deliveries
}

#[tokio::test(start_paused = true)]
async fn typed_text_is_keyed_with_unit_timing() -> Result<()> {
    let relay = Relay::new(AppConfig::default());
    let transformer = relay.transformer();
    let display = relay.display();
    let (keyboard, producer) = relay.producer();
    sleep(SETTLE).await;

    keyboard.send("SOS".into()).await?;
    sleep(Duration::from_secs(5)).await;

    let events = relay.indicator.events();
    let first_on = events
        .iter()
        .position(|(_, state)| *state == IndicatorState::On)
        .expect("playback started");
    let origin = events[first_on].0;
    let timeline: Vec<(u64, IndicatorState)> = events[first_on..]
        .iter()
        .map(|(at, state)| ((*at - origin).as_millis() as u64, *state))
        .collect();

    let on_durations: Vec<u64> = timeline
        .windows(2)
        .filter(|pair| pair[0].1 == IndicatorState::On)
        .map(|pair| pair[1].0 - pair[0].0)
        .collect();
    assert_eq!(on_durations, vec![100, 100, 100, 300, 300, 300, 100, 100, 100]);
    assert_eq!(timeline.last(), Some(&(2700, IndicatorState::Off)));

    keyboard.send("quit".into()).await?;
    let producer_stats = producer.handle.await??;
    assert_eq!(producer_stats.published, 1);
    assert_eq!(transformer.stop().await.published, 1);
    assert_eq!(display.stop().await.accepted, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn producer_loss_reaches_the_display_through_the_transformer() -> Result<()> {
    let mut config = AppConfig::default();
    config.display.watch_source_status = false;
    let relay = Relay::new(config);
    let transformer = relay.transformer();
    let display = relay.display();
    let (_keyboard, producer) = relay.producer();
    sleep(SETTLE).await;
    assert_eq!(relay.indicator.last(), Some(IndicatorState::Off));

    assert!(relay.broker.kill("KeyboardEntry"));
    sleep(SETTLE).await;
    assert_eq!(
        relay.broker.retained("S/textInMorse"),
        Some(Bytes::from_static(b"Offline"))
    );
    assert_eq!(relay.indicator.last(), Some(IndicatorState::UpstreamDown));
    producer.handle.await??;

    let (_keyboard, producer) = relay.producer();
    sleep(SETTLE).await;
    assert_eq!(
        relay.broker.retained("S/textInMorse"),
        Some(Bytes::from_static(b"Online"))
    );
    assert_eq!(relay.indicator.last(), Some(IndicatorState::Off));

    producer.stop().await;
    transformer.stop().await;
    display.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn redelivered_text_is_encoded_once() -> Result<()> {
    let relay = Relay::new(AppConfig::default());
    let transformer = relay.transformer();
    sleep(SETTLE).await;
    let mut probe = relay.probe(&["E/textInMorse"]).await;

    let frame = encode_envelope(&Envelope::with_id("HI", "c7"), WireFormat::Marker)?;
    relay.broker.publish_raw("E/KeyboardEvent", frame.clone(), false);
    relay.broker.publish_raw("E/KeyboardEvent", frame, false);

    let published = drain(&mut probe).await;
    assert_eq!(published.len(), 1);
    let envelope = decode_envelope(&published[0].1)?;
    assert_eq!(envelope.payload, ".... ..");

    let stats = transformer.stop().await;
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.published, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn transformer_crash_interrupts_playback() -> Result<()> {
    let relay = Relay::new(AppConfig::default());
    let transformer = relay.transformer();
    let display = relay.display();
    let (keyboard, producer) = relay.producer();
    sleep(SETTLE).await;

    keyboard.send("SOS".into()).await?;
    sleep(Duration::from_millis(500)).await;
    assert!(relay.broker.kill("textToMorse"));
    sleep(SETTLE).await;
    assert_eq!(relay.indicator.last(), Some(IndicatorState::UpstreamDown));
    transformer.handle.await??;

    let crash_time = Instant::now();
    sleep(Duration::from_secs(5)).await;
    assert!(
        relay
            .indicator
            .events()
            .iter()
            .all(|(at, _)| *at < crash_time),
        "stale playback wrote after the upstream went down"
    );

    let transformer = relay.transformer();
    sleep(SETTLE).await;
    assert_eq!(relay.indicator.last(), Some(IndicatorState::Off));

    keyboard.send("E".into()).await?;
    sleep(Duration::from_secs(1)).await;
    let states = relay.indicator.states();
    assert_eq!(
        &states[states.len() - 2..],
        &[IndicatorState::On, IndicatorState::Off]
    );

    producer.stop().await;
    transformer.stop().await;
    display.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn newer_text_preempts_current_playback() -> Result<()> {
    let relay = Relay::new(AppConfig::default());
    let transformer = relay.transformer();
    let display = relay.display();
    let (keyboard, producer) = relay.producer();
    sleep(SETTLE).await;

    keyboard.send("O".into()).await?;
    sleep(Duration::from_millis(150)).await;
    relay.indicator.clear();
    keyboard.send("E".into()).await?;
    sleep(Duration::from_secs(2)).await;

    assert_eq!(
        relay.indicator.states(),
        vec![IndicatorState::Off, IndicatorState::On, IndicatorState::Off]
    );

    producer.stop().await;
    transformer.stop().await;
    display.stop().await;
    Ok(())
}
