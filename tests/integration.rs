//! End-to-end tests for the genie-fall engine.
//!
//! These exercise the full threaded flow:
//!   Simulator → TriggerEvent channel → Pipeline ⇄ genie worker → Instrument + StepLog
//!
//! The worker runs a real PianoGenie on seeded random weights, so notes are
//! unmusical but every step of the protocol is the production one.

use crossbeam_channel::{bounded, unbounded};
use std::thread;
use std::time::Duration;

use genie_fall::config::{Config, PipelineConfig, SimulatorConfig};
use genie_fall::instrument::{RecordingInstrument, SampleInstrument};
use genie_fall::notes::{name_to_midi, LOWEST_INSTRUMENT_MIDI_NUMBER, LOWEST_PIANO_MIDI_NUMBER};
use genie_fall::pipeline::{Pipeline, TriggerOutcome};
use genie_fall::session_log::{JsonlStepLog, MemoryStepLog, SessionSeed, StepLog, DEFAULT_SEED_POSITION};
use genie_fall::simulator::Simulator;
use genie_fall::types::*;
use genie_fall::weights::ModelWeights;
use genie_fall::worker::{self, WorkerHandle};

// ─── Helpers ───────────────────────────────────────────────────────────────

const WAIT: Duration = Duration::from_secs(10);

fn ready_worker(source: WeightSource) -> WorkerHandle {
    let w = worker::spawn(LOWEST_PIANO_MIDI_NUMBER, Some(42)).unwrap();
    w.commands.send(WorkerCommand::Init(source)).unwrap();
    w
}

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        seed: Some(9),
        ..PipelineConfig::default()
    }
}

fn sim_config(bounces: usize) -> SimulatorConfig {
    SimulatorConfig {
        bounces,
        interval_ms: 5,
        seed: Some(4),
        ..SimulatorConfig::default()
    }
}

/// Run one simulated session to completion and hand back the log.
fn run_session<L: StepLog + 'static>(
    log: L,
    bounces: usize,
) -> (RecordingInstrument, L, Vec<VisualCue>) {
    let genie = ready_worker(WeightSource::Random { seed: 1 });
    let instrument = RecordingInstrument::new();
    let (cue_tx, cue_rx) = unbounded();
    let seed = SessionSeed::load(&log);

    let mut pipeline = Pipeline::new(
        genie.commands.clone(),
        genie.replies.clone(),
        instrument.clone(),
        log,
        pipeline_config(),
    )
    .with_cues(cue_tx);
    pipeline.wait_until_ready(WAIT).unwrap();

    let (trigger_tx, trigger_rx) = bounded(16);
    let mut sim = Simulator::new(sim_config(bounces), seed.position);
    let sim_thread = thread::spawn(move || sim.run(&trigger_tx));

    pipeline.run(trigger_rx);
    assert_eq!(sim_thread.join().unwrap(), bounces);
    assert_eq!(pipeline.pending(), 0);

    let (_, log) = pipeline.into_parts();
    genie.shutdown();
    (instrument, log, cue_rx.try_iter().collect())
}

// ─── Scenarios ─────────────────────────────────────────────────────────────

#[test]
fn test_session_plays_two_voices_per_bounce() {
    let (instrument, log, cues) = run_session(MemoryStepLog::new(), 6);

    let played = instrument.played();
    assert_eq!(played.len(), 12);
    assert_eq!(log.count().unwrap(), 12);
    assert_eq!(cues.len(), 6);

    for p in &played {
        let midi = name_to_midi(&p.note).unwrap();
        assert!(midi >= LOWEST_PIANO_MIDI_NUMBER, "{} below the piano", p.note);
    }
    let high = played
        .iter()
        .filter(|p| name_to_midi(&p.note).unwrap() >= LOWEST_INSTRUMENT_MIDI_NUMBER)
        .count();
    assert!(high >= 6, "every bounce has a high voice note");

    let records = log.all().unwrap();
    assert!(records.windows(2).all(|w| w[0].time <= w[1].time));
    // Positions come from the bounce that asked for them
    let mut ys: Vec<f32> = records.iter().map(|r| r.position.y).collect();
    ys.dedup();
    assert_eq!(ys.len(), 6);
    assert!(ys.windows(2).all(|w| w[1] < w[0]), "the star only falls");
}

#[test]
fn test_rapid_triggers_each_get_notes() {
    let genie = ready_worker(WeightSource::Random { seed: 2 });
    let instrument = RecordingInstrument::new();
    let mut pipeline = Pipeline::new(
        genie.commands.clone(),
        genie.replies.clone(),
        instrument.clone(),
        MemoryStepLog::new(),
        pipeline_config(),
    );
    pipeline.wait_until_ready(WAIT).unwrap();

    let (trigger_tx, trigger_rx) = unbounded();
    let a = Vector3::new(0.0, 30.0, 0.0);
    let b = Vector3::new(0.5, 29.0, 0.0);
    trigger_tx.send(TriggerEvent { position: a }).unwrap();
    trigger_tx.send(TriggerEvent { position: b }).unwrap();
    drop(trigger_tx);
    pipeline.run(trigger_rx);

    assert_eq!(pipeline.triggers(), 2);
    assert_eq!(instrument.played().len(), 4);
    let records = pipeline.log().all().unwrap();
    assert_eq!(records.iter().filter(|r| r.position == a).count(), 2);
    assert_eq!(records.iter().filter(|r| r.position == b).count(), 2);
    genie.shutdown();
}

#[test]
fn test_triggers_before_ready_are_dropped() {
    // Never initialized: the worker never reports ready
    let genie = worker::spawn(LOWEST_PIANO_MIDI_NUMBER, Some(1)).unwrap();
    let instrument = RecordingInstrument::new();
    let mut pipeline = Pipeline::new(
        genie.commands.clone(),
        genie.replies.clone(),
        instrument.clone(),
        MemoryStepLog::new(),
        pipeline_config(),
    );
    let outcome = pipeline.on_trigger(&TriggerEvent {
        position: DEFAULT_SEED_POSITION,
    });
    assert_eq!(outcome, TriggerOutcome::Dropped);
    assert!(instrument.played().is_empty());
    assert_eq!(pipeline.log().count().unwrap(), 0);
    genie.shutdown();
}

#[test]
fn test_next_session_resumes_from_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("steps.jsonl");

    // Empty history seeds the default position
    let fresh = JsonlStepLog::open(&path).unwrap();
    assert_eq!(SessionSeed::load(&fresh).position, DEFAULT_SEED_POSITION);

    let (_, log, _) = run_session(fresh, 3);
    let last = *log.all().unwrap().last().unwrap();
    drop(log);

    let reopened = JsonlStepLog::open(&path).unwrap();
    let seed = SessionSeed::load(&reopened);
    // Three bounces, two voices each
    assert_eq!(seed.bounces, 3);
    assert_eq!(seed.position, last.position);
    assert_eq!(seed.markers.len(), 6);

    let (_, log, _) = run_session(reopened, 2);
    let records = log.all().unwrap();
    assert_eq!(records.len(), 10);
    assert!(records[6].position.y < last.position.y, "fall continues below the last bounce");
    assert_eq!(records[6].bounce, 4, "bounce numbering continues across sessions");
    assert_eq!(SessionSeed::load(&log).bounces, 5);
}

#[test]
fn test_worker_loads_saved_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = ModelWeights::random(3).save_manifest(dir.path(), "genie").unwrap();

    let genie = ready_worker(WeightSource::Manifest(manifest));
    assert_eq!(genie.replies.recv_timeout(WAIT).unwrap(), WorkerReply::Ready);
    genie
        .commands
        .send(WorkerCommand::Infer(InferenceRequest {
            request_id: 77,
            button: 6,
            temperature: 0.25,
            minimum_note: LOWEST_INSTRUMENT_MIDI_NUMBER,
        }))
        .unwrap();
    match genie.replies.recv_timeout(WAIT).unwrap() {
        WorkerReply::Note { request_id, note, .. } => {
            assert_eq!(request_id, 77);
            assert!(note >= LOWEST_INSTRUMENT_MIDI_NUMBER);
        }
        other => panic!("unexpected reply {:?}", other),
    }
    genie.shutdown();
}

#[test]
fn test_offline_render_of_a_session() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("session.wav");
    let genie = ready_worker(WeightSource::Random { seed: 5 });
    let mut pipeline = Pipeline::new(
        genie.commands.clone(),
        genie.replies.clone(),
        SampleInstrument::bell(8000, LOWEST_INSTRUMENT_MIDI_NUMBER, &out),
        MemoryStepLog::new(),
        pipeline_config(),
    );
    pipeline.wait_until_ready(WAIT).unwrap();

    let (trigger_tx, trigger_rx) = bounded(8);
    let mut sim = Simulator::new(sim_config(3), DEFAULT_SEED_POSITION);
    let sim_thread = thread::spawn(move || sim.run(&trigger_tx));
    pipeline.run(trigger_rx);
    sim_thread.join().unwrap();

    pipeline.finish().unwrap();
    assert!(!pipeline.instrument().rendered().is_empty());
    let reader = hound::WavReader::open(&out).unwrap();
    assert_eq!(reader.spec().sample_rate, 8000);
    assert!(reader.len() > 0);
    genie.shutdown();
}

#[test]
fn test_default_config_roundtrip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    Config::default().save(&path).unwrap();
    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded, Config::default());
}
