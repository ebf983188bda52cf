use crate::config::PipelineConfig;
use crate::error::InstrumentError;
use crate::instrument::{Instrument, PlayOptions};
use crate::notes::midi_to_name;
use crate::session_log::{SessionSeed, StepLog};
use crate::types::*;
use crossbeam_channel::{never, select, Receiver, Sender};
use log::{debug, error, info, trace, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How often `run` wakes to expire stale requests when nothing arrives.
const EXPIRY_TICK: Duration = Duration::from_millis(100);

/// What happened to a trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// The model was not ready; nothing was requested, played or logged.
    Dropped,
    Issued {
        trigger: u64,
        requests: Vec<RequestId>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineStats {
    pub dropped: u64,
    pub requests: u64,
    pub played: u64,
    pub failed: u64,
    pub expired: u64,
    pub unknown_replies: u64,
    pub log_errors: u64,
}

/// A request waiting for its note.
#[derive(Debug, Clone)]
struct Pending {
    trigger: u64,
    bounce: u64,
    position: Vector3,
    voice: usize,
    issued_at: Instant,
}

/// Turns triggers into notes: one tagged request per voice goes to the
/// model worker, and each reply, whatever order it arrives in, is paired
/// with its request by id, played, and recorded at the trigger's position.
///
/// Triggers that arrive before the worker reports `Ready` are dropped.
/// Rapid triggers are never merged; each gets its own requests.
pub struct Pipeline<I: Instrument, L: StepLog> {
    worker_tx: Sender<WorkerCommand>,
    reply_rx: Receiver<WorkerReply>,
    instrument: I,
    log: L,
    cue_tx: Option<Sender<VisualCue>>,
    config: PipelineConfig,
    ready: bool,
    next_request_id: RequestId,
    triggers: u64,
    /// Accepted bounces, including those recorded by earlier sessions
    bounces: usize,
    pending: HashMap<RequestId, Pending>,
    last_record_time: u64,
    rng: StdRng,
    stats: PipelineStats,
}

impl<I: Instrument, L: StepLog> Pipeline<I, L> {
    pub fn new(
        worker_tx: Sender<WorkerCommand>,
        reply_rx: Receiver<WorkerReply>,
        instrument: I,
        log: L,
        config: PipelineConfig,
    ) -> Self {
        let bounces = SessionSeed::load(&log).bounces;
        let rng = match config.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            worker_tx,
            reply_rx,
            instrument,
            log,
            cue_tx: None,
            config,
            ready: false,
            next_request_id: 1,
            triggers: 0,
            bounces,
            pending: HashMap::new(),
            last_record_time: 0,
            rng,
            stats: PipelineStats::default(),
        }
    }

    /// Send a `VisualCue` for every accepted trigger.
    pub fn with_cues(mut self, cue_tx: Sender<VisualCue>) -> Self {
        self.cue_tx = Some(cue_tx);
        self
    }

    pub fn on_trigger(&mut self, event: &TriggerEvent) -> TriggerOutcome {
        if !self.ready {
            self.stats.dropped += 1;
            debug!("Trigger at {} dropped: model not ready", event.position);
            return TriggerOutcome::Dropped;
        }

        self.triggers += 1;
        self.bounces += 1;
        let trigger = self.triggers;
        let bounce = self.bounces as u64;
        let now = Instant::now();
        let mut requests = Vec::with_capacity(self.config.voices.len());

        for (voice, v) in self.config.voices.iter().enumerate() {
            let request_id = self.next_request_id;
            self.next_request_id += 1;
            let request = InferenceRequest {
                request_id,
                button: v.button,
                temperature: v.temperature,
                minimum_note: v.minimum_note,
            };
            if self.worker_tx.send(WorkerCommand::Infer(request)).is_err() {
                warn!("Genie worker is gone; trigger {} {} voice lost", trigger, v.name);
                continue;
            }
            self.pending.insert(
                request_id,
                Pending {
                    trigger,
                    bounce,
                    position: event.position,
                    voice,
                    issued_at: now,
                },
            );
            requests.push(request_id);
        }
        self.stats.requests += requests.len() as u64;
        debug!("Trigger {} at {} → requests {:?}", trigger, event.position, requests);

        self.emit_cue(trigger);
        TriggerOutcome::Issued { trigger, requests }
    }

    fn emit_cue(&mut self, trigger: u64) {
        let Some(tx) = &self.cue_tx else { return };
        let Some(color) = self.config.palette.choose(&mut self.rng) else {
            return;
        };
        let cue = VisualCue {
            trigger,
            color: color.clone(),
            intensity: self.config.cue_intensity,
        };
        if tx.send(cue).is_err() {
            trace!("Cue receiver gone");
        }
    }

    /// Apply one worker reply. Returns the record appended for a played note.
    pub fn handle_reply(&mut self, reply: WorkerReply) -> Option<StepRecord> {
        match reply {
            WorkerReply::Ready => {
                info!("Genie ready; accepting triggers");
                self.ready = true;
                None
            }
            WorkerReply::InitFailed(e) => {
                error!("Genie failed to initialize: {}", e);
                self.ready = false;
                None
            }
            WorkerReply::Failed { request_id, error } => {
                if self.pending.remove(&request_id).is_some() {
                    self.stats.failed += 1;
                    warn!("Request {} failed: {}", request_id, error);
                } else {
                    self.stats.unknown_replies += 1;
                    debug!("Failure for unknown request {}: {}", request_id, error);
                }
                None
            }
            WorkerReply::Note {
                request_id,
                raw,
                note,
            } => {
                let Some(p) = self.pending.remove(&request_id) else {
                    self.stats.unknown_replies += 1;
                    warn!("Note for unknown or expired request {} ignored", request_id);
                    return None;
                };
                Some(self.play(p, raw, note))
            }
        }
    }

    fn play(&mut self, p: Pending, raw: i32, note: i32) -> StepRecord {
        let voice = &self.config.voices[p.voice];
        let name = midi_to_name(note);
        debug!(
            "Trigger {} {} voice: key {} → {} ({:.0} ms)",
            p.trigger,
            voice.name,
            raw,
            name,
            p.issued_at.elapsed().as_secs_f64() * 1000.0
        );
        self.instrument.play(
            &name,
            None,
            PlayOptions {
                gain: voice.gain,
                duration: None,
            },
        );
        self.stats.played += 1;

        // Clamp so records stay ordered if the wall clock steps back
        let time = wall_clock_ms().max(self.last_record_time);
        self.last_record_time = time;
        let record = StepRecord {
            position: p.position,
            note,
            time,
            bounce: p.bounce,
        };
        if let Err(e) = self.log.append(&record) {
            self.stats.log_errors += 1;
            warn!("Step not recorded: {}", e);
        }
        record
    }

    /// Drop requests older than the inference timeout. Returns how many.
    pub fn expire_pending(&mut self, now: Instant) -> usize {
        let timeout = self.config.inference_timeout();
        let before = self.pending.len();
        self.pending.retain(|id, p| {
            let stale = now.saturating_duration_since(p.issued_at) >= timeout;
            if stale {
                warn!("Request {} (trigger {}) timed out", id, p.trigger);
            }
            !stale
        });
        let expired = before - self.pending.len();
        self.stats.expired += expired as u64;
        expired
    }

    /// Block until the worker reports `Ready`, applying any other replies
    /// that arrive first.
    pub fn wait_until_ready(&mut self, timeout: Duration) -> Result<(), String> {
        let deadline = Instant::now() + timeout;
        while !self.ready {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.reply_rx.recv_timeout(left) {
                Ok(WorkerReply::InitFailed(e)) => return Err(format!("model init failed: {}", e)),
                Ok(reply) => {
                    self.handle_reply(reply);
                }
                Err(e) => return Err(format!("waiting for model: {}", e)),
            }
        }
        Ok(())
    }

    /// Run the event loop. Blocks until the trigger channel closes and every
    /// outstanding request has been answered or has expired.
    pub fn run(&mut self, trigger_rx: Receiver<TriggerEvent>) {
        info!(
            "Pipeline running: {} voices, {} prior bounces",
            self.config.voices.len(),
            self.bounces
        );
        let idle_triggers = never::<TriggerEvent>();
        let idle_replies = never::<WorkerReply>();
        let replies = self.reply_rx.clone();
        let mut triggers_open = true;
        let mut worker_alive = true;

        while triggers_open || !self.pending.is_empty() {
            let trig = if triggers_open { &trigger_rx } else { &idle_triggers };
            let rep = if worker_alive { &replies } else { &idle_replies };
            select! {
                recv(trig) -> msg => match msg {
                    Ok(event) => {
                        self.on_trigger(&event);
                    }
                    Err(_) => {
                        debug!("Trigger source closed; {} requests outstanding", self.pending.len());
                        triggers_open = false;
                    }
                },
                recv(rep) -> msg => match msg {
                    Ok(reply) => {
                        self.handle_reply(reply);
                    }
                    Err(_) => {
                        error!("Genie worker disconnected");
                        worker_alive = false;
                        self.ready = false;
                    }
                },
                default(EXPIRY_TICK) => {}
            }
            self.expire_pending(Instant::now());
        }

        info!(
            "Pipeline done: {} triggers, {} notes played, {} dropped, {} expired",
            self.triggers, self.stats.played, self.stats.dropped, self.stats.expired
        );
    }

    pub fn finish(&mut self) -> Result<(), InstrumentError> {
        self.instrument.finish()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Bounces accepted, counting those already in the log at startup.
    /// Each bounce may record one step per voice.
    pub fn bounces(&self) -> usize {
        self.bounces
    }

    pub fn triggers(&self) -> u64 {
        self.triggers
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn instrument(&self) -> &I {
        &self.instrument
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn into_parts(self) -> (I, L) {
        (self.instrument, self.log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LogError;
    use crate::instrument::RecordingInstrument;
    use crate::session_log::MemoryStepLog;
    use crossbeam_channel::unbounded;

    type TestPipeline<L> = Pipeline<RecordingInstrument, L>;

    struct Harness<L: StepLog> {
        pipeline: TestPipeline<L>,
        instrument: RecordingInstrument,
        worker_rx: Receiver<WorkerCommand>,
        cue_rx: Receiver<VisualCue>,
    }

    fn harness_with<L: StepLog>(log: L, config: PipelineConfig) -> Harness<L> {
        let (worker_tx, worker_rx) = unbounded();
        let (_reply_tx, reply_rx) = unbounded();
        let (cue_tx, cue_rx) = unbounded();
        let instrument = RecordingInstrument::new();
        let pipeline =
            Pipeline::new(worker_tx, reply_rx, instrument.clone(), log, config).with_cues(cue_tx);
        Harness {
            pipeline,
            instrument,
            worker_rx,
            cue_rx,
        }
    }

    fn harness() -> Harness<MemoryStepLog> {
        let config = PipelineConfig {
            seed: Some(3),
            ..PipelineConfig::default()
        };
        harness_with(MemoryStepLog::new(), config)
    }

    fn trigger(y: f32) -> TriggerEvent {
        TriggerEvent {
            position: Vector3::new(0.0, y, 0.0),
        }
    }

    fn issued(outcome: TriggerOutcome) -> Vec<RequestId> {
        match outcome {
            TriggerOutcome::Issued { requests, .. } => requests,
            TriggerOutcome::Dropped => panic!("trigger was dropped"),
        }
    }

    fn note(request_id: RequestId, note: i32) -> WorkerReply {
        WorkerReply::Note {
            request_id,
            raw: note - 21,
            note,
        }
    }

    #[test]
    fn test_trigger_before_ready_is_dropped() {
        let mut h = harness();
        assert_eq!(h.pipeline.on_trigger(&trigger(30.0)), TriggerOutcome::Dropped);
        assert!(h.worker_rx.try_recv().is_err(), "no request should be sent");
        assert!(h.cue_rx.try_recv().is_err(), "no cue for a dropped trigger");
        assert!(h.instrument.played().is_empty());
        assert_eq!(h.pipeline.log().count().unwrap(), 0);
        assert_eq!(h.pipeline.stats().dropped, 1);
    }

    #[test]
    fn test_requests_per_voice() {
        let mut h = harness();
        h.pipeline.handle_reply(WorkerReply::Ready);
        let ids = issued(h.pipeline.on_trigger(&trigger(30.0)));
        assert_eq!(ids, vec![1, 2]);

        let sent: Vec<InferenceRequest> = h
            .worker_rx
            .try_iter()
            .map(|c| match c {
                WorkerCommand::Infer(r) => r,
                other => panic!("unexpected command {:?}", other),
            })
            .collect();
        assert_eq!(sent.len(), 2);
        assert_eq!((sent[0].button, sent[0].minimum_note), (1, 21));
        assert_eq!((sent[1].button, sent[1].minimum_note), (6, 81));
        assert!(sent.iter().all(|r| r.temperature == 0.25));

        let cue = h.cue_rx.try_recv().unwrap();
        assert_eq!(cue.trigger, 1);
        assert!(h.pipeline.config.palette.contains(&cue.color));
        assert_eq!(h.pipeline.pending(), 2);
    }

    #[test]
    fn test_rapid_triggers_replies_out_of_order() {
        let mut h = harness();
        h.pipeline.handle_reply(WorkerReply::Ready);
        let first = issued(h.pipeline.on_trigger(&trigger(30.0)));
        let second = issued(h.pipeline.on_trigger(&trigger(18.0)));
        assert_eq!(first.len() + second.len(), 4);
        assert!(first.iter().all(|id| !second.contains(id)));

        h.pipeline.handle_reply(note(second[1], 93));
        h.pipeline.handle_reply(note(first[0], 45));
        h.pipeline.handle_reply(note(second[0], 40));
        h.pipeline.handle_reply(note(first[1], 86));

        let played: Vec<String> = h.instrument.played().into_iter().map(|p| p.note).collect();
        assert_eq!(played, vec!["A6", "A2", "E2", "D6"]);

        let records = h.pipeline.log().all().unwrap();
        let at = |n: i32| records.iter().find(|r| r.note == n).unwrap().position.y;
        assert_eq!(at(45), 30.0);
        assert_eq!(at(86), 30.0);
        assert_eq!(at(40), 18.0);
        assert_eq!(at(93), 18.0);
        let bounce = |n: i32| records.iter().find(|r| r.note == n).unwrap().bounce;
        assert_eq!((bounce(45), bounce(86)), (1, 1));
        assert_eq!((bounce(40), bounce(93)), (2, 2));
        assert!(records.windows(2).all(|w| w[0].time <= w[1].time));
        assert_eq!(h.pipeline.pending(), 0);
        // One bounce per trigger, not per voice
        assert_eq!(h.pipeline.bounces(), 2);
        assert_eq!(h.cue_rx.try_iter().count(), 2);
    }

    #[test]
    fn test_unknown_and_failed_replies() {
        let mut h = harness();
        h.pipeline.handle_reply(WorkerReply::Ready);
        let ids = issued(h.pipeline.on_trigger(&trigger(30.0)));

        assert!(h.pipeline.handle_reply(note(999, 60)).is_none());
        h.pipeline.handle_reply(WorkerReply::Failed {
            request_id: ids[0],
            error: "boom".into(),
        });
        // A late reply for the failed request is ignored
        assert!(h.pipeline.handle_reply(note(ids[0], 60)).is_none());
        assert!(h.pipeline.handle_reply(note(ids[1], 81)).is_some());

        let stats = h.pipeline.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.unknown_replies, 2);
        assert_eq!(stats.played, 1);
        assert_eq!(h.instrument.played().len(), 1);
    }

    #[test]
    fn test_expire_pending() {
        let mut h = harness();
        h.pipeline.handle_reply(WorkerReply::Ready);
        let ids = issued(h.pipeline.on_trigger(&trigger(30.0)));

        assert_eq!(h.pipeline.expire_pending(Instant::now()), 0);
        let later = Instant::now() + Duration::from_secs(3);
        assert_eq!(h.pipeline.expire_pending(later), 2);
        assert_eq!(h.pipeline.pending(), 0);
        assert!(h.pipeline.handle_reply(note(ids[0], 60)).is_none());
        assert_eq!(h.pipeline.stats().expired, 2);
    }

    struct BrokenLog;

    impl StepLog for BrokenLog {
        fn append(&mut self, _record: &StepRecord) -> Result<(), LogError> {
            Err(LogError::StorageUnavailable {
                path: "/dev/null/steps.jsonl".into(),
                source: std::io::Error::other("disk gone"),
            })
        }

        fn all(&self) -> Result<Vec<StepRecord>, LogError> {
            Ok(Vec::new())
        }

        fn count(&self) -> Result<usize, LogError> {
            Ok(0)
        }
    }

    #[test]
    fn test_log_failure_still_plays() {
        let mut h = harness_with(BrokenLog, PipelineConfig::default());
        h.pipeline.handle_reply(WorkerReply::Ready);
        let ids = issued(h.pipeline.on_trigger(&trigger(30.0)));
        for (i, id) in ids.iter().enumerate() {
            h.pipeline.handle_reply(note(*id, 60 + i as i32));
        }
        assert_eq!(h.instrument.played().len(), 2);
        assert_eq!(h.pipeline.stats().log_errors, 2);
        assert_eq!(h.pipeline.bounces(), 1);
    }

    #[test]
    fn test_bounces_seeded_from_log() {
        // Three earlier bounces, two voices each
        let mut log = MemoryStepLog::new();
        for t in 0..6 {
            log.append(&StepRecord {
                position: Vector3::default(),
                note: 81,
                time: t,
                bounce: t / 2 + 1,
            })
            .unwrap();
        }
        let mut h = harness_with(log, PipelineConfig::default());
        assert_eq!(h.pipeline.bounces(), 3);

        h.pipeline.handle_reply(WorkerReply::Ready);
        let ids = issued(h.pipeline.on_trigger(&trigger(30.0)));
        let record = h.pipeline.handle_reply(note(ids[0], 60)).unwrap();
        assert_eq!(record.bounce, 4);
        assert_eq!(h.pipeline.bounces(), 4);
    }

    #[test]
    fn test_init_failure_while_waiting() {
        let (worker_tx, _worker_rx) = unbounded();
        let (reply_tx, reply_rx) = unbounded();
        let mut pipeline = Pipeline::new(
            worker_tx,
            reply_rx,
            RecordingInstrument::new(),
            MemoryStepLog::new(),
            PipelineConfig::default(),
        );
        reply_tx.send(WorkerReply::InitFailed("no weights".into())).unwrap();
        let err = pipeline.wait_until_ready(Duration::from_secs(1)).unwrap_err();
        assert!(err.contains("no weights"));

        reply_tx.send(WorkerReply::Ready).unwrap();
        pipeline.wait_until_ready(Duration::from_secs(1)).unwrap();
        assert!(pipeline.is_ready());
    }

    #[test]
    fn test_run_drains_until_answered() {
        let (worker_tx, worker_rx) = unbounded();
        let (reply_tx, reply_rx) = unbounded();
        let (trigger_tx, trigger_rx) = unbounded();
        let instrument = RecordingInstrument::new();
        let mut pipeline = Pipeline::new(
            worker_tx,
            reply_rx,
            instrument.clone(),
            MemoryStepLog::new(),
            PipelineConfig::default(),
        );

        // Fake worker: answers every request with the floor note
        let worker = std::thread::spawn(move || {
            reply_tx.send(WorkerReply::Ready).unwrap();
            for cmd in worker_rx.iter() {
                if let WorkerCommand::Infer(r) = cmd {
                    let _ = reply_tx.send(WorkerReply::Note {
                        request_id: r.request_id,
                        raw: 0,
                        note: r.minimum_note,
                    });
                }
            }
        });

        pipeline.wait_until_ready(Duration::from_secs(5)).unwrap();
        for y in [30.0, 20.0, 10.0] {
            trigger_tx.send(trigger(y)).unwrap();
        }
        drop(trigger_tx);
        pipeline.run(trigger_rx);

        assert_eq!(pipeline.triggers(), 3);
        assert_eq!(instrument.played().len(), 6);
        assert_eq!(pipeline.log().count().unwrap(), 6);
        drop(pipeline);
        worker.join().unwrap();
    }
}
