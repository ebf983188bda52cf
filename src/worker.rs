use crate::genie::PianoGenie;
use crate::notes;
use crate::types::*;
use crate::weights::ModelWeights;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::io;
use std::thread::{self, JoinHandle};

/// Owns one Piano Genie and answers inference requests on its own thread,
/// so loading weights and stepping the network never block the caller.
///
/// Protocol (see `WorkerCommand` / `WorkerReply`):
///   - `Init(source)` loads weights, initializes, resets state, then replies
///     `Ready` (or `InitFailed`).
///   - `Infer(request)` steps the model once, resolves the key into the
///     request's register and replies `Note` tagged with the request id.
///     Before `Ready` it replies `Failed`.
///   - `Reset` starts a new musical session.
///   - `Shutdown` (or the command channel closing) ends the thread.
pub struct GenieWorker {
    rx: Receiver<WorkerCommand>,
    tx: Sender<WorkerReply>,
    genie: PianoGenie,
    /// MIDI number of the model's key 0
    base_offset: i32,
}

/// Host-side ends of a running worker.
pub struct WorkerHandle {
    pub commands: Sender<WorkerCommand>,
    pub replies: Receiver<WorkerReply>,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask the worker to stop and wait for it.
    pub fn shutdown(self) {
        let _ = self.commands.send(WorkerCommand::Shutdown);
        if self.thread.join().is_err() {
            error!("Genie worker panicked");
        }
    }
}

/// Start a worker thread. `seed` fixes the sampler for reproducible sessions.
pub fn spawn(base_offset: i32, seed: Option<u64>) -> io::Result<WorkerHandle> {
    let (cmd_tx, cmd_rx) = unbounded::<WorkerCommand>();
    let (reply_tx, reply_rx) = unbounded::<WorkerReply>();
    let genie = match seed {
        Some(s) => PianoGenie::with_seed(s),
        None => PianoGenie::new(),
    };
    let thread = thread::Builder::new()
        .name("genie-worker".into())
        .spawn(move || {
            GenieWorker::new(cmd_rx, reply_tx, genie, base_offset).run();
        })?;
    Ok(WorkerHandle {
        commands: cmd_tx,
        replies: reply_rx,
        thread,
    })
}

impl GenieWorker {
    pub fn new(
        rx: Receiver<WorkerCommand>,
        tx: Sender<WorkerReply>,
        genie: PianoGenie,
        base_offset: i32,
    ) -> Self {
        Self {
            rx,
            tx,
            genie,
            base_offset,
        }
    }

    /// Run the worker loop. Blocks the calling thread.
    pub fn run(&mut self) {
        info!("Genie worker running (key 0 = MIDI {})", self.base_offset);
        let mut served: u64 = 0;

        let rx = self.rx.clone();
        for cmd in rx.iter() {
            let reply = match cmd {
                WorkerCommand::Init(source) => Some(self.init(source)),
                WorkerCommand::Infer(req) => {
                    served += 1;
                    Some(self.infer(&req))
                }
                WorkerCommand::Reset => {
                    self.genie.reset_state();
                    None
                }
                WorkerCommand::Shutdown => break,
            };
            if let Some(reply) = reply {
                if self.tx.send(reply).is_err() {
                    // Host went away
                    break;
                }
            }
        }

        info!("Genie worker shutting down after {} requests", served);
    }

    fn init(&mut self, source: WeightSource) -> WorkerReply {
        let weights = match &source {
            WeightSource::Manifest(path) => match ModelWeights::load_manifest(path) {
                Ok(w) => w,
                Err(e) => {
                    error!("Failed to load weights: {}", e);
                    return WorkerReply::InitFailed(e.to_string());
                }
            },
            WeightSource::Random { seed } => {
                warn!("Using random weights (seed {}); output will not be musical", seed);
                ModelWeights::random(*seed)
            }
        };
        if let Err(e) = self.genie.initialize(&weights) {
            error!("Genie initialization failed: {}", e);
            return WorkerReply::InitFailed(e.to_string());
        }
        self.genie.reset_state();
        info!("Genie is ready");
        WorkerReply::Ready
    }

    fn infer(&mut self, req: &InferenceRequest) -> WorkerReply {
        match self.genie.next(req.button, req.temperature) {
            Ok(raw) => {
                let note = notes::resolve(raw, self.base_offset, req.minimum_note);
                debug!(
                    "request {}: button {} → key {} → MIDI {} (floor {})",
                    req.request_id, req.button, raw, note, req.minimum_note
                );
                WorkerReply::Note {
                    request_id: req.request_id,
                    raw,
                    note,
                }
            }
            Err(e) => WorkerReply::Failed {
                request_id: req.request_id,
                error: e.to_string(),
            },
        }
    }
}
