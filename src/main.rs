use genie_fall::config::Config;
use genie_fall::instrument::{Instrument, InstrumentRack, RecordingInstrument, SampleInstrument};
use genie_fall::notes::name_to_midi;
use genie_fall::osc_sender::{CueSender, OscInstrument};
use genie_fall::pipeline::Pipeline;
use genie_fall::session_log::{JsonlStepLog, MemoryStepLog, SessionSeed, StepLog};
use genie_fall::simulator::Simulator;
use genie_fall::types::*;
use genie_fall::worker;

use clap::Parser;
use crossbeam_channel::{bounded, unbounded};
use log::{debug, error, info, warn};
use std::error::Error;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Sample rate of the built-in bell when no sample file is given.
const BELL_SAMPLE_RATE: u32 = 44_100;

#[derive(Parser)]
#[command(name = "genie-fall")]
#[command(about = "Generative note engine for a falling star: bounces in, notes out")]
struct Cli {
    /// Engine config (JSON). Missing fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective config to this path and exit
    #[arg(long)]
    dump_config: Option<PathBuf>,

    /// Weights manifest (tfjs-style JSON next to its .bin shards).
    /// Without it the model runs on seeded random weights.
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Seed for the sampler, palette and simulator (reproducible sessions)
    #[arg(long)]
    seed: Option<u64>,

    /// Step log file
    #[arg(long, default_value = "./sessions/steps.jsonl")]
    log_file: PathBuf,

    /// Keep the step log in memory only
    #[arg(long)]
    no_log: bool,

    /// Play notes over OSC and forward visual cues
    #[arg(long)]
    osc: bool,

    /// OSC target address
    #[arg(long, default_value = "127.0.0.1:9000")]
    osc_target: String,

    /// Render the session offline to this WAV file
    #[arg(long)]
    render: Option<PathBuf>,

    /// WAV sample for the renderer (defaults to a synthetic bell)
    #[arg(long)]
    sample: Option<PathBuf>,

    /// Note the sample was recorded at
    #[arg(long, default_value = "A5")]
    sample_root: String,

    /// Number of simulated bounces (overrides config)
    #[arg(long)]
    bounces: Option<usize>,

    /// Milliseconds between simulated bounces (overrides config)
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Seconds to wait for the model to load
    #[arg(long, default_value_t = 30)]
    init_timeout: u64,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = run(Cli::parse()) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &cli);
    config.validate()?;

    if let Some(path) = &cli.dump_config {
        config.save(path)?;
        return Ok(());
    }

    info!("═══════════════════════════════════════════════");
    info!("  GENIE FALL v{}", env!("CARGO_PKG_VERSION"));
    match &cli.weights {
        Some(p) => info!("  Weights: {:?}", p),
        None => info!("  Weights: random (demo)"),
    }
    info!("  Voices: {}", config.pipeline.voices.iter().map(|v| v.name.as_str()).collect::<Vec<_>>().join(", "));
    if cli.osc { info!("  OSC: {}", cli.osc_target); }
    if let Some(p) = &cli.render { info!("  Render: {:?}", p); }
    info!("═══════════════════════════════════════════════");

    // ─── Model worker ───────────────────────────────────────────────
    let genie = worker::spawn(config.genie.base_offset, config.genie.seed)?;
    let source = match &cli.weights {
        Some(path) => WeightSource::Manifest(path.clone()),
        None => WeightSource::Random {
            seed: config.genie.seed.unwrap_or(0),
        },
    };
    genie.commands.send(WorkerCommand::Init(source))?;

    // ─── Step log ───────────────────────────────────────────────────
    let log: Box<dyn StepLog> = if cli.no_log {
        Box::new(MemoryStepLog::new())
    } else {
        match JsonlStepLog::open(&cli.log_file) {
            Ok(l) => Box::new(l),
            Err(e) => {
                warn!("{}; steps will not persist", e);
                Box::new(MemoryStepLog::new())
            }
        }
    };
    let seed = SessionSeed::load(&log);
    info!(
        "Session starts at {} with {} prior bounces",
        seed.position, seed.bounces
    );

    // ─── Instruments ────────────────────────────────────────────────
    let mut rack = InstrumentRack::new();
    if cli.osc {
        rack.push(Box::new(OscInstrument::new(&cli.osc_target)?));
    }
    if let Some(out) = &cli.render {
        let root = name_to_midi(&cli.sample_root)
            .ok_or_else(|| format!("--sample-root {:?} is not a note name", cli.sample_root))?;
        let inst = match &cli.sample {
            Some(path) => SampleInstrument::open(path, root, out)?,
            None => SampleInstrument::bell(BELL_SAMPLE_RATE, root, out),
        };
        rack.push(Box::new(inst));
    }
    let instrument: Box<dyn Instrument> = if rack.is_empty() {
        Box::new(RecordingInstrument::announcing())
    } else {
        Box::new(rack)
    };

    // ─── Cues ───────────────────────────────────────────────────────
    let (cue_tx, cue_rx) = unbounded::<VisualCue>();
    let mut handles = Vec::new();
    if cli.osc {
        let target = cli.osc_target.clone();
        handles.push(thread::Builder::new().name("cues".into()).spawn(move || {
            CueSender::new(cue_rx, target).run();
        })?);
    } else {
        handles.push(thread::Builder::new().name("cues".into()).spawn(move || {
            for cue in cue_rx.iter() {
                debug!("cue {}: {} @ {:.2}", cue.trigger, cue.color, cue.intensity);
            }
        })?);
    }

    // ─── Pipeline ───────────────────────────────────────────────────
    let mut pipeline = Pipeline::new(
        genie.commands.clone(),
        genie.replies.clone(),
        instrument,
        log,
        config.pipeline.clone(),
    )
    .with_cues(cue_tx);
    pipeline.wait_until_ready(Duration::from_secs(cli.init_timeout))?;

    // ─── Trigger source ─────────────────────────────────────────────
    let (trigger_tx, trigger_rx) = bounded::<TriggerEvent>(64);
    let mut simulator = Simulator::new(config.simulator.clone(), seed.position);
    handles.push(thread::Builder::new().name("simulator".into()).spawn(move || {
        simulator.run(&trigger_tx);
    })?);

    pipeline.run(trigger_rx);
    let finished = pipeline.finish();
    info!("{} bounces recorded in total", pipeline.bounces());

    // Drops the cue sender so the cue thread can end
    drop(pipeline);
    genie.shutdown();
    for h in handles {
        let _ = h.join();
    }
    finished?;
    Ok(())
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(seed) = cli.seed {
        config.genie.seed = Some(seed);
        config.pipeline.seed = Some(seed.wrapping_add(1));
        config.simulator.seed = Some(seed.wrapping_add(2));
    }
    if let Some(n) = cli.bounces {
        config.simulator.bounces = n;
    }
    if let Some(ms) = cli.interval_ms {
        config.simulator.interval_ms = ms;
    }
}
