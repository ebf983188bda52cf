//! Instruments consume note names and play them, fire-and-forget.
//! Overlapping notes are normal; nothing here is monophonic.

use crate::error::InstrumentError;
use crate::notes::{midi_to_hz, name_to_midi};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Per-note playback options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayOptions {
    pub gain: f32,
    /// Cut the note after this many seconds; `None` lets the sample ring out.
    pub duration: Option<f64>,
}

impl Default for PlayOptions {
    fn default() -> Self {
        Self {
            gain: 1.0,
            duration: None,
        }
    }
}

pub trait Instrument: Send {
    /// Start `note` (e.g. "A5") at `start` seconds on the instrument's own
    /// timeline, or now when `None`. Must not block on earlier notes.
    fn play(&mut self, note: &str, start: Option<f64>, options: PlayOptions);

    /// Flush anything buffered (rendered audio, sockets). Called once at
    /// the end of a session.
    fn finish(&mut self) -> Result<(), InstrumentError> {
        Ok(())
    }
}

impl<T: Instrument + ?Sized> Instrument for Box<T> {
    fn play(&mut self, note: &str, start: Option<f64>, options: PlayOptions) {
        (**self).play(note, start, options)
    }

    fn finish(&mut self) -> Result<(), InstrumentError> {
        (**self).finish()
    }
}

/// Several instruments playing the same notes.
#[derive(Default)]
pub struct InstrumentRack {
    members: Vec<Box<dyn Instrument>>,
}

impl InstrumentRack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instrument: Box<dyn Instrument>) {
        self.members.push(instrument);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Instrument for InstrumentRack {
    fn play(&mut self, note: &str, start: Option<f64>, options: PlayOptions) {
        for m in &mut self.members {
            m.play(note, start, options);
        }
    }

    fn finish(&mut self) -> Result<(), InstrumentError> {
        let mut first_err = None;
        for m in &mut self.members {
            if let Err(e) = m.finish() {
                warn!("Instrument finish failed: {}", e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

// ─── Recording ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PlayedNote {
    pub note: String,
    pub start: Option<f64>,
    pub options: PlayOptions,
}

/// Remembers every call. Clones share one history, so a test (or the CLI's
/// dry run) can keep a handle while the pipeline owns the instrument.
#[derive(Debug, Clone, Default)]
pub struct RecordingInstrument {
    played: Arc<Mutex<Vec<PlayedNote>>>,
    announce: bool,
}

impl RecordingInstrument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also log each note at info level.
    pub fn announcing() -> Self {
        Self {
            played: Arc::default(),
            announce: true,
        }
    }

    pub fn played(&self) -> Vec<PlayedNote> {
        self.played.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl Instrument for RecordingInstrument {
    fn play(&mut self, note: &str, start: Option<f64>, options: PlayOptions) {
        if self.announce {
            info!("♪ {} (gain {:.2})", note, options.gain);
        }
        if let Ok(mut p) = self.played.lock() {
            p.push(PlayedNote {
                note: note.to_string(),
                start,
                options,
            });
        }
    }
}

// ─── Offline sample renderer ────────────────────────────────────────────────

/// Sample-based instrument that renders offline to a WAV file.
///
/// One mono sample recorded at `root_note` is repitched per note by
/// resampling (linear interpolation) at the ratio between the target and
/// root frequencies. Every note is summed into a mix buffer at its start
/// time, so overlapping notes ring together. `finish` normalizes if the
/// mix clipped and writes 32-bit float mono.
pub struct SampleInstrument {
    sample: Vec<f32>,
    sample_rate: u32,
    root_note: i32,
    mix: Vec<f32>,
    output: PathBuf,
    started: Instant,
}

impl SampleInstrument {
    /// Load the sample from a WAV file (any channel count, int or float).
    pub fn open(sample_path: &Path, root_note: i32, output: &Path) -> Result<Self, InstrumentError> {
        let reader = WavReader::open(sample_path)?;
        let spec = reader.spec();
        let channels = spec.channels as usize;

        let samples: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>()?,
            SampleFormat::Int => {
                let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max))
                    .collect::<Result<_, _>>()?
            }
        };

        // Mix down to mono
        let mono: Vec<f32> = if channels <= 1 {
            samples
        } else {
            samples
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        };
        if mono.is_empty() {
            return Err(InstrumentError::EmptySample(sample_path.to_path_buf()));
        }

        info!(
            "Sample {:?}: {} Hz, {} ch, {:.2}s, root MIDI {}",
            sample_path.file_name().unwrap_or_default(),
            spec.sample_rate,
            channels,
            mono.len() as f64 / spec.sample_rate as f64,
            root_note
        );
        Ok(Self::from_samples(mono, spec.sample_rate, root_note, output))
    }

    pub fn from_samples(sample: Vec<f32>, sample_rate: u32, root_note: i32, output: &Path) -> Self {
        Self {
            sample,
            sample_rate,
            root_note,
            mix: Vec::new(),
            output: output.to_path_buf(),
            started: Instant::now(),
        }
    }

    /// A synthetic celesta-like strike: a few inharmonic partials under a
    /// fast exponential decay. Stands in when no recorded sample is given.
    pub fn bell(sample_rate: u32, root_note: i32, output: &Path) -> Self {
        let freq = midi_to_hz(root_note as f64);
        let len = (sample_rate as f64 * 1.5) as usize;
        let partials = [(1.0, 1.0), (2.76, 0.4), (5.4, 0.15), (8.93, 0.06)];
        let sample = (0..len)
            .map(|i| {
                let t = i as f64 / sample_rate as f64;
                let env = (-t * 4.0).exp() * (1.0 - (-t * 800.0).exp());
                let tone: f64 = partials
                    .iter()
                    .map(|&(ratio, amp)| {
                        amp * (2.0 * std::f64::consts::PI * freq * ratio * t).sin()
                            * (-t * ratio).exp()
                    })
                    .sum();
                (0.4 * env * tone) as f32
            })
            .collect();
        Self::from_samples(sample, sample_rate, root_note, output)
    }

    pub fn rendered(&self) -> &[f32] {
        &self.mix
    }

    fn render(&mut self, midi: i32, start_secs: f64, options: PlayOptions) {
        let ratio = midi_to_hz(midi as f64) / midi_to_hz(self.root_note as f64);
        let offset = (start_secs.max(0.0) * self.sample_rate as f64) as usize;
        let mut len = (self.sample.len().saturating_sub(1) as f64 / ratio) as usize;
        if let Some(d) = options.duration {
            len = len.min((d.max(0.0) * self.sample_rate as f64) as usize);
        }
        if self.mix.len() < offset + len {
            self.mix.resize(offset + len, 0.0);
        }
        for k in 0..len {
            let pos = k as f64 * ratio;
            let i = pos as usize;
            let frac = (pos - i as f64) as f32;
            let a = self.sample[i];
            let b = self.sample.get(i + 1).copied().unwrap_or(0.0);
            self.mix[offset + k] += (a + (b - a) * frac) * options.gain;
        }
    }
}

impl Instrument for SampleInstrument {
    fn play(&mut self, note: &str, start: Option<f64>, options: PlayOptions) {
        let Some(midi) = name_to_midi(note) else {
            warn!("SampleInstrument: {}", InstrumentError::UnknownNote(note.to_string()));
            return;
        };
        let start = start.unwrap_or_else(|| self.started.elapsed().as_secs_f64());
        self.render(midi, start, options);
    }

    fn finish(&mut self) -> Result<(), InstrumentError> {
        let peak = self.mix.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
        if peak > 1.0 {
            for s in &mut self.mix {
                *s /= peak;
            }
        }

        let spec = WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(&self.output, spec)?;
        for &s in &self.mix {
            writer.write_sample(s)?;
        }
        writer.finalize()?;
        info!(
            "Rendered {:.2}s of audio → {:?}",
            self.mix.len() as f64 / self.sample_rate as f64,
            self.output
        );
        Ok(())
    }
}
