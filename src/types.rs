use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

// ─── Scene geometry ─────────────────────────────────────────────────────────

/// A point in scene space. Y is up; the star falls toward -Y.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn offset(self, dx: f32, dy: f32, dz: f32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }
}

impl fmt::Display for Vector3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

// ─── Triggers ───────────────────────────────────────────────────────────────

/// A collision reported by the scene: the star touched a collider at `position`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub position: Vector3,
}

// ─── Inference ──────────────────────────────────────────────────────────────

/// Correlation id carried by a request and echoed by its reply.
pub type RequestId = u64;

/// One "give me the next note" request for the model worker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub request_id: RequestId,
    /// Coarse register button, 0..=MAX_BUTTON
    pub button: u8,
    pub temperature: f32,
    /// Register floor for the resolved note (absolute MIDI number)
    pub minimum_note: i32,
}

/// Where the worker gets its weights from.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightSource {
    /// tfjs-style weights manifest JSON; shard paths are relative to it.
    Manifest(PathBuf),
    /// Architecture-shaped random weights. Useful for demos and tests,
    /// musically meaningless.
    Random { seed: u64 },
}

// ─── Inter-thread messages ──────────────────────────────────────────────────

/// Host → worker.
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    Init(WeightSource),
    Infer(InferenceRequest),
    /// Start a fresh musical session without reloading weights.
    Reset,
    Shutdown,
}

/// Worker → host.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    Ready,
    InitFailed(String),
    Note {
        request_id: RequestId,
        /// Key index straight from the model, 0..88
        raw: i32,
        /// Absolute MIDI note after register resolution
        note: i32,
    },
    Failed {
        request_id: RequestId,
        error: String,
    },
}

// ─── Session log ────────────────────────────────────────────────────────────

/// One bounce: where it happened, what it played, and when.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub position: Vector3,
    pub note: i32,
    /// Milliseconds since the UNIX epoch
    pub time: u64,
    /// Bounce that produced the step, numbered from 1 across sessions.
    /// Every voice of one bounce shares it.
    #[serde(default)]
    pub bounce: u64,
}

// ─── Visual feedback ────────────────────────────────────────────────────────

/// Cosmetic signal for the scene, one per accepted trigger: flash the star
/// light and retarget the ambient colour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualCue {
    pub trigger: u64,
    /// "#rrggbbaa"
    pub color: String,
    pub intensity: f32,
}

// ─── Clocks ─────────────────────────────────────────────────────────────────

/// Monotonic clock for a session; feeds the model's timing feature.
#[derive(Clone, Debug)]
pub struct SessionClock {
    start: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock milliseconds since the UNIX epoch. A clock set before 1970
/// reads as 0.
pub fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
