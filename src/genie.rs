use crate::error::GenieError;
use crate::types::SessionClock;
use crate::weights::{ModelWeights, Tensor};
use log::{debug, info, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ─── Architecture ───────────────────────────────────────────────────────────

/// Size of the button alphabet the checkpoint was trained on. Buttons are
/// coarse register gestures, 0 = lowest. Sets the feature scaling.
pub const NUM_BUTTONS: u8 = 8;
/// Highest button a caller may press. Scenes address buttons 0..=8; button 8
/// sits one step past the trained alphabet and its scaled feature
/// extrapolates to 9/7 instead of being rejected.
pub const MAX_BUTTON: u8 = NUM_BUTTONS;
/// Output keys, one per piano key (A0..C8).
pub const NUM_KEYS: usize = 88;
pub const RNN_LAYERS: usize = 2;
pub const RNN_UNITS: usize = 128;
/// Temperatures at or below this take the greedy path.
pub const MIN_TEMPERATURE: f32 = 1e-4;

const DELTA_TIME_BINS_PER_SEC: f64 = 31.25;
const MAX_DELTA_TIME_BIN: usize = 32;
/// last-key one-hot (89) + scaled button (1) + delta-time one-hot (33)
pub const INPUT_WIDTH: usize = (NUM_KEYS + 1) + 1 + (MAX_DELTA_TIME_BIN + 1);
const FORGET_BIAS: f32 = 1.0;

const INPUT_KERNEL: &str = "phero_model/decoder/rnn_input/dense/kernel";
const INPUT_BIAS: &str = "phero_model/decoder/rnn_input/dense/bias";
const CELL_KERNELS: [&str; RNN_LAYERS] = [
    "phero_model/decoder/rnn/rnn/multi_rnn_cell/cell_0/lstm_cell/kernel",
    "phero_model/decoder/rnn/rnn/multi_rnn_cell/cell_1/lstm_cell/kernel",
];
const CELL_BIASES: [&str; RNN_LAYERS] = [
    "phero_model/decoder/rnn/rnn/multi_rnn_cell/cell_0/lstm_cell/bias",
    "phero_model/decoder/rnn/rnn/multi_rnn_cell/cell_1/lstm_cell/bias",
];
const PITCH_KERNEL: &str = "phero_model/decoder/pitches/dense/kernel";
const PITCH_BIAS: &str = "phero_model/decoder/pitches/dense/bias";

/// Every tensor the runtime needs, with its exact shape. Weight bundles
/// must match this to stay compatible with the pretrained checkpoint.
pub const ARCHITECTURE: &[(&str, &[usize])] = &[
    (INPUT_KERNEL, &[INPUT_WIDTH, RNN_UNITS]),
    (INPUT_BIAS, &[RNN_UNITS]),
    (CELL_KERNELS[0], &[2 * RNN_UNITS, 4 * RNN_UNITS]),
    (CELL_BIASES[0], &[4 * RNN_UNITS]),
    (CELL_KERNELS[1], &[2 * RNN_UNITS, 4 * RNN_UNITS]),
    (CELL_BIASES[1], &[4 * RNN_UNITS]),
    (PITCH_KERNEL, &[RNN_UNITS, NUM_KEYS]),
    (PITCH_BIAS, &[NUM_KEYS]),
];

// ─── Layers ─────────────────────────────────────────────────────────────────

/// Fully connected layer, `out = x · W + b`, with W stored [inputs, outputs].
struct Dense {
    kernel: Vec<f32>,
    bias: Vec<f32>,
    outputs: usize,
}

impl Dense {
    fn from_weights(
        weights: &ModelWeights,
        kernel: &str,
        bias: &str,
        inputs: usize,
        outputs: usize,
    ) -> Result<Self, GenieError> {
        let k = expect_tensor(weights, kernel, &[inputs, outputs])?;
        let b = expect_tensor(weights, bias, &[outputs])?;
        Ok(Self {
            kernel: k.data().to_vec(),
            bias: b.data().to_vec(),
            outputs,
        })
    }

    fn forward(&self, x: &[f32], out: &mut [f32]) {
        out.copy_from_slice(&self.bias);
        for (i, &xi) in x.iter().enumerate() {
            // one-hot inputs are mostly zero
            if xi == 0.0 {
                continue;
            }
            let row = &self.kernel[i * self.outputs..(i + 1) * self.outputs];
            for (o, &w) in out.iter_mut().zip(row) {
                *o += xi * w;
            }
        }
    }
}

/// Basic LSTM cell. Gates come out of one projection of `[x, h]` in the
/// order input, candidate, forget, output.
struct LstmCell {
    gates: Dense,
}

impl LstmCell {
    fn step(&self, x: &[f32], c: &mut [f32], h: &mut [f32], concat: &mut [f32], z: &mut [f32]) {
        let n = c.len();
        concat[..x.len()].copy_from_slice(x);
        concat[x.len()..].copy_from_slice(h);
        self.gates.forward(concat, z);
        for u in 0..n {
            let i = sigmoid(z[u]);
            let j = z[n + u].tanh();
            let f = sigmoid(z[2 * n + u] + FORGET_BIAS);
            let o = sigmoid(z[3 * n + u]);
            c[u] = c[u] * f + i * j;
            h[u] = c[u].tanh() * o;
        }
    }
}

struct Network {
    input: Dense,
    cells: Vec<LstmCell>,
    pitches: Dense,
}

fn expect_tensor<'a>(
    weights: &'a ModelWeights,
    name: &str,
    shape: &[usize],
) -> Result<&'a Tensor, GenieError> {
    let t = weights
        .get(name)
        .ok_or_else(|| GenieError::MissingTensor(name.to_string()))?;
    if t.shape() != shape {
        return Err(GenieError::WeightShape {
            name: name.to_string(),
            expected: shape.to_vec(),
            actual: t.shape().to_vec(),
        });
    }
    Ok(t)
}

// ─── State ──────────────────────────────────────────────────────────────────

/// Recurrent state for one performer. Zeroed by `reset_state`, advanced by
/// every step.
#[derive(Debug, Clone)]
struct ModelState {
    c: Vec<Vec<f32>>,
    h: Vec<Vec<f32>>,
    last_key: Option<usize>,
    /// Seconds, on whatever clock the caller steps with
    last_time: Option<f64>,
}

impl ModelState {
    fn zeroed() -> Self {
        Self {
            c: vec![vec![0.0; RNN_UNITS]; RNN_LAYERS],
            h: vec![vec![0.0; RNN_UNITS]; RNN_LAYERS],
            last_key: None,
            last_time: None,
        }
    }
}

struct Scratch {
    features: Vec<f32>,
    x: Vec<f32>,
    concat: Vec<f32>,
    gates: Vec<f32>,
    logits: Vec<f32>,
}

impl Scratch {
    fn new() -> Self {
        Self {
            features: vec![0.0; INPUT_WIDTH],
            x: vec![0.0; RNN_UNITS],
            concat: vec![0.0; 2 * RNN_UNITS],
            gates: vec![0.0; 4 * RNN_UNITS],
            logits: vec![0.0; NUM_KEYS],
        }
    }
}

// ─── Runtime ────────────────────────────────────────────────────────────────

/// Piano Genie decoder: maps a stream of button presses to piano keys.
///
/// Each step encodes (previous key, button, time since previous step),
/// projects it into the RNN width, runs it through two stacked LSTM cells
/// and projects the top hidden state onto 88 key logits. The key is then
/// sampled with temperature:
///
///   - at or below `MIN_TEMPERATURE` (including 0 and negatives) the step
///     is greedy, so identical state and input give identical output;
///   - otherwise logits are divided by the temperature before the softmax
///     and a key is drawn from the resulting distribution.
///
/// Every successful step mutates the recurrent state. One instance serves
/// one performer; it is not meant to be shared between concurrent callers.
pub struct PianoGenie {
    net: Option<Network>,
    state: Option<ModelState>,
    scratch: Scratch,
    rng: StdRng,
    clock: SessionClock,
}

impl PianoGenie {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Sampling draws from a seeded generator; same weights, seed and
    /// inputs give the same session.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            net: None,
            state: None,
            scratch: Scratch::new(),
            rng,
            clock: SessionClock::new(),
        }
    }

    /// Load the layer parameters. Every tensor in `ARCHITECTURE` must be
    /// present with its exact shape. Any previous state is discarded, so
    /// `reset_state` must follow before stepping.
    pub fn initialize(&mut self, weights: &ModelWeights) -> Result<(), GenieError> {
        let input = Dense::from_weights(weights, INPUT_KERNEL, INPUT_BIAS, INPUT_WIDTH, RNN_UNITS)?;
        let cells = (0..RNN_LAYERS)
            .map(|l| {
                Dense::from_weights(
                    weights,
                    CELL_KERNELS[l],
                    CELL_BIASES[l],
                    2 * RNN_UNITS,
                    4 * RNN_UNITS,
                )
                .map(|gates| LstmCell { gates })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let pitches = Dense::from_weights(weights, PITCH_KERNEL, PITCH_BIAS, RNN_UNITS, NUM_KEYS)?;

        self.net = Some(Network {
            input,
            cells,
            pitches,
        });
        self.state = None;
        info!(
            "Piano Genie initialized: {} LSTM layers × {} units, {} keys",
            RNN_LAYERS, RNN_UNITS, NUM_KEYS
        );
        Ok(())
    }

    /// Zero the recurrent state and forget the previous key. Starts a new
    /// musical session without reloading weights.
    pub fn reset_state(&mut self) {
        self.state = Some(ModelState::zeroed());
        debug!("Piano Genie state reset");
    }

    pub fn is_initialized(&self) -> bool {
        self.net.is_some() && self.state.is_some()
    }

    /// Step with the runtime's own monotonic clock for the timing feature.
    pub fn next(&mut self, button: u8, temperature: f32) -> Result<i32, GenieError> {
        let now = self.clock.now_secs();
        self.next_at(button, temperature, now)
    }

    /// Step at an explicit time (seconds). Returns the key index, 0..88.
    pub fn next_at(&mut self, button: u8, temperature: f32, time: f64) -> Result<i32, GenieError> {
        self.step(button, time, |logits, rng| sample_logits(logits, temperature, rng))
    }

    /// Step, but only allow keys from `keys` (indices 0..88).
    pub fn next_from_key_list(
        &mut self,
        button: u8,
        keys: &[usize],
        temperature: f32,
    ) -> Result<i32, GenieError> {
        let now = self.clock.now_secs();
        self.next_from_key_list_at(button, keys, temperature, now)
    }

    pub fn next_from_key_list_at(
        &mut self,
        button: u8,
        keys: &[usize],
        temperature: f32,
        time: f64,
    ) -> Result<i32, GenieError> {
        if keys.is_empty() || keys.iter().any(|&k| k >= NUM_KEYS) {
            return Err(GenieError::InvalidKeyList);
        }
        let mut allowed = [false; NUM_KEYS];
        for &k in keys {
            allowed[k] = true;
        }
        self.step(button, time, |logits, rng| {
            for (l, &ok) in logits.iter_mut().zip(allowed.iter()) {
                if !ok {
                    *l = f32::NEG_INFINITY;
                }
            }
            sample_logits(logits, temperature, rng)
        })
    }

    fn step<F>(&mut self, button: u8, time: f64, sample: F) -> Result<i32, GenieError>
    where
        F: FnOnce(&mut [f32], &mut StdRng) -> usize,
    {
        let (net, state) = match (&self.net, &mut self.state) {
            (Some(net), Some(state)) => (net, state),
            _ => return Err(GenieError::NotInitialized),
        };
        if button > MAX_BUTTON {
            return Err(GenieError::InvalidButton(button));
        }

        let s = &mut self.scratch;
        encode_features(&mut s.features, state, button, time);
        net.input.forward(&s.features, &mut s.x);
        for (layer, cell) in net.cells.iter().enumerate() {
            cell.step(
                &s.x,
                &mut state.c[layer],
                &mut state.h[layer],
                &mut s.concat,
                &mut s.gates,
            );
            s.x.copy_from_slice(&state.h[layer]);
        }
        net.pitches.forward(&s.x, &mut s.logits);

        let key = sample(&mut s.logits, &mut self.rng);
        state.last_key = Some(key);
        state.last_time = Some(time);
        trace!("genie step: button={} t={:.3} → key {}", button, time, key);
        Ok(key as i32)
    }
}

impl Default for PianoGenie {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_features(features: &mut [f32], state: &ModelState, button: u8, time: f64) {
    features.fill(0.0);

    // Previous key, class 0 = none yet
    features[state.last_key.map_or(0, |k| k + 1)] = 1.0;

    // Button scaled to [-1, 1]
    features[NUM_KEYS + 1] = 2.0 * button as f32 / (NUM_BUTTONS - 1) as f32 - 1.0;

    // Time since the previous step, quantized; the first step gets the top bin
    let bin = match state.last_time {
        Some(prev) => ((time - prev).max(0.0) * DELTA_TIME_BINS_PER_SEC)
            .round()
            .min(MAX_DELTA_TIME_BIN as f64) as usize,
        None => MAX_DELTA_TIME_BIN,
    };
    features[NUM_KEYS + 2 + bin] = 1.0;
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Pick a key index from logits. Overwrites `logits` with unnormalized
/// probabilities on the sampling path.
fn sample_logits(logits: &mut [f32], temperature: f32, rng: &mut StdRng) -> usize {
    // f32::max ignores NaN, so a NaN temperature lands on the floor too
    let t = temperature.max(MIN_TEMPERATURE);
    if t <= MIN_TEMPERATURE {
        return argmax(logits);
    }

    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut total = 0.0f32;
    for l in logits.iter_mut() {
        *l = ((*l - max) / t).exp();
        total += *l;
    }

    let mut u = rng.gen::<f32>() * total;
    for (i, &p) in logits.iter().enumerate() {
        if u < p {
            return i;
        }
        u -= p;
    }
    // Rounding left u just past the last bucket
    argmax(logits)
}
