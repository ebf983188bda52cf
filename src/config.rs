//! Engine configuration: voices, palette, timeouts, simulator schedule.
//!
//! Every field has a default, so a config file only needs the values it
//! changes. `validate` runs after loading; the CLI overrides a few fields
//! from flags on top of the file.

use crate::error::ConfigError;
use crate::genie::MAX_BUTTON;
use crate::notes::{GENIE_TEMPERATURE, LOWEST_INSTRUMENT_MIDI_NUMBER, LOWEST_PIANO_MIDI_NUMBER};
use crate::session_log::DEFAULT_SEED_POSITION;
use crate::types::Vector3;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub genie: GenieConfig,
    pub pipeline: PipelineConfig,
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenieConfig {
    /// MIDI number of the model's key 0
    pub base_offset: i32,
    /// Sampler seed; `None` draws one from the OS.
    pub seed: Option<u64>,
}

impl Default for GenieConfig {
    fn default() -> Self {
        Self {
            base_offset: LOWEST_PIANO_MIDI_NUMBER,
            seed: None,
        }
    }
}

/// One request issued per trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub name: String,
    pub button: u8,
    pub minimum_note: i32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_gain")]
    pub gain: f32,
}

fn default_temperature() -> f32 {
    GENIE_TEMPERATURE
}

fn default_gain() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub voices: Vec<VoiceConfig>,
    pub inference_timeout_ms: u64,
    /// Cue colours, "#rrggbbaa"
    pub palette: Vec<String>,
    pub cue_intensity: f32,
    /// Palette seed; `None` draws one from the OS.
    pub seed: Option<u64>,
}

impl PipelineConfig {
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            voices: vec![
                VoiceConfig {
                    name: "low".into(),
                    button: 1,
                    minimum_note: LOWEST_PIANO_MIDI_NUMBER,
                    temperature: GENIE_TEMPERATURE,
                    gain: 1.0,
                },
                VoiceConfig {
                    name: "high".into(),
                    button: 6,
                    minimum_note: LOWEST_INSTRUMENT_MIDI_NUMBER,
                    temperature: GENIE_TEMPERATURE,
                    gain: 1.0,
                },
            ],
            inference_timeout_ms: 2000,
            palette: [
                "#cc4d33ff", "#663399ff", "#1a80ffff", "#8099ccff", "#ccb333ff", "#ff4d99ff",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            cue_intensity: 1.0,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Where the star starts when the log has no history.
    pub start: Vector3,
    pub bounces: usize,
    pub interval_ms: u64,
    /// Each bounce lowers the collider by a random amount in this range.
    pub drop_min: f32,
    pub drop_max: f32,
    /// Maximum horizontal drift per bounce, x and z.
    pub jitter: f32,
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            start: DEFAULT_SEED_POSITION,
            bounces: 24,
            interval_ms: 600,
            drop_min: 8.0,
            drop_max: 16.0,
            jitter: 2.0,
            seed: None,
        }
    }
}

impl Config {
    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&data)?;
        config.validate()?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        info!("Config saved to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.pipeline;
        if p.voices.is_empty() {
            return Err(ConfigError::Invalid("at least one voice is required".into()));
        }
        for v in &p.voices {
            if v.button > MAX_BUTTON {
                return Err(ConfigError::Invalid(format!(
                    "voice {:?}: button {} out of range 0..={}",
                    v.name, v.button, MAX_BUTTON
                )));
            }
            if !v.temperature.is_finite() || v.temperature < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "voice {:?}: temperature must be a non-negative number",
                    v.name
                )));
            }
            if !(0.0..=4.0).contains(&v.gain) {
                return Err(ConfigError::Invalid(format!("voice {:?}: gain {} out of range", v.name, v.gain)));
            }
            if !(0..=127).contains(&v.minimum_note) {
                return Err(ConfigError::Invalid(format!(
                    "voice {:?}: minimum_note {} is not a MIDI note",
                    v.name, v.minimum_note
                )));
            }
        }
        if p.inference_timeout_ms == 0 {
            return Err(ConfigError::Invalid("inference_timeout_ms must be positive".into()));
        }
        if p.palette.is_empty() {
            return Err(ConfigError::Invalid("palette is empty".into()));
        }
        if let Some(bad) = p.palette.iter().find(|c| !is_rgba_hex(c)) {
            return Err(ConfigError::Invalid(format!("palette colour {:?} is not #rrggbbaa", bad)));
        }

        let s = &self.simulator;
        if !(s.drop_min > 0.0 && s.drop_min <= s.drop_max) {
            return Err(ConfigError::Invalid(format!(
                "simulator drop range {}..{} is invalid",
                s.drop_min, s.drop_max
            )));
        }
        if s.jitter < 0.0 {
            return Err(ConfigError::Invalid("simulator jitter must be non-negative".into()));
        }
        Ok(())
    }
}

fn is_rgba_hex(s: &str) -> bool {
    s.len() == 9 && s.starts_with('#') && s[1..].chars().all(|c| c.is_ascii_hexdigit())
}
