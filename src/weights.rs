//! Model weight bundle: named f32 tensors.
//!
//! On disk a bundle is a tfjs-style manifest (a JSON array of groups, each
//! listing shard `paths` and the `weights` they hold) next to binary shard
//! files. A group's shards are read back to back as one little-endian f32
//! stream; tensors are laid out in manifest order, row-major.

use crate::error::GenieError;
use crate::genie::ARCHITECTURE;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// A dense row-major tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Returns `None` if `data` does not hold exactly `shape.product()` values.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Option<Self> {
        if shape.iter().product::<usize>() != data.len() {
            return None;
        }
        Some(Self { shape, data })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; shape.iter().product()],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestGroup {
    pub paths: Vec<String>,
    pub weights: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub shape: Vec<usize>,
    #[serde(default = "default_dtype")]
    pub dtype: String,
}

fn default_dtype() -> String {
    "float32".to_string()
}

/// Immutable set of named tensors. Built once, handed to the runtime,
/// never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct ModelWeights {
    tensors: BTreeMap<String, Tensor>,
}

impl ModelWeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Architecture-shaped weights drawn uniformly from ±1/√fan_in.
    /// Deterministic for a given seed.
    pub fn random(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut weights = Self::new();
        for &(name, shape) in ARCHITECTURE {
            let fan_in = shape[0] as f32;
            let scale = 1.0 / fan_in.sqrt();
            let n: usize = shape.iter().product();
            let data = (0..n).map(|_| rng.gen_range(-scale..scale)).collect();
            weights.insert(
                name,
                Tensor {
                    shape: shape.to_vec(),
                    data,
                },
            );
        }
        weights
    }

    /// Load a bundle from a manifest file. Shard paths resolve relative to
    /// the manifest's directory; a leading '/' is treated as that directory too.
    pub fn load_manifest(path: &Path) -> Result<Self, GenieError> {
        let text = fs::read_to_string(path).map_err(|source| GenieError::WeightIo {
            path: path.to_path_buf(),
            source,
        })?;
        let groups: Vec<ManifestGroup> =
            serde_json::from_str(&text).map_err(|e| GenieError::Manifest(e.to_string()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let mut weights = Self::new();
        for group in &groups {
            let mut stream: Box<dyn Read> = Box::new(std::io::empty());
            for shard in &group.paths {
                let shard_path = base.join(shard.trim_start_matches('/'));
                let file = File::open(&shard_path).map_err(|source| GenieError::WeightIo {
                    path: shard_path.clone(),
                    source,
                })?;
                stream = Box::new(stream.chain(BufReader::new(file)));
            }
            weights.read_group(group, &mut stream)?;
        }
        info!("Loaded {} tensors from {:?}", weights.len(), path);
        Ok(weights)
    }

    fn read_group<R: Read>(&mut self, group: &ManifestGroup, stream: &mut R) -> Result<(), GenieError> {
        for entry in &group.weights {
            if entry.dtype != "float32" {
                return Err(GenieError::UnsupportedDtype {
                    name: entry.name.clone(),
                    dtype: entry.dtype.clone(),
                });
            }
            let mut data = vec![0.0f32; entry.shape.iter().product()];
            stream
                .read_f32_into::<LittleEndian>(&mut data)
                .map_err(|source| GenieError::WeightIo {
                    path: PathBuf::from(&entry.name),
                    source,
                })?;
            debug!("  {} {:?}", entry.name, entry.shape);
            self.insert(
                entry.name.clone(),
                Tensor {
                    shape: entry.shape.clone(),
                    data,
                },
            );
        }
        Ok(())
    }

    /// Write the bundle as `<stem>.json` plus a single `<stem>.bin` shard in `dir`.
    /// Returns the manifest path.
    pub fn save_manifest(&self, dir: &Path, stem: &str) -> Result<PathBuf, GenieError> {
        fs::create_dir_all(dir).map_err(io_err(dir))?;

        let shard_name = format!("{}.bin", stem);
        let shard_path = dir.join(&shard_name);
        let mut shard = BufWriter::new(File::create(&shard_path).map_err(io_err(&shard_path))?);
        let mut entries = Vec::with_capacity(self.tensors.len());
        for (name, tensor) in &self.tensors {
            for &v in &tensor.data {
                shard
                    .write_f32::<LittleEndian>(v)
                    .map_err(|source| GenieError::WeightIo {
                        path: shard_path.clone(),
                        source,
                    })?;
            }
            entries.push(ManifestEntry {
                name: name.clone(),
                shape: tensor.shape.clone(),
                dtype: default_dtype(),
            });
        }
        shard.flush().map_err(io_err(&shard_path))?;

        let manifest = vec![ManifestGroup {
            paths: vec![shard_name],
            weights: entries,
        }];
        let manifest_path = dir.join(format!("{}.json", stem));
        let json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| GenieError::Manifest(e.to_string()))?;
        fs::write(&manifest_path, json).map_err(io_err(&manifest_path))?;
        Ok(manifest_path)
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> GenieError {
    let path = path.to_path_buf();
    move |source| GenieError::WeightIo { path, source }
}
