use crate::config::SimulatorConfig;
use crate::types::*;
use crossbeam_channel::Sender;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::thread;
use std::time::Duration;

/// Stands in for the 3D scene: a star falling from `start`, bouncing off a
/// collider that drops a random 8–16 units (by default) after every hit.
/// Each bounce drifts a little in x/z. Emits one `TriggerEvent` per bounce.
pub struct Simulator {
    config: SimulatorConfig,
    start: Vector3,
    rng: StdRng,
}

impl Simulator {
    /// `start` is usually the session seed position, so a new session picks
    /// up where the last one ended.
    pub fn new(config: SimulatorConfig, start: Vector3) -> Self {
        let rng = match config.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { config, start, rng }
    }

    /// The next `config.bounces` collision points. Advances the simulator,
    /// so a second call continues the fall.
    pub fn bounce_positions(&mut self) -> Vec<Vector3> {
        let c = &self.config;
        let mut pos = self.start;
        let mut out = Vec::with_capacity(c.bounces);
        for _ in 0..c.bounces {
            let drop = if c.drop_max > c.drop_min {
                self.rng.gen_range(c.drop_min..c.drop_max)
            } else {
                c.drop_min
            };
            let (dx, dz) = if c.jitter > 0.0 {
                (
                    self.rng.gen_range(-c.jitter..=c.jitter),
                    self.rng.gen_range(-c.jitter..=c.jitter),
                )
            } else {
                (0.0, 0.0)
            };
            pos = pos.offset(dx, -drop, dz);
            out.push(pos);
        }
        self.start = pos;
        out
    }

    /// Send the bounce schedule, one trigger per interval. Blocks the calling
    /// thread; returns the number of triggers sent. Stops early if the
    /// receiver goes away.
    pub fn run(&mut self, tx: &Sender<TriggerEvent>) -> usize {
        let interval = Duration::from_millis(self.config.interval_ms);
        let from = self.start;
        let positions = self.bounce_positions();
        info!(
            "Simulator: {} bounces from {} every {:?}",
            positions.len(),
            from,
            interval
        );

        let mut sent = 0;
        for position in positions {
            if sent > 0 {
                thread::sleep(interval);
            }
            if tx.send(TriggerEvent { position }).is_err() {
                debug!("Simulator: trigger receiver closed");
                break;
            }
            sent += 1;
            debug!("bounce {} at {}", sent, position);
        }
        info!("Simulator finished after {} bounces", sent);
        sent
    }
}
