//! Stand-in for the authoritative colony simulation
//!
//! The host owns the canonical world. Each step, [`DemoSimulation`] makes a
//! handful of random changes to it and reports every change through the
//! replicator so that clients can mirror it:
//! - Critters and duplicants spawn and despawn
//! - Status effects are toggled on live entities
//! - Buildings flip between operational and broken
//! - Cells change element, mass and temperature (bulk, batched)

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use shared::messages::{CellUpdate, OperationalState, ToggleEffect};
use shared::world::{EntityKey, MirrorWorld, SimWorld};
use shared::{Replicator, SendError, Transport};

pub const PREFABS: [&str; 4] = ["Duplicant", "Hatch", "Pacu", "ShineBug"];
pub const EFFECTS: [&str; 3] = ["Overjoyed", "Stressed", "Soaked"];

#[derive(Debug, Clone)]
pub struct SimulationSettings {
    pub max_entities: usize,
    /// Cells are addressed as `0..cell_count`
    pub cell_count: i32,
    pub cell_updates_per_step: usize,
    pub spawn_chance: f64,
    pub despawn_chance: f64,
    pub effect_chance: f64,
    pub operational_chance: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            max_entities: 32,
            cell_count: 4096,
            cell_updates_per_step: 4,
            spawn_chance: 0.1,
            despawn_chance: 0.02,
            effect_chance: 0.05,
            operational_chance: 0.05,
        }
    }
}

/// Changes made by one step
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StepSummary {
    pub spawned: usize,
    pub despawned: usize,
    pub effects: usize,
    pub operational: usize,
    pub cells: usize,
}

pub struct DemoSimulation {
    rng: StdRng,
    settings: SimulationSettings,
    live: Vec<EntityKey>,
}

impl DemoSimulation {
    /// Seeded so that runs are reproducible
    pub fn new(seed: u64) -> Self {
        Self::with_settings(seed, SimulationSettings::default())
    }

    pub fn with_settings(seed: u64, settings: SimulationSettings) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            settings,
            live: Vec::new(),
        }
    }

    pub fn live_entities(&self) -> &[EntityKey] {
        &self.live
    }

    pub fn step<T: Transport>(
        &mut self,
        replicator: &mut Replicator<T>,
        world: &mut MirrorWorld,
    ) -> Result<StepSummary, SendError> {
        let mut summary = StepSummary::default();

        if self.live.len() < self.settings.max_entities && self.rng.gen_bool(self.settings.spawn_chance) {
            let prefab = PREFABS[self.rng.gen_range(0..PREFABS.len())];
            let cell = self.rng.gen_range(0..self.settings.cell_count);
            let (key, _) = replicator.spawn_replicated(world, prefab, cell)?;
            self.live.push(key);
            summary.spawned += 1;
        }

        if self.rng.gen_bool(self.settings.effect_chance) {
            if let Some(key) = self.live.choose(&mut self.rng).copied() {
                let effect = EFFECTS[self.rng.gen_range(0..EFFECTS.len())];
                let adding = !world.has_effect(key, effect);
                world.set_effect(key, effect, adding);
                let target = replicator.net_id(key)?;
                replicator.replicate(ToggleEffect {
                    target,
                    adding,
                    effect: effect.to_string(),
                })?;
                summary.effects += 1;
            }
        }

        if self.rng.gen_bool(self.settings.operational_chance) {
            if let Some(key) = self.live.choose(&mut self.rng).copied() {
                let operational = !world.entity(key).map(|e| e.operational).unwrap_or(true);
                let active = operational && self.rng.gen_bool(0.5);
                world.set_operational(key, operational, active);
                let target = replicator.net_id(key)?;
                replicator.replicate(OperationalState {
                    target,
                    operational,
                    active,
                })?;
                summary.operational += 1;
            }
        }

        for _ in 0..self.settings.cell_updates_per_step {
            let cell = self.rng.gen_range(0..self.settings.cell_count);
            let element = self.rng.gen_range(1..32u16);
            let mass = self.rng.gen_range(0.0..2000.0f32);
            let temperature = self.rng.gen_range(250.0..400.0f32);
            world.set_cell(cell, element, mass, temperature);
            replicator.replicate(CellUpdate {
                cell,
                element,
                mass,
                temperature,
            })?;
            summary.cells += 1;
        }

        if !self.live.is_empty() && self.rng.gen_bool(self.settings.despawn_chance) {
            let index = self.rng.gen_range(0..self.live.len());
            let key = self.live.swap_remove(index);
            replicator.despawn_replicated(world, key)?;
            summary.despawned += 1;
        }

        Ok(summary)
    }
}
