//! Local simulation surface that replicated messages act upon
//!
//! The real simulation is an external collaborator. The core talks to it
//! through [`SimWorld`]; [`MirrorWorld`] is a plain arena implementation used
//! by clients that only mirror host state, by the host demo and by tests.

use crate::transport::PeerId;
use std::collections::{BTreeSet, HashMap};

/// Generational handle into an entity arena
///
/// A key stays valid until its slot is freed; a reused slot gets a new
/// generation, so stale keys never alias a newer entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    index: u32,
    generation: u32,
}

impl EntityKey {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Everything a replicated message may do to local state
pub trait SimWorld {
    fn spawn(&mut self, prefab: &str, cell: i32) -> EntityKey;

    /// Returns false if the entity was already gone
    fn despawn(&mut self, entity: EntityKey) -> bool;

    fn contains(&self, entity: EntityKey) -> bool;

    /// Returns false if the entity does not exist
    fn set_effect(&mut self, entity: EntityKey, effect: &str, adding: bool) -> bool;

    fn set_operational(&mut self, entity: EntityKey, operational: bool, active: bool) -> bool;

    fn dig(&mut self, cell: i32, origin: PeerId);

    fn build(&mut self, cell: i32, prefab: &str, orientation: u8, materials: &[String], origin: PeerId);

    fn deconstruct(&mut self, cell: i32, layer: u8, origin: PeerId);

    fn set_cell(&mut self, cell: i32, element: u16, mass: f32, temperature: f32);

    fn move_cursor(&mut self, player: PeerId, x: f32, y: f32);

    /// Prefab and cell of a live entity, used to answer full-sync requests
    fn describe(&self, entity: EntityKey) -> Option<(String, i32)>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct MirrorEntity {
    pub prefab: String,
    pub cell: i32,
    pub effects: BTreeSet<String>,
    pub operational: bool,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellState {
    pub element: u16,
    pub mass: f32,
    pub temperature: f32,
}

/// What happened to a [`MirrorWorld`], in order
#[derive(Debug, Clone, PartialEq)]
pub enum WorldEvent {
    Spawned(EntityKey),
    Despawned(EntityKey),
    EffectChanged {
        entity: EntityKey,
        effect: String,
        adding: bool,
    },
    OperationalChanged(EntityKey),
    Dug {
        cell: i32,
        origin: PeerId,
    },
    Built {
        cell: i32,
        prefab: String,
        origin: PeerId,
    },
    Deconstructed {
        cell: i32,
        layer: u8,
        origin: PeerId,
    },
    CellChanged(i32),
    CursorMoved(PeerId),
}

struct Slot {
    generation: u32,
    entity: Option<MirrorEntity>,
}

/// Arena-backed [`SimWorld`]
#[derive(Default)]
pub struct MirrorWorld {
    slots: Vec<Slot>,
    free: Vec<u32>,
    cells: HashMap<i32, CellState>,
    buildings: HashMap<(i32, u8), String>,
    cursors: HashMap<PeerId, (f32, f32)>,
    events: Vec<WorldEvent>,
}

impl MirrorWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(&self, key: EntityKey) -> Option<&MirrorEntity> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.entity.as_ref())
    }

    fn entity_mut(&mut self, key: EntityKey) -> Option<&mut MirrorEntity> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.entity.as_mut())
    }

    pub fn has_effect(&self, key: EntityKey, effect: &str) -> bool {
        self.entity(key)
            .map(|e| e.effects.contains(effect))
            .unwrap_or(false)
    }

    pub fn cell(&self, cell: i32) -> Option<&CellState> {
        self.cells.get(&cell)
    }

    /// Building prefab standing in `cell` on `layer`
    pub fn building(&self, cell: i32, layer: u8) -> Option<&str> {
        self.buildings.get(&(cell, layer)).map(String::as_str)
    }

    pub fn cursor(&self, player: PeerId) -> Option<(f32, f32)> {
        self.cursors.get(&player).copied()
    }

    pub fn entity_count(&self) -> usize {
        self.slots.iter().filter(|s| s.entity.is_some()).count()
    }

    pub fn events(&self) -> &[WorldEvent] {
        &self.events
    }

    pub fn drain_events(&mut self) -> Vec<WorldEvent> {
        std::mem::take(&mut self.events)
    }

    /// Number of digs recorded at `cell`
    pub fn dig_count(&self, cell: i32) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, WorldEvent::Dug { cell: c, .. } if *c == cell))
            .count()
    }
}

impl SimWorld for MirrorWorld {
    fn spawn(&mut self, prefab: &str, cell: i32) -> EntityKey {
        let entity = MirrorEntity {
            prefab: prefab.to_string(),
            cell,
            effects: BTreeSet::new(),
            operational: true,
            active: false,
        };

        let key = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entity = Some(entity);
            EntityKey {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                entity: Some(entity),
            });
            EntityKey {
                index,
                generation: 0,
            }
        };

        self.events.push(WorldEvent::Spawned(key));
        key
    }

    fn despawn(&mut self, entity: EntityKey) -> bool {
        let Some(slot) = self.slots.get_mut(entity.index as usize) else {
            return false;
        };
        if slot.generation != entity.generation || slot.entity.is_none() {
            return false;
        }
        slot.entity = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(entity.index);
        self.events.push(WorldEvent::Despawned(entity));
        true
    }

    fn contains(&self, entity: EntityKey) -> bool {
        self.entity(entity).is_some()
    }

    fn set_effect(&mut self, entity: EntityKey, effect: &str, adding: bool) -> bool {
        let Some(target) = self.entity_mut(entity) else {
            return false;
        };
        let changed = if adding {
            target.effects.insert(effect.to_string())
        } else {
            target.effects.remove(effect)
        };
        if changed {
            self.events.push(WorldEvent::EffectChanged {
                entity,
                effect: effect.to_string(),
                adding,
            });
        }
        true
    }

    fn set_operational(&mut self, entity: EntityKey, operational: bool, active: bool) -> bool {
        let Some(target) = self.entity_mut(entity) else {
            return false;
        };
        target.operational = operational;
        target.active = active;
        self.events.push(WorldEvent::OperationalChanged(entity));
        true
    }

    fn dig(&mut self, cell: i32, origin: PeerId) {
        self.buildings.retain(|(c, _), _| *c != cell);
        self.events.push(WorldEvent::Dug { cell, origin });
    }

    fn build(&mut self, cell: i32, prefab: &str, _orientation: u8, _materials: &[String], origin: PeerId) {
        self.buildings.insert((cell, 1), prefab.to_string());
        self.events.push(WorldEvent::Built {
            cell,
            prefab: prefab.to_string(),
            origin,
        });
    }

    fn deconstruct(&mut self, cell: i32, layer: u8, origin: PeerId) {
        self.buildings.remove(&(cell, layer));
        self.events.push(WorldEvent::Deconstructed {
            cell,
            layer,
            origin,
        });
    }

    fn set_cell(&mut self, cell: i32, element: u16, mass: f32, temperature: f32) {
        self.cells.insert(
            cell,
            CellState {
                element,
                mass,
                temperature,
            },
        );
        self.events.push(WorldEvent::CellChanged(cell));
    }

    fn move_cursor(&mut self, player: PeerId, x: f32, y: f32) {
        self.cursors.insert(player, (x, y));
        self.events.push(WorldEvent::CursorMoved(player));
    }

    fn describe(&self, entity: EntityKey) -> Option<(String, i32)> {
        self.entity(entity).map(|e| (e.prefab.clone(), e.cell))
    }
}
