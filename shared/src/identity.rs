//! Cross-peer entity identity
//!
//! The host hands out small integer [`NetId`]s for entities that messages
//! need to reference; clients learn them from spawn messages and bind them to
//! their own local entities. The registry stores arena keys only, so it never
//! keeps an entity alive.

use crate::error::IdentityError;
use crate::session::SessionRole;
use crate::world::EntityKey;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Network id shared by every peer for one entity. `0` is never valid.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NetId(pub u32);

impl NetId {
    pub const INVALID: NetId = NetId(0);

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net:{}", self.0)
    }
}

/// Bidirectional `NetId <-> EntityKey` table
///
/// Mutated only from the tick thread. Ids are allocated monotonically from
/// the last assigned value and never collide with a live id; a released id
/// can only come back after the counter wraps around.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    by_id: HashMap<NetId, EntityKey>,
    by_entity: HashMap<EntityKey, NetId>,
    last_assigned: u32,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entity's id, allocating one on first use. Host only.
    pub fn register(
        &mut self,
        role: SessionRole,
        entity: EntityKey,
    ) -> Result<NetId, IdentityError> {
        if role != SessionRole::Host {
            return Err(IdentityError::NotHost);
        }
        if let Some(id) = self.by_entity.get(&entity) {
            return Ok(*id);
        }

        let id = self.allocate()?;
        self.by_id.insert(id, entity);
        self.by_entity.insert(entity, id);
        debug!("Registered {} for {:?}", id, entity);
        Ok(id)
    }

    fn allocate(&mut self) -> Result<NetId, IdentityError> {
        if self.by_id.len() >= u32::MAX as usize {
            return Err(IdentityError::Exhausted);
        }
        let mut candidate = self.last_assigned;
        loop {
            candidate = candidate.wrapping_add(1);
            if candidate == 0 {
                continue;
            }
            let id = NetId(candidate);
            if !self.by_id.contains_key(&id) {
                self.last_assigned = candidate;
                return Ok(id);
            }
        }
    }

    /// Look up the local entity for `id`. `None` means "not arrived yet".
    pub fn resolve(&self, id: NetId) -> Option<EntityKey> {
        self.by_id.get(&id).copied()
    }

    /// Reverse lookup
    pub fn id_of(&self, entity: EntityKey) -> Option<NetId> {
        self.by_entity.get(&entity).copied()
    }

    /// Bind a host-allocated id to a local entity without allocating. Client only.
    ///
    /// Host state wins: an id that was already bound elsewhere is rebound and
    /// the previously bound entity is returned.
    pub fn bind(
        &mut self,
        role: SessionRole,
        id: NetId,
        entity: EntityKey,
    ) -> Result<Option<EntityKey>, IdentityError> {
        if role != SessionRole::Client {
            return Err(IdentityError::NotClient);
        }
        if !id.is_valid() {
            return Err(IdentityError::ReservedId);
        }

        if let Some(old_id) = self.by_entity.remove(&entity) {
            if old_id != id {
                self.by_id.remove(&old_id);
            }
        }
        let previous = self.by_id.insert(id, entity);
        if let Some(previous) = previous {
            if previous != entity {
                warn!("Rebinding {} from {:?} to {:?}", id, previous, entity);
                self.by_entity.remove(&previous);
            }
        }
        self.by_entity.insert(entity, id);
        Ok(previous.filter(|p| *p != entity))
    }

    /// Remove both directions of the mapping for `id`
    pub fn release(&mut self, id: NetId) -> Option<EntityKey> {
        let entity = self.by_id.remove(&id)?;
        self.by_entity.remove(&entity);
        debug!("Released {}", id);
        Some(entity)
    }

    /// Remove the mapping for a destroyed entity
    pub fn release_entity(&mut self, entity: EntityKey) -> Option<NetId> {
        let id = self.by_entity.remove(&entity)?;
        self.by_id.remove(&id);
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Live bindings in ascending id order
    pub fn entries(&self) -> Vec<(NetId, EntityKey)> {
        let mut entries: Vec<_> = self.by_id.iter().map(|(id, key)| (*id, *key)).collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }
}
