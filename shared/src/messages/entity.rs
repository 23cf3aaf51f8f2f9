//! Entity lifecycle and state messages broadcast by the host

use super::{ApplyContext, Authority, MessageKind, Replicated};
use crate::error::{ApplyError, IdentityError};
use crate::identity::NetId;
use crate::session::SessionRole;
use crate::transport::Reliability;
use log::debug;
use serde::{Deserialize, Serialize};

/// A host entity now exists and is addressable as `id`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySpawn {
    pub id: NetId,
    pub prefab: String,
    pub cell: i32,
}

impl Replicated for EntitySpawn {
    const KIND: MessageKind = MessageKind::EntitySpawn;
    const AUTHORITY: Authority = Authority::ClientOnly;
    const RELIABILITY: Reliability = Reliability::Reliable;

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        if !self.id.is_valid() {
            return Err(ApplyError::InvalidTarget);
        }
        // Only clients bind host ids; checked before anything is spawned
        if ctx.role != SessionRole::Client {
            return Err(IdentityError::NotClient.into());
        }
        // Repeated spawns (e.g. from a full sync) leave a live binding alone
        if let Some(existing) = ctx.registry.resolve(self.id) {
            if ctx.world.contains(existing) {
                return Ok(());
            }
        }
        let entity = ctx.world.spawn(&self.prefab, self.cell);
        if let Some(replaced) = ctx.registry.bind(ctx.role, self.id, entity)? {
            ctx.world.despawn(replaced);
        }
        debug!("Spawned {} as {} at cell {}", self.id, self.prefab, self.cell);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityDestroy {
    pub id: NetId,
}

impl Replicated for EntityDestroy {
    const KIND: MessageKind = MessageKind::EntityDestroy;
    const AUTHORITY: Authority = Authority::ClientOnly;
    const RELIABILITY: Reliability = Reliability::Reliable;

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        let entity = ctx.target(self.id)?;
        ctx.world.despawn(entity);
        ctx.registry.release(self.id);
        Ok(())
    }
}

/// Add or remove a named status effect on an entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToggleEffect {
    pub target: NetId,
    pub adding: bool,
    pub effect: String,
}

impl Replicated for ToggleEffect {
    const KIND: MessageKind = MessageKind::ToggleEffect;
    const AUTHORITY: Authority = Authority::ClientOnly;
    const RELIABILITY: Reliability = Reliability::Reliable;

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        let entity = ctx.target(self.target)?;
        if !ctx.world.set_effect(entity, &self.effect, self.adding) {
            return Err(ApplyError::StaleEntity(self.target));
        }
        Ok(())
    }
}

/// Whether a building works and whether it is currently running
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationalState {
    pub target: NetId,
    pub operational: bool,
    pub active: bool,
}

impl Replicated for OperationalState {
    const KIND: MessageKind = MessageKind::OperationalState;
    const AUTHORITY: Authority = Authority::ClientOnly;
    const RELIABILITY: Reliability = Reliability::Reliable;

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        let entity = ctx.target(self.target)?;
        if !ctx
            .world
            .set_operational(entity, self.operational, self.active)
        {
            return Err(ApplyError::StaleEntity(self.target));
        }
        Ok(())
    }
}
