//! Terrain state and full-state synchronization

use super::{ApplyContext, Authority, EntitySpawn, MessageKind, Replicated};
use crate::batching::BulkPolicy;
use crate::error::ApplyError;
use crate::transport::Reliability;
use log::debug;
use serde::{Deserialize, Serialize};

/// Element, mass and temperature of a single cell
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellUpdate {
    pub cell: i32,
    pub element: u16,
    pub mass: f32,
    pub temperature: f32,
}

impl Replicated for CellUpdate {
    const KIND: MessageKind = MessageKind::CellUpdate;
    const AUTHORITY: Authority = Authority::ClientOnly;
    const RELIABILITY: Reliability = Reliability::Unreliable;
    const BULK: Option<BulkPolicy> = Some(BulkPolicy {
        max_batch_size: 64,
        interval_ms: 100,
    });

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        ctx.world
            .set_cell(self.cell, self.element, self.mass, self.temperature);
        Ok(())
    }
}

/// Sent by a client that wants every live host entity re-announced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FullSyncRequest {}

impl Replicated for FullSyncRequest {
    const KIND: MessageKind = MessageKind::FullSyncRequest;
    const AUTHORITY: Authority = Authority::HostOnly;
    const RELIABILITY: Reliability = Reliability::Reliable;

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        let entries = ctx.registry.entries();
        for (id, entity) in entries {
            if let Some((prefab, cell)) = ctx.world.describe(entity) {
                ctx.reply(EntitySpawn { id, prefab, cell });
            }
        }
        debug!(
            "Full sync for {}: {} entities",
            ctx.sender,
            ctx.replies.len()
        );
        Ok(())
    }
}
