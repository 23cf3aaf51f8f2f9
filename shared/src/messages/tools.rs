//! Player tool actions. Any peer may originate them; the host applies each
//! one and forwards it to everyone else.

use super::{ApplyContext, Authority, MessageKind, Replicated};
use crate::batching::BulkPolicy;
use crate::error::ApplyError;
use crate::transport::{PeerId, Reliability};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigAction {
    pub origin: PeerId,
    pub cell: i32,
}

impl Default for DigAction {
    fn default() -> Self {
        Self {
            origin: PeerId(0),
            cell: 0,
        }
    }
}

impl Replicated for DigAction {
    const KIND: MessageKind = MessageKind::DigAction;
    const AUTHORITY: Authority = Authority::Either;
    const RELIABILITY: Reliability = Reliability::Reliable;
    const REBROADCAST: bool = true;

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        ctx.world.dig(self.cell, self.origin);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildAction {
    pub origin: PeerId,
    pub cell: i32,
    pub prefab: String,
    pub orientation: u8,
    pub materials: Vec<String>,
}

impl Default for BuildAction {
    fn default() -> Self {
        Self {
            origin: PeerId(0),
            cell: 0,
            prefab: String::new(),
            orientation: 0,
            materials: Vec::new(),
        }
    }
}

impl Replicated for BuildAction {
    const KIND: MessageKind = MessageKind::BuildAction;
    const AUTHORITY: Authority = Authority::Either;
    const RELIABILITY: Reliability = Reliability::Reliable;
    const REBROADCAST: bool = true;

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        ctx.world.build(
            self.cell,
            &self.prefab,
            self.orientation,
            &self.materials,
            self.origin,
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeconstructAction {
    pub origin: PeerId,
    pub cell: i32,
    pub layer: u8,
}

impl Default for DeconstructAction {
    fn default() -> Self {
        Self {
            origin: PeerId(0),
            cell: 0,
            layer: 1,
        }
    }
}

impl Replicated for DeconstructAction {
    const KIND: MessageKind = MessageKind::DeconstructAction;
    const AUTHORITY: Authority = Authority::Either;
    const RELIABILITY: Reliability = Reliability::Reliable;
    const REBROADCAST: bool = true;

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        ctx.world.deconstruct(self.cell, self.layer, self.origin);
        Ok(())
    }
}

/// Remote player cursor position, in world units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorMoved {
    pub origin: PeerId,
    pub x: f32,
    pub y: f32,
}

impl Default for CursorMoved {
    fn default() -> Self {
        Self {
            origin: PeerId(0),
            x: 0.0,
            y: 0.0,
        }
    }
}

impl Replicated for CursorMoved {
    const KIND: MessageKind = MessageKind::CursorMoved;
    const AUTHORITY: Authority = Authority::Either;
    const RELIABILITY: Reliability = Reliability::Unreliable;
    const REBROADCAST: bool = true;
    const BULK: Option<BulkPolicy> = Some(BulkPolicy {
        max_batch_size: 8,
        interval_ms: 50,
    });

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        ctx.world.move_cursor(self.origin, self.x, self.y);
        Ok(())
    }
}
