//! Replicated message kinds
//!
//! Every kind is a plain struct implementing [`Replicated`]: its payload is
//! bincode-encoded and its `apply` mutates the local simulation. [`Message`]
//! is the closed sum over all kinds; the wire tag of each variant comes from
//! [`MessageKind`], an append-only enumeration. New kinds get the next free
//! tag and existing tags never change meaning.

mod entity;
mod tools;
mod world;

pub use entity::{EntityDestroy, EntitySpawn, OperationalState, ToggleEffect};
pub use tools::{BuildAction, CursorMoved, DeconstructAction, DigAction};
pub use world::{CellUpdate, FullSyncRequest};

use crate::batching::BulkPolicy;
use crate::catalog::MessageCatalog;
use crate::error::{ApplyError, CodecError};
use crate::identity::{IdentityRegistry, NetId};
use crate::session::SessionRole;
use crate::transport::{PeerId, Reliability};
use crate::world::{EntityKey, SimWorld};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Wire tags. Append only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum MessageKind {
    Batch = 1,
    EntitySpawn = 2,
    EntityDestroy = 3,
    ToggleEffect = 4,
    OperationalState = 5,
    DigAction = 6,
    BuildAction = 7,
    DeconstructAction = 8,
    CellUpdate = 9,
    CursorMoved = 10,
    FullSyncRequest = 11,
}

impl MessageKind {
    pub const ALL: [MessageKind; 11] = [
        MessageKind::Batch,
        MessageKind::EntitySpawn,
        MessageKind::EntityDestroy,
        MessageKind::ToggleEffect,
        MessageKind::OperationalState,
        MessageKind::DigAction,
        MessageKind::BuildAction,
        MessageKind::DeconstructAction,
        MessageKind::CellUpdate,
        MessageKind::CursorMoved,
        MessageKind::FullSyncRequest,
    ];

    pub fn tag(self) -> u16 {
        self as u16
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.tag() == tag)
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Batch => "Batch",
            MessageKind::EntitySpawn => "EntitySpawn",
            MessageKind::EntityDestroy => "EntityDestroy",
            MessageKind::ToggleEffect => "ToggleEffect",
            MessageKind::OperationalState => "OperationalState",
            MessageKind::DigAction => "DigAction",
            MessageKind::BuildAction => "BuildAction",
            MessageKind::DeconstructAction => "DeconstructAction",
            MessageKind::CellUpdate => "CellUpdate",
            MessageKind::CursorMoved => "CursorMoved",
            MessageKind::FullSyncRequest => "FullSyncRequest",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }
}

/// Which role may apply a kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    /// Applied only on the host, e.g. requests from clients
    HostOnly,
    /// Applied only on clients, e.g. state broadcast by the host
    ClientOnly,
    /// Peer-initiated actions: the host applies and forwards, clients apply the forward
    Either,
}

impl Authority {
    pub fn permits(self, role: SessionRole) -> bool {
        match self {
            Authority::HostOnly => role == SessionRole::Host,
            Authority::ClientOnly => role == SessionRole::Client,
            Authority::Either => role != SessionRole::NotInSession,
        }
    }
}

/// State a message may touch while being applied
pub struct ApplyContext<'a> {
    pub role: SessionRole,
    /// Connection the message arrived on
    pub sender: PeerId,
    pub registry: &'a mut IdentityRegistry,
    pub world: &'a mut dyn SimWorld,
    /// Messages to send back to `sender` once applied
    pub replies: Vec<Message>,
}

impl<'a> ApplyContext<'a> {
    pub fn new(
        role: SessionRole,
        sender: PeerId,
        registry: &'a mut IdentityRegistry,
        world: &'a mut dyn SimWorld,
    ) -> Self {
        Self {
            role,
            sender,
            registry,
            world,
            replies: Vec::new(),
        }
    }

    /// Resolve a target id to a live local entity.
    ///
    /// A mapping whose entity has vanished locally is released on the spot.
    pub fn target(&mut self, id: NetId) -> Result<EntityKey, ApplyError> {
        if !id.is_valid() {
            return Err(ApplyError::InvalidTarget);
        }
        let entity = self
            .registry
            .resolve(id)
            .ok_or(ApplyError::UnresolvedIdentity(id))?;
        if !self.world.contains(entity) {
            self.registry.release(id);
            return Err(ApplyError::StaleEntity(id));
        }
        Ok(entity)
    }

    pub fn reply(&mut self, message: impl Into<Message>) {
        self.replies.push(message.into());
    }
}

/// A replicated message kind
pub trait Replicated: Serialize + DeserializeOwned + Default + Clone + Into<Message> {
    const KIND: MessageKind;
    const AUTHORITY: Authority;
    const RELIABILITY: Reliability;
    /// Forwarded by the host to every other peer after being applied
    const REBROADCAST: bool = false;
    /// Coalesce instead of sending immediately, unless configured otherwise
    const BULK: Option<BulkPolicy> = None;

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError>;
}

/// Coalesced messages of a single kind
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    kind: MessageKind,
    items: Vec<Message>,
}

#[derive(Serialize, Deserialize)]
struct BatchWire {
    kind: u16,
    payloads: Vec<Vec<u8>>,
}

impl Batch {
    /// Build a batch; every item must be of `kind` and none may be a batch
    pub fn new(kind: MessageKind, items: Vec<Message>) -> Result<Self, CodecError> {
        if kind == MessageKind::Batch || items.iter().any(|m| m.kind() != kind) {
            return Err(CodecError::NestedBatch);
        }
        Ok(Self { kind, items })
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn items(&self) -> &[Message] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Message> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn encode_payload(&self) -> Result<Vec<u8>, CodecError> {
        let payloads = self
            .items
            .iter()
            .map(Message::encode_payload)
            .collect::<Result<Vec<_>, _>>()?;
        let wire = BatchWire {
            kind: self.kind.tag(),
            payloads,
        };
        bincode::serialize(&wire).map_err(|source| CodecError::Payload {
            tag: MessageKind::Batch.tag(),
            source,
        })
    }

    /// Decode a batch payload, decoding each item through the catalog
    pub(crate) fn decode(catalog: &MessageCatalog, payload: &[u8]) -> Result<Message, CodecError> {
        let wire: BatchWire =
            bincode::deserialize(payload).map_err(|source| CodecError::Payload {
                tag: MessageKind::Batch.tag(),
                source,
            })?;
        if wire.kind == MessageKind::Batch.tag() {
            return Err(CodecError::NestedBatch);
        }
        let kind = MessageKind::from_tag(wire.kind)
            .filter(|k| catalog.contains(k.tag()))
            .ok_or(CodecError::UnknownMessageKind {
                tag: wire.kind,
                payload_length: payload.len(),
            })?;
        let items = wire
            .payloads
            .iter()
            .map(|p| catalog.decode_payload(kind.tag(), p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Message::Batch(Batch::new(kind, items)?))
    }
}

/// Every replicated message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Batch(Batch),
    EntitySpawn(EntitySpawn),
    EntityDestroy(EntityDestroy),
    ToggleEffect(ToggleEffect),
    OperationalState(OperationalState),
    DigAction(DigAction),
    BuildAction(BuildAction),
    DeconstructAction(DeconstructAction),
    CellUpdate(CellUpdate),
    CursorMoved(CursorMoved),
    FullSyncRequest(FullSyncRequest),
}

macro_rules! impl_from_payload {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Message {
                fn from(payload: $variant) -> Self {
                    Message::$variant(payload)
                }
            }
        )*
    };
}

impl_from_payload!(
    EntitySpawn,
    EntityDestroy,
    ToggleEffect,
    OperationalState,
    DigAction,
    BuildAction,
    DeconstructAction,
    CellUpdate,
    CursorMoved,
    FullSyncRequest,
);

impl From<Batch> for Message {
    fn from(batch: Batch) -> Self {
        Message::Batch(batch)
    }
}

fn encode_replicated<M: Replicated>(payload: &M) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(payload).map_err(|source| CodecError::Payload {
        tag: M::KIND.tag(),
        source,
    })
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Batch(_) => MessageKind::Batch,
            Message::EntitySpawn(_) => MessageKind::EntitySpawn,
            Message::EntityDestroy(_) => MessageKind::EntityDestroy,
            Message::ToggleEffect(_) => MessageKind::ToggleEffect,
            Message::OperationalState(_) => MessageKind::OperationalState,
            Message::DigAction(_) => MessageKind::DigAction,
            Message::BuildAction(_) => MessageKind::BuildAction,
            Message::DeconstructAction(_) => MessageKind::DeconstructAction,
            Message::CellUpdate(_) => MessageKind::CellUpdate,
            Message::CursorMoved(_) => MessageKind::CursorMoved,
            Message::FullSyncRequest(_) => MessageKind::FullSyncRequest,
        }
    }

    /// Kind whose authority and reliability rules govern this message.
    /// For a batch that is the kind of its items.
    pub fn governing_kind(&self) -> MessageKind {
        match self {
            Message::Batch(batch) => batch.kind(),
            other => other.kind(),
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Message::Batch(batch) => batch.encode_payload(),
            Message::EntitySpawn(m) => encode_replicated(m),
            Message::EntityDestroy(m) => encode_replicated(m),
            Message::ToggleEffect(m) => encode_replicated(m),
            Message::OperationalState(m) => encode_replicated(m),
            Message::DigAction(m) => encode_replicated(m),
            Message::BuildAction(m) => encode_replicated(m),
            Message::DeconstructAction(m) => encode_replicated(m),
            Message::CellUpdate(m) => encode_replicated(m),
            Message::CursorMoved(m) => encode_replicated(m),
            Message::FullSyncRequest(m) => encode_replicated(m),
        }
    }

    /// Apply to local state. Batches are unpacked by the dispatch pipeline
    /// and applying one directly applies each item in order.
    pub fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        match self {
            Message::Batch(batch) => {
                let mut result = Ok(());
                for item in batch.items() {
                    if let Err(e) = item.apply(ctx) {
                        result = Err(e);
                    }
                }
                result
            }
            Message::EntitySpawn(m) => m.apply(ctx),
            Message::EntityDestroy(m) => m.apply(ctx),
            Message::ToggleEffect(m) => m.apply(ctx),
            Message::OperationalState(m) => m.apply(ctx),
            Message::DigAction(m) => m.apply(ctx),
            Message::BuildAction(m) => m.apply(ctx),
            Message::DeconstructAction(m) => m.apply(ctx),
            Message::CellUpdate(m) => m.apply(ctx),
            Message::CursorMoved(m) => m.apply(ctx),
            Message::FullSyncRequest(m) => m.apply(ctx),
        }
    }

    /// Originator carried by peer-initiated actions.
    ///
    /// A batch has an origin only when every item carries the same one, as
    /// after [`Message::stamp_origin`]; an empty or mixed batch has none.
    pub fn origin(&self) -> Option<PeerId> {
        match self {
            Message::DigAction(m) => Some(m.origin),
            Message::BuildAction(m) => Some(m.origin),
            Message::DeconstructAction(m) => Some(m.origin),
            Message::CursorMoved(m) => Some(m.origin),
            Message::Batch(batch) => {
                let first = batch.items().first()?.origin()?;
                batch
                    .items()
                    .iter()
                    .all(|item| item.origin() == Some(first))
                    .then_some(first)
            }
            _ => None,
        }
    }

    /// Overwrite the originator of a peer-initiated action. The host does
    /// this with the connection a message arrived on, so a client cannot
    /// act in another peer's name.
    pub fn stamp_origin(&mut self, origin: PeerId) {
        match self {
            Message::DigAction(m) => m.origin = origin,
            Message::BuildAction(m) => m.origin = origin,
            Message::DeconstructAction(m) => m.origin = origin,
            Message::CursorMoved(m) => m.origin = origin,
            Message::Batch(batch) => {
                for item in batch.items.iter_mut() {
                    item.stamp_origin(origin);
                }
            }
            _ => {}
        }
    }
}
