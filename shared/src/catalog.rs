//! Registry of message kinds
//!
//! The catalog maps wire tags to everything the codec and the pipeline need
//! to know about a kind: how to decode it, who may apply it, how it travels
//! and whether it is coalesced. It is assembled once at startup through a
//! [`CatalogBuilder`] and is read-only afterwards; share it behind an `Arc`.
//!
//! ```
//! use shared::catalog::MessageCatalog;
//! use shared::messages::{DigAction, EntitySpawn};
//!
//! let catalog = MessageCatalog::builder()
//!     .register::<EntitySpawn>()?
//!     .register::<DigAction>()?
//!     .build();
//! assert_eq!(catalog.len(), 2);
//! # Ok::<(), shared::error::ConfigurationError>(())
//! ```

use crate::batching::BulkPolicy;
use crate::error::{CodecError, ConfigurationError};
use crate::messages::{
    Authority, Batch, BuildAction, CellUpdate, CursorMoved, DeconstructAction, DigAction,
    EntityDestroy, EntitySpawn, FullSyncRequest, Message, MessageKind, OperationalState,
    Replicated, ToggleEffect,
};
use crate::transport::Reliability;
use std::collections::BTreeMap;

type DecodeFn = fn(&MessageCatalog, &[u8]) -> Result<Message, CodecError>;
type ConstructFn = fn() -> Message;

fn decode_replicated<M: Replicated>(
    _catalog: &MessageCatalog,
    payload: &[u8],
) -> Result<Message, CodecError> {
    bincode::deserialize::<M>(payload)
        .map(Into::into)
        .map_err(|source| CodecError::Payload {
            tag: M::KIND.tag(),
            source,
        })
}

fn construct_default<M: Replicated>() -> Message {
    M::default().into()
}

/// Static properties of one registered kind
#[derive(Clone, Copy)]
pub struct KindDescriptor {
    pub kind: MessageKind,
    pub authority: Authority,
    pub reliability: Reliability,
    pub rebroadcast: bool,
    pub bulk: Option<BulkPolicy>,
    construct: Option<ConstructFn>,
    decode: DecodeFn,
}

impl KindDescriptor {
    pub fn of<M: Replicated>() -> Self {
        Self {
            kind: M::KIND,
            authority: M::AUTHORITY,
            reliability: M::RELIABILITY,
            rebroadcast: M::REBROADCAST,
            bulk: M::BULK,
            construct: Some(construct_default::<M>),
            decode: decode_replicated::<M>,
        }
    }

    /// The batch envelope. Its rules are those of the kind it carries.
    pub fn batch() -> Self {
        Self {
            kind: MessageKind::Batch,
            authority: Authority::Either,
            reliability: Reliability::Reliable,
            rebroadcast: false,
            bulk: None,
            construct: None,
            decode: Batch::decode,
        }
    }

    pub fn tag(&self) -> u16 {
        self.kind.tag()
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

impl std::fmt::Debug for KindDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindDescriptor")
            .field("kind", &self.kind)
            .field("authority", &self.authority)
            .field("reliability", &self.reliability)
            .field("rebroadcast", &self.rebroadcast)
            .field("bulk", &self.bulk)
            .finish()
    }
}

#[derive(Default)]
pub struct CatalogBuilder {
    descriptors: BTreeMap<u16, KindDescriptor>,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every kind this crate defines, with default bulk policies
    pub fn standard() -> Self {
        let descriptors = [
            KindDescriptor::batch(),
            KindDescriptor::of::<EntitySpawn>(),
            KindDescriptor::of::<EntityDestroy>(),
            KindDescriptor::of::<ToggleEffect>(),
            KindDescriptor::of::<OperationalState>(),
            KindDescriptor::of::<DigAction>(),
            KindDescriptor::of::<BuildAction>(),
            KindDescriptor::of::<DeconstructAction>(),
            KindDescriptor::of::<CellUpdate>(),
            KindDescriptor::of::<CursorMoved>(),
            KindDescriptor::of::<FullSyncRequest>(),
        ];
        Self {
            descriptors: descriptors.into_iter().map(|d| (d.tag(), d)).collect(),
        }
    }

    pub fn register<M: Replicated>(self) -> Result<Self, ConfigurationError> {
        self.register_descriptor(KindDescriptor::of::<M>())
    }

    pub fn register_batch(self) -> Result<Self, ConfigurationError> {
        self.register_descriptor(KindDescriptor::batch())
    }

    pub fn register_descriptor(
        mut self,
        descriptor: KindDescriptor,
    ) -> Result<Self, ConfigurationError> {
        if self.descriptors.contains_key(&descriptor.tag()) {
            return Err(ConfigurationError::DuplicateKind {
                tag: descriptor.tag(),
            });
        }
        if let Some(policy) = descriptor.bulk {
            check_policy(descriptor.kind, &policy)?;
        }
        self.descriptors.insert(descriptor.tag(), descriptor);
        Ok(self)
    }

    /// Replace the bulk policy of registered kinds, keyed by kind name
    pub fn with_bulk_overrides(
        mut self,
        overrides: &BTreeMap<String, BulkPolicy>,
    ) -> Result<Self, ConfigurationError> {
        for (name, policy) in overrides {
            let kind = MessageKind::from_name(name)
                .ok_or_else(|| ConfigurationError::UnknownKindName(name.clone()))?;
            check_policy(kind, policy)?;
            let descriptor = self
                .descriptors
                .get_mut(&kind.tag())
                .ok_or_else(|| ConfigurationError::UnknownKindName(name.clone()))?;
            descriptor.bulk = Some(*policy);
        }
        Ok(self)
    }

    pub fn build(self) -> MessageCatalog {
        MessageCatalog {
            descriptors: self.descriptors,
        }
    }
}

fn check_policy(kind: MessageKind, policy: &BulkPolicy) -> Result<(), ConfigurationError> {
    if kind == MessageKind::Batch {
        return Err(ConfigurationError::InvalidBulkPolicy {
            kind: kind.name().to_string(),
            reason: "batch envelopes cannot be batched".to_string(),
        });
    }
    if policy.max_batch_size == 0 {
        return Err(ConfigurationError::InvalidBulkPolicy {
            kind: kind.name().to_string(),
            reason: "max_batch_size must be at least 1".to_string(),
        });
    }
    Ok(())
}

/// Immutable tag -> kind table
pub struct MessageCatalog {
    descriptors: BTreeMap<u16, KindDescriptor>,
}

impl MessageCatalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::new()
    }

    pub fn standard() -> Self {
        CatalogBuilder::standard().build()
    }

    pub fn get(&self, tag: u16) -> Option<&KindDescriptor> {
        self.descriptors.get(&tag)
    }

    pub fn descriptor(&self, kind: MessageKind) -> Option<&KindDescriptor> {
        self.get(kind.tag())
    }

    pub fn contains(&self, tag: u16) -> bool {
        self.descriptors.contains_key(&tag)
    }

    /// Registered kinds in tag order
    pub fn descriptors(&self) -> impl Iterator<Item = &KindDescriptor> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Fresh default instance of a kind, ready to be filled in
    pub fn construct(&self, tag: u16) -> Option<Message> {
        self.get(tag)?.construct.map(|construct| construct())
    }

    /// Decode a payload of the kind registered under `tag`
    pub fn decode_payload(&self, tag: u16, payload: &[u8]) -> Result<Message, CodecError> {
        let descriptor = self.get(tag).ok_or(CodecError::UnknownMessageKind {
            tag,
            payload_length: payload.len(),
        })?;
        (descriptor.decode)(self, payload)
    }
}

impl std::fmt::Debug for MessageCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.descriptors.values().map(|d| d.name()))
            .finish()
    }
}
