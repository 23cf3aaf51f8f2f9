//! Error types for the replication core
//!
//! Each concern gets its own enum so callers can tell recoverable,
//! per-message failures apart from connection-fatal and startup-fatal ones.

use crate::identity::NetId;
use crate::session::SessionRole;
use crate::transport::PeerId;
use thiserror::Error;

/// Failure to turn bytes into a message, or a message into bytes
#[derive(Debug, Error)]
pub enum CodecError {
    /// Fewer than six bytes were available for the frame header
    #[error("frame header needs {needed} bytes, only {available} available")]
    IncompleteHeader { needed: usize, available: usize },

    /// The header announced more payload than the buffer holds
    #[error("payload truncated: header announced {expected} bytes, only {available} available")]
    TruncatedPayload { expected: usize, available: usize },

    /// The tag is not registered in the catalog; the payload can be skipped
    #[error("unknown message kind {tag} ({payload_length} payload bytes)")]
    UnknownMessageKind { tag: u16, payload_length: usize },

    /// The payload did not deserialize into the registered kind
    #[error("malformed payload for message kind {tag}: {source}")]
    Payload {
        tag: u16,
        #[source]
        source: bincode::Error,
    },

    /// The payload is larger than a frame may carry
    #[error("payload of {0} bytes exceeds the frame length limit")]
    PayloadTooLarge(usize),

    /// A stream header announced more payload than the receiver buffers
    #[error("frame announces {announced} payload bytes, limit is {limit}")]
    FrameTooLarge { announced: usize, limit: usize },

    /// A batch envelope nested another batch
    #[error("batch envelopes cannot contain batches")]
    NestedBatch,
}

impl CodecError {
    /// Whether the stream can continue after this error.
    ///
    /// Truncation and oversized stream frames cannot be resynchronized;
    /// everything else is confined to a single frame whose length is known.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            CodecError::IncompleteHeader { .. }
                | CodecError::TruncatedPayload { .. }
                | CodecError::FrameTooLarge { .. }
        )
    }
}

/// Startup-time misconfiguration. Never recovered from.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("message kind {tag} registered twice")]
    DuplicateKind { tag: u16 },

    #[error("invalid bulk policy for {kind}: {reason}")]
    InvalidBulkPolicy { kind: String, reason: String },

    #[error("unknown message kind name {0:?} in configuration")]
    UnknownKindName(String),

    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),

    #[error("failed to read configuration file {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Failure reported by a transport implementation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    UnknownPeer(PeerId),

    #[error("transport is closed")]
    Closed,

    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Rejected outbound send
#[derive(Debug, Error)]
pub enum SendError {
    #[error("cannot send while not in a session")]
    NotInSession,

    /// Clients may only address the host; fan-out goes through the host
    #[error("clients may only send to the host, not to peer {0}")]
    ClientFanOut(PeerId),

    #[error("clients cannot broadcast; send to the host instead")]
    ClientBroadcast,

    #[error("only clients have a host to send to")]
    NotAClient,

    /// The receiving role would drop the kind as an authority violation
    #[error("a {role} may not send {kind} messages")]
    Unauthorized {
        kind: &'static str,
        role: SessionRole,
    },

    /// A local action of a kind this role never applies
    #[error("{kind} messages are not applied on a {role}")]
    NotApplicable {
        kind: &'static str,
        role: SessionRole,
    },

    #[error("message kind {0} is not in the catalog")]
    Unregistered(&'static str),

    /// The local apply of an action failed, so it was not shared
    #[error("local apply failed: {0}")]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Misuse of the identity registry
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// Only the host allocates ids
    #[error("only the host may allocate network ids")]
    NotHost,

    /// Only clients bind ids allocated elsewhere
    #[error("only clients may bind host-allocated ids")]
    NotClient,

    #[error("network id 0 is reserved")]
    ReservedId,

    #[error("network id space exhausted")]
    Exhausted,
}

/// Invalid session-role transition
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("cannot go from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

/// Why a decoded message had no effect when applied
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApplyError {
    /// Expected under reordering; the next full-state update corrects it
    #[error("network id {0} is not registered on this peer")]
    UnresolvedIdentity(NetId),

    #[error("entity for network id {0} no longer exists")]
    StaleEntity(NetId),

    #[error("network id 0 is not a valid target")]
    InvalidTarget,

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_errors_are_send_sync() {
        assert_send_sync::<CodecError>();
        assert_send_sync::<TransportError>();
        assert_send_sync::<SendError>();
        assert_send_sync::<ConfigurationError>();
    }

    #[test]
    fn test_truncation_is_not_recoverable() {
        let err = CodecError::TruncatedPayload {
            expected: 10,
            available: 4,
        };
        assert!(!err.is_recoverable());

        let err = CodecError::UnknownMessageKind {
            tag: 999,
            payload_length: 3,
        };
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_error_messages() {
        let err = ConfigurationError::DuplicateKind { tag: 4 };
        assert!(format!("{}", err).contains("registered twice"));

        let err = SendError::ClientFanOut(PeerId(7));
        assert!(format!("{}", err).contains("peer:7"));

        let err = SendError::Unauthorized {
            kind: "EntitySpawn",
            role: SessionRole::Client,
        };
        assert_eq!(
            format!("{}", err),
            "a client may not send EntitySpawn messages"
        );
    }
}
