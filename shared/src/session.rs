//! Session role state machine
//!
//! Every dispatch and send decision is gated on the role. The role lives in
//! a [`Session`] value that is passed to components explicitly, so the
//! authority rules can be exercised without a live connection.

use crate::error::SessionError;
use crate::transport::PeerId;
use log::info;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionRole {
    #[default]
    NotInSession,
    Host,
    Client,
}

impl SessionRole {
    pub fn name(&self) -> &'static str {
        match self {
            SessionRole::NotInSession => "not-in-session",
            SessionRole::Host => "host",
            SessionRole::Client => "client",
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Current role plus, for clients, the connection that leads to the host
///
/// Allowed transitions: `NotInSession -> Host`, `NotInSession -> Client`,
/// and any role back to `NotInSession`.
#[derive(Debug, Clone, Default)]
pub struct Session {
    role: SessionRole,
    host_peer: Option<PeerId>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn is_host(&self) -> bool {
        self.role == SessionRole::Host
    }

    pub fn is_client(&self) -> bool {
        self.role == SessionRole::Client
    }

    /// The host connection while acting as a client
    pub fn host_peer(&self) -> Option<PeerId> {
        self.host_peer
    }

    pub fn start_host(&mut self) -> Result<(), SessionError> {
        self.transition(SessionRole::Host)?;
        info!("Session started as host");
        Ok(())
    }

    pub fn join(&mut self, host_peer: PeerId) -> Result<(), SessionError> {
        self.transition(SessionRole::Client)?;
        self.host_peer = Some(host_peer);
        info!("Session joined as client of {}", host_peer);
        Ok(())
    }

    /// Leave any session. Always allowed.
    pub fn leave(&mut self) {
        if self.role != SessionRole::NotInSession {
            info!("Session ended ({})", self.role);
        }
        self.role = SessionRole::NotInSession;
        self.host_peer = None;
    }

    fn transition(&mut self, to: SessionRole) -> Result<(), SessionError> {
        if self.role != SessionRole::NotInSession {
            return Err(SessionError::InvalidTransition {
                from: self.role.name(),
                to: to.name(),
            });
        }
        self.role = to;
        Ok(())
    }
}
