//! Client session registry.
//!
//! Tracks every open session, its per-world role and last activity. Guarded
//! by its own lock so topology queries never wait on a world's scene.

use crate::error::{Result, UwdsError};
use crate::types::{ClientInfo, Link, Role};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use underworlds_env::{ClientId, Timestamp};

#[derive(Debug, Clone)]
struct Session {
    name: String,
    links: BTreeMap<String, Link>,
    /// Cleared on close or eviction; inactive sessions reject every call
    active: bool,
}

/// Registry of connected clients.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<ClientId, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session. Names are not deduplicated.
    pub fn register(&self, client: ClientId, name: impl Into<String>) {
        self.sessions.write().insert(
            client,
            Session {
                name: name.into(),
                links: BTreeMap::new(),
                active: true,
            },
        );
    }

    /// Fails with `UnknownClient` unless the session is open.
    pub fn ensure_active(&self, client: ClientId) -> Result<()> {
        match self.sessions.read().get(&client) {
            Some(session) if session.active => Ok(()),
            _ => Err(UwdsError::UnknownClient(client)),
        }
    }

    pub fn name_of(&self, client: ClientId) -> Option<String> {
        self.sessions.read().get(&client).map(|s| s.name.clone())
    }

    /// Records that `client` used `world` with `role`.
    ///
    /// A READER link is replaced by any other role; PROVIDER and MONITOR
    /// links are never downgraded. The activity stamp is always refreshed.
    pub fn record_access(
        &self,
        client: ClientId,
        world: &str,
        role: Role,
        now: Timestamp,
    ) -> Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&client)
            .filter(|s| s.active)
            .ok_or(UwdsError::UnknownClient(client))?;

        let link = session.links.entry(world.to_string()).or_insert(Link {
            role,
            last_activity: now,
        });
        if link.role == Role::Reader {
            link.role = role;
        }
        link.last_activity = now;
        Ok(())
    }

    /// Marks a session inactive. Returns false if it was already inactive or
    /// unknown.
    pub fn deactivate(&self, client: ClientId) -> bool {
        match self.sessions.write().get_mut(&client) {
            Some(session) if session.active => {
                session.active = false;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, client: ClientId) -> bool {
        self.sessions.write().remove(&client).is_some()
    }

    /// Deactivates and removes a session in one step.
    pub fn evict(&self, client: ClientId) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(&client) {
            Some(session) if session.active => {
                sessions.remove(&client);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.sessions.read().keys().copied().collect()
    }

    /// Snapshot of active sessions for the topology view.
    pub fn clients(&self) -> BTreeMap<ClientId, ClientInfo> {
        self.sessions
            .read()
            .iter()
            .filter(|(_, s)| s.active)
            .map(|(id, s)| {
                (
                    *id,
                    ClientInfo {
                        name: s.name.clone(),
                        links: s.links.clone(),
                    },
                )
            })
            .collect()
    }
}
