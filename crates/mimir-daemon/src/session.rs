//! Sessions opened by HELLO and closed by BYE
//!
//! A session also ends when the last connection attached to it goes away,
//! so clients that disconnect without BYE do not leak entries.

use crate::protocol::{Data, fields};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

/// One client session
#[derive(Debug, Clone)]
pub struct Session {
    /// Session id handed to the client
    pub id: String,
    /// Free-form data the client sent with HELLO
    pub client: Data,
    /// When HELLO was answered
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Session map sent with every response
    #[must_use]
    pub fn wire(&self) -> Data {
        session_map(&self.id)
    }
}

/// Session map holding only `id`
#[must_use]
pub fn session_map(id: &str) -> Data {
    Data::from([(fields::SESSION_ID.to_string(), id.to_string())])
}

#[derive(Debug)]
struct Slot {
    session: Session,
    connections: usize,
}

/// Live sessions keyed by id
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: DashMap<String, Slot>,
}

impl SessionTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a session for a client, attached to the calling connection
    pub fn open(&self, client: Data) -> Session {
        let session = Session {
            id: Uuid::new_v4().to_string(),
            client,
            created_at: Utc::now(),
        };
        self.sessions.insert(
            session.id.clone(),
            Slot {
                session: session.clone(),
                connections: 1,
            },
        );
        tracing::debug!(session = %session.id, "Session opened");
        session
    }

    /// Look a session up by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|slot| slot.session.clone())
    }

    /// Attach another connection to a live session; `false` if it is unknown
    pub fn attach(&self, id: &str) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut slot) => {
                slot.connections += 1;
                true
            }
            None => false,
        }
    }

    /// Detach a connection, dropping the session with its last connection
    pub fn detach(&self, id: &str) {
        let removed = self.sessions.remove_if_mut(id, |_, slot| {
            slot.connections = slot.connections.saturating_sub(1);
            slot.connections == 0
        });
        if removed.is_some() {
            tracing::debug!(session = %id, "Session dropped with its last connection");
        }
    }

    /// Drop a session
    pub fn close(&self, id: &str) -> Option<Session> {
        let removed = self.sessions.remove(id).map(|(_, slot)| slot.session);
        if removed.is_some() {
            tracing::debug!(session = %id, "Session closed");
        }
        removed
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_get_close() {
        let table = SessionTable::new();
        let client = Data::from([("tool".to_string(), "maven".to_string())]);
        let session = table.open(client.clone());

        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&session.id).unwrap().client, client);
        assert_eq!(session.wire()[fields::SESSION_ID], session.id);

        assert!(table.close(&session.id).is_some());
        assert!(table.close(&session.id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_last_detach_drops_session() {
        let table = SessionTable::new();
        let session = table.open(Data::new());
        assert!(table.attach(&session.id));

        table.detach(&session.id);
        assert!(table.get(&session.id).is_some());
        table.detach(&session.id);
        assert!(table.is_empty());

        assert!(!table.attach(&session.id));
        table.detach(&session.id);
        assert!(table.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let table = SessionTable::new();
        let a = table.open(Data::new());
        let b = table.open(Data::new());
        assert_ne!(a.id, b.id);
    }
}
