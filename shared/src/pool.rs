//! Registry of live tunnel connections.

use std::sync::Arc;

use dashmap::DashMap;

use crate::conn::Conn;

/// Set of live connections, keyed by connection identity. Client-id lookups
/// are linear scans; several connections may share one client id.
#[derive(Default)]
pub struct Pool {
    conns: DashMap<u64, Arc<Conn>>,
}

impl Pool {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
        }
    }

    /// Returns any live connection.
    pub fn get_any(&self) -> Option<Arc<Conn>> {
        self.conns.iter().next().map(|entry| entry.value().clone())
    }

    /// Returns any one connection registered with `client_id`.
    pub fn get_by_id(&self, client_id: &str) -> Option<Arc<Conn>> {
        self.conns
            .iter()
            .find(|entry| entry.value().client_id() == client_id)
            .map(|entry| entry.value().clone())
    }

    /// Returns every connection registered with `client_id`.
    pub fn get_all_by_id(&self, client_id: &str) -> Vec<Arc<Conn>> {
        self.conns
            .iter()
            .filter(|entry| entry.value().client_id() == client_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn size(&self) -> usize {
        self.conns.len()
    }

    pub(crate) fn register(&self, conn: Arc<Conn>) {
        self.conns.insert(conn.id(), conn);
    }

    pub(crate) fn unregister(&self, conn: &Conn) {
        self.conns.remove(&conn.id());
    }
}
