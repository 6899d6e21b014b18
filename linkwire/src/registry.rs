//! Bidirectional client registry: forward (connection -> identity) and
//! reverse (identity tuple -> connection) kept strictly consistent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::identity::{Address, ClientInfo};

/// Opaque handle identifying a connection, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

/// Monotonic generator for [`ConnectionId`]s, one per server.
#[derive(Debug, Default)]
pub struct ConnectionIdGenerator(AtomicU64);

impl ConnectionIdGenerator {
    pub fn new() -> Self {
        ConnectionIdGenerator(AtomicU64::new(0))
    }

    pub fn next(&self) -> ConnectionId {
        ConnectionId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

type ReverseKey = (Address, Option<String>, Option<String>);

fn reverse_key(info: &ClientInfo) -> ReverseKey {
    (info.address.clone(), info.name.clone(), info.group.clone())
}

/// Errors returned by registry operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A connection with this id is already registered.
    AlreadyRegistered(ConnectionId),
    /// No connection with this id is registered.
    NotFound,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::AlreadyRegistered(id) => {
                write!(f, "connection {id:?} is already registered")
            }
            RegistryError::NotFound => write!(f, "connection not found"),
        }
    }
}

impl std::error::Error for RegistryError {}

struct Inner {
    forward: HashMap<ConnectionId, ClientInfo>,
    reverse: HashMap<ReverseKey, ConnectionId>,
}

/// The server's bidirectional client registry.
///
/// `insert`/`remove`/`rename_or_regroup` update both maps under a single
/// lock so the two are never observed out of sync.
pub struct ClientRegistry {
    inner: RwLock<Inner>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        ClientRegistry {
            inner: RwLock::new(Inner {
                forward: HashMap::new(),
                reverse: HashMap::new(),
            }),
        }
    }

    pub fn insert(&self, id: ConnectionId, info: ClientInfo) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        if inner.forward.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        inner.reverse.insert(reverse_key(&info), id);
        inner.forward.insert(id, info);
        Ok(())
    }

    pub fn remove(&self, id: ConnectionId) -> Option<ClientInfo> {
        let mut inner = self.inner.write();
        let info = inner.forward.remove(&id)?;
        inner.reverse.remove(&reverse_key(&info));
        Some(info)
    }

    pub fn get(&self, id: ConnectionId) -> Option<ClientInfo> {
        self.inner.read().forward.get(&id).cloned()
    }

    /// Atomically change name and/or group for `id`, keeping both maps
    /// consistent. `None` leaves that field unchanged.
    pub fn rename_or_regroup(
        &self,
        id: ConnectionId,
        new_name: Option<Option<String>>,
        new_group: Option<Option<String>>,
    ) -> Result<(ClientInfo, ClientInfo), RegistryError> {
        let mut inner = self.inner.write();
        let old_info = inner.forward.get(&id).cloned().ok_or(RegistryError::NotFound)?;

        let mut new_info = old_info.clone();
        if let Some(name) = new_name {
            new_info.name = name;
        }
        if let Some(group) = new_group {
            new_info.group = group;
        }

        inner.reverse.remove(&reverse_key(&old_info));
        inner.reverse.insert(reverse_key(&new_info), id);
        inner.forward.insert(id, new_info.clone());

        Ok((old_info, new_info))
    }

    pub fn find_by_address(&self, address: &Address) -> Option<(ConnectionId, ClientInfo)> {
        self.find(|info| &info.address == address)
    }

    pub fn find_by_name(&self, name: &str) -> Option<(ConnectionId, ClientInfo)> {
        self.find(|info| info.name.as_deref() == Some(name))
    }

    pub fn find_by_group(&self, group: &str) -> Vec<(ConnectionId, ClientInfo)> {
        self.inner
            .read()
            .forward
            .iter()
            .filter(|(_, info)| info.group.as_deref() == Some(group))
            .map(|(id, info)| (*id, info.clone()))
            .collect()
    }

    fn find(&self, predicate: impl Fn(&ClientInfo) -> bool) -> Option<(ConnectionId, ClientInfo)> {
        self.inner
            .read()
            .forward
            .iter()
            .find(|(_, info)| predicate(info))
            .map(|(id, info)| (*id, info.clone()))
    }

    pub fn all(&self) -> Vec<(ConnectionId, ClientInfo)> {
        self.inner
            .read()
            .forward
            .iter()
            .map(|(id, info)| (*id, info.clone()))
            .collect()
    }

    /// Resolve an identifier as either an `ip:port` address or, failing
    /// that, a client name. Used by the in-band `$GETCLT$` handler.
    pub fn lookup_by_identifier(&self, identifier: &str) -> Option<(ConnectionId, ClientInfo)> {
        if let Ok(addr) = crate::identity::string_to_address(identifier) {
            if let Some(found) = self.find_by_address(&addr) {
                return Some(found);
            }
        }
        self.find_by_name(identifier)
    }

    pub fn len(&self) -> usize {
        self.inner.read().forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(host: &str, port: u16, name: Option<&str>, group: Option<&str>) -> ClientInfo {
        ClientInfo {
            address: Address {
                host: host.to_string(),
                port,
            },
            name: name.map(String::from),
            group: group.map(String::from),
        }
    }

    #[test]
    fn insert_keeps_forward_and_reverse_in_sync() {
        let registry = ClientRegistry::new();
        let gen = ConnectionIdGenerator::new();
        let id = gen.next();
        let i = info("127.0.0.1", 5001, Some("Alice"), Some("g1"));
        registry.insert(id, i.clone()).unwrap();

        assert_eq!(registry.get(id), Some(i.clone()));
        assert_eq!(registry.find_by_name("Alice"), Some((id, i.clone())));
        assert_eq!(
            registry.find_by_address(&Address {
                host: "127.0.0.1".to_string(),
                port: 5001
            }),
            Some((id, i))
        );
    }

    #[test]
    fn rename_updates_reverse_map() {
        let registry = ClientRegistry::new();
        let gen = ConnectionIdGenerator::new();
        let id = gen.next();
        registry
            .insert(id, info("127.0.0.1", 5001, Some("Alice"), Some("g1")))
            .unwrap();

        registry
            .rename_or_regroup(id, Some(Some("Bob".to_string())), None)
            .unwrap();

        assert!(registry.find_by_name("Alice").is_none());
        assert_eq!(registry.find_by_name("Bob").unwrap().0, id);
    }

    #[test]
    fn remove_clears_both_maps() {
        let registry = ClientRegistry::new();
        let gen = ConnectionIdGenerator::new();
        let id = gen.next();
        registry
            .insert(id, info("127.0.0.1", 5001, Some("Alice"), None))
            .unwrap();
        registry.remove(id);

        assert!(registry.get(id).is_none());
        assert!(registry.find_by_name("Alice").is_none());
    }

    #[test]
    fn find_by_group_returns_all_members() {
        let registry = ClientRegistry::new();
        let gen = ConnectionIdGenerator::new();
        let a = gen.next();
        let b = gen.next();
        registry
            .insert(a, info("127.0.0.1", 1, Some("A"), Some("team")))
            .unwrap();
        registry
            .insert(b, info("127.0.0.1", 2, Some("B"), Some("team")))
            .unwrap();

        let members = registry.find_by_group("team");
        assert_eq!(members.len(), 2);
    }
}
