//! Connection registry
//!
//! Tracks every peer connection by address together with the indices the
//! introduction handshake depends on: which `(mirror, base ip)` pairs are
//! taken and how many connections each base IP holds. All indices live
//! behind one lock so they cannot drift apart.
//!
//! Connection workers call [`ConnectionRegistry::pending`] and
//! [`ConnectionRegistry::connected`] directly; everything else is driven
//! from the event loop.

use crate::network::message::IntroductionMessage;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;

/// Registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection {0} is already registered")]
    AlreadyRegistered(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Connection {0} does not exist")]
    NotExist(String),
    #[error("Mirror {mirror} is already registered for {ip}")]
    IPMirrorAlreadyRegistered { mirror: u32, ip: String },
    #[error("Connection {0} is already introduced")]
    AlreadyIntroduced(String),
}

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Outgoing dial in flight
    Pending,
    /// Socket established, waiting for the peer's introduction
    Connected,
    /// Handshake complete
    Introduced,
}

/// One peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub address: String,
    pub state: ConnectionState,
    pub outgoing: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub mirror: Option<u32>,
    pub listen_port: u16,
    pub protocol_version: i32,
    pub height: u64,
    pub user_agent: Option<String>,
    pub last_received: Option<DateTime<Utc>>,
    pub last_sent: Option<DateTime<Utc>>,
}

impl Connection {
    fn new(address: &str, state: ConnectionState, outgoing: bool, listen_port: u16) -> Self {
        Self {
            address: address.to_string(),
            state,
            outgoing,
            connected_at: None,
            mirror: None,
            listen_port,
            protocol_version: 0,
            height: 0,
            user_agent: None,
            last_received: None,
            last_sent: None,
        }
    }

    pub fn is_introduced(&self) -> bool {
        self.state == ConnectionState::Introduced
    }

    /// Address the peer accepts connections on
    pub fn listen_address(&self) -> Option<String> {
        let (ip, _) = split_addr(&self.address).ok()?;
        Some(SocketAddr::new(ip.parse().ok()?, self.listen_port).to_string())
    }
}

/// Split `ip:port` into its base IP and port
pub fn split_addr(addr: &str) -> Result<(String, u16), ConnectionError> {
    let parsed: SocketAddr = addr
        .parse()
        .map_err(|_| ConnectionError::InvalidAddress(addr.to_string()))?;
    Ok((parsed.ip().to_string(), parsed.port()))
}

#[derive(Debug, Default)]
struct Inner {
    conns: HashMap<String, Connection>,
    /// mirror -> base ip -> listen port
    mirrors: HashMap<u32, HashMap<String, u16>>,
    ip_counts: HashMap<String, usize>,
}

impl Inner {
    fn can_update_mirror(&self, ip: &str, mirror: u32) -> bool {
        self.mirrors
            .get(&mirror)
            .map_or(true, |ips| !ips.contains_key(ip))
    }

    fn insert(&mut self, conn: Connection, ip: String) -> Connection {
        *self.ip_counts.entry(ip).or_insert(0) += 1;
        self.conns.insert(conn.address.clone(), conn.clone());
        conn
    }
}

/// Thread-safe registry of peer connections
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outgoing dial to `addr`
    pub fn pending(&self, addr: &str) -> Result<Connection, ConnectionError> {
        let (ip, port) = split_addr(addr)?;
        let mut inner = self.inner.lock();

        if inner.conns.contains_key(addr) {
            return Err(ConnectionError::AlreadyRegistered(addr.to_string()));
        }

        log::debug!("Connection {} is pending", addr);
        Ok(inner.insert(
            Connection::new(addr, ConnectionState::Pending, true, port),
            ip,
        ))
    }

    /// Mark `addr` as connected, creating an incoming entry if it is unknown
    pub fn connected(&self, addr: &str) -> Result<Connection, ConnectionError> {
        let (ip, _) = split_addr(addr)?;
        let now = Utc::now();
        let mut inner = self.inner.lock();

        if let Some(conn) = inner.conns.get_mut(addr) {
            if conn.state != ConnectionState::Pending {
                log::warn!(
                    "Connection {} became connected while in state {:?}",
                    addr,
                    conn.state
                );
            }
            if conn.address != addr {
                log::warn!(
                    "Connection address mismatch: registered {}, connected {}",
                    conn.address,
                    addr
                );
            }
            conn.state = ConnectionState::Connected;
            conn.connected_at = Some(now);
            return Ok(conn.clone());
        }

        let mut conn = Connection::new(addr, ConnectionState::Connected, false, 0);
        conn.connected_at = Some(now);
        Ok(inner.insert(conn, ip))
    }

    /// Complete the handshake for `addr`
    pub fn introduced(
        &self,
        addr: &str,
        intro: &IntroductionMessage,
    ) -> Result<Connection, ConnectionError> {
        let (ip, _) = split_addr(addr)?;
        let mut inner = self.inner.lock();

        let conn = inner
            .conns
            .get(addr)
            .cloned()
            .ok_or_else(|| ConnectionError::NotExist(addr.to_string()))?;

        if conn.mirror.is_some() {
            return Err(ConnectionError::AlreadyIntroduced(addr.to_string()));
        }
        if conn.state != ConnectionState::Connected {
            log::warn!(
                "Connection {} introduced while in state {:?}",
                addr,
                conn.state
            );
        }

        let listen_port = if conn.outgoing {
            if intro.listen_port != conn.listen_port {
                log::debug!(
                    "Outgoing peer {} reports listen port {}, keeping dial port {}",
                    addr,
                    intro.listen_port,
                    conn.listen_port
                );
            }
            conn.listen_port
        } else {
            intro.listen_port
        };

        if !inner.can_update_mirror(&ip, intro.mirror) {
            return Err(ConnectionError::IPMirrorAlreadyRegistered {
                mirror: intro.mirror,
                ip,
            });
        }

        let mut updated = conn;
        updated.mirror = Some(intro.mirror);
        updated.protocol_version = intro.protocol_version;
        updated.listen_port = listen_port;
        updated.state = ConnectionState::Introduced;

        inner
            .mirrors
            .entry(intro.mirror)
            .or_default()
            .insert(ip, listen_port);
        inner.conns.insert(addr.to_string(), updated.clone());

        Ok(updated)
    }

    /// Update fields of `addr` in place.
    ///
    /// # Panics
    ///
    /// If `mutate` changes the mirror or the address.
    pub fn modify<F>(&self, addr: &str, mutate: F) -> Result<Connection, ConnectionError>
    where
        F: FnOnce(&mut Connection),
    {
        let mut inner = self.inner.lock();
        let current = inner
            .conns
            .get(addr)
            .ok_or_else(|| ConnectionError::NotExist(addr.to_string()))?;

        let mut updated = current.clone();
        mutate(&mut updated);

        if updated.mirror != current.mirror {
            log::error!(
                "Connection {} mirror changed by modify: {:?} -> {:?}",
                addr,
                current.mirror,
                updated.mirror
            );
            panic!("connection mirror must not be changed by modify");
        }
        if updated.address != current.address {
            log::error!(
                "Connection {} address changed by modify to {}",
                addr,
                updated.address
            );
            panic!("connection address must not be changed by modify");
        }

        inner.conns.insert(addr.to_string(), updated.clone());
        Ok(updated)
    }

    /// Remove `addr` and its index entries. No-op if absent.
    pub fn remove(&self, addr: &str) -> Option<Connection> {
        let mut inner = self.inner.lock();
        let conn = inner.conns.remove(addr)?;

        let ip = match split_addr(addr) {
            Ok((ip, _)) => ip,
            Err(_) => {
                log::error!("Registered connection has unparsable address {}", addr);
                panic!("registered connection address must parse");
            }
        };

        if let Some(mirror) = conn.mirror {
            let removed = match inner.mirrors.get_mut(&mirror) {
                Some(ips) => {
                    let removed = ips.remove(&ip).is_some();
                    if ips.is_empty() {
                        inner.mirrors.remove(&mirror);
                    }
                    removed
                }
                None => false,
            };
            if !removed {
                log::error!("Mirror {} of {} missing from the mirror index", mirror, addr);
                panic!("mirror index out of sync with connections");
            }
        }

        match inner.ip_counts.get_mut(&ip) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                inner.ip_counts.remove(&ip);
            }
            None => log::warn!("IP counter for {} was already zero on remove", ip),
        }

        Some(conn)
    }

    pub fn get(&self, addr: &str) -> Option<Connection> {
        self.inner.lock().conns.get(addr).cloned()
    }

    /// Snapshot of every connection, sorted by address
    pub fn all(&self) -> Vec<Connection> {
        let mut conns: Vec<Connection> = self.inner.lock().conns.values().cloned().collect();
        conns.sort_by(|a, b| a.address.cmp(&b.address));
        conns
    }

    /// Number of connections on base IP `ip`
    pub fn ip_count(&self, ip: &str) -> usize {
        self.inner.lock().ip_counts.get(ip).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().conns.is_empty()
    }

    pub fn outgoing_len(&self) -> usize {
        self.inner.lock().conns.values().filter(|c| c.outgoing).count()
    }

    pub fn pending_len(&self) -> usize {
        self.inner
            .lock()
            .conns
            .values()
            .filter(|c| c.state == ConnectionState::Pending)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intro(mirror: u32, listen_port: u16) -> IntroductionMessage {
        IntroductionMessage {
            mirror,
            listen_port,
            protocol_version: 2,
            extra: vec![],
        }
    }

    /// Counter consistency: every ip counter equals the entries on that ip
    fn assert_counters_consistent(registry: &ConnectionRegistry) {
        let mut expected: HashMap<String, usize> = HashMap::new();
        for conn in registry.all() {
            let (ip, _) = split_addr(&conn.address).unwrap();
            *expected.entry(ip).or_insert(0) += 1;
        }
        for (ip, count) in &expected {
            assert_eq!(registry.ip_count(ip), *count, "ip {}", ip);
        }
        assert_eq!(registry.inner.lock().ip_counts.len(), expected.len());
    }

    #[test]
    fn test_outgoing_keeps_dial_port() {
        let registry = ConnectionRegistry::new();
        let addr = "127.0.0.1:6060";

        let conn = registry.pending(addr).unwrap();
        assert_eq!(conn.state, ConnectionState::Pending);
        assert!(conn.outgoing);
        assert_eq!(registry.pending_len(), 1);

        let conn = registry.connected(addr).unwrap();
        assert_eq!(conn.state, ConnectionState::Connected);
        assert!(conn.connected_at.is_some());

        let conn = registry.introduced(addr, &intro(1111, 6061)).unwrap();
        assert_eq!(conn.listen_port, 6060);
        assert_eq!(conn.state, ConnectionState::Introduced);
        assert_eq!(conn.mirror, Some(1111));
        assert_eq!(registry.ip_count("127.0.0.1"), 1);
        assert_eq!(registry.outgoing_len(), 1);
        assert_eq!(registry.pending_len(), 0);
    }

    #[test]
    fn test_incoming_adopts_reported_port() {
        let registry = ConnectionRegistry::new();
        let addr = "127.0.0.1:6060";

        let conn = registry.connected(addr).unwrap();
        assert!(!conn.outgoing);
        assert_eq!(registry.ip_count("127.0.0.1"), 1);

        let conn = registry.introduced(addr, &intro(1111, 6061)).unwrap();
        assert_eq!(conn.listen_port, 6061);
        assert_eq!(conn.listen_address().unwrap(), "127.0.0.1:6061");
        assert_eq!(registry.outgoing_len(), 0);
    }

    #[test]
    fn test_same_mirror_same_ip_rejected() {
        let registry = ConnectionRegistry::new();
        registry.connected("10.0.0.1:5000").unwrap();
        registry.connected("10.0.0.1:5001").unwrap();

        registry
            .introduced("10.0.0.1:5000", &intro(42, 6000))
            .unwrap();
        let err = registry
            .introduced("10.0.0.1:5001", &intro(42, 6000))
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::IPMirrorAlreadyRegistered { mirror: 42, .. }
        ));

        let second = registry.get("10.0.0.1:5001").unwrap();
        assert_eq!(second.state, ConnectionState::Connected);
        assert_eq!(second.mirror, None);
        assert_eq!(second.listen_port, 0);
    }

    #[test]
    fn test_same_mirror_different_ip_allowed() {
        let registry = ConnectionRegistry::new();
        registry.connected("10.0.0.1:5000").unwrap();
        registry.connected("10.0.0.2:5000").unwrap();

        registry
            .introduced("10.0.0.1:5000", &intro(42, 6000))
            .unwrap();
        registry
            .introduced("10.0.0.2:5000", &intro(42, 6000))
            .unwrap();
    }

    #[test]
    fn test_mirror_reusable_after_remove() {
        let registry = ConnectionRegistry::new();
        registry.connected("10.0.0.1:5000").unwrap();
        registry
            .introduced("10.0.0.1:5000", &intro(42, 6000))
            .unwrap();
        registry.remove("10.0.0.1:5000");
        assert!(registry.inner.lock().mirrors.is_empty());

        registry.connected("10.0.0.1:5001").unwrap();
        registry
            .introduced("10.0.0.1:5001", &intro(42, 6000))
            .unwrap();
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let registry = ConnectionRegistry::new();
        registry.connected("10.0.0.1:5000").unwrap();

        assert!(registry.remove("10.0.0.9:1234").is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.ip_count("10.0.0.1"), 1);
        assert_eq!(registry.ip_count("10.0.0.9"), 0);
    }

    #[test]
    fn test_state_machine_errors() {
        let registry = ConnectionRegistry::new();
        assert!(matches!(
            registry.introduced("10.0.0.1:5000", &intro(1, 1)),
            Err(ConnectionError::NotExist(_))
        ));

        registry.connected("10.0.0.1:5000").unwrap();
        assert!(matches!(
            registry.pending("10.0.0.1:5000"),
            Err(ConnectionError::AlreadyRegistered(_))
        ));

        registry.introduced("10.0.0.1:5000", &intro(1, 1)).unwrap();
        assert!(matches!(
            registry.pending("10.0.0.1:5000"),
            Err(ConnectionError::AlreadyRegistered(_))
        ));
        assert!(matches!(
            registry.introduced("10.0.0.1:5000", &intro(2, 1)),
            Err(ConnectionError::AlreadyIntroduced(_))
        ));

        assert!(matches!(
            registry.pending("not an address"),
            Err(ConnectionError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_ip_counters_track_entries() {
        let registry = ConnectionRegistry::new();
        registry.pending("10.0.0.1:5000").unwrap();
        registry.connected("10.0.0.1:5001").unwrap();
        registry.connected("10.0.0.2:5000").unwrap();
        registry.connected("10.0.0.1:5000").unwrap();
        assert_counters_consistent(&registry);
        assert_eq!(registry.ip_count("10.0.0.1"), 2);

        registry.remove("10.0.0.1:5001");
        assert_counters_consistent(&registry);
        registry.remove("10.0.0.1:5000");
        registry.remove("10.0.0.1:5000");
        assert_counters_consistent(&registry);
        assert_eq!(registry.ip_count("10.0.0.1"), 0);
        assert_eq!(registry.ip_count("10.0.0.2"), 1);
    }

    #[test]
    fn test_modify_updates_fields() {
        let registry = ConnectionRegistry::new();
        registry.connected("10.0.0.1:5000").unwrap();
        let conn = registry
            .modify("10.0.0.1:5000", |c| c.height = 17)
            .unwrap();
        assert_eq!(conn.height, 17);
        assert_eq!(registry.get("10.0.0.1:5000").unwrap().height, 17);

        assert!(matches!(
            registry.modify("10.0.0.2:5000", |c| c.height = 1),
            Err(ConnectionError::NotExist(_))
        ));
    }

    #[test]
    #[should_panic(expected = "mirror")]
    fn test_modify_rejects_mirror_change() {
        let registry = ConnectionRegistry::new();
        registry.connected("10.0.0.1:5000").unwrap();
        registry.introduced("10.0.0.1:5000", &intro(7, 1)).unwrap();
        let _ = registry.modify("10.0.0.1:5000", |c| c.mirror = Some(8));
    }

    #[test]
    fn test_connected_from_unexpected_state_still_transitions() {
        let registry = ConnectionRegistry::new();
        let addr = "10.0.0.1:5000";
        let first = registry.connected(addr).unwrap();

        // already connected, not pending: warns and restamps
        std::thread::sleep(std::time::Duration::from_millis(2));
        let again = registry.connected(addr).unwrap();
        assert_eq!(again.state, ConnectionState::Connected);
        assert!(again.connected_at > first.connected_at);
        assert_eq!(registry.ip_count("10.0.0.1"), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_introduced_from_pending_still_commits() {
        let registry = ConnectionRegistry::new();
        let addr = "10.0.0.1:5000";
        registry.pending(addr).unwrap();

        let conn = registry.introduced(addr, &intro(9, 6000)).unwrap();
        assert_eq!(conn.state, ConnectionState::Introduced);
        assert_eq!(conn.mirror, Some(9));
        assert_eq!(conn.listen_port, 5000);
        assert!(!registry.inner.lock().can_update_mirror("10.0.0.1", 9));
    }

    #[test]
    fn test_remove_with_zero_counter_still_removes() {
        let registry = ConnectionRegistry::new();
        registry.connected("10.0.0.1:5000").unwrap();
        registry.inner.lock().ip_counts.clear();

        let removed = registry.remove("10.0.0.1:5000").unwrap();
        assert_eq!(removed.address, "10.0.0.1:5000");
        assert!(registry.is_empty());
        assert_eq!(registry.ip_count("10.0.0.1"), 0);
        assert!(registry.inner.lock().ip_counts.is_empty());
    }

    #[test]
    fn test_concurrent_connect_and_remove() {
        let registry = ConnectionRegistry::new();

        std::thread::scope(|scope| {
            for worker in 0..8u16 {
                let registry = &registry;
                scope.spawn(move || {
                    for i in 0..50u16 {
                        let addr = format!("10.0.0.{}:{}", i % 4, 10_000 + worker * 100 + i);
                        registry.connected(&addr).unwrap();
                        if i % 2 == 0 {
                            registry.remove(&addr);
                        }
                    }
                });
            }
        });

        assert_eq!(registry.len(), 8 * 25);
        assert_counters_consistent(&registry);
        let total: usize = (0..4).map(|i| registry.ip_count(&format!("10.0.0.{}", i))).sum();
        assert_eq!(total, registry.len());
    }
}
