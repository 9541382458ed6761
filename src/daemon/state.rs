//! Daemon state owned by the event loop
//!
//! [`Daemon`] bundles the registry, trackers and collaborators and carries
//! out everything the event loop decides: admitting connections, sending
//! and broadcasting, disconnecting, and the periodic maintenance jobs.

use crate::crypto::Sha256;
use crate::daemon::announced::{now_nanos, AnnouncementCache};
use crate::daemon::config::DaemonConfig;
use crate::daemon::connections::{split_addr, Connection, ConnectionRegistry, ConnectionState};
use crate::daemon::heights::PeerHeightTracker;
use crate::daemon::introduction::NodeIdentity;
use crate::core::Visor;
use crate::network::disconnect::DisconnectReason;
use crate::network::message::{
    AnnounceBlocksMessage, AnnounceTxnsMessage, GetBlocksMessage, GetPeersMessage, Message,
    PingMessage,
};
use crate::network::peerbook::PeerDirectory;
use crate::network::transport::{Transport, TransportError};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Shared daemon state, mutated only from the event loop
pub struct Daemon {
    config: DaemonConfig,
    identity: Arc<NodeIdentity>,
    connections: Arc<ConnectionRegistry>,
    heights: PeerHeightTracker,
    announced: AnnouncementCache,
    transport: Arc<dyn Transport>,
    peers: Box<dyn PeerDirectory>,
    visor: Box<dyn Visor>,
    default_connections: HashSet<String>,
    /// Connections we asked the transport to close
    disconnecting: HashMap<String, DisconnectReason>,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        identity: Arc<NodeIdentity>,
        connections: Arc<ConnectionRegistry>,
        transport: Arc<dyn Transport>,
        peers: Box<dyn PeerDirectory>,
        visor: Box<dyn Visor>,
    ) -> Self {
        let default_connections = config.default_connections.iter().cloned().collect();
        Self {
            config,
            identity,
            connections,
            heights: PeerHeightTracker::new(),
            announced: AnnouncementCache::new(),
            transport,
            peers,
            visor,
            default_connections,
            disconnecting: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn heights(&self) -> &PeerHeightTracker {
        &self.heights
    }

    pub fn announced(&self) -> &AnnouncementCache {
        &self.announced
    }

    pub fn peers(&self) -> &dyn PeerDirectory {
        self.peers.as_ref()
    }

    pub fn peers_mut(&mut self) -> &mut dyn PeerDirectory {
        self.peers.as_mut()
    }

    pub fn visor(&self) -> &dyn Visor {
        self.visor.as_ref()
    }

    pub fn visor_mut(&mut self) -> &mut dyn Visor {
        self.visor.as_mut()
    }

    pub fn is_default_connection(&self, addr: &str) -> bool {
        self.default_connections.contains(addr)
    }

    pub fn is_disconnecting(&self, addr: &str) -> bool {
        self.disconnecting.contains_key(addr)
    }

    /// Introduced connections, excluding `except`
    fn introduced_addrs(&self, except: Option<&str>) -> Vec<String> {
        self.connections
            .all()
            .into_iter()
            .filter(|c| c.is_introduced() && Some(c.address.as_str()) != except)
            .filter(|c| !self.disconnecting.contains_key(&c.address))
            .map(|c| c.address)
            .collect()
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Queue `message` for `addr`. A failed send disconnects the peer.
    pub fn send(&mut self, addr: &str, message: Message) -> bool {
        log::debug!("Sending {} to {}", message.type_name(), addr);

        match self.transport.send(addr, message) {
            Ok(()) => {
                let _ = self
                    .connections
                    .modify(addr, |c| c.last_sent = Some(Utc::now()));
                true
            }
            Err(TransportError::NotConnected(_)) => {
                log::debug!("Send to {} dropped: not connected", addr);
                false
            }
            Err(e) => {
                log::info!("Send to {} failed: {}", addr, e);
                self.disconnect(addr, DisconnectReason::FailedSend);
                false
            }
        }
    }

    /// Send `message` to every introduced peer except `except`
    pub fn broadcast(&mut self, message: Message, except: Option<&str>) -> usize {
        let targets = self.introduced_addrs(except);
        if targets.is_empty() {
            log::debug!("No peers to broadcast {} to", message.type_name());
            return 0;
        }

        targets
            .iter()
            .filter(|addr| self.send(addr, message.clone()))
            .count()
    }

    /// Announce transactions and stamp them in the announcement cache
    pub fn announce_txns(&mut self, hashes: Vec<Sha256>, except: Option<&str>) -> usize {
        if hashes.is_empty() {
            return 0;
        }
        self.announced.add(&hashes);
        self.broadcast(
            Message::AnnounceTxns(AnnounceTxnsMessage { txns: hashes }),
            except,
        )
    }

    /// Ask `addr` for the blocks after our head
    pub fn request_blocks_from(&mut self, addr: &str) -> bool {
        let request = self.get_blocks_request();
        self.send(addr, request)
    }

    fn get_blocks_request(&self) -> Message {
        Message::GetBlocks(GetBlocksMessage {
            last_block: self.visor.head_sequence(),
            requested_blocks: self.config.blocks_response_count,
        })
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Close `addr` with `reason`. Cleanup waits for the transport's
    /// disconnect event.
    pub fn disconnect(&mut self, addr: &str, reason: DisconnectReason) {
        if self.disconnecting.contains_key(addr) {
            return;
        }
        self.disconnecting.insert(addr.to_string(), reason);
        log::info!("Disconnecting {}: {}", addr, reason);
        self.transport.disconnect(addr, reason);
    }

    /// Admit a freshly connected socket and introduce ourselves
    pub fn on_connected(&mut self, addr: &str, outgoing: bool) {
        log::info!(
            "Connected to {} ({})",
            addr,
            if outgoing { "outgoing" } else { "incoming" }
        );

        // closed while the dial was still in flight
        if let Some(reason) = self.disconnecting.get(addr).copied() {
            self.transport.disconnect(addr, reason);
            return;
        }

        if let Some(reason) = self.admission_check(addr, outgoing) {
            self.disconnect(addr, reason);
            return;
        }

        let intro = self.identity.introduction();
        self.send(addr, Message::Introduction(intro));
    }

    fn admission_check(&self, addr: &str, outgoing: bool) -> Option<DisconnectReason> {
        if outgoing {
            if self.connections.outgoing_len() > self.config.max_outgoing_connections {
                return Some(DisconnectReason::MaxOutgoingConnectionsReached);
            }
            return None;
        }

        if self.peers.is_blacklisted(addr) {
            return Some(DisconnectReason::IsBlacklisted);
        }
        let ip = match split_addr(addr) {
            Ok((ip, _)) => ip,
            Err(_) => return Some(DisconnectReason::OtherError),
        };
        if self.connections.ip_count(&ip) > self.config.max_incoming_per_ip {
            return Some(DisconnectReason::IPLimitReached);
        }
        None
    }

    /// Clean up after the transport closed `addr`
    pub fn on_disconnected(&mut self, addr: &str, reason: DisconnectReason) {
        self.disconnecting.remove(addr);
        let conn = self.connections.remove(addr);
        self.heights.remove(addr);

        log::info!("Disconnected from {}: {}", addr, reason);

        if reason.should_blacklist() {
            self.peers
                .add_blacklist_entry(addr, self.config.blacklist_duration());
        }
        if reason == DisconnectReason::SelfConnect {
            if let Some(conn) = conn.filter(|c| c.outgoing) {
                self.peers.remove_peer(&conn.address);
            }
        }
    }

    /// An outgoing dial never produced a socket
    pub fn on_dial_failure(&mut self, addr: &str, error: &TransportError) {
        log::debug!("Dial to {} failed: {}", addr, error);
        self.disconnecting.remove(addr);
        match self.connections.get(addr) {
            Some(conn) if conn.state == ConnectionState::Pending => {
                self.connections.remove(addr);
            }
            Some(_) => log::warn!("Dial failure for {} which is not pending", addr),
            None => {}
        }
    }

    /// Complete a successful introduction from `addr`
    pub fn on_introduced(&mut self, conn: &Connection, user_agent: Option<String>) {
        let addr = conn.address.as_str();
        let _ = self.connections.modify(addr, |c| c.user_agent = user_agent);

        match conn.listen_address() {
            Some(listen) if !self.is_default_connection(&listen) => {
                if self.peers.add_peer(&listen) {
                    log::debug!("Added {} to the peer book", listen);
                }
            }
            _ => {}
        }

        log::info!(
            "Introduced {} (mirror {:?}, listen port {})",
            addr,
            conn.mirror,
            conn.listen_port
        );

        self.request_blocks_from(addr);
        let head = self.visor.head_sequence();
        self.send(
            addr,
            Message::AnnounceBlocks(AnnounceBlocksMessage { max_bk_seq: head }),
        );
        if self.peers.len() < self.config.max_known_peers {
            self.send(addr, Message::GetPeers(GetPeersMessage {}));
        }
    }

    /// Record that a message from `addr` is being processed
    pub fn touch_received(&self, addr: &str) {
        let _ = self
            .connections
            .modify(addr, |c| c.last_received = Some(Utc::now()));
    }

    // =========================================================================
    // Periodic jobs
    // =========================================================================

    /// Dial default connections, then random known peers, up to the limits
    pub fn connect_to_peers(&mut self) {
        if self.config.disable_outgoing {
            return;
        }

        let mut candidates: Vec<String> = self.config.default_connections.clone();
        candidates.extend(self.peers.random_peers(self.config.max_outgoing_connections));

        let own = format!(":{}", self.identity.listen_port);
        let known_listeners: HashSet<String> = self
            .connections
            .all()
            .iter()
            .filter_map(Connection::listen_address)
            .collect();

        for addr in candidates {
            if self.connections.outgoing_len() >= self.config.max_outgoing_connections
                || self.connections.pending_len() >= self.config.max_pending_connections
            {
                break;
            }
            if self.connections.get(&addr).is_some()
                || known_listeners.contains(&addr)
                || self.peers.is_blacklisted(&addr)
            {
                continue;
            }
            if is_loopback(&addr) && addr.ends_with(&own) {
                continue;
            }

            match self.transport.dial(&addr) {
                Ok(()) => log::debug!("Dialing {}", addr),
                Err(e) => log::debug!("Cannot dial {}: {}", addr, e),
            }
        }
    }

    /// Drop connections that never introduced themselves or went quiet
    pub fn evict_stale(&mut self, now: DateTime<Utc>) {
        let intro_timeout = self.config.introduction_timeout();
        let idle_limit = self.config.idle_limit();

        for conn in self.connections.all() {
            let reason = match conn.state {
                ConnectionState::Pending => None,
                ConnectionState::Connected => conn
                    .connected_at
                    .filter(|at| *at + intro_timeout < now)
                    .map(|_| DisconnectReason::IntroductionTimeout),
                ConnectionState::Introduced => conn
                    .last_received
                    .or(conn.connected_at)
                    .filter(|at| *at + idle_limit < now)
                    .map(|_| DisconnectReason::Idle),
            };
            if let Some(reason) = reason {
                self.disconnect(&conn.address, reason);
            }
        }
    }

    pub fn ping_peers(&mut self) {
        self.broadcast(Message::Ping(PingMessage {}), None);
    }

    pub fn request_peers(&mut self) {
        if self.peers.len() >= self.config.max_known_peers {
            return;
        }
        self.broadcast(Message::GetPeers(GetPeersMessage {}), None);
    }

    pub fn sweep_blacklist(&mut self) {
        let pruned = self.peers.prune_blacklist();
        if pruned > 0 {
            log::debug!("Removed {} expired blacklist entries", pruned);
        }
    }

    /// Hand pending announcement stamps to the visor
    pub fn flush_announced(&mut self) {
        let stamps = self.announced.flush();
        if stamps.is_empty() {
            return;
        }
        log::debug!("Recording {} transaction announcements", stamps.len());
        self.visor.set_transactions_announced(stamps);
    }

    /// Re-announce unconfirmed transactions not announced within the period
    pub fn rebroadcast_transactions(&mut self) {
        let period = (self.config.rebroadcast_rate_secs as i64).saturating_mul(1_000_000_000);
        let hashes = self
            .visor
            .unconfirmed_hashes(now_nanos().saturating_sub(period));
        if hashes.is_empty() {
            return;
        }
        log::debug!("Rebroadcasting {} unconfirmed transactions", hashes.len());
        self.announce_txns(hashes, None);
    }

    pub fn request_blocks(&mut self) {
        let request = self.get_blocks_request();
        self.broadcast(request, None);
    }

    pub fn announce_blocks(&mut self) {
        let head = self.visor.head_sequence();
        self.broadcast(
            Message::AnnounceBlocks(AnnounceBlocksMessage { max_bk_seq: head }),
            None,
        );
    }

    /// Final teardown once the event loop stopped
    pub fn shutdown(&mut self) {
        self.transport.shutdown();
        self.flush_announced();
        if let Err(e) = self.peers.save() {
            log::error!("Failed to save peer book: {}", e);
        }
    }
}

fn is_loopback(addr: &str) -> bool {
    addr.parse::<std::net::SocketAddr>()
        .map(|sa| sa.ip().is_loopback())
        .unwrap_or(false)
}
