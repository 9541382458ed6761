//! The daemon event loop
//!
//! One task owns the [`Daemon`] and services, one at a time, the periodic
//! timers, the ready-message queue, connection events and dial failures.
//! Nothing else mutates daemon state, so none of it needs extra locking.

use crate::daemon::state::Daemon;
use crate::network::disconnect::DisconnectReason;
use crate::network::message::Message;
use crate::network::transport::{ConnectionEvent, DaemonReceivers, DialFailure, ReadyMessage};
use chrono::Utc;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Access to daemon state while processing one message from `addr`.
///
/// Only the event loop can create one, so `process` cannot run anywhere
/// else.
pub struct LoopContext<'a> {
    daemon: &'a mut Daemon,
    addr: &'a str,
}

impl<'a> LoopContext<'a> {
    fn new(daemon: &'a mut Daemon, addr: &'a str) -> Self {
        Self { daemon, addr }
    }

    /// The peer the message came from
    pub fn addr(&self) -> &'a str {
        self.addr
    }

    pub fn daemon(&mut self) -> &mut Daemon {
        &mut *self.daemon
    }
}

/// Single consumer of everything the network produces
pub struct EventLoop {
    daemon: Daemon,
    receivers: Option<DaemonReceivers>,
    shutdown: CancellationToken,
}

fn ticker(secs: u64) -> Interval {
    let mut ticker = interval(Duration::from_secs(secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl EventLoop {
    pub fn new(daemon: Daemon, receivers: DaemonReceivers, shutdown: CancellationToken) -> Self {
        Self {
            daemon,
            receivers: Some(receivers),
            shutdown,
        }
    }

    pub fn daemon(&self) -> &Daemon {
        &self.daemon
    }

    pub fn daemon_mut(&mut self) -> &mut Daemon {
        &mut self.daemon
    }

    /// Run until the shutdown token is cancelled, then tear down
    pub async fn run(mut self) {
        let Some(receivers) = self.receivers.take() else {
            log::error!("Event loop started twice");
            return;
        };
        let DaemonReceivers {
            mut ready,
            mut events,
            mut dial_failures,
        } = receivers;
        let shutdown = self.shutdown.clone();

        let config = self.daemon.config().clone();
        let mut outgoing = ticker(config.outgoing_rate_secs);
        let mut stale = ticker(config.stale_check_rate_secs);
        let mut ping = ticker(config.ping_rate_secs);
        let mut peers_request = ticker(config.peers_request_rate_secs);
        let mut blacklist = ticker(config.blacklist_sweep_rate_secs);
        let mut flush_announced = ticker(config.flush_announced_rate_secs);
        let mut rebroadcast = ticker(config.rebroadcast_rate_secs);
        let mut blocks_request = ticker(config.blocks_request_rate_secs);
        let mut blocks_announce = ticker(config.blocks_announce_rate_secs);

        log::info!("Event loop started");

        loop {
            // A connection's `Connected` event is queued before any of its
            // messages, so events must drain ahead of the ready queue.
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    log::info!("Event loop shutting down...");
                    break;
                }
                Some(event) = events.recv() => self.handle_event(event),
                Some(failure) = dial_failures.recv() => self.handle_dial_failure(failure),
                Some(message) = ready.recv() => self.process_ready(message),
                _ = outgoing.tick() => self.daemon.connect_to_peers(),
                _ = stale.tick() => self.daemon.evict_stale(Utc::now()),
                _ = ping.tick() => self.daemon.ping_peers(),
                _ = peers_request.tick() => self.daemon.request_peers(),
                _ = blacklist.tick() => self.daemon.sweep_blacklist(),
                _ = flush_announced.tick() => self.daemon.flush_announced(),
                _ = rebroadcast.tick() => self.daemon.rebroadcast_transactions(),
                _ = blocks_request.tick() => self.daemon.request_blocks(),
                _ = blocks_announce.tick() => self.daemon.announce_blocks(),
            }
        }

        self.daemon.shutdown();
        log::info!("Event loop stopped");
    }

    /// Process one message that passed `handle`
    pub fn process_ready(&mut self, ready: ReadyMessage) {
        let ReadyMessage { addr, message } = ready;

        if self.daemon.is_disconnecting(&addr) {
            log::debug!("Dropping {} from disconnecting {}", message.type_name(), addr);
            return;
        }
        let Some(conn) = self.daemon.connections().get(&addr) else {
            log::debug!("Dropping {} from unknown {}", message.type_name(), addr);
            return;
        };

        let needs_introduction =
            !matches!(message, Message::Introduction(_) | Message::Disconnect(_));
        if needs_introduction && !conn.is_introduced() {
            log::info!(
                "{} sent {} before introducing itself",
                addr,
                message.type_name()
            );
            self.daemon
                .disconnect(&addr, DisconnectReason::NoIntroduction);
            return;
        }

        log::debug!("Processing {} from {}", message.type_name(), addr);
        self.daemon.touch_received(&addr);

        let mut ctx = LoopContext::new(&mut self.daemon, &addr);
        message.process(&mut ctx);
    }

    pub fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { addr, outgoing } => {
                self.daemon.on_connected(&addr, outgoing)
            }
            ConnectionEvent::Disconnected { addr, reason } => {
                self.daemon.on_disconnected(&addr, reason)
            }
        }
    }

    pub fn handle_dial_failure(&mut self, failure: DialFailure) {
        self.daemon.on_dial_failure(&failure.addr, &failure.error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::sample_transaction;
    use crate::core::{Block, MemoryVisor, SignedBlock, Visor};
    use crate::crypto::random_pubkey;
    use crate::daemon::config::DaemonConfig;
    use crate::daemon::connections::{ConnectionRegistry, ConnectionState};
    use crate::daemon::introduction::NodeIdentity;
    use crate::network::message::*;
    use crate::network::peerbook::{PeerBook, PeerDirectory, PEERS_FILE};
    use crate::network::transport::{daemon_channels, DaemonSenders, Transport, TransportError};
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::Arc;

    const GENESIS_TIME: u64 = 1_700_000_000;
    const PEER: &str = "10.0.0.1:51000";
    const OTHER: &str = "10.0.0.2:51000";

    #[derive(Default)]
    struct Recorded {
        sent: Vec<(String, Message)>,
        disconnected: Vec<(String, DisconnectReason)>,
        dialed: Vec<String>,
        fail_sends: HashSet<String>,
        shut_down: bool,
    }

    /// Transport that records what the daemon asks of it
    #[derive(Default, Clone)]
    struct RecordingTransport {
        recorded: Arc<Mutex<Recorded>>,
        connections: Option<Arc<ConnectionRegistry>>,
    }

    impl RecordingTransport {
        fn sent_to(&self, addr: &str) -> Vec<Message> {
            self.recorded
                .lock()
                .sent
                .iter()
                .filter(|(a, _)| a == addr)
                .map(|(_, m)| m.clone())
                .collect()
        }

        fn disconnects(&self) -> Vec<(String, DisconnectReason)> {
            self.recorded.lock().disconnected.clone()
        }

        fn clear(&self) {
            let mut recorded = self.recorded.lock();
            recorded.sent.clear();
            recorded.disconnected.clear();
        }
    }

    impl Transport for RecordingTransport {
        fn dial(&self, addr: &str) -> Result<(), TransportError> {
            if let Some(connections) = &self.connections {
                connections.pending(addr)?;
            }
            self.recorded.lock().dialed.push(addr.to_string());
            Ok(())
        }

        fn send(&self, addr: &str, message: Message) -> Result<(), TransportError> {
            let mut recorded = self.recorded.lock();
            if recorded.fail_sends.contains(addr) {
                return Err(TransportError::QueueFull(addr.to_string()));
            }
            recorded.sent.push((addr.to_string(), message));
            Ok(())
        }

        fn disconnect(&self, addr: &str, reason: DisconnectReason) {
            self.recorded
                .lock()
                .disconnected
                .push((addr.to_string(), reason));
        }

        fn shutdown(&self) {
            self.recorded.lock().shut_down = true;
        }
    }

    struct Harness {
        event_loop: EventLoop,
        transport: RecordingTransport,
        connections: Arc<ConnectionRegistry>,
        identity: Arc<NodeIdentity>,
        senders: DaemonSenders,
        shutdown: CancellationToken,
    }

    fn genesis() -> SignedBlock {
        SignedBlock::new(Block::genesis(GENESIS_TIME))
    }

    fn harness_with(config: DaemonConfig, peers: Box<dyn PeerDirectory>) -> Harness {
        let connections = Arc::new(ConnectionRegistry::new());
        let transport = RecordingTransport {
            connections: Some(connections.clone()),
            ..Default::default()
        };
        let identity = Arc::new(NodeIdentity::new(
            config.port,
            config.protocol_version,
            config.blockchain_pubkey().unwrap(),
            config.user_agent.clone(),
        ));
        let daemon = Daemon::new(
            config,
            identity.clone(),
            connections.clone(),
            Arc::new(transport.clone()),
            peers,
            Box::new(MemoryVisor::new(genesis())),
        );
        let (senders, receivers) = daemon_channels(8, 8, 8);
        let shutdown = CancellationToken::new();

        Harness {
            event_loop: EventLoop::new(daemon, receivers, shutdown.clone()),
            transport,
            connections,
            identity,
            senders,
            shutdown,
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn harness() -> Harness {
        harness_with(DaemonConfig::default(), Box::new(PeerBook::in_memory(100)))
    }

    fn peer_intro(h: &Harness, mirror: u32) -> IntroductionMessage {
        assert_ne!(mirror, h.identity.mirror);
        IntroductionMessage {
            mirror,
            listen_port: 6000,
            protocol_version: PROTOCOL_VERSION,
            extra: vec![],
        }
    }

    impl Harness {
        fn deliver(&mut self, addr: &str, message: Message) {
            self.event_loop.process_ready(ReadyMessage {
                addr: addr.to_string(),
                message,
            });
        }

        /// Register an incoming connection and let the loop admit it
        fn connect(&mut self, addr: &str) {
            self.connections.connected(addr).unwrap();
            self.event_loop.handle_event(ConnectionEvent::Connected {
                addr: addr.to_string(),
                outgoing: false,
            });
        }

        /// Connect and complete the handshake
        fn introduce(&mut self, addr: &str, mirror: u32) {
            self.connect(addr);
            let intro = peer_intro(self, mirror);
            self.deliver(addr, Message::Introduction(intro));
            assert!(self.connections.get(addr).unwrap().is_introduced());
        }

        fn daemon(&mut self) -> &mut Daemon {
            self.event_loop.daemon_mut()
        }
    }

    #[test]
    fn test_connected_peer_gets_introduction() {
        let mut h = harness();
        h.connect(PEER);

        let sent = h.transport.sent_to(PEER);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Message::Introduction(intro) => {
                assert_eq!(intro.mirror, h.identity.mirror);
                assert_eq!(intro.listen_port, h.identity.listen_port);
            }
            other => panic!("expected introduction, got {:?}", other),
        }
        assert!(h.connections.get(PEER).unwrap().last_sent.is_some());
    }

    #[test]
    fn test_introduction_promotes_peer() {
        let mut h = harness();
        h.connect(PEER);
        h.transport.clear();

        let intro = peer_intro(&h, 99);
        h.deliver(PEER, Message::Introduction(intro));

        let conn = h.connections.get(PEER).unwrap();
        assert_eq!(conn.state, ConnectionState::Introduced);
        assert_eq!(conn.listen_port, 6000);
        assert!(conn.last_received.is_some());
        assert_eq!(h.daemon().peers().random_peers(10), vec!["10.0.0.1:6000"]);

        let kinds: Vec<MessageKind> = h.transport.sent_to(PEER).iter().map(Message::kind).collect();
        assert!(kinds.contains(&MessageKind::GetBlocks));
        assert!(kinds.contains(&MessageKind::AnnounceBlocks));
        assert!(kinds.contains(&MessageKind::GetPeers));
    }

    #[test]
    fn test_default_connection_not_promoted() {
        let config = DaemonConfig {
            default_connections: vec!["10.0.0.1:6000".to_string()],
            ..Default::default()
        };
        let mut h = harness_with(config, Box::new(PeerBook::in_memory(100)));
        h.introduce(PEER, 5);
        assert!(h.daemon().peers().is_empty());
    }

    #[test]
    fn test_duplicate_mirror_disconnects() {
        let mut h = harness();
        h.introduce("10.0.0.1:51000", 77);
        h.connect("10.0.0.1:51001");

        let intro = peer_intro(&h, 77);
        h.deliver("10.0.0.1:51001", Message::Introduction(intro));

        assert_eq!(
            h.transport.disconnects(),
            vec![("10.0.0.1:51001".to_string(), DisconnectReason::ConnectedTwice)]
        );
        assert_eq!(
            h.connections.get("10.0.0.1:51001").unwrap().state,
            ConnectionState::Connected
        );
    }

    #[test]
    fn test_message_before_introduction() {
        let mut h = harness();
        h.connect(PEER);
        h.deliver(PEER, Message::Ping(PingMessage {}));

        assert_eq!(
            h.transport.disconnects(),
            vec![(PEER.to_string(), DisconnectReason::NoIntroduction)]
        );

        // anything else from a disconnecting peer is dropped
        h.transport.clear();
        h.deliver(PEER, Message::Ping(PingMessage {}));
        assert!(h.transport.sent_to(PEER).is_empty());
        assert!(h.transport.disconnects().is_empty());
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let mut h = harness();
        h.introduce(PEER, 5);
        h.transport.clear();

        h.deliver(PEER, Message::Ping(PingMessage {}));
        assert_eq!(h.transport.sent_to(PEER), vec![Message::Pong(PongMessage {})]);
    }

    #[test]
    fn test_blacklisted_incoming_rejected() {
        let mut peers = PeerBook::in_memory(100);
        peers.add_blacklist_entry(PEER, Duration::from_secs(60));
        let mut h = harness_with(DaemonConfig::default(), Box::new(peers));

        h.connect(PEER);
        assert_eq!(
            h.transport.disconnects(),
            vec![(PEER.to_string(), DisconnectReason::IsBlacklisted)]
        );
        assert!(h.transport.sent_to(PEER).is_empty());
    }

    #[test]
    fn test_ip_limit() {
        let config = DaemonConfig {
            max_incoming_per_ip: 1,
            ..Default::default()
        };
        let mut h = harness_with(config, Box::new(PeerBook::in_memory(100)));
        h.connect("10.0.0.1:51000");
        h.connect("10.0.0.1:51001");

        assert_eq!(
            h.transport.disconnects(),
            vec![("10.0.0.1:51001".to_string(), DisconnectReason::IPLimitReached)]
        );
    }

    #[test]
    fn test_disconnect_cleans_up_and_blacklists() {
        let mut h = harness();
        h.introduce(PEER, 5);
        h.daemon().heights().record(PEER, 40);

        h.event_loop.handle_event(ConnectionEvent::Disconnected {
            addr: PEER.to_string(),
            reason: DisconnectReason::MalformedMessage,
        });

        assert!(h.connections.get(PEER).is_none());
        assert_eq!(h.connections.ip_count("10.0.0.1"), 0);
        assert!(h.daemon().heights().is_empty());
        assert!(h.daemon().peers().is_blacklisted(PEER));
    }

    #[test]
    fn test_idle_disconnect_does_not_blacklist() {
        let mut h = harness();
        h.introduce(PEER, 5);
        h.event_loop.handle_event(ConnectionEvent::Disconnected {
            addr: PEER.to_string(),
            reason: DisconnectReason::Idle,
        });
        assert!(!h.daemon().peers().is_blacklisted(PEER));
    }

    #[test]
    fn test_evict_stale_connections() {
        let mut h = harness();
        h.connect(PEER);
        h.introduce(OTHER, 5);

        h.daemon().evict_stale(Utc::now());
        assert!(h.transport.disconnects().is_empty());

        let later = Utc::now() + chrono::Duration::hours(1);
        h.daemon().evict_stale(later);
        let mut disconnects = h.transport.disconnects();
        disconnects.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            disconnects,
            vec![
                (PEER.to_string(), DisconnectReason::IntroductionTimeout),
                (OTHER.to_string(), DisconnectReason::Idle),
            ]
        );
    }

    #[test]
    fn test_failed_send_disconnects() {
        let mut h = harness();
        h.introduce(PEER, 5);
        h.transport.recorded.lock().fail_sends.insert(PEER.to_string());

        h.deliver(PEER, Message::Ping(PingMessage {}));
        assert_eq!(
            h.transport.disconnects(),
            vec![(PEER.to_string(), DisconnectReason::FailedSend)]
        );
    }

    #[test]
    fn test_received_disconnect() {
        let mut h = harness();
        h.connect(PEER);
        h.deliver(
            PEER,
            Message::Disconnect(DisconnectMessage {
                reason: DisconnectReason::InvalidVersion.code(),
                reserved: vec![],
            }),
        );
        assert_eq!(
            h.transport.disconnects(),
            vec![(PEER.to_string(), DisconnectReason::ReceivedDisconnect)]
        );
    }

    #[test]
    fn test_transaction_gossip() {
        let mut h = harness();
        h.introduce(PEER, 5);
        h.introduce(OTHER, 6);
        h.transport.clear();

        let tx = sample_transaction(9);
        let hash = tx.hash();

        h.deliver(PEER, Message::AnnounceTxns(AnnounceTxnsMessage { txns: vec![hash] }));
        assert_eq!(
            h.transport.sent_to(PEER),
            vec![Message::GetTxns(GetTxnsMessage { txns: vec![hash] })]
        );

        h.deliver(PEER, Message::GiveTxns(GiveTxnsMessage { txns: vec![tx] }));
        assert_eq!(h.daemon().visor().known_transaction_hashes(&[hash]), vec![hash]);
        assert_eq!(
            h.transport.sent_to(OTHER),
            vec![Message::AnnounceTxns(AnnounceTxnsMessage { txns: vec![hash] })]
        );
        assert_eq!(h.transport.sent_to(PEER).len(), 1);
        assert_eq!(h.daemon().announced().len(), 1);

        // a known hash is not requested again
        h.transport.clear();
        h.deliver(OTHER, Message::AnnounceTxns(AnnounceTxnsMessage { txns: vec![hash] }));
        assert!(h.transport.sent_to(OTHER).is_empty());

        // never announced as far as the visor knows, until the flush
        assert_eq!(h.daemon().visor().unconfirmed_hashes(1), vec![hash]);
        h.daemon().flush_announced();
        assert!(h.daemon().announced().is_empty());
        assert!(h.daemon().visor().unconfirmed_hashes(1).is_empty());
    }

    #[test]
    fn test_rebroadcast_stamps_announcements() {
        let mut h = harness();
        h.introduce(PEER, 5);
        h.transport.clear();

        let tx = sample_transaction(3);
        let hash = tx.hash();
        h.daemon().visor_mut().inject_transaction(tx).unwrap();

        h.daemon().rebroadcast_transactions();
        assert_eq!(
            h.transport.sent_to(PEER),
            vec![Message::AnnounceTxns(AnnounceTxnsMessage { txns: vec![hash] })]
        );

        // once flushed, the fresh stamp keeps it out of the next round
        h.daemon().flush_announced();
        h.transport.clear();
        h.daemon().rebroadcast_transactions();
        assert!(h.transport.sent_to(PEER).is_empty());
    }

    #[test]
    fn test_block_sync() {
        // a second chain with the same genesis, two blocks ahead
        let mut source = MemoryVisor::new(genesis());
        for _ in 0..2 {
            let head = source.head().block.head.clone();
            let block = SignedBlock::new(Block::new(&head, head.time + 10, 0, vec![]));
            source.execute_block(block).unwrap();
        }

        let mut h = harness();
        h.introduce(PEER, 5);
        h.introduce(OTHER, 6);
        h.transport.clear();

        h.deliver(PEER, Message::AnnounceBlocks(AnnounceBlocksMessage { max_bk_seq: 2 }));
        assert_eq!(h.connections.get(PEER).unwrap().height, 2);
        assert_eq!(h.daemon().heights().estimate(0), 2);
        assert_eq!(
            h.transport.sent_to(PEER),
            vec![Message::GetBlocks(GetBlocksMessage {
                last_block: 0,
                requested_blocks: DaemonConfig::default().blocks_response_count,
            })]
        );

        h.transport.clear();
        let blocks = source.blocks_since(0, 10);
        h.deliver(PEER, Message::GiveBlocks(GiveBlocksMessage { blocks }));
        assert_eq!(h.daemon().visor().head_sequence(), 2);
        assert!(h
            .transport
            .sent_to(OTHER)
            .contains(&Message::AnnounceBlocks(AnnounceBlocksMessage { max_bk_seq: 2 })));
        // caught up with the estimate, so no further request
        assert!(!h
            .transport
            .sent_to(PEER)
            .iter()
            .any(|m| m.kind() == MessageKind::GetBlocks));
    }

    #[test]
    fn test_get_blocks_is_capped() {
        let config = DaemonConfig {
            blocks_response_count: 1,
            ..Default::default()
        };
        let mut h = harness_with(config, Box::new(PeerBook::in_memory(100)));
        for _ in 0..3 {
            let visor = h.daemon().visor_mut();
            let head = visor.blocks_since(0, 100).last().map(|b| b.block.head.clone());
            let head = head.unwrap_or_else(|| genesis().block.head);
            let block = SignedBlock::new(Block::new(&head, head.time + 10, 0, vec![]));
            visor.execute_block(block).unwrap();
        }

        h.introduce(PEER, 5);
        h.transport.clear();
        h.deliver(
            PEER,
            Message::GetBlocks(GetBlocksMessage {
                last_block: 0,
                requested_blocks: 50,
            }),
        );
        match h.transport.sent_to(PEER).as_slice() {
            [Message::GiveBlocks(give)] => {
                assert_eq!(give.blocks.len(), 1);
                assert_eq!(give.blocks[0].seq(), 1);
            }
            other => panic!("unexpected messages {:?}", other),
        }
    }

    #[test]
    fn test_peer_exchange() {
        let mut h = harness();
        h.introduce(PEER, 5);
        h.transport.clear();

        h.deliver(
            PEER,
            Message::GivePeers(GivePeersMessage {
                peers: vec![PeerAddress::from_addr_str("10.0.0.7:6000").unwrap()],
            }),
        );
        assert_eq!(h.daemon().peers().len(), 2);

        h.deliver(PEER, Message::GetPeers(GetPeersMessage {}));
        match h.transport.sent_to(PEER).as_slice() {
            [Message::GivePeers(give)] => assert_eq!(give.peers.len(), 2),
            other => panic!("unexpected messages {:?}", other),
        }
    }

    #[test]
    fn test_connect_to_peers_respects_limits() {
        let config = DaemonConfig {
            default_connections: vec!["10.0.0.5:6000".to_string()],
            max_outgoing_connections: 2,
            ..Default::default()
        };
        let mut peers = PeerBook::in_memory(100);
        for i in 10..20 {
            peers.add_peer(&format!("10.0.1.{}:6000", i));
        }
        let mut h = harness_with(config, Box::new(peers));

        h.daemon().connect_to_peers();
        let dialed = h.transport.recorded.lock().dialed.clone();
        assert_eq!(dialed.len(), 2);
        assert_eq!(dialed[0], "10.0.0.5:6000");
        assert_eq!(h.connections.pending_len(), 2);

        // a failed dial frees the slot
        h.event_loop.handle_dial_failure(DialFailure {
            addr: "10.0.0.5:6000".to_string(),
            error: TransportError::DialTimeout("10.0.0.5:6000".to_string()),
        });
        assert_eq!(h.connections.pending_len(), 1);
        assert!(h.connections.get("10.0.0.5:6000").is_none());
    }

    #[test]
    fn test_disconnect_during_dial_is_replayed() {
        let mut h = harness();
        h.connections.pending(PEER).unwrap();
        h.daemon().disconnect(PEER, DisconnectReason::Idle);

        h.connections.connected(PEER).unwrap();
        h.event_loop.handle_event(ConnectionEvent::Connected {
            addr: PEER.to_string(),
            outgoing: true,
        });

        assert_eq!(
            h.transport.disconnects(),
            vec![
                (PEER.to_string(), DisconnectReason::Idle),
                (PEER.to_string(), DisconnectReason::Idle),
            ]
        );
        assert!(h.transport.sent_to(PEER).is_empty());
    }

    #[test]
    fn test_pubkey_mismatch_blacklists() {
        let config = DaemonConfig {
            blockchain_pubkey: Some(random_pubkey().hex()),
            ..Default::default()
        };
        let mut h = harness_with(config, Box::new(PeerBook::in_memory(100)));
        h.connect(PEER);

        // the reading task rejects the introduction and the pool reports it
        h.event_loop.handle_event(ConnectionEvent::Disconnected {
            addr: PEER.to_string(),
            reason: DisconnectReason::BlockchainPubkeyNotMatched,
        });
        assert!(h.daemon().peers().is_blacklisted(PEER));
        assert!(h.connections.is_empty());
    }

    /// Queue an incoming connection and its introduction before the loop runs
    fn queue_incoming(h: &Harness, addr: &str, mirror: u32) {
        h.connections.connected(addr).unwrap();
        h.senders
            .events
            .try_send(ConnectionEvent::Connected {
                addr: addr.to_string(),
                outgoing: false,
            })
            .unwrap();
        h.senders
            .ready
            .try_send(ReadyMessage {
                addr: addr.to_string(),
                message: Message::Introduction(peer_intro(h, mirror)),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_admits_before_processing_messages() {
        let mut peers = PeerBook::in_memory(100);
        peers.add_blacklist_entry(PEER, Duration::from_secs(60));
        let h = harness_with(DaemonConfig::default(), Box::new(peers));
        queue_incoming(&h, PEER, 5);

        let Harness {
            event_loop,
            transport,
            connections,
            senders,
            shutdown,
            ..
        } = h;
        let handle = tokio::spawn(event_loop.run());

        wait_for(|| senders.ready.capacity() == senders.ready.max_capacity()).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(
            transport.disconnects(),
            vec![(PEER.to_string(), DisconnectReason::IsBlacklisted)]
        );
        assert!(transport.sent_to(PEER).is_empty());
        assert_eq!(
            connections.get(PEER).unwrap().state,
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn test_run_introduces_before_syncing() {
        let h = harness();
        queue_incoming(&h, PEER, 5);

        let Harness {
            event_loop,
            transport,
            connections,
            senders,
            shutdown,
            ..
        } = h;
        let handle = tokio::spawn(event_loop.run());

        wait_for(|| senders.ready.capacity() == senders.ready.max_capacity()).await;
        shutdown.cancel();
        handle.await.unwrap();

        let kinds: Vec<MessageKind> = transport.sent_to(PEER).iter().map(Message::kind).collect();
        assert_eq!(kinds.first(), Some(&MessageKind::Introduction));
        assert!(kinds.contains(&MessageKind::GetBlocks));
        assert!(transport.disconnects().is_empty());
        assert!(connections.get(PEER).unwrap().is_introduced());
    }

    #[tokio::test]
    async fn test_run_shuts_down_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            data_dir: dir.path().to_path_buf(),
            disable_outgoing: true,
            ..Default::default()
        };
        let mut peers = PeerBook::load(dir.path(), 100).unwrap();
        peers.add_peer("10.0.0.9:6000");

        let connections = Arc::new(ConnectionRegistry::new());
        let transport = RecordingTransport::default();
        let identity = Arc::new(NodeIdentity::new(6000, PROTOCOL_VERSION, None, "t".into()));
        let daemon = Daemon::new(
            config,
            identity,
            connections,
            Arc::new(transport.clone()),
            Box::new(peers),
            Box::new(MemoryVisor::new(genesis())),
        );

        let (_senders, receivers) = daemon_channels(8, 8, 8);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(EventLoop::new(daemon, receivers, shutdown.clone()).run());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(transport.recorded.lock().shut_down);
        assert!(dir.path().join(PEERS_FILE).exists());
    }
}
