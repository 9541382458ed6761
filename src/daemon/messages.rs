//! Two-phase message dispatch
//!
//! Every inbound message goes through two steps:
//!
//! 1. `handle` runs on the connection's reading task as soon as the frame
//!    is decoded. It may only look at the message and our identity; an error
//!    closes the connection before anything else from the peer is read.
//! 2. `process` runs later, exactly once, on the event loop. It receives a
//!    [`LoopContext`], which only the event loop can create, and is the only
//!    place daemon state is changed in response to a peer.

use crate::daemon::connections::ConnectionError;
use crate::daemon::event_loop::LoopContext;
use crate::daemon::introduction::NodeIdentity;
use crate::network::disconnect::DisconnectReason;
use crate::network::message::{
    AnnounceBlocksMessage, AnnounceTxnsMessage, DisconnectMessage, GetBlocksMessage,
    GetPeersMessage, GetTxnsMessage, GiveBlocksMessage, GivePeersMessage, GiveTxnsMessage,
    IntroductionExtra, IntroductionMessage, Message, PeerAddress, PingMessage, PongMessage,
};
use crate::network::transport::InboundHandler;
use std::sync::Arc;

/// What `handle` may see
#[derive(Debug, Clone, Copy)]
pub struct MessageContext<'a> {
    pub addr: &'a str,
    pub identity: &'a NodeIdentity,
}

/// Behaviour of an inbound message
pub trait AsyncMessage: Sized {
    /// Checks that must pass before the peer's next message is read
    fn handle(&self, _ctx: &MessageContext<'_>) -> Result<(), DisconnectReason> {
        Ok(())
    }

    /// Act on the message from the event loop
    fn process(self, ctx: &mut LoopContext<'_>);
}

impl AsyncMessage for IntroductionMessage {
    fn handle(&self, ctx: &MessageContext<'_>) -> Result<(), DisconnectReason> {
        ctx.identity.verify_introduction(ctx.addr, self).map(|_| ())
    }

    fn process(self, ctx: &mut LoopContext<'_>) {
        let addr = ctx.addr();
        let daemon = ctx.daemon();
        // already validated by handle
        let user_agent = IntroductionExtra::parse(&self.extra)
            .ok()
            .and_then(|extra| extra.user_agent);

        match daemon.connections().introduced(addr, &self) {
            Ok(conn) => daemon.on_introduced(&conn, user_agent),
            Err(ConnectionError::IPMirrorAlreadyRegistered { mirror, ip }) => {
                log::info!("{} is already connected from {} (mirror {})", addr, ip, mirror);
                daemon.disconnect(addr, DisconnectReason::ConnectedTwice);
            }
            Err(ConnectionError::NotExist(_)) => {
                log::debug!("Introduction from {} arrived after it disconnected", addr);
            }
            Err(ConnectionError::AlreadyIntroduced(_)) => {
                log::debug!("Ignoring repeated introduction from {}", addr);
            }
            Err(e) => {
                log::warn!("Failed to register introduction from {}: {}", addr, e);
                daemon.disconnect(addr, DisconnectReason::OtherError);
            }
        }
    }
}

impl AsyncMessage for GetPeersMessage {
    fn process(self, ctx: &mut LoopContext<'_>) {
        let addr = ctx.addr();
        let daemon = ctx.daemon();

        let peers: Vec<PeerAddress> = daemon
            .peers()
            .random_peers(daemon.config().peers_per_message)
            .iter()
            .filter_map(|p| PeerAddress::from_addr_str(p))
            .collect();
        if peers.is_empty() {
            return;
        }

        daemon.send(addr, Message::GivePeers(GivePeersMessage { peers }));
    }
}

impl AsyncMessage for GivePeersMessage {
    fn process(self, ctx: &mut LoopContext<'_>) {
        let addr = ctx.addr();
        let daemon = ctx.daemon();
        let limit = daemon.config().peers_per_message;

        let added = self
            .peers
            .iter()
            .take(limit)
            .filter(|peer| daemon.peers_mut().add_peer(&peer.to_addr_string()))
            .count();
        log::debug!("Learned {} peers from {}", added, addr);
    }
}

impl AsyncMessage for PingMessage {
    fn process(self, ctx: &mut LoopContext<'_>) {
        let addr = ctx.addr();
        ctx.daemon().send(addr, Message::Pong(PongMessage {}));
    }
}

impl AsyncMessage for PongMessage {
    fn process(self, _ctx: &mut LoopContext<'_>) {}
}

impl AsyncMessage for GetBlocksMessage {
    fn process(self, ctx: &mut LoopContext<'_>) {
        let addr = ctx.addr();
        let daemon = ctx.daemon();

        let count = self
            .requested_blocks
            .min(daemon.config().blocks_response_count);
        let blocks = daemon.visor().blocks_since(self.last_block, count);
        if blocks.is_empty() {
            return;
        }

        log::debug!(
            "Giving {} blocks after {} to {}",
            blocks.len(),
            self.last_block,
            addr
        );
        daemon.send(addr, Message::GiveBlocks(GiveBlocksMessage { blocks }));
    }
}

impl AsyncMessage for GiveBlocksMessage {
    fn process(self, ctx: &mut LoopContext<'_>) {
        let addr = ctx.addr();
        let daemon = ctx.daemon();

        let mut executed = 0;
        for block in self.blocks {
            let seq = block.seq();
            if seq <= daemon.visor().head_sequence() {
                continue;
            }
            if let Err(e) = daemon.visor_mut().execute_block(block) {
                log::info!("Rejected block {} from {}: {}", seq, addr, e);
                break;
            }
            executed += 1;
        }
        if executed == 0 {
            return;
        }

        let head = daemon.visor().head_sequence();
        log::info!("Added {} blocks from {}, head is {}", executed, addr, head);
        daemon.announce_blocks();

        if daemon.heights().estimate(head) > head {
            daemon.request_blocks_from(addr);
        }
    }
}

impl AsyncMessage for AnnounceBlocksMessage {
    fn process(self, ctx: &mut LoopContext<'_>) {
        let addr = ctx.addr();
        let daemon = ctx.daemon();

        daemon.heights().record(addr, self.max_bk_seq);
        let _ = daemon
            .connections()
            .modify(addr, |c| c.height = self.max_bk_seq);

        if self.max_bk_seq > daemon.visor().head_sequence() {
            daemon.request_blocks_from(addr);
        }
    }
}

impl AsyncMessage for GetTxnsMessage {
    fn process(self, ctx: &mut LoopContext<'_>) {
        let addr = ctx.addr();
        let daemon = ctx.daemon();

        let txns = daemon.visor().transactions(&self.txns);
        if txns.is_empty() {
            return;
        }
        daemon.send(addr, Message::GiveTxns(GiveTxnsMessage { txns }));
    }
}

impl AsyncMessage for GiveTxnsMessage {
    fn process(self, ctx: &mut LoopContext<'_>) {
        let addr = ctx.addr();
        let daemon = ctx.daemon();

        let mut accepted = Vec::new();
        for tx in self.txns {
            let hash = tx.hash();
            match daemon.visor_mut().inject_transaction(tx) {
                Ok(true) => accepted.push(hash),
                Ok(false) => {}
                Err(e) => log::debug!("Rejected transaction {} from {}: {}", hash, addr, e),
            }
        }

        if !accepted.is_empty() {
            log::debug!("Accepted {} transactions from {}", accepted.len(), addr);
            daemon.announce_txns(accepted, Some(addr));
        }
    }
}

impl AsyncMessage for AnnounceTxnsMessage {
    fn process(self, ctx: &mut LoopContext<'_>) {
        let addr = ctx.addr();
        let daemon = ctx.daemon();

        let known = daemon.visor().known_transaction_hashes(&self.txns);
        let unknown: Vec<_> = self
            .txns
            .into_iter()
            .filter(|hash| !known.contains(hash))
            .collect();
        if unknown.is_empty() {
            return;
        }

        daemon.send(addr, Message::GetTxns(GetTxnsMessage { txns: unknown }));
    }
}

impl AsyncMessage for DisconnectMessage {
    fn process(self, ctx: &mut LoopContext<'_>) {
        let addr = ctx.addr();
        let reason = DisconnectReason::from_code(self.reason);
        log::info!("{} is disconnecting us: {}", addr, reason);
        ctx.daemon()
            .disconnect(addr, DisconnectReason::ReceivedDisconnect);
    }
}

impl Message {
    /// Run the reading-task checks for this message
    pub fn handle(&self, ctx: &MessageContext<'_>) -> Result<(), DisconnectReason> {
        match self {
            Message::Introduction(m) => m.handle(ctx),
            Message::GetPeers(m) => m.handle(ctx),
            Message::GivePeers(m) => m.handle(ctx),
            Message::Ping(m) => m.handle(ctx),
            Message::Pong(m) => m.handle(ctx),
            Message::GetBlocks(m) => m.handle(ctx),
            Message::GiveBlocks(m) => m.handle(ctx),
            Message::AnnounceBlocks(m) => m.handle(ctx),
            Message::GetTxns(m) => m.handle(ctx),
            Message::GiveTxns(m) => m.handle(ctx),
            Message::AnnounceTxns(m) => m.handle(ctx),
            Message::Disconnect(m) => m.handle(ctx),
        }
    }

    /// Act on this message from the event loop
    pub fn process(self, ctx: &mut LoopContext<'_>) {
        match self {
            Message::Introduction(m) => m.process(ctx),
            Message::GetPeers(m) => m.process(ctx),
            Message::GivePeers(m) => m.process(ctx),
            Message::Ping(m) => m.process(ctx),
            Message::Pong(m) => m.process(ctx),
            Message::GetBlocks(m) => m.process(ctx),
            Message::GiveBlocks(m) => m.process(ctx),
            Message::AnnounceBlocks(m) => m.process(ctx),
            Message::GetTxns(m) => m.process(ctx),
            Message::GiveTxns(m) => m.process(ctx),
            Message::AnnounceTxns(m) => m.process(ctx),
            Message::Disconnect(m) => m.process(ctx),
        }
    }
}

/// Runs `handle` for every message read by the connection pool
#[derive(Debug, Clone)]
pub struct MessageGate {
    identity: Arc<NodeIdentity>,
}

impl MessageGate {
    pub fn new(identity: Arc<NodeIdentity>) -> Self {
        Self { identity }
    }
}

impl InboundHandler for MessageGate {
    fn handle(&self, addr: &str, message: &Message) -> Result<(), DisconnectReason> {
        let ctx = MessageContext {
            addr,
            identity: &self.identity,
        };
        message.handle(&ctx)
    }
}
