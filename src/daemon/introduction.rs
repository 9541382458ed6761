//! Introduction handshake
//!
//! Both sides send an introduction as soon as a socket is up. The checks in
//! [`NodeIdentity::verify_introduction`] run on the connection's reading
//! task, before anything else from that peer is queued; registering the
//! mirror happens later on the event loop.

use crate::crypto::PubKey;
use crate::daemon::connections::split_addr;
use crate::network::disconnect::DisconnectReason;
use crate::network::message::{IntroductionExtra, IntroductionMessage};

/// What this daemon tells peers about itself
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    /// Random value picked at startup
    pub mirror: u32,
    pub protocol_version: i32,
    pub listen_port: u16,
    pub blockchain_pubkey: Option<PubKey>,
    pub user_agent: String,
}

impl NodeIdentity {
    /// Identity with a fresh random mirror
    pub fn new(
        listen_port: u16,
        protocol_version: i32,
        blockchain_pubkey: Option<PubKey>,
        user_agent: String,
    ) -> Self {
        Self {
            mirror: rand::random(),
            protocol_version,
            listen_port,
            blockchain_pubkey,
            user_agent,
        }
    }

    /// Our introduction. The user agent is only carried next to a key.
    pub fn introduction(&self) -> IntroductionMessage {
        let pubkey = self.blockchain_pubkey.map(|key| *key.as_bytes());
        let extra = IntroductionExtra {
            pubkey,
            user_agent: pubkey.map(|_| self.user_agent.clone()),
        };

        IntroductionMessage {
            mirror: self.mirror,
            listen_port: self.listen_port,
            protocol_version: self.protocol_version,
            extra: extra.to_bytes(),
        }
    }

    /// Check a peer's introduction; the first failing check decides the
    /// disconnect reason.
    pub fn verify_introduction(
        &self,
        addr: &str,
        intro: &IntroductionMessage,
    ) -> Result<IntroductionExtra, DisconnectReason> {
        if intro.mirror == self.mirror {
            log::info!("Remote mirror value {} matches ours, {} is us", intro.mirror, addr);
            return Err(DisconnectReason::SelfConnect);
        }

        if intro.protocol_version != self.protocol_version {
            log::info!(
                "{} speaks protocol version {}, we speak {}",
                addr,
                intro.protocol_version,
                self.protocol_version
            );
            return Err(DisconnectReason::InvalidVersion);
        }

        let extra = IntroductionExtra::parse(&intro.extra).map_err(|e| {
            log::info!("Invalid introduction extra data from {}: {}", addr, e);
            DisconnectReason::InvalidExtraData
        })?;
        self.verify_pubkey(addr, &extra)?;

        if split_addr(addr).is_err() {
            log::warn!("Introduction from unparsable address {}", addr);
            return Err(DisconnectReason::OtherError);
        }

        Ok(extra)
    }

    fn verify_pubkey(&self, addr: &str, extra: &IntroductionExtra) -> Result<(), DisconnectReason> {
        let Some(theirs) = extra.pubkey else {
            return Ok(());
        };

        match &self.blockchain_pubkey {
            Some(ours) if ours.as_bytes() != &theirs => {
                log::info!("Blockchain pubkey from {} does not match ours", addr);
                Err(DisconnectReason::BlockchainPubkeyNotMatched)
            }
            Some(_) => Ok(()),
            None => PubKey::from_slice(&theirs).map(|_| ()).map_err(|e| {
                log::info!("Invalid blockchain pubkey from {}: {}", addr, e);
                DisconnectReason::InvalidExtraData
            }),
        }
    }
}
