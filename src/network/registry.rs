//! Bidirectional map between message kinds and wire prefixes.
//!
//! Built once at startup and shared read-only with every connection.
//! Conflicting registrations are configuration errors that must stop the
//! daemon before it accepts any connection.

use crate::network::message::MessageKind;
use crate::wire::{MessagePrefix, WireError, WireResult};
use std::collections::HashMap;

/// Registry of message prefixes
#[derive(Debug, Default, Clone)]
pub struct MessageRegistry {
    by_prefix: HashMap<MessagePrefix, MessageKind>,
    by_kind: HashMap<MessageKind, MessagePrefix>,
}

impl MessageRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every message kind under its default prefix, verified
    pub fn standard() -> WireResult<Self> {
        let mut registry = Self::new();
        for kind in MessageKind::ALL {
            let prefix: MessagePrefix = kind.default_prefix().parse()?;
            registry.register(kind, prefix)?;
        }
        registry.verify_messages()?;
        Ok(registry)
    }

    /// Register `kind` under `prefix`
    pub fn register(&mut self, kind: MessageKind, prefix: MessagePrefix) -> WireResult<()> {
        if self.by_kind.contains_key(&kind) {
            return Err(WireError::DuplicateType(kind.to_string()));
        }
        if self.by_prefix.contains_key(&prefix) {
            return Err(WireError::DuplicatePrefix(prefix));
        }

        self.by_kind.insert(kind, prefix);
        self.by_prefix.insert(prefix, kind);
        Ok(())
    }

    /// Check every kind is registered exactly once under a valid prefix
    pub fn verify_messages(&self) -> WireResult<()> {
        for kind in MessageKind::ALL {
            let prefix = self
                .by_kind
                .get(&kind)
                .ok_or_else(|| WireError::Unregistered(kind.to_string()))?;
            MessagePrefix::new(*prefix.as_bytes())?;

            if self.by_prefix.get(prefix) != Some(&kind) {
                return Err(WireError::DuplicatePrefix(*prefix));
            }
        }

        if self.by_prefix.len() != self.by_kind.len() {
            return Err(WireError::Malformed(format!(
                "registry maps disagree: {} prefixes, {} kinds",
                self.by_prefix.len(),
                self.by_kind.len()
            )));
        }

        Ok(())
    }

    pub fn prefix_of(&self, kind: MessageKind) -> WireResult<MessagePrefix> {
        self.by_kind
            .get(&kind)
            .copied()
            .ok_or_else(|| WireError::Unregistered(kind.to_string()))
    }

    pub fn kind_of(&self, prefix: &MessagePrefix) -> WireResult<MessageKind> {
        self.by_prefix
            .get(prefix)
            .copied()
            .ok_or(WireError::UnknownPrefix(*prefix))
    }

    pub fn len(&self) -> usize {
        self.by_kind.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }
}
