//! Per-session mutable state for one emulated token (`TokenState`).
//!
//! Created fresh on device connect, lives for the duration of the session,
//! and is discarded on disconnect. Owns its [`KeyDefinition`] exclusively —
//! the dispatcher borrows it mutably for the duration of one command and
//! there is no cross-token sharing, so no internal locking is needed.

use crate::key_definition::KeyDefinition;

/// Tracks where a session is in the handshake: `Fresh -> KeysSet -> Opened`.
/// Exposed for tests and logging; the dispatcher itself only consults
/// `is_init_done` / `is_key_opened`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Fresh,
    KeysSet,
    Opened,
}

/// Mutable per-session state plus the immutable key definition it guards.
pub struct TokenState {
    pub key: KeyDefinition,

    pub chiper_key1: u16,
    pub chiper_key2: u16,
    pub encoded_status: u8,
    pub is_init_done: bool,
    pub is_key_opened: bool,
}

impl TokenState {
    /// A fresh session for `key`, as created on "device connect".
    pub fn new(key: KeyDefinition) -> Self {
        Self {
            key,
            chiper_key1: 0,
            chiper_key2: 0,
            encoded_status: 0,
            is_init_done: false,
            is_key_opened: false,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        if self.is_key_opened {
            SessionPhase::Opened
        } else if self.is_init_done {
            SessionPhase::KeysSet
        } else {
            SessionPhase::Fresh
        }
    }
}
