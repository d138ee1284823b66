//! Error types for linkd.
//!
//! Semua error di sini bersifat connection-scoped kecuali
//! [`RegistryError`] dan [`ConfigError`], yang fatal saat startup.

use std::io;

use thiserror::Error;

use crate::protocol::{Header, MessageKind, MessageType};

/// Failure while receiving one frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Peer closed the stream cleanly before a new header started.
    #[error("stream ended")]
    StreamEnded,

    /// Type identifier is not registered. Framing can no longer be trusted.
    #[error("unknown message {0}")]
    UnknownMessage(Header),

    #[error("unexpected message size for type {msg_type}: expected {expected} bytes, got {actual}")]
    Size {
        msg_type: MessageType,
        expected: usize,
        actual: usize,
    },

    /// Declared `size` field disagrees with the resolved type (strict mode only).
    #[error("declared frame size {} does not match {expected} for type {}", .header.size, .header.msg_type)]
    DeclaredSize { header: Header, expected: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Graceful disconnect, not worth an error log.
    pub fn is_stream_end(&self) -> bool {
        matches!(self, ProtocolError::StreamEnded)
    }
}

/// Failure of a worker handoff.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// Socket could not be duplicated or the worker could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    /// Worker was killed by a signal, or waiting on it failed.
    #[error("worker did not exit normally{}", .signal.map(|s| format!(" (signal {s})")).unwrap_or_default())]
    AbnormalExit {
        signal: Option<i32>,
        #[source]
        source: Option<io::Error>,
    },
}

/// Type table violates the bidirectional uniqueness invariant.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("type {msg_type} registered twice ({first:?} and {second:?})")]
    DuplicateType {
        msg_type: MessageType,
        first: MessageKind,
        second: MessageKind,
    },

    #[error("{kind:?} registered twice (types {first} and {second})")]
    DuplicateKind {
        kind: MessageKind,
        first: MessageType,
        second: MessageType,
    },

    #[error("{0:?} has no type identifier")]
    Unregistered(MessageKind),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("cannot resolve listen address {addr:?}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },
}
