//! Message Format
//!
//! Layout (little-endian):
//! ┌─────────────────────────────────────────────────────┐
//! │ Header (16 bytes, fixed): size u64 | type u64       │
//! ├─────────────────────────────────────────────────────┤
//! │ Payload (fixed per type, 0..=128 bytes)             │
//! └─────────────────────────────────────────────────────┘
//!
//! `size` adalah total frame (header + payload). Nilai ini tidak
//! dicocokkan dengan jumlah byte yang benar-benar dibaca kecuali
//! strict mode diaktifkan di [`Courier`](super::Courier).

use std::borrow::Cow;
use std::ffi::OsStr;
use std::fmt;

use crate::error::RegistryError;

/// Lebar header di wire
pub const HEADER_SIZE: usize = 16;

/// Payload sizes per kind
pub const VERSION_SIZE: usize = 8;
pub const TOKEN_SIZE: usize = 128;
pub const LIBRARY_NAME_SIZE: usize = 64;

/// Wire type identifier (opaque 64-bit value)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageType(pub u64);

impl MessageType {
    pub const VERSION: Self = Self(0x01);
    pub const AUTHORIZATION: Self = Self(0x0A);
    pub const LINK_LIBRARY: Self = Self(0x111B);
    pub const OK: Self = Self(0x0C << 56);
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageType({:#x})", self.0)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Native message layouts known to this build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Empty acknowledgment
    Ok,
    /// Client protocol version
    Version,
    /// Opaque authorization token
    Authorization,
    /// Request to link a library; ends the connection's protocol phase
    LinkLibrary,
}

impl MessageKind {
    pub const ALL: [MessageKind; 4] = [
        MessageKind::Ok,
        MessageKind::Version,
        MessageKind::Authorization,
        MessageKind::LinkLibrary,
    ];

    /// Fixed payload size in bytes
    #[inline(always)]
    pub const fn payload_size(self) -> usize {
        match self {
            MessageKind::Ok => 0,
            MessageKind::Version => VERSION_SIZE,
            MessageKind::Authorization => TOKEN_SIZE,
            MessageKind::LinkLibrary => LIBRARY_NAME_SIZE,
        }
    }

    /// Total frame size (header + payload)
    #[inline(always)]
    pub const fn frame_size(self) -> usize {
        HEADER_SIZE + self.payload_size()
    }
}

/// Frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Declared total frame size (header + payload)
    pub size: u64,
    /// Wire type identifier
    pub msg_type: MessageType,
}

impl Header {
    /// Parse header dari raw bytes
    #[inline(always)]
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        let mut size = [0u8; 8];
        let mut msg_type = [0u8; 8];
        size.copy_from_slice(&buf[..8]);
        msg_type.copy_from_slice(&buf[8..]);

        Self {
            size: u64::from_le_bytes(size),
            msg_type: MessageType(u64::from_le_bytes(msg_type)),
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{size: {}, type: {}}}", self.size, self.msg_type)
    }
}

/// 128-byte opaque credential. Equality is byte-for-byte.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Token(pub [u8; TOKEN_SIZE]);

impl Token {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Default for Token {
    fn default() -> Self {
        Self([0u8; TOKEN_SIZE])
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.to_hex())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Authorization {
    pub token: Token,
}

/// Link request. The name buffer is NUL-terminated when shorter than 64 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkLibrary {
    pub name_buf: [u8; LIBRARY_NAME_SIZE],
}

impl Default for LinkLibrary {
    fn default() -> Self {
        Self {
            name_buf: [0u8; LIBRARY_NAME_SIZE],
        }
    }
}

impl LinkLibrary {
    /// Bytes up to the first NUL, or the whole buffer when there is none.
    pub fn name_bytes(&self) -> &[u8] {
        match self.name_buf.iter().position(|&b| b == 0) {
            Some(n) => &self.name_buf[..n],
            None => &self.name_buf,
        }
    }

    /// Library name as text, for logs. Invalid UTF-8 is replaced.
    pub fn name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.name_bytes())
    }

    /// Library name as a process argument. Bytes dipakai apa adanya di unix.
    #[cfg(unix)]
    pub fn name_os(&self) -> Cow<'_, OsStr> {
        use std::os::unix::ffi::OsStrExt;
        Cow::Borrowed(OsStr::from_bytes(self.name_bytes()))
    }

    #[cfg(not(unix))]
    pub fn name_os(&self) -> Cow<'_, OsStr> {
        Cow::Owned(self.name().into_owned().into())
    }
}

/// Decoded message, closed over [`MessageKind`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ok,
    Version(Version),
    Authorization(Authorization),
    LinkLibrary(LinkLibrary),
}

impl Message {
    /// Decode payload yang ukurannya sudah pas untuk `kind`.
    ///
    /// `payload.len()` harus sama dengan `kind.payload_size()`; caller
    /// ([`Courier`](super::Courier)) yang menjamin ini.
    pub(crate) fn decode(kind: MessageKind, payload: &[u8]) -> Self {
        debug_assert_eq!(payload.len(), kind.payload_size());

        match kind {
            MessageKind::Ok => Message::Ok,
            MessageKind::Version => {
                let mut value = [0u8; VERSION_SIZE];
                value.copy_from_slice(payload);
                Message::Version(Version {
                    value: u64::from_le_bytes(value),
                })
            }
            MessageKind::Authorization => {
                let mut token = Token::default();
                token.0.copy_from_slice(payload);
                Message::Authorization(Authorization { token })
            }
            MessageKind::LinkLibrary => {
                let mut link = LinkLibrary::default();
                link.name_buf.copy_from_slice(payload);
                Message::LinkLibrary(link)
            }
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Ok => MessageKind::Ok,
            Message::Version(_) => MessageKind::Version,
            Message::Authorization(_) => MessageKind::Authorization,
            Message::LinkLibrary(_) => MessageKind::LinkLibrary,
        }
    }
}

/// Read-only bidirectional map between wire identifiers and native kinds.
///
/// Dibangun sekali sebelum accept loop, lalu hanya dibaca (dibagi
/// antar thread lewat `Arc` tanpa lock).
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    entries: Vec<(MessageType, MessageKind)>,
}

impl TypeRegistry {
    /// Standard table of the link protocol
    pub const STANDARD: [(MessageType, MessageKind); 4] = [
        (MessageType::VERSION, MessageKind::Version),
        (MessageType::AUTHORIZATION, MessageKind::Authorization),
        (MessageType::LINK_LIBRARY, MessageKind::LinkLibrary),
        (MessageType::OK, MessageKind::Ok),
    ];

    /// Build a registry, rejecting tables where either direction is not unique
    /// or some kind has no identifier.
    pub fn build(table: &[(MessageType, MessageKind)]) -> Result<Self, RegistryError> {
        let mut entries: Vec<(MessageType, MessageKind)> = Vec::with_capacity(table.len());

        for &(msg_type, kind) in table {
            if let Some(&(_, existing)) = entries.iter().find(|(t, _)| *t == msg_type) {
                return Err(RegistryError::DuplicateType {
                    msg_type,
                    first: existing,
                    second: kind,
                });
            }
            if let Some(&(existing, _)) = entries.iter().find(|(_, k)| *k == kind) {
                return Err(RegistryError::DuplicateKind {
                    kind,
                    first: existing,
                    second: msg_type,
                });
            }
            entries.push((msg_type, kind));
        }

        for kind in MessageKind::ALL {
            if !entries.iter().any(|(_, k)| *k == kind) {
                return Err(RegistryError::Unregistered(kind));
            }
        }

        Ok(Self { entries })
    }

    pub fn standard() -> Result<Self, RegistryError> {
        Self::build(&Self::STANDARD)
    }

    /// Wire identifier -> native kind
    #[inline(always)]
    pub fn resolve(&self, msg_type: MessageType) -> Option<MessageKind> {
        self.entries
            .iter()
            .find(|(t, _)| *t == msg_type)
            .map(|&(_, kind)| kind)
    }

    /// Native kind -> wire identifier. Total because `build` rejects gaps.
    #[inline(always)]
    pub fn type_of(&self, kind: MessageKind) -> MessageType {
        self.entries
            .iter()
            .find(|(_, k)| *k == kind)
            .map(|&(t, _)| t)
            .unwrap_or_else(|| unreachable!("registry built without {kind:?}"))
    }

    #[inline(always)]
    pub fn size_of(&self, kind: MessageKind) -> usize {
        kind.payload_size()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
