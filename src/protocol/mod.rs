//! Protocol Layer: Fixed-Layout Binary Frames
//!
//! Prinsip desain:
//! - Fixed-size header: 16 byte, little-endian
//! - Fixed-size payload per tipe, diketahui dari type registry
//! - Closed message set: tidak ada reflection, decode lewat match exhaustive

mod codec;
mod message;

pub use codec::{read_header, Courier};
pub use message::{
    Authorization, Header, LinkLibrary, Message, MessageKind, MessageType, Token, TypeRegistry,
    Version, HEADER_SIZE, LIBRARY_NAME_SIZE, TOKEN_SIZE, VERSION_SIZE,
};
