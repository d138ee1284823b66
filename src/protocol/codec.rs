//! Frame Decoder
//!
//! Membaca satu frame per panggilan langsung dari byte stream (blocking).
//! Payload dibaca ke buffer stack berukuran tetap, tidak ada alokasi heap.

use std::io::{self, Read};

use tracing::debug;

use super::message::{Header, Message, TypeRegistry, HEADER_SIZE, TOKEN_SIZE};
use crate::error::ProtocolError;

/// Largest fixed payload of any registered kind
const MAX_PAYLOAD_SIZE: usize = TOKEN_SIZE;

/// Read until `buf` is full or the stream ends. Returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Baca header 16 byte.
///
/// EOF sebelum byte pertama = [`ProtocolError::StreamEnded`] (peer disconnect).
/// EOF di tengah header = I/O error `UnexpectedEof`.
pub fn read_header<R: Read>(reader: &mut R) -> Result<Header, ProtocolError> {
    let mut buf = [0u8; HEADER_SIZE];
    match read_full(reader, &mut buf)? {
        0 => Err(ProtocolError::StreamEnded),
        HEADER_SIZE => Ok(Header::from_bytes(&buf)),
        n => Err(ProtocolError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("stream ended after {n} of {HEADER_SIZE} header bytes"),
        ))),
    }
}

/// Message courier over a byte stream
///
/// Decode-only: [`Courier::send`] exists for API symmetry but does no I/O.
pub struct Courier<'r, R> {
    reader: R,
    registry: &'r TypeRegistry,
    strict_frame_size: bool,
}

impl<'r, R: Read> Courier<'r, R> {
    pub fn new(reader: R, registry: &'r TypeRegistry) -> Self {
        Self {
            reader,
            registry,
            strict_frame_size: false,
        }
    }

    /// Reject frames whose declared `size` does not match the resolved type.
    pub fn with_strict_frame_size(mut self, strict: bool) -> Self {
        self.strict_frame_size = strict;
        self
    }

    /// Receive the next message.
    ///
    /// Unknown type: header dikembalikan apa adanya dan tidak ada byte
    /// tambahan yang dibaca (field `size` tidak dipakai untuk skip).
    pub fn receive(&mut self) -> Result<Message, ProtocolError> {
        let header = read_header(&mut self.reader)?;

        let kind = self
            .registry
            .resolve(header.msg_type)
            .ok_or(ProtocolError::UnknownMessage(header))?;

        let expected_frame = kind.frame_size() as u64;
        if header.size != expected_frame {
            if self.strict_frame_size {
                return Err(ProtocolError::DeclaredSize {
                    header,
                    expected: expected_frame,
                });
            }
            debug!(
                declared = header.size,
                expected = expected_frame,
                msg_type = %header.msg_type,
                "declared frame size ignored"
            );
        }

        let expected = self.registry.size_of(kind);
        let mut payload = [0u8; MAX_PAYLOAD_SIZE];
        let actual = read_full(&mut self.reader, &mut payload[..expected])?;
        if actual < expected {
            return Err(ProtocolError::Size {
                msg_type: header.msg_type,
                expected,
                actual,
            });
        }

        Ok(Message::decode(kind, &payload[..expected]))
    }

    /// Encoding is not implemented: no bytes are written.
    pub fn send(&mut self, _msg: &Message) {}

    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Authorization, LinkLibrary, MessageKind, MessageType, Token, Version};
    use std::io::Cursor;

    fn frame(msg_type: u64, declared: u64, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(&declared.to_le_bytes());
        buf.extend_from_slice(&msg_type.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    fn well_formed(msg_type: MessageType, payload: &[u8]) -> Vec<u8> {
        frame(msg_type.0, (HEADER_SIZE + payload.len()) as u64, payload)
    }

    #[test]
    fn test_decode_ok() {
        let registry = TypeRegistry::standard().unwrap();
        let data = well_formed(MessageType::OK, &[]);
        let mut courier = Courier::new(Cursor::new(data), &registry);

        assert_eq!(courier.receive().unwrap(), Message::Ok);
    }

    #[test]
    fn test_decode_version() {
        let registry = TypeRegistry::standard().unwrap();
        let data = well_formed(MessageType::VERSION, &0x0102_0304_0506_0708u64.to_le_bytes());
        let mut courier = Courier::new(Cursor::new(data), &registry);

        assert_eq!(
            courier.receive().unwrap(),
            Message::Version(Version {
                value: 0x0102_0304_0506_0708
            })
        );
    }

    #[test]
    fn test_decode_authorization() {
        let registry = TypeRegistry::standard().unwrap();
        let mut token = [0u8; 128];
        for (i, b) in token.iter_mut().enumerate() {
            *b = i as u8;
        }
        let data = well_formed(MessageType::AUTHORIZATION, &token);
        let mut courier = Courier::new(Cursor::new(data), &registry);

        assert_eq!(
            courier.receive().unwrap(),
            Message::Authorization(Authorization {
                token: Token(token)
            })
        );
    }

    #[test]
    fn test_decode_link_library() {
        let registry = TypeRegistry::standard().unwrap();
        let mut name = [0u8; 64];
        name[..7].copy_from_slice(b"libtest");
        let data = well_formed(MessageType::LINK_LIBRARY, &name);
        let mut courier = Courier::new(Cursor::new(data), &registry);

        match courier.receive().unwrap() {
            Message::LinkLibrary(link) => {
                assert_eq!(link, LinkLibrary { name_buf: name });
                assert_eq!(link.name(), "libtest");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_sequential_frames() {
        let registry = TypeRegistry::standard().unwrap();
        let mut data = well_formed(MessageType::VERSION, &3u64.to_le_bytes());
        data.extend(well_formed(MessageType::OK, &[]));
        data.extend(well_formed(MessageType::VERSION, &4u64.to_le_bytes()));
        let mut courier = Courier::new(Cursor::new(data), &registry);

        assert_eq!(courier.receive().unwrap(), Message::Version(Version { value: 3 }));
        assert_eq!(courier.receive().unwrap(), Message::Ok);
        assert_eq!(courier.receive().unwrap(), Message::Version(Version { value: 4 }));
        assert!(courier.receive().unwrap_err().is_stream_end());
    }

    #[test]
    fn test_unknown_type_consumes_header_only() {
        let registry = TypeRegistry::standard().unwrap();
        let mut data = frame(0xFFFF, 24, &[]);
        data.extend_from_slice(&[0xAA; 8]);
        let mut courier = Courier::new(Cursor::new(data), &registry);

        match courier.receive() {
            Err(ProtocolError::UnknownMessage(header)) => {
                assert_eq!(header.size, 24);
                assert_eq!(header.msg_type, MessageType(0xFFFF));
            }
            other => panic!("expected unknown message, got {:?}", other),
        }
        assert_eq!(courier.get_ref().position(), HEADER_SIZE as u64);
    }

    #[test]
    fn test_short_payload_is_size_error() {
        let registry = TypeRegistry::standard().unwrap();
        let data = frame(MessageType::AUTHORIZATION.0, 144, &[1u8; 5]);
        let mut courier = Courier::new(Cursor::new(data), &registry);

        match courier.receive() {
            Err(ProtocolError::Size {
                msg_type,
                expected,
                actual,
            }) => {
                assert_eq!(msg_type, MessageType::AUTHORIZATION);
                assert_eq!(expected, 128);
                assert_eq!(actual, 5);
            }
            other => panic!("expected size error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_payload_is_size_error() {
        let registry = TypeRegistry::standard().unwrap();
        let data = frame(MessageType::VERSION.0, 24, &[]);
        let mut courier = Courier::new(Cursor::new(data), &registry);

        assert!(matches!(
            courier.receive(),
            Err(ProtocolError::Size {
                expected: 8,
                actual: 0,
                ..
            })
        ));
    }

    #[test]
    fn test_empty_stream_is_stream_end() {
        let registry = TypeRegistry::standard().unwrap();
        let mut courier = Courier::new(Cursor::new(Vec::new()), &registry);

        assert!(matches!(courier.receive(), Err(ProtocolError::StreamEnded)));
    }

    #[test]
    fn test_partial_header_is_io_error() {
        let registry = TypeRegistry::standard().unwrap();
        let mut courier = Courier::new(Cursor::new(vec![0u8; 10]), &registry);

        match courier.receive() {
            Err(ProtocolError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected io error, got {:?}", other),
        }
    }

    #[test]
    fn test_declared_size_ignored_by_default() {
        let registry = TypeRegistry::standard().unwrap();
        let data = frame(MessageType::VERSION.0, 9999, &5u64.to_le_bytes());
        let mut courier = Courier::new(Cursor::new(data), &registry);

        assert_eq!(courier.receive().unwrap(), Message::Version(Version { value: 5 }));
    }

    #[test]
    fn test_declared_size_checked_in_strict_mode() {
        let registry = TypeRegistry::standard().unwrap();
        let data = frame(MessageType::VERSION.0, 9999, &5u64.to_le_bytes());
        let mut courier =
            Courier::new(Cursor::new(data), &registry).with_strict_frame_size(true);

        match courier.receive() {
            Err(ProtocolError::DeclaredSize { header, expected }) => {
                assert_eq!(header.size, 9999);
                assert_eq!(expected, 24);
            }
            other => panic!("expected declared size error, got {:?}", other),
        }
        // payload tidak dibaca
        assert_eq!(courier.get_ref().position(), HEADER_SIZE as u64);
    }

    #[test]
    fn test_strict_mode_accepts_consistent_frames() {
        let registry = TypeRegistry::standard().unwrap();
        let data = well_formed(MessageType::OK, &[]);
        let mut courier =
            Courier::new(Cursor::new(data), &registry).with_strict_frame_size(true);

        assert_eq!(courier.receive().unwrap().kind(), MessageKind::Ok);
    }

    #[test]
    fn test_send_writes_nothing() {
        let registry = TypeRegistry::standard().unwrap();
        let mut courier = Courier::new(Cursor::new(Vec::<u8>::new()), &registry);

        courier.send(&Message::Version(Version { value: 1 }));
        assert!(courier.into_inner().into_inner().is_empty());
    }
}
