//! Connection Dispatcher
//!
//! Satu thread per koneksi. Loop decode-dispatch berjalan selama state
//! `Active`; transisi ke `Closed` terjadi tepat sekali, dan socket ditutup
//! saat `Connection` di-consume oleh [`Connection::run`].

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::server::ServerStats;
use crate::error::{HandoffError, ProtocolError};
use crate::handoff::{Handoff, WorkerExit};
use crate::protocol::{Courier, Message, Token, TypeRegistry};

/// Why a connection left the `Active` state
#[derive(Debug)]
pub enum CloseReason {
    /// Peer closed between frames
    PeerClosed,
    /// Unknown type, size mismatch, or I/O failure
    Protocol(ProtocolError),
    /// Worker ran and exited normally
    HandedOff(WorkerExit),
    /// Worker could not be spawned or did not exit normally
    HandoffFailed(HandoffError),
}

enum ConnectionState {
    Active,
    Closed(CloseReason),
}

/// Values reported by the peer before the link request.
///
/// Tidak ada negosiasi versi dan token tidak diverifikasi.
#[derive(Debug, Default, Clone)]
pub struct Session {
    pub version: Option<u64>,
    pub token: Option<Token>,
    pub acks: u64,
}

/// Per-connection dispatcher
pub struct Connection<H: Handoff> {
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<TypeRegistry>,
    handoff: Arc<H>,
    stats: Arc<ServerStats>,
    strict_frame_size: bool,
    session: Session,
}

impl<H: Handoff> Connection<H> {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        registry: Arc<TypeRegistry>,
        handoff: Arc<H>,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            stream,
            peer,
            registry,
            handoff,
            stats,
            strict_frame_size: false,
            session: Session::default(),
        }
    }

    pub fn with_strict_frame_size(mut self, strict: bool) -> Self {
        self.strict_frame_size = strict;
        self
    }

    /// Jalankan loop sampai `Closed`, lalu tutup socket.
    pub fn run(mut self) -> (CloseReason, Session) {
        info!(peer = %self.peer, "Client connected");

        let reason = self.dispatch_loop();
        self.record_close(&reason);

        info!(peer = %self.peer, "Client disconnected");
        // Satu-satunya titik penutupan socket
        drop(self.stream);

        (reason, self.session)
    }

    fn dispatch_loop(&mut self) -> CloseReason {
        let registry = Arc::clone(&self.registry);
        let mut courier =
            Courier::new(&self.stream, &registry).with_strict_frame_size(self.strict_frame_size);

        loop {
            let msg = match courier.receive() {
                Ok(msg) => msg,
                Err(ProtocolError::StreamEnded) => return CloseReason::PeerClosed,
                Err(e) => return CloseReason::Protocol(e),
            };
            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

            let state = match msg {
                Message::Ok => {
                    info!(peer = %self.peer, "OK");
                    self.session.acks += 1;
                    ConnectionState::Active
                }
                Message::Version(v) => {
                    info!(peer = %self.peer, version = v.value, "Version reported");
                    self.session.version = Some(v.value);
                    ConnectionState::Active
                }
                Message::Authorization(auth) => {
                    warn!(
                        peer = %self.peer,
                        token = %auth.token.to_hex(),
                        "Authorization token received but not verified"
                    );
                    self.session.token = Some(auth.token);
                    ConnectionState::Active
                }
                Message::LinkLibrary(link) => {
                    info!(peer = %self.peer, library = %link.name(), "Link library requested");

                    self.stats.handoffs_started.fetch_add(1, Ordering::Relaxed);
                    // Satu link request per koneksi, apapun hasilnya.
                    // Nama diteruskan sebagai bytes mentah, bukan versi lossy.
                    match self.handoff.handoff(&self.stream, &link.name_os()) {
                        Ok(exit) => ConnectionState::Closed(CloseReason::HandedOff(exit)),
                        Err(e) => ConnectionState::Closed(CloseReason::HandoffFailed(e)),
                    }
                }
            };

            if let ConnectionState::Closed(reason) = state {
                return reason;
            }
        }
    }

    fn record_close(&self, reason: &CloseReason) {
        match reason {
            CloseReason::PeerClosed => debug!(peer = %self.peer, "Peer closed stream"),
            CloseReason::Protocol(ProtocolError::UnknownMessage(header)) => {
                self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %self.peer, %header, "unknown message");
            }
            CloseReason::Protocol(e) => {
                self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %self.peer, "{}", e);
            }
            CloseReason::HandedOff(exit) => {
                debug!(peer = %self.peer, code = exit.code, "Handoff complete")
            }
            CloseReason::HandoffFailed(e) => {
                self.stats.handoffs_failed.fetch_add(1, Ordering::Relaxed);
                error!(peer = %self.peer, "Handoff failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageType, HEADER_SIZE};
    use std::ffi::{OsStr, OsString};
    use std::io::Write;
    use std::net::{Shutdown, TcpListener};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandoff {
        libraries: Mutex<Vec<OsString>>,
        fail: bool,
    }

    impl Handoff for RecordingHandoff {
        fn handoff(&self, _conn: &TcpStream, library: &OsStr) -> Result<WorkerExit, HandoffError> {
            self.libraries.lock().unwrap().push(library.to_os_string());
            if self.fail {
                Err(HandoffError::AbnormalExit {
                    signal: Some(9),
                    source: None,
                })
            } else {
                Ok(WorkerExit { code: 0 })
            }
        }
    }

    fn frame(msg_type: MessageType, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((HEADER_SIZE + payload.len()) as u64).to_le_bytes());
        buf.extend_from_slice(&msg_type.0.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    fn link_frame(name: &str) -> Vec<u8> {
        let mut buf = [0u8; 64];
        buf[..name.len()].copy_from_slice(name.as_bytes());
        frame(MessageType::LINK_LIBRARY, &buf)
    }

    fn run_with(data: &[u8], handoff: Arc<RecordingHandoff>) -> (CloseReason, Session) {
        run_counted(data, handoff, Arc::new(ServerStats::new()))
    }

    /// Kirim `data`, tutup sisi tulis client, lalu jalankan dispatcher.
    fn run_counted(
        data: &[u8],
        handoff: Arc<RecordingHandoff>,
        stats: Arc<ServerStats>,
    ) -> (CloseReason, Session) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();

        client.write_all(data).unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        let conn = Connection::new(
            server,
            peer,
            Arc::new(TypeRegistry::standard().unwrap()),
            handoff,
            stats,
        );
        conn.run()
    }

    #[test]
    fn test_session_values_recorded() {
        let mut data = frame(MessageType::VERSION, &2u64.to_le_bytes());
        data.extend(frame(MessageType::AUTHORIZATION, &[0x11; 128]));
        data.extend(frame(MessageType::OK, &[]));

        let (reason, session) = run_with(&data, Arc::default());

        assert!(matches!(reason, CloseReason::PeerClosed));
        assert_eq!(session.version, Some(2));
        assert_eq!(session.token, Some(Token([0x11; 128])));
        assert_eq!(session.acks, 1);
    }

    #[test]
    fn test_link_library_is_terminal() {
        let handoff = Arc::new(RecordingHandoff::default());
        let mut data = link_frame("libtest");
        data.extend(link_frame("libother"));

        let (reason, _) = run_with(&data, Arc::clone(&handoff));

        assert!(matches!(reason, CloseReason::HandedOff(WorkerExit { code: 0 })));
        assert_eq!(*handoff.libraries.lock().unwrap(), vec![OsString::from("libtest")]);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_name_is_not_replaced() {
        use std::os::unix::ffi::OsStrExt;

        let handoff = Arc::new(RecordingHandoff::default());
        let data = frame(MessageType::LINK_LIBRARY, &[0xE9; 64]);

        run_with(&data, Arc::clone(&handoff));

        let libraries = handoff.libraries.lock().unwrap();
        assert_eq!(libraries.len(), 1);
        assert_eq!(libraries[0].as_bytes(), &[0xE9; 64][..]);
    }

    #[test]
    fn test_failed_handoff_closes_connection() {
        let handoff = Arc::new(RecordingHandoff {
            fail: true,
            ..Default::default()
        });

        let stats = Arc::new(ServerStats::new());

        let (reason, _) = run_counted(
            &link_frame("libtest"),
            Arc::clone(&handoff),
            Arc::clone(&stats),
        );

        assert!(matches!(
            reason,
            CloseReason::HandoffFailed(HandoffError::AbnormalExit { .. })
        ));
        assert_eq!(handoff.libraries.lock().unwrap().len(), 1);
        assert_eq!(stats.handoffs_started.load(Ordering::Relaxed), 1);
        assert_eq!(stats.handoffs_failed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unknown_message_closes_connection() {
        let handoff = Arc::new(RecordingHandoff::default());
        let mut data = frame(MessageType(0xFFFF), &[]);
        data.extend(link_frame("libtest"));

        let (reason, _) = run_with(&data, Arc::clone(&handoff));

        match reason {
            CloseReason::Protocol(ProtocolError::UnknownMessage(header)) => {
                assert_eq!(header.msg_type, MessageType(0xFFFF));
                assert_eq!(header.size, 16);
            }
            other => panic!("unexpected close reason: {:?}", other),
        }
        assert!(handoff.libraries.lock().unwrap().is_empty());
    }

    #[test]
    fn test_truncated_payload_closes_connection() {
        let mut data = frame(MessageType::AUTHORIZATION, &[0u8; 128]);
        data.truncate(HEADER_SIZE + 40);

        let (reason, session) = run_with(&data, Arc::default());

        assert!(matches!(
            reason,
            CloseReason::Protocol(ProtocolError::Size {
                expected: 128,
                actual: 40,
                ..
            })
        ));
        assert!(session.token.is_none());
    }
}
