//! linkd accept loop
//!
//! Menggunakan mio untuk menunggu koneksi baru atau sinyal shutdown
//! (via `Waker`) dalam satu `poll`. Setiap koneksi yang diterima
//! dikonversi ke blocking `std::net::TcpStream` dan dijalankan di
//! thread sendiri.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use mio::net::TcpListener as MioTcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, warn};

use super::Connection;
use crate::handoff::Handoff;
use crate::protocol::TypeRegistry;

const SERVER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const EVENTS_CAPACITY: usize = 128;

/// Langkah berikutnya setelah `accept` gagal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptStep {
    /// Backlog kosong, tunggu event berikutnya
    Drained,
    /// Error milik satu koneksi saja, lanjut accept
    Retry,
    /// Error di sisi listener (mis. EMFILE). Listener edge-triggered harus
    /// di-register ulang supaya koneksi yang tersisa di backlog tetap dilaporkan.
    Rearm,
}

fn accept_step(e: &io::Error) -> AcceptStep {
    match e.kind() {
        io::ErrorKind::WouldBlock => AcceptStep::Drained,
        io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => AcceptStep::Retry,
        _ => AcceptStep::Rearm,
    }
}

/// Server-wide counters
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub messages_received: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub handoffs_started: AtomicU64,
    pub handoffs_failed: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_summary(&self) {
        info!(
            connections_total = self.connections_total.load(Ordering::Relaxed),
            connections_active = self.connections_active.load(Ordering::Relaxed),
            messages = self.messages_received.load(Ordering::Relaxed),
            protocol_errors = self.protocol_errors.load(Ordering::Relaxed),
            handoffs = self.handoffs_started.load(Ordering::Relaxed),
            handoffs_failed = self.handoffs_failed.load(Ordering::Relaxed),
            "Server stats"
        );
    }
}

/// Stops the accept loop from any thread. Cheap to clone.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            error!("Failed to wake accept loop: {}", e);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// linkd server
pub struct Server<H: Handoff + 'static> {
    poll: Poll,
    listener: MioTcpListener,
    shutdown: ShutdownHandle,
    registry: Arc<TypeRegistry>,
    handoff: Arc<H>,
    stats: Arc<ServerStats>,
    strict_frame_size: bool,
    next_id: u64,
}

impl<H: Handoff + 'static> Server<H> {
    /// Bind listener. Gagal di sini = fatal untuk caller.
    pub fn bind(addr: SocketAddr, registry: Arc<TypeRegistry>, handoff: Arc<H>) -> io::Result<Self> {
        let poll = Poll::new()?;

        let mut listener = MioTcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, SERVER_TOKEN, Interest::READABLE)?;

        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        Ok(Self {
            poll,
            listener,
            shutdown: ShutdownHandle {
                flag: Arc::new(AtomicBool::new(false)),
                waker: Arc::new(waker),
            },
            registry,
            handoff,
            stats: Arc::new(ServerStats::new()),
            strict_frame_size: false,
            next_id: 0,
        })
    }

    pub fn with_strict_frame_size(mut self, strict: bool) -> Self {
        self.strict_frame_size = strict;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept loop. Returns after [`ShutdownHandle::shutdown`].
    ///
    /// Thread koneksi yang masih berjalan tidak di-join; worker yang
    /// sedang berjalan juga tidak dihentikan.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        info!("linkd listening on {}", self.listener.local_addr()?);

        while !self.shutdown.is_shutdown() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    SERVER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => {}
                    _ => unreachable!(),
                }
            }
        }

        info!(
            in_flight = self.stats.connections_active.load(Ordering::Relaxed),
            "Accept loop stopped"
        );
        Ok(())
    }

    /// Accept semua koneksi yang pending
    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = self.start_connection(stream, addr) {
                        warn!(peer = %addr, "Failed to set up connection: {}", e);
                    }
                }
                Err(e) => match accept_step(&e) {
                    AcceptStep::Drained => break,
                    AcceptStep::Retry => {
                        debug!("Accept error on pending connection: {}", e);
                        continue;
                    }
                    AcceptStep::Rearm => {
                        warn!("Accept error: {}", e);
                        if let Err(e) = self.poll.registry().reregister(
                            &mut self.listener,
                            SERVER_TOKEN,
                            Interest::READABLE,
                        ) {
                            error!("Failed to re-register listener: {}", e);
                        }
                        break;
                    }
                },
            }
        }
    }

    fn start_connection(&mut self, stream: mio::net::TcpStream, addr: SocketAddr) -> io::Result<()> {
        // Convert mio TcpStream ke blocking std TcpStream
        #[cfg(unix)]
        let stream = {
            use std::os::unix::io::{FromRawFd, IntoRawFd};
            // SAFETY: fd baru saja dilepas dari mio stream, ownership pindah.
            unsafe { TcpStream::from_raw_fd(stream.into_raw_fd()) }
        };

        #[cfg(windows)]
        let stream = {
            use std::os::windows::io::{FromRawSocket, IntoRawSocket};
            // SAFETY: socket baru saja dilepas dari mio stream, ownership pindah.
            unsafe { TcpStream::from_raw_socket(stream.into_raw_socket()) }
        };

        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;

        let id = self.next_id;
        self.next_id += 1;

        let conn = Connection::new(
            stream,
            addr,
            Arc::clone(&self.registry),
            Arc::clone(&self.handoff),
            Arc::clone(&self.stats),
        )
        .with_strict_frame_size(self.strict_frame_size);

        let stats = Arc::clone(&self.stats);
        stats.connections_total.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let spawned = thread::Builder::new()
            .name(format!("conn-{id}"))
            .spawn(move || {
                conn.run();
                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            });

        if let Err(e) = spawned {
            self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            return Err(e);
        }
        Ok(())
    }
}
