//! Network Layer: Accept Loop + Per-Connection Dispatch
//!
//! - Accept loop berbasis mio (listener + waker untuk shutdown)
//! - Satu blocking thread per koneksi
//! - Koneksi berakhir setelah satu link request diserahkan ke worker

mod connection;
mod server;

pub use connection::{CloseReason, Connection, Session};
pub use server::{Server, ServerStats, ShutdownHandle};
