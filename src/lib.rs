//! linkd - Link Request Front-End
//!
//! Arsitektur:
//! - Binary Protocol: fixed 16-byte header + fixed-size payload per tipe
//! - Static Type Registry: dibangun sekali, read-only, dibagi tanpa lock
//! - Thread-per-Connection: decode blocking, satu link request per koneksi
//! - Process Handoff: socket diduplikasi ke fd 3 milik worker process

pub mod config;
pub mod error;
pub mod handoff;
pub mod network;
pub mod protocol;
