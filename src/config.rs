//! Command line and server configuration.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use clap::Parser;

use crate::error::ConfigError;
use crate::handoff::WorkerConfig;

pub const DEFAULT_LISTEN_ADDR: &str = ":40545";

#[derive(Parser, Debug, Clone)]
#[command(name = "linkd")]
#[command(about = "Accepts link requests and hands each connection to a linker worker")]
pub struct Args {
    /// Listen address; `:PORT` listens on all interfaces
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    pub addr: String,

    /// Path to the linker worker executable
    #[arg(long = "lpath", default_value = "svclinker")]
    pub worker_path: PathBuf,

    /// Resolver endpoint passed to the worker (symbol to library)
    #[arg(long = "res-addr", default_value = "/var/run/svcsymres.sock")]
    pub resolver_addr: String,

    /// argv[0] given to the worker
    #[arg(long, default_value = "svclinker")]
    pub worker_name: String,

    /// Working directory for the worker (default: inherit)
    #[arg(long)]
    pub worker_dir: Option<PathBuf>,

    /// Reject frames whose declared size does not match their type
    #[arg(long)]
    pub strict_frame_size: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub strict_frame_size: bool,
    pub worker: WorkerConfig,
}

impl ServerConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        Ok(Self {
            listen_addr: parse_listen_addr(&args.addr)?,
            strict_frame_size: args.strict_frame_size,
            worker: WorkerConfig {
                path: args.worker_path.clone(),
                name: args.worker_name.clone(),
                resolver_addr: args.resolver_addr.clone(),
                working_dir: args.worker_dir.clone(),
            },
        })
    }
}

/// Parse `:PORT`, `HOST:PORT`, or `[V6]:PORT`.
///
/// Host kosong berarti semua interface (0.0.0.0). Hostname di-resolve
/// lewat resolver sistem; alamat pertama yang dipakai.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidAddress {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    if let Some(port) = addr.strip_prefix(':') {
        let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }

    if let Ok(parsed) = addr.parse::<SocketAddr>() {
        return Ok(parsed);
    }

    if !addr.contains(':') {
        return Err(invalid("missing port"));
    }

    addr.to_socket_addrs()
        .map_err(|source| ConfigError::Resolve {
            addr: addr.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| invalid("no addresses found"))
}
