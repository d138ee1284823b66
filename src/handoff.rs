//! Worker Handoff
//!
//! Koneksi diserahkan ke proses worker terpisah: socket diduplikasi ke
//! descriptor 3 milik child, lalu dispatcher menunggu child selesai.
//! Crash di worker tidak ikut menjatuhkan server.

use std::ffi::OsStr;
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::{Command, ExitStatus};

use tracing::{debug, info, warn};

use crate::error::HandoffError;

/// Descriptor slot yang menerima socket di proses worker (setelah stderr)
pub const WORKER_FD: i32 = 3;

/// Normal worker termination. The exit code is reported, not interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: i32,
}

/// Transfers a live connection to whatever performs the link work.
///
/// The dispatcher keeps ownership of `conn` and closes it after this returns.
/// `library` carries the raw name bytes; failures are logged by the caller.
pub trait Handoff: Send + Sync {
    fn handoff(&self, conn: &TcpStream, library: &OsStr) -> Result<WorkerExit, HandoffError>;
}

/// How the worker process is launched
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Path to the worker executable
    pub path: PathBuf,
    /// argv[0] given to the worker
    pub name: String,
    /// Resolver endpoint, passed through uninterpreted
    pub resolver_addr: String,
    /// Working directory; inherited when `None`
    pub working_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("svclinker"),
            name: "svclinker".to_string(),
            resolver_addr: "/var/run/svcsymres.sock".to_string(),
            working_dir: None,
        }
    }
}

/// Spawns one worker process per link request
#[derive(Debug, Clone)]
pub struct WorkerHandoff {
    config: WorkerConfig,
}

impl WorkerHandoff {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    /// Command tanpa descriptor binding; argumen: `3 <resolver> <library>`
    fn command(&self, library: &OsStr) -> Command {
        let mut cmd = Command::new(&self.config.path);
        cmd.arg(WORKER_FD.to_string())
            .arg(&self.config.resolver_addr)
            .arg(library);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.arg0(&self.config.name);
        }

        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[cfg(unix)]
impl Handoff for WorkerHandoff {
    fn handoff(&self, conn: &TcpStream, library: &OsStr) -> Result<WorkerExit, HandoffError> {
        use std::os::fd::{AsFd, AsRawFd};
        use std::os::unix::process::CommandExt;

        // Duplikat milik parent (close-on-exec). Original tetap milik dispatcher.
        let inherited = conn
            .as_fd()
            .try_clone_to_owned()
            .map_err(HandoffError::Spawn)?;
        let raw = inherited.as_raw_fd();

        let mut cmd = self.command(library);
        // SAFETY: closure hanya memanggil dup2/fcntl (async-signal-safe)
        // dan tidak mengalokasi memori.
        unsafe {
            cmd.pre_exec(move || bind_worker_fd(raw));
        }

        info!(
            worker = %self.config.path.display(),
            library = %library.to_string_lossy(),
            fd = WORKER_FD,
            "Spawning worker"
        );

        let mut child = cmd.spawn().map_err(HandoffError::Spawn)?;
        // Child sudah punya salinannya sendiri di fd 3
        drop(inherited);

        let pid = child.id();
        debug!(pid, "Waiting for worker");

        match child.wait() {
            Ok(status) => classify(pid, status),
            Err(e) => Err(HandoffError::AbnormalExit {
                signal: None,
                source: Some(e),
            }),
        }
    }
}

#[cfg(not(unix))]
impl Handoff for WorkerHandoff {
    fn handoff(&self, _conn: &TcpStream, _library: &OsStr) -> Result<WorkerExit, HandoffError> {
        Err(HandoffError::Spawn(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "descriptor inheritance is only available on unix",
        )))
    }
}

/// Runs in the forked child before exec.
#[cfg(unix)]
fn bind_worker_fd(raw: i32) -> std::io::Result<()> {
    // SAFETY: `raw` tetap open di child sampai exec; dup2/fcntl aman dipanggil
    // di antara fork dan exec.
    unsafe {
        if raw == WORKER_FD {
            // dup2 ke dirinya sendiri tidak menghapus FD_CLOEXEC
            if libc::fcntl(WORKER_FD, libc::F_SETFD, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
        } else if libc::dup2(raw, WORKER_FD) == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn classify(pid: u32, status: ExitStatus) -> Result<WorkerExit, HandoffError> {
    if let Some(code) = status.code() {
        if code == 0 {
            info!(pid, code, "Worker exited");
        } else {
            warn!(pid, code, "Worker exited with non-zero status");
        }
        return Ok(WorkerExit { code });
    }

    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    debug!(pid, ?signal, "Worker terminated by signal");
    Err(HandoffError::AbnormalExit {
        signal,
        source: None,
    })
}
