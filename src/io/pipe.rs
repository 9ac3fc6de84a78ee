//! Local pipe transport for the CMake Server
//!
//! The server listens on a Unix domain socket (or a Windows named pipe)
//! whose name the client chooses. Names are unique per build directory and
//! per client instance.

use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[cfg(unix)]
pub type PipeStream = tokio::net::UnixStream;

#[cfg(windows)]
pub type PipeStream = tokio::net::windows::named_pipe::NamedPipeClient;

/// Interval between connection attempts while the server starts
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// How long the server gets to create its pipe
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn build_dir_hash(binary_dir: &Path) -> String {
    let digest = Sha256::digest(binary_dir.to_string_lossy().as_bytes());
    digest.iter().take(6).map(|b| format!("{b:02x}")).collect()
}

/// Pick a fresh pipe name for a server bound to `binary_dir`
pub fn pipe_name(binary_dir: &Path) -> PathBuf {
    let hash = build_dir_hash(binary_dir);
    let id = uuid::Uuid::new_v4().simple().to_string();
    pipe_path(&format!("cmsrv-{}-{}", hash, &id[..8]))
}

#[cfg(unix)]
fn pipe_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{name}.sock"))
}

#[cfg(windows)]
fn pipe_path(name: &str) -> PathBuf {
    PathBuf::from(format!(r"\\.\pipe\{name}"))
}

#[cfg(unix)]
pub async fn connect(name: &Path) -> io::Result<PipeStream> {
    tokio::net::UnixStream::connect(name).await
}

#[cfg(windows)]
pub async fn connect(name: &Path) -> io::Result<PipeStream> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(name)
}

/// Keep trying to connect until the pipe exists or `timeout` elapses
pub async fn connect_with_retry(
    name: &Path,
    interval: Duration,
    timeout: Duration,
) -> io::Result<PipeStream> {
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match connect(name).await {
            Ok(stream) => {
                debug!("Connected to {} after {} attempts", name.display(), attempts);
                return Ok(stream);
            }
            Err(e) if Instant::now() + interval < deadline => {
                trace!("Pipe {} not ready: {}", name.display(), e);
                tokio::time::sleep(interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Remove the socket file left behind by a server (no-op for named pipes)
pub fn remove_pipe(name: &Path) {
    #[cfg(unix)]
    {
        if let Err(e) = std::fs::remove_file(name) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!("Failed to remove {}: {}", name.display(), e);
            }
        }
    }
    #[cfg(windows)]
    {
        let _ = name;
    }
}
