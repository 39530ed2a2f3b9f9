//! Host-side socat bridges from filesystem sockets to the proxy TCP ports.
//!
//! The jail gets a vnet stack with no route out, so the only path to the
//! proxies is a unix socket bound into the jail root. Each bridge is a
//! `socat UNIX-LISTEN:<sock> TCP:localhost:<port>` process owned by the
//! returned [`BridgeContext`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::cleanup::try_cleanup;
use super::error::{Result, SandboxError};
use super::random_suffix;

/// How long a terminated bridge gets to exit before it is killed outright.
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// Knobs for starting bridges.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// socat binary (resolved through `PATH` when relative).
    pub socat: PathBuf,

    /// Directory the sockets are created in.
    pub temp_dir: PathBuf,

    /// Readiness polls before giving up.
    pub readiness_attempts: u32,

    /// Delay unit; the wait after poll `i` is `i * readiness_step`.
    pub readiness_step: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            socat: PathBuf::from(super::detect::SOCAT_TOOL),
            temp_dir: std::env::temp_dir(),
            readiness_attempts: 5,
            readiness_step: Duration::from_millis(100),
        }
    }
}

/// One running forwarder.
#[derive(Debug)]
pub struct Bridge {
    pub socket_path: PathBuf,
    pub port: u16,
    process: Child,
}

impl Bridge {
    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }
}

/// Both bridges, returned only once both sockets exist.
#[derive(Debug)]
pub struct BridgeContext {
    pub http: Bridge,
    pub socks: Bridge,
}

impl BridgeContext {
    pub fn http_socket_path(&self) -> &Path {
        &self.http.socket_path
    }

    pub fn socks_socket_path(&self) -> &Path {
        &self.socks.socket_path
    }

    /// Terminate both forwarders and remove their sockets. Best effort.
    pub async fn shutdown(mut self) {
        terminate("http", &mut self.http.process).await;
        terminate("socks", &mut self.socks.process).await;
        for bridge in [&self.http, &self.socks] {
            try_cleanup("remove bridge socket", || std::fs::remove_file(&bridge.socket_path));
        }
        debug!("Bridges shut down");
    }
}

/// Socket path for one bridge: `<temp_dir>/jailwrap-<kind>-<16 hex>.sock`.
pub fn generate_socket_path(temp_dir: &Path, kind: &str) -> PathBuf {
    temp_dir.join(format!("jailwrap-{kind}-{}.sock", random_suffix()))
}

/// Start the HTTP and SOCKS bridges and wait for both sockets to appear.
///
/// On any failure every process that was started gets a termination signal
/// before the error is returned.
pub async fn start_bridges(
    http_port: u16,
    socks_port: u16,
    options: &BridgeOptions,
) -> Result<BridgeContext> {
    let http_socket = generate_socket_path(&options.temp_dir, "http");
    let socks_socket = generate_socket_path(&options.temp_dir, "socks");

    let mut http = spawn_forwarder("http", &options.socat, &http_socket, http_port)?;
    let mut socks = match spawn_forwarder("socks", &options.socat, &socks_socket, socks_port) {
        Ok(child) => child,
        Err(e) => {
            terminate("http", &mut http).await;
            return Err(e);
        }
    };

    if let Err(e) = wait_until_ready(&mut http, &mut socks, &http_socket, &socks_socket, options).await {
        warn!("Bridge startup failed: {}", e);
        terminate("http", &mut http).await;
        terminate("socks", &mut socks).await;
        return Err(e);
    }

    info!(
        "Bridges ready: {} -> localhost:{}, {} -> localhost:{}",
        http_socket.display(),
        http_port,
        socks_socket.display(),
        socks_port
    );

    Ok(BridgeContext {
        http: Bridge {
            socket_path: http_socket,
            port: http_port,
            process: http,
        },
        socks: Bridge {
            socket_path: socks_socket,
            port: socks_port,
            process: socks,
        },
    })
}

fn spawn_forwarder(kind: &'static str, socat: &Path, socket: &Path, port: u16) -> Result<Child> {
    let child = Command::new(socat)
        .arg(format!("UNIX-LISTEN:{},fork,reuseaddr", socket.display()))
        .arg(format!(
            "TCP:localhost:{port},keepalive,keepidle=10,keepintvl=5,keepcnt=3"
        ))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SandboxError::BridgeStartFailure {
            bridge: kind,
            reason: format!("failed to spawn {}: {e}", socat.display()),
        })?;

    match child.id() {
        Some(pid) => {
            debug!("Spawned {} bridge (pid {}) on {}", kind, pid, socket.display());
            Ok(child)
        }
        None => Err(SandboxError::BridgeStartFailure {
            bridge: kind,
            reason: "process id unavailable".to_string(),
        }),
    }
}

async fn wait_until_ready(
    http: &mut Child,
    socks: &mut Child,
    http_socket: &Path,
    socks_socket: &Path,
    options: &BridgeOptions,
) -> Result<()> {
    let sockets_exist = || http_socket.exists() && socks_socket.exists();

    for attempt in 0..options.readiness_attempts {
        ensure_alive("http", http)?;
        ensure_alive("socks", socks)?;
        if sockets_exist() {
            return Ok(());
        }
        tokio::time::sleep(readiness_delay(options.readiness_step, attempt)).await;
    }

    ensure_alive("http", http)?;
    ensure_alive("socks", socks)?;
    if sockets_exist() {
        return Ok(());
    }

    Err(SandboxError::BridgeNotReady {
        attempts: options.readiness_attempts,
        http: http_socket.to_path_buf(),
        socks: socks_socket.to_path_buf(),
    })
}

/// Linear backoff, saturating for oversized configured steps.
fn readiness_delay(step: Duration, attempt: u32) -> Duration {
    step.checked_mul(attempt).unwrap_or(Duration::MAX)
}

fn ensure_alive(kind: &'static str, child: &mut Child) -> Result<()> {
    match child.try_wait() {
        Ok(None) => Ok(()),
        Ok(Some(status)) => {
            debug!("{} bridge exited early: {}", kind, status);
            Err(SandboxError::BridgeProcessDied { bridge: kind })
        }
        Err(e) => {
            debug!("{} bridge status unknown: {}", kind, e);
            Err(SandboxError::BridgeProcessDied { bridge: kind })
        }
    }
}

/// Send SIGTERM and reap, escalating to SIGKILL if the process lingers.
async fn terminate(kind: &str, child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(raw_pid) = i32::try_from(pid) else {
        return;
    };

    try_cleanup(&format!("SIGTERM {kind} bridge"), || {
        kill(Pid::from_raw(raw_pid), Signal::SIGTERM)
    });

    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => debug!("{} bridge (pid {}) exited: {}", kind, pid, status),
        Ok(Err(e)) => debug!("Failed to reap {} bridge (pid {}): {}", kind, pid, e),
        Err(_) => {
            try_cleanup(&format!("SIGKILL {kind} bridge"), || child.start_kill());
        }
    }
}
