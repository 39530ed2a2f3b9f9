//! Bridge startup, readiness and teardown against fake forwarders.
//!
//! Each test points `BridgeOptions::socat` at a small shell script standing in
//! for socat, so the lifecycle can be exercised on any unix host.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use jailwrap::sandbox::{start_bridges, BridgeOptions, SandboxError};
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Scripts are written then exec'd; a fork in a parallel test could inherit
/// the write fd and make exec fail with ETXTBSY.
static SPAWN_LOCK: Mutex<()> = Mutex::new(());

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write fake socat");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake socat");
    path
}

fn options(socat: PathBuf, temp_dir: &Path, attempts: u32, step_ms: u64) -> BridgeOptions {
    BridgeOptions {
        socat,
        temp_dir: temp_dir.to_path_buf(),
        readiness_attempts: attempts,
        readiness_step: Duration::from_millis(step_ms),
    }
}

fn is_running(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[tokio::test]
async fn test_bridges_become_ready_and_shut_down() {
    let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let args_log = dir.path().join("args.log");
    let socat = write_script(
        dir.path(),
        "fake-socat",
        &format!(
            r#"printf '%s\n' "$@" >> '{}'
sock="${{1#UNIX-LISTEN:}}"
sock="${{sock%%,*}}"
: > "$sock"
exec sleep 30"#,
            args_log.display()
        ),
    );

    let ctx = start_bridges(18080, 11080, &options(socat, dir.path(), 5, 50))
        .await
        .expect("bridges should start");

    assert!(ctx.http_socket_path().starts_with(dir.path()));
    assert!(ctx.http_socket_path().exists());
    assert!(ctx.socks_socket_path().exists());
    assert_ne!(ctx.http_socket_path(), ctx.socks_socket_path());
    assert_eq!(ctx.http.port, 18080);
    assert_eq!(ctx.socks.port, 11080);

    let args = fs::read_to_string(&args_log).unwrap();
    assert!(args.contains(&format!(
        "UNIX-LISTEN:{},fork,reuseaddr",
        ctx.http_socket_path().display()
    )));
    assert!(args.contains("TCP:localhost:18080,keepalive,keepidle=10,keepintvl=5,keepcnt=3"));
    assert!(args.contains("TCP:localhost:11080,"));

    let pids = [ctx.http.pid().unwrap(), ctx.socks.pid().unwrap()];
    let sockets = [
        ctx.http_socket_path().to_path_buf(),
        ctx.socks_socket_path().to_path_buf(),
    ];
    assert!(pids.iter().all(|pid| is_running(*pid)));

    ctx.shutdown().await;

    for pid in pids {
        assert!(!is_running(pid), "bridge {pid} still running after shutdown");
    }
    for socket in sockets {
        assert!(!socket.exists(), "{} not removed", socket.display());
    }
}

#[tokio::test]
async fn test_never_ready_bridges_are_terminated() {
    let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let pid_log = dir.path().join("pids.log");
    let socat = write_script(
        dir.path(),
        "silent-socat",
        &format!("echo $$ >> '{}'\nexec sleep 30", pid_log.display()),
    );

    let err = start_bridges(18081, 11081, &options(socat, dir.path(), 4, 25))
        .await
        .unwrap_err();

    match err {
        SandboxError::BridgeNotReady {
            attempts,
            http,
            socks,
        } => {
            assert_eq!(attempts, 4);
            assert!(!http.exists());
            assert!(!socks.exists());
        }
        other => panic!("expected BridgeNotReady, got {other:?}"),
    }

    let pids: Vec<u32> = fs::read_to_string(&pid_log)
        .unwrap_or_default()
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect();
    assert_eq!(pids.len(), 2, "both forwarders should have started: {pids:?}");
    for pid in pids {
        assert!(!is_running(pid), "bridge {pid} survived failed startup");
    }
}

#[tokio::test]
async fn test_exiting_bridge_is_reported_as_died() {
    let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let socat = write_script(dir.path(), "failing-socat", "exit 1");

    let err = start_bridges(18082, 11082, &options(socat, dir.path(), 5, 100))
        .await
        .unwrap_err();

    assert!(
        matches!(err, SandboxError::BridgeProcessDied { .. }),
        "expected BridgeProcessDied, got {err:?}"
    );
    assert!(err.to_string().contains("exited before becoming ready"));
}

#[tokio::test]
async fn test_missing_forwarder_binary() {
    let dir = tempfile::tempdir().unwrap();
    let err = start_bridges(
        18083,
        11083,
        &options(dir.path().join("absent"), dir.path(), 5, 100),
    )
    .await
    .unwrap_err();

    match err {
        SandboxError::BridgeStartFailure { bridge, reason } => {
            assert_eq!(bridge, "http");
            assert!(reason.contains("absent"));
        }
        other => panic!("expected BridgeStartFailure, got {other:?}"),
    }
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}
