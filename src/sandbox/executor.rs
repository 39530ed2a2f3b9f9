use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use super::bridge::start_bridges;
use super::detect::{detect_capabilities, has_freebsd_sandbox_dependencies, Platform};
use super::freebsd::{prepare_sandbox, SandboxParams};
use super::policy::build_restrictions;
use crate::config::Config;

/// Run a shell command under the configured jail policy.
///
/// Starts the bridges when network restriction is configured, builds the
/// wrapper script, runs it with `sh -c` and collects its output. The bridges
/// are shut down whatever the outcome. With the sandbox disabled, or no
/// restriction configured, the command runs directly.
///
/// The effective timeout is the minimum of `timeout_ms` and
/// `sandbox.timeout_secs * 1000`.
pub async fn run_sandboxed(command: &str, config: &Config, timeout_ms: u64) -> Result<(String, i32)> {
    let policy_timeout_ms = config.sandbox.timeout_secs.saturating_mul(1000);
    let effective_timeout_ms = timeout_ms.min(policy_timeout_ms);
    let timeout_duration = Duration::from_millis(effective_timeout_ms);

    let cwd = std::env::current_dir()?;
    let mut params = sandbox_params(command, config, &cwd);
    let network = config.sandbox.enabled && config.network.restricted;

    if !params.is_restricted() && !network {
        debug!("No restrictions configured, running command directly");
        return execute(command, &cwd, timeout_duration, config.sandbox.max_output_bytes).await;
    }

    if !Platform::current().supports_jails() || !has_freebsd_sandbox_dependencies() {
        // Re-probe uncached for a precise error
        detect_capabilities().ensure_available()?;
    }

    let bridges = if network {
        Some(
            start_bridges(
                config.network.http_proxy_port,
                config.network.socks_proxy_port,
                &config.bridge_options(),
            )
            .await?,
        )
    } else {
        None
    };
    if let Some(bridges) = &bridges {
        params = params.with_bridges(bridges);
    }

    let result = match prepare_sandbox(&params) {
        Ok(Some(prepared)) => {
            let outcome = execute(
                &prepared.script,
                &cwd,
                timeout_duration,
                config.sandbox.max_output_bytes,
            )
            .await;
            if outcome.is_err() {
                warn!(
                    "Jail {} did not finish cleanly; mounts under {} may need manual removal",
                    prepared.identity.name,
                    prepared.identity.root.display()
                );
            }
            outcome
        }
        Ok(None) => execute(command, &cwd, timeout_duration, config.sandbox.max_output_bytes).await,
        Err(e) => Err(e.into()),
    };

    if let Some(bridges) = bridges {
        bridges.shutdown().await;
    }

    result
}

/// Sandbox parameters from the config, without bridge sockets.
pub fn sandbox_params(command: &str, config: &Config, cwd: &Path) -> SandboxParams {
    let mut params = SandboxParams {
        cwd: Some(cwd.to_path_buf()),
        temp_dir: Some(config.temp_dir()),
        ..SandboxParams::new(command)
    };

    if config.sandbox.enabled && config.filesystem.restricted {
        let (read, write) = build_restrictions(&config.filesystem, cwd);
        params.has_filesystem_restrictions = true;
        params.read_config = read;
        params.write_config = write;
    }

    params
}

async fn execute(
    script: &str,
    cwd: &Path,
    timeout_duration: Duration,
    max_output_bytes: u64,
) -> Result<(String, i32)> {
    // env_clear() keeps parent secrets out of the jail; jail(8) and
    // mount_nullfs live in /usr/sbin and /sbin.
    let output_fut = tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .current_dir(cwd)
        .env_clear()
        .envs(sandbox_env())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .output();

    // On expiry, dropping the future kills the child
    match tokio::time::timeout(timeout_duration, output_fut).await {
        Ok(Ok(output)) => format_output(&output, max_output_bytes),
        Ok(Err(e)) => Err(anyhow::anyhow!("Sandboxed command I/O error: {}", e)),
        Err(_timeout) => Err(anyhow::anyhow!(
            "Sandboxed command timed out after {}ms",
            timeout_duration.as_millis()
        )),
    }
}

/// Format captured output, applying UTF-8-safe truncation.
fn format_output(output: &std::process::Output, max_output_bytes: u64) -> Result<(String, i32)> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    let max_bytes = usize::try_from(max_output_bytes).unwrap_or(usize::MAX);

    let mut result = String::new();

    if !stdout.is_empty() {
        if stdout.len() > max_bytes {
            result.push_str(truncate_utf8(&stdout, max_bytes));
            result.push_str(&format!(
                "\n\n[Output truncated, {} bytes total]",
                stdout.len()
            ));
        } else {
            result.push_str(&stdout);
        }
    }

    if !stderr.is_empty() {
        if !result.is_empty() {
            result.push_str("\n\nSTDERR:\n");
        }
        let remaining = max_bytes.saturating_sub(result.len());
        if stderr.len() > remaining && remaining > 0 {
            result.push_str(truncate_utf8(&stderr, remaining));
            result.push_str("\n[stderr truncated]");
        } else {
            result.push_str(&stderr);
        }
    }

    let exit_code = output.status.code().unwrap_or(-1);

    Ok((result, exit_code))
}

/// Truncate a UTF-8 string at or before `max_bytes`, respecting char boundaries.
fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Environment for the wrapper shell. Proxy variables inside the jail are
/// set through `env.` jail parameters, not inherited from here.
fn sandbox_env() -> Vec<(&'static str, String)> {
    vec![
        (
            "PATH",
            "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin".to_string(),
        ),
        (
            "HOME",
            super::policy::dirs_home().to_string_lossy().into_owned(),
        ),
        ("TERM", "dumb".to_string()),
        (
            "LANG",
            std::env::var("LANG").unwrap_or_else(|_| "C.UTF-8".to_string()),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::sync::Mutex;

    /// Serializes tests that mutate the process environment via set_var/remove_var.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn unrestricted_config() -> Config {
        let mut config = Config::default();
        config.sandbox.timeout_secs = 10;
        config
    }

    #[test]
    fn test_sandbox_env_contains_only_safe_vars() {
        let env = sandbox_env();
        let keys: Vec<&str> = env.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["PATH", "HOME", "TERM", "LANG"]);

        let (_, path) = env.iter().find(|(k, _)| *k == "PATH").unwrap();
        assert!(path.split(':').any(|p| p == "/usr/sbin"));
        assert!(path.split(':').any(|p| p == "/sbin"));
    }

    #[tokio::test]
    async fn test_child_env_is_scrubbed() {
        let _guard = ENV_LOCK.lock().unwrap();

        // SAFETY: ENV_LOCK serializes all env-mutating tests.
        unsafe {
            std::env::set_var("JAILWRAP_TEST_SECRET", "hunter2");
        }

        let cwd = std::env::current_dir().unwrap();
        let result = execute(
            "env",
            &cwd,
            Duration::from_secs(5),
            1_048_576,
        )
        .await;

        unsafe {
            std::env::remove_var("JAILWRAP_TEST_SECRET");
        }

        let (output, code) = result.unwrap();
        assert_eq!(code, 0);
        assert!(!output.contains("hunter2"), "secret leaked to child env");
        assert!(output.contains("TERM=dumb"));
        assert!(output.contains("PATH="));
    }

    #[tokio::test]
    async fn test_unrestricted_runs_directly() {
        let config = unrestricted_config();
        let (output, code) = run_sandboxed("echo hi; exit 3", &config, 5_000).await.unwrap();
        assert_eq!(output.trim(), "hi");
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn test_disabled_sandbox_ignores_restrictions() {
        let mut config = unrestricted_config();
        config.sandbox.enabled = false;
        config.network.restricted = true;
        config.filesystem.restricted = true;

        let (output, code) = run_sandboxed("echo out; echo err >&2", &config, 5_000)
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(output, "out\n\n\nSTDERR:\nerr\n");
    }

    #[tokio::test]
    async fn test_timeout_is_capped_by_config() {
        let mut config = unrestricted_config();
        config.sandbox.timeout_secs = 1;

        let err = run_sandboxed("sleep 5", &config, 60_000).await.unwrap_err();
        assert!(err.to_string().contains("timed out after 1000ms"), "{err}");
    }

    #[cfg(not(target_os = "freebsd"))]
    #[tokio::test]
    async fn test_restricted_run_requires_jail_support() {
        let mut config = unrestricted_config();
        config.filesystem.restricted = true;

        let err = run_sandboxed("true", &config, 5_000).await.unwrap_err();
        let sandbox_err = err.downcast_ref::<crate::sandbox::SandboxError>();
        assert!(
            matches!(
                sandbox_err,
                Some(crate::sandbox::SandboxError::UnsupportedPlatform { .. })
            ),
            "{err}"
        );
    }

    #[test]
    fn test_sandbox_params_from_config() {
        let mut config = Config::default();
        config.filesystem.restricted = true;
        config.filesystem.deny_read = vec!["/nonexistent/secret".to_string()];
        config.filesystem.allow_write = vec!["build".to_string()];

        let params = sandbox_params("make", &config, Path::new("/nonexistent/project"));
        assert_eq!(params.command, "make");
        assert!(params.has_filesystem_restrictions);
        assert!(!params.has_network_restrictions);
        assert_eq!(
            params.write_config.unwrap().allow_only,
            vec![std::path::PathBuf::from("/nonexistent/project/build")]
        );
        assert_eq!(params.temp_dir, Some(config.temp_dir()));

        config.sandbox.enabled = false;
        let params = sandbox_params("make", &config, Path::new("/nonexistent/project"));
        assert!(!params.is_restricted());
    }

    #[test]
    fn test_format_output_truncates() {
        let output = std::process::Output {
            status: std::process::ExitStatus::from_raw(0),
            stdout: "a".repeat(20).into_bytes(),
            stderr: Vec::new(),
        };
        let (text, code) = format_output(&output, 8).unwrap();
        assert_eq!(code, 0);
        assert!(text.starts_with("aaaaaaaa\n\n[Output truncated, 20 bytes total]"));
    }

    #[test]
    fn test_truncate_utf8_basic() {
        assert_eq!(truncate_utf8("hello", 3), "hel");
        assert_eq!(truncate_utf8("hello", 10), "hello");
        assert_eq!(truncate_utf8("hello", 5), "hello");
    }

    #[test]
    fn test_truncate_utf8_multibyte() {
        // '€' is 3 bytes in UTF-8
        let s = "€€";
        assert_eq!(truncate_utf8(s, 3), "€");
        assert_eq!(truncate_utf8(s, 4), "€");
        assert_eq!(truncate_utf8(s, 6), "€€");
    }
}
