use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};

use super::error::SandboxError;

/// Host tools the jail sandbox shells out to.
pub const JAIL_TOOL: &str = "jail";
pub const SOCAT_TOOL: &str = "socat";
pub const RIPGREP_TOOL: &str = "rg";

const REQUIRED_TOOLS: [&str; 3] = [JAIL_TOOL, SOCAT_TOOL, RIPGREP_TOOL];

/// Operating system families, as far as sandboxing cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    FreeBsd,
    Linux,
    MacOs,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    pub fn from_os(os: &str) -> Self {
        match os {
            "freebsd" => Self::FreeBsd,
            "linux" => Self::Linux,
            "macos" => Self::MacOs,
            _ => Self::Other,
        }
    }

    pub fn supports_jails(self) -> bool {
        self == Self::FreeBsd
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::FreeBsd => "FreeBSD",
            Self::Linux => "Linux",
            Self::MacOs => "macOS",
            Self::Other => std::env::consts::OS,
        };
        f.write_str(name)
    }
}

/// Process-wide memo for a boolean probe.
///
/// Holds an explicit "not yet computed" state so a cached `false` is
/// distinguishable from "never asked".
pub struct ProbeCache(AtomicU8);

const UNKNOWN: u8 = 0;
const ABSENT: u8 = 1;
const PRESENT: u8 = 2;

impl ProbeCache {
    pub const fn new() -> Self {
        Self(AtomicU8::new(UNKNOWN))
    }

    /// Return the cached answer, computing it with `probe` on first use.
    pub fn get_or_probe(&self, probe: impl FnOnce() -> bool) -> bool {
        match self.0.load(Ordering::Acquire) {
            PRESENT => true,
            ABSENT => false,
            _ => {
                let value = if probe() { PRESENT } else { ABSENT };
                // A racing first call may win; both computed the same inputs.
                match self
                    .0
                    .compare_exchange(UNKNOWN, value, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => value == PRESENT,
                    Err(existing) => existing == PRESENT,
                }
            }
        }
    }

    pub fn reset(&self) {
        self.0.store(UNKNOWN, Ordering::Release);
    }
}

impl Default for ProbeCache {
    fn default() -> Self {
        Self::new()
    }
}

static DEPENDENCY_CACHE: ProbeCache = ProbeCache::new();

/// Whether `jail`, `socat` and `rg` are all on `PATH`.
///
/// Probed once per process; later calls return the first answer even if the
/// host's tools change.
pub fn has_freebsd_sandbox_dependencies() -> bool {
    DEPENDENCY_CACHE.get_or_probe(|| {
        let missing = missing_tools();
        if !missing.is_empty() {
            tracing::warn!("Jail sandbox unavailable, missing tools: {}", missing.join(", "));
        }
        missing.is_empty()
    })
}

/// Forget the memoized dependency probe. Test isolation only.
#[doc(hidden)]
pub fn reset_dependency_cache_for_tests() {
    DEPENDENCY_CACHE.reset();
}

fn missing_tools() -> Vec<&'static str> {
    REQUIRED_TOOLS
        .iter()
        .copied()
        .filter(|tool| which::which(tool).is_err())
        .collect()
}

/// Locate a host tool on `PATH`.
pub fn find_tool(tool: &str) -> Option<PathBuf> {
    which::which(tool).ok()
}

/// Detected sandbox capabilities of the current host.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxCapabilities {
    pub platform: Platform,

    /// Resolved locations of the required tools, `None` when missing.
    pub jail: Option<PathBuf>,
    pub socat: Option<PathBuf>,
    pub ripgrep: Option<PathBuf>,
}

/// Probe the current host. Not memoized; used for status reporting.
pub fn detect_capabilities() -> SandboxCapabilities {
    SandboxCapabilities {
        platform: Platform::current(),
        jail: find_tool(JAIL_TOOL),
        socat: find_tool(SOCAT_TOOL),
        ripgrep: find_tool(RIPGREP_TOOL),
    }
}

impl SandboxCapabilities {
    pub fn is_available(&self) -> bool {
        self.platform.supports_jails()
            && self.jail.is_some()
            && self.socat.is_some()
            && self.ripgrep.is_some()
    }

    /// Fail with the reason sandboxing cannot be used here.
    pub fn ensure_available(&self) -> Result<(), SandboxError> {
        if !self.platform.supports_jails() {
            return Err(SandboxError::UnsupportedPlatform {
                platform: self.platform.to_string(),
            });
        }
        let missing: Vec<&str> = [
            (JAIL_TOOL, &self.jail),
            (SOCAT_TOOL, &self.socat),
            (RIPGREP_TOOL, &self.ripgrep),
        ]
        .into_iter()
        .filter(|(_, path)| path.is_none())
        .map(|(name, _)| name)
        .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::DependencyUnavailable {
                missing: missing.join(", "),
            })
        }
    }

    /// Human-readable status lines for `jailwrap check`.
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();

        if self.platform.supports_jails() {
            lines.push(format!("  Platform:  {:<24} ok", self.platform));
        } else {
            lines.push(format!("  Platform:  {:<24} --", self.platform));
        }

        for (label, found) in [
            ("jail", &self.jail),
            ("socat", &self.socat),
            ("rg", &self.ripgrep),
        ] {
            match found {
                Some(path) => lines.push(format!("  {:<10} {:<24} ok", format!("{label}:"), path.display())),
                None => lines.push(format!("  {:<10} {:<24} --", format!("{label}:"), "not found")),
            }
        }

        lines.push(format!(
            "  Sandbox:   {}",
            if self.is_available() { "available" } else { "unavailable" }
        ));

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_platform_from_os() {
        assert_eq!(Platform::from_os("freebsd"), Platform::FreeBsd);
        assert_eq!(Platform::from_os("linux"), Platform::Linux);
        assert_eq!(Platform::from_os("macos"), Platform::MacOs);
        assert_eq!(Platform::from_os("openbsd"), Platform::Other);
        assert!(Platform::FreeBsd.supports_jails());
        assert!(!Platform::Linux.supports_jails());
    }

    #[test]
    fn test_probe_cache_memoizes_true_and_false() {
        let calls = AtomicUsize::new(0);
        let cache = ProbeCache::new();

        let probe = |answer: bool| {
            calls.fetch_add(1, Ordering::SeqCst);
            answer
        };

        assert!(!cache.get_or_probe(|| probe(false)));
        // Tool availability "changes" but the cached answer wins
        assert!(!cache.get_or_probe(|| probe(true)));
        assert!(!cache.get_or_probe(|| probe(true)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.reset();
        assert!(cache.get_or_probe(|| probe(true)));
        assert!(cache.get_or_probe(|| probe(false)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Serializes tests that reset the process-wide dependency cache.
    static CACHE_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn test_dependency_check_is_memoized_until_reset() {
        let _guard = CACHE_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        reset_dependency_cache_for_tests();
        let first = has_freebsd_sandbox_dependencies();
        assert_eq!(first, missing_tools().is_empty());
        let expected = if first { PRESENT } else { ABSENT };
        assert_eq!(DEPENDENCY_CACHE.0.load(Ordering::Acquire), expected);
        for _ in 0..3 {
            assert_eq!(has_freebsd_sandbox_dependencies(), first);
        }

        reset_dependency_cache_for_tests();
        assert_eq!(has_freebsd_sandbox_dependencies(), first);
    }

    #[test]
    fn test_ensure_available_reports_missing_tools() {
        let caps = SandboxCapabilities {
            platform: Platform::FreeBsd,
            jail: Some(PathBuf::from("/usr/sbin/jail")),
            socat: None,
            ripgrep: None,
        };
        assert!(!caps.is_available());
        match caps.ensure_available() {
            Err(SandboxError::DependencyUnavailable { missing }) => assert_eq!(missing, "socat, rg"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_ensure_available_rejects_other_platforms() {
        let caps = SandboxCapabilities {
            platform: Platform::Linux,
            jail: Some(PathBuf::from("/usr/sbin/jail")),
            socat: Some(PathBuf::from("/usr/bin/socat")),
            ripgrep: Some(PathBuf::from("/usr/bin/rg")),
        };
        assert!(matches!(
            caps.ensure_available(),
            Err(SandboxError::UnsupportedPlatform { .. })
        ));
    }

    #[test]
    fn test_status_lines() {
        let caps = detect_capabilities();
        let lines = caps.status_lines();
        assert_eq!(lines.len(), 5);
        assert!(lines.last().unwrap().contains("Sandbox:"));
    }
}
