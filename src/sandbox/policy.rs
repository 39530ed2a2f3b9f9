use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::config::FilesystemConfig;

/// Read restriction: everything is readable except `deny_only`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRestrictionConfig {
    /// Paths hidden from the jailed process.
    pub deny_only: Vec<PathBuf>,
}

/// Write restriction: nothing is writable except `allow_only`, minus `deny_within_allow`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRestrictionConfig {
    /// Paths bound read-write into the jail.
    pub allow_only: Vec<PathBuf>,

    /// Subpaths of `allow_only` that stay read-only.
    pub deny_within_allow: Vec<PathBuf>,
}

/// Files that can execute code or redirect tooling when written, so they are
/// never writable even inside an allowed directory.
pub const DANGEROUS_FILES: &[&str] = &[
    ".gitconfig",
    ".gitmodules",
    ".bashrc",
    ".bash_profile",
    ".zshrc",
    ".zprofile",
    ".profile",
    ".ripgreprc",
    ".mcp.json",
];

/// Directories with the same property. `.git` is handled separately: only
/// its hooks and config are protected so commits keep working.
pub const DANGEROUS_DIRECTORIES: &[&str] = &[
    ".vscode",
    ".idea",
    ".claude/commands",
    ".claude/agents",
];

/// Search depth for nested dangerous files.
pub const DEFAULT_MANDATORY_DENY_SEARCH_DEPTH: u32 = 3;

pub(crate) fn dirs_home() -> PathBuf {
    directories::BaseDirs::new()
        .map(|b| b.home_dir().to_path_buf())
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
        .unwrap_or_else(|| {
            warn!("Cannot determine home directory, '~' paths will not resolve");
            PathBuf::from("/nonexistent")
        })
}

/// Lexical path normalization: collapse `.`, `..`, and redundant separators
/// without touching the filesystem.
///
/// Root-stable for absolute paths: `PathBuf::pop()` on root `/` is a no-op,
/// so repeated `..` cannot escape above root.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            other => result.push(other),
        }
    }
    result
}

/// Turn a user-supplied path into the absolute form used for mount targets.
///
/// Expands `~`, resolves relative paths against `cwd`, follows symlinks when
/// the path exists and falls back to lexical normalization when it doesn't.
pub fn normalize_path_for_sandbox(raw: &str, cwd: &Path) -> PathBuf {
    let expanded =
        shellexpand::tilde_with_context(raw, || Some(dirs_home().to_string_lossy().into_owned()));
    let candidate = PathBuf::from(expanded.as_ref());
    let absolute = if candidate.is_absolute() {
        candidate
    } else {
        cwd.join(candidate)
    };
    absolute
        .canonicalize()
        .unwrap_or_else(|_| lexical_normalize(&absolute))
}

/// Paths under `cwd` that must stay read-only whatever the write policy says.
///
/// The top level of `cwd` is always checked. When `rg` is given, nested
/// occurrences up to `max_depth` are located with `rg --files --hidden`; a
/// failing search only loses the nested matches.
pub fn mandatory_deny_paths(cwd: &Path, rg: Option<&Path>, max_depth: u32) -> Vec<PathBuf> {
    let mut paths = BTreeSet::new();

    for name in DANGEROUS_FILES.iter().chain(DANGEROUS_DIRECTORIES) {
        paths.insert(cwd.join(name));
    }
    paths.insert(cwd.join(".git/hooks"));
    paths.insert(cwd.join(".git/config"));

    if let Some(rg) = rg {
        match find_nested_dangerous_paths(cwd, rg, max_depth) {
            Ok(nested) => paths.extend(nested),
            Err(e) => warn!("Nested dangerous-file search failed in {}: {}", cwd.display(), e),
        }
    }

    paths.into_iter().collect()
}

fn find_nested_dangerous_paths(cwd: &Path, rg: &Path, max_depth: u32) -> anyhow::Result<Vec<PathBuf>> {
    let mut cmd = std::process::Command::new(rg);
    cmd.current_dir(cwd)
        .arg("--files")
        .arg("--hidden")
        .arg("--no-ignore")
        .arg("--max-depth")
        .arg(max_depth.to_string());
    for name in DANGEROUS_FILES {
        cmd.arg("--glob").arg(format!("**/{name}"));
    }
    for dir in DANGEROUS_DIRECTORIES.iter().chain(&[".git"]) {
        cmd.arg("--glob").arg(format!("**/{dir}/**"));
    }

    let output = cmd.output()?;
    // rg exits 1 when nothing matched
    if !output.status.success() && output.status.code() != Some(1) {
        anyhow::bail!(
            "rg exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let found: BTreeSet<PathBuf> = stdout
        .lines()
        .filter_map(|line| classify_dangerous(Path::new(line)))
        .map(|rel| cwd.join(rel))
        .collect();
    debug!("Found {} nested dangerous paths under {}", found.len(), cwd.display());
    Ok(found.into_iter().collect())
}

/// Map a file listed by ripgrep to the path that has to be protected.
fn classify_dangerous(rel: &Path) -> Option<PathBuf> {
    let rel = rel.strip_prefix("./").unwrap_or(rel);
    let parts: Vec<&str> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();

    for (i, part) in parts.iter().enumerate() {
        if *part == ".git" {
            return match parts.get(i + 1) {
                Some(&"hooks") => Some(parts[..=i + 1].iter().collect()),
                Some(&"config") if i + 2 == parts.len() => Some(parts[..=i + 1].iter().collect()),
                _ => None,
            };
        }
        for dir in DANGEROUS_DIRECTORIES {
            let dir_parts: Vec<&str> = dir.split('/').collect();
            if parts[i..].starts_with(&dir_parts) && parts.len() > i + dir_parts.len() {
                return Some(parts[..i + dir_parts.len()].iter().collect());
            }
        }
    }

    let file_name = parts.last()?;
    DANGEROUS_FILES
        .contains(file_name)
        .then(|| rel.to_path_buf())
}

/// Build read/write restrictions from the `[filesystem]` config section.
///
/// Returns `(None, None)` when filesystem restriction is disabled.
pub fn build_restrictions(
    config: &FilesystemConfig,
    cwd: &Path,
) -> (Option<ReadRestrictionConfig>, Option<WriteRestrictionConfig>) {
    if !config.restricted {
        return (None, None);
    }

    let normalize_all = |raw: &[String]| -> Vec<PathBuf> {
        raw.iter()
            .filter_map(|p| {
                let normalized = normalize_path_for_sandbox(p, cwd);
                if normalized == Path::new("/") {
                    warn!("Ignoring filesystem entry {:?}: the root directory cannot be bound", p);
                    None
                } else {
                    Some(normalized)
                }
            })
            .collect()
    };

    let read = ReadRestrictionConfig {
        deny_only: normalize_all(&config.deny_read),
    };

    let write = if config.allow_write.is_empty() && config.deny_write.is_empty() {
        None
    } else {
        Some(WriteRestrictionConfig {
            allow_only: normalize_all(&config.allow_write),
            deny_within_allow: normalize_all(&config.deny_write),
        })
    };

    (Some(read), write)
}
