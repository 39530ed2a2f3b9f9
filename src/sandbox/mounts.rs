//! Mount planning for the jail root.
//!
//! The plan is an ordered list of [`MountOperation`]s. Mount order is the
//! list order; unmount order is derived once at the end from each entry's
//! [`MountPriority`] (highest first), and within a priority in reverse list
//! order. Because isolation mounts are always added after the fundamental
//! mounts they sit on, this is also the exact reverse of the mount order.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::cleanup::try_cleanup;
use super::error::{Result, SandboxError};
use super::policy::{ReadRestrictionConfig, WriteRestrictionConfig};
use super::quote::{quote, quote_args};
use super::random_suffix;

/// Directories every jail root gets, mounted over or not.
pub const ESSENTIAL_DIRS: &[&str] = &["/dev", "/tmp", "/var/tmp", "/etc", "/usr", "/bin"];

/// Host directories bound into every jail. Only `/dev` is writable.
pub const ESSENTIAL_BINDS: &[&str] = &["/dev", "/usr", "/bin", "/lib", "/libexec", "/etc"];

/// Extra read-only binds for vnet jails: `ifconfig` for bringing up `lo0`.
pub const NETWORK_TOOL_BINDS: &[&str] = &["/sbin"];

/// Teardown precedence. Higher priorities are unmounted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MountPriority {
    /// System directories, allowed write paths, the working directory.
    Fundamental,
    /// Read-only overrides and hides layered over fundamental mounts.
    Isolation,
    /// Bridge sockets added by the orchestrator.
    Bridge,
}

/// What gets mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// nullfs bind of a host directory or file.
    Host { path: PathBuf, read_only: bool },
    /// Empty tmpfs, used to hide a directory.
    EmptyTmpfs,
    /// Read-write bind of a bridge socket. The mount point is created by the
    /// mount command itself, since an earlier tmpfs may cover its parent.
    Socket { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOperation {
    pub source: MountSource,
    /// Absolute mount point inside the jail root.
    pub target: PathBuf,
    pub priority: MountPriority,
}

impl MountOperation {
    pub fn bind(host: &Path, target: PathBuf, read_only: bool, priority: MountPriority) -> Self {
        Self {
            source: MountSource::Host {
                path: host.to_path_buf(),
                read_only,
            },
            target,
            priority,
        }
    }

    pub fn tmpfs(target: PathBuf, priority: MountPriority) -> Self {
        Self {
            source: MountSource::EmptyTmpfs,
            target,
            priority,
        }
    }

    pub fn bridge_socket(host: &Path, target: PathBuf) -> Self {
        Self {
            source: MountSource::Socket {
                path: host.to_path_buf(),
            },
            target,
            priority: MountPriority::Bridge,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.source, MountSource::Host { read_only: true, .. })
    }

    pub fn mount_command(&self) -> String {
        let target = self.target.to_string_lossy();
        match &self.source {
            MountSource::Host { path, read_only } => {
                let path = path.to_string_lossy();
                if *read_only {
                    quote_args(&["mount_nullfs", "-o", "ro", &*path, &*target])
                } else {
                    quote_args(&["mount_nullfs", &*path, &*target])
                }
            }
            MountSource::EmptyTmpfs => quote_args(&["mount", "-t", "tmpfs", "tmpfs", &*target]),
            MountSource::Socket { path } => {
                let parent = self
                    .target
                    .parent()
                    .map(|p| p.to_string_lossy())
                    .unwrap_or_default();
                let quoted = quote(&target);
                format!(
                    "mkdir -p {} && (test -e {quoted} || : > {quoted}) && {}",
                    quote(&parent),
                    quote_args(&["mount_nullfs", &*path.to_string_lossy(), &*target])
                )
            }
        }
    }

    pub fn unmount_command(&self) -> String {
        quote_args(&["umount", "-f", &*self.target.to_string_lossy()])
    }
}

/// Ordered mounts for one jail root plus the scratch files they depend on.
#[derive(Debug, Clone, Default)]
pub struct MountPlan {
    operations: Vec<MountOperation>,
    scratch_files: Vec<PathBuf>,
}

impl MountPlan {
    pub fn push(&mut self, op: MountOperation) {
        debug!("Planned mount: {}", op.mount_command());
        self.operations.push(op);
    }

    pub fn operations(&self) -> &[MountOperation] {
        &self.operations
    }

    /// Operations in unmount order.
    pub fn unmount_order(&self) -> Vec<&MountOperation> {
        let mut indexed: Vec<(usize, &MountOperation)> = self.operations.iter().enumerate().collect();
        indexed.sort_by(|(ia, a), (ib, b)| b.priority.cmp(&a.priority).then(ib.cmp(ia)));
        indexed.into_iter().map(|(_, op)| op).collect()
    }

    pub fn mount_commands(&self) -> Vec<String> {
        self.operations.iter().map(MountOperation::mount_command).collect()
    }

    pub fn unmount_commands(&self) -> Vec<String> {
        self.unmount_order()
            .into_iter()
            .map(MountOperation::unmount_command)
            .collect()
    }

    /// Host files created for this plan, to be deleted after teardown.
    pub fn scratch_files(&self) -> &[PathBuf] {
        &self.scratch_files
    }
}

/// Map a host path to its location under the jail root.
pub fn jail_path(jail_root: &Path, host: &Path) -> PathBuf {
    jail_root.join(host.strip_prefix("/").unwrap_or(host))
}

fn is_device_path(path: &Path) -> bool {
    path.starts_with("/dev")
}

fn is_host_root(path: &Path) -> bool {
    path.parent().is_none() && path.has_root()
}

/// Computes mounts for a jail root and prepares the mount points on disk.
#[derive(Debug, Clone)]
pub struct MountPlanner<'a> {
    jail_root: &'a Path,
    cwd: &'a Path,
    scratch_dir: &'a Path,
    mandatory_deny: &'a [PathBuf],
    network_tools: bool,
}

impl<'a> MountPlanner<'a> {
    /// `scratch_dir` receives the empty files used to hide denied files;
    /// `mandatory_deny` is merged into every write policy's deny list.
    pub fn new(
        jail_root: &'a Path,
        cwd: &'a Path,
        scratch_dir: &'a Path,
        mandatory_deny: &'a [PathBuf],
    ) -> Self {
        Self {
            jail_root,
            cwd,
            scratch_dir,
            mandatory_deny,
            network_tools: false,
        }
    }

    /// Also bind [`NETWORK_TOOL_BINDS`], for jails with their own vnet stack.
    pub fn with_network_tools(mut self) -> Self {
        self.network_tools = true;
        self
    }

    /// Plan the mounts and create their mount points under the jail root.
    ///
    /// Scratch files created before a failure are removed again.
    pub fn plan(
        &self,
        read: Option<&ReadRestrictionConfig>,
        write: Option<&WriteRestrictionConfig>,
    ) -> Result<MountPlan> {
        let mut plan = MountPlan::default();
        match self.plan_into(&mut plan, read, write) {
            Ok(()) => Ok(plan),
            Err(e) => {
                for file in plan.scratch_files() {
                    try_cleanup("remove scratch file", || fs::remove_file(file));
                }
                Err(e)
            }
        }
    }

    fn plan_into(
        &self,
        plan: &mut MountPlan,
        read: Option<&ReadRestrictionConfig>,
        write: Option<&WriteRestrictionConfig>,
    ) -> Result<()> {
        for dir in ESSENTIAL_DIRS {
            ensure_dir(&jail_path(self.jail_root, Path::new(dir)))?;
        }

        for dir in ESSENTIAL_BINDS {
            let host = Path::new(dir);
            if !host.exists() {
                debug!("Skipping essential bind {}: not present on host", dir);
                continue;
            }
            self.bind(plan, host, host.is_dir(), *dir != "/dev", MountPriority::Fundamental)?;
        }

        if self.network_tools {
            for dir in NETWORK_TOOL_BINDS {
                let host = Path::new(dir);
                if host.is_dir() {
                    self.bind(plan, host, true, true, MountPriority::Fundamental)?;
                } else {
                    warn!("{} not present on host; loopback setup in the jail will fail", dir);
                }
            }
        }

        match write {
            Some(write) => self.plan_write_policy(plan, write)?,
            None => self.bind(plan, self.cwd, true, false, MountPriority::Fundamental)?,
        }

        if let Some(read) = read {
            self.plan_read_policy(plan, read)?;
        }

        Ok(())
    }

    fn plan_write_policy(&self, plan: &mut MountPlan, write: &WriteRestrictionConfig) -> Result<()> {
        for path in &write.allow_only {
            if is_device_path(path) {
                continue;
            }
            let Ok(meta) = fs::metadata(path) else {
                warn!("Skipping writable path {}: does not exist", path.display());
                continue;
            };
            let source = if meta.is_dir() {
                path.as_path()
            } else {
                match path.parent() {
                    Some(parent) => parent,
                    None => continue,
                }
            };
            self.bind(plan, source, true, false, MountPriority::Fundamental)?;
        }

        let mut seen = std::collections::HashSet::new();
        for path in write.deny_within_allow.iter().chain(self.mandatory_deny) {
            if is_device_path(path) || !seen.insert(path) {
                continue;
            }
            let Ok(meta) = fs::metadata(path) else {
                debug!("Skipping read-only override {}: does not exist", path.display());
                continue;
            };
            self.bind(plan, path, meta.is_dir(), true, MountPriority::Isolation)?;
        }

        Ok(())
    }

    fn plan_read_policy(&self, plan: &mut MountPlan, read: &ReadRestrictionConfig) -> Result<()> {
        for path in &read.deny_only {
            let Ok(meta) = fs::metadata(path) else {
                debug!("Skipping hidden path {}: does not exist", path.display());
                continue;
            };
            let target = jail_path(self.jail_root, path);
            if meta.is_dir() {
                ensure_dir(&target)?;
                plan.push(MountOperation::tmpfs(target, MountPriority::Isolation));
            } else {
                let empty = self.create_empty_file()?;
                ensure_file(&target)?;
                plan.push(MountOperation::bind(&empty, target, true, MountPriority::Isolation));
                plan.scratch_files.push(empty);
            }
        }
        Ok(())
    }

    /// Bind `host` at the same location under the jail root, creating the
    /// mount point first. The host root itself is never bound: it would land
    /// on the jail root and expose the whole host.
    fn bind(
        &self,
        plan: &mut MountPlan,
        host: &Path,
        is_dir: bool,
        read_only: bool,
        priority: MountPriority,
    ) -> Result<()> {
        if is_host_root(host) {
            warn!("Refusing to bind the host root into jail {}", self.jail_root.display());
            return Ok(());
        }
        let target = jail_path(self.jail_root, host);
        if is_dir {
            ensure_dir(&target)?;
        } else {
            ensure_file(&target)?;
        }
        plan.push(MountOperation::bind(host, target, read_only, priority));
        Ok(())
    }

    fn create_empty_file(&self) -> Result<PathBuf> {
        let path = self
            .scratch_dir
            .join(format!("jailwrap-empty-{}", random_suffix()));
        fs::File::create(&path)
            .map_err(|e| SandboxError::io(format!("failed to create {}", path.display()), e))?;
        Ok(path)
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| SandboxError::io(format!("failed to create directory {}", path.display()), e))
}

/// Make sure a file mount point exists, creating parents and an empty file.
fn ensure_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(|_| ())
        .map_err(|e| SandboxError::io(format!("failed to create mount point {}", path.display()), e))
}
