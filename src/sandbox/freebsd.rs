//! Turns a command plus restriction flags into a self-contained wrapper
//! script that mounts a jail root, runs the command in a jail and tears the
//! root down again.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::bridge::BridgeContext;
use super::cleanup::try_cleanup;
use super::detect::{find_tool, RIPGREP_TOOL};
use super::error::{Result, SandboxError};
use super::jail::{
    build_inner_command, JailInvocation, JailNetwork, JAIL_HTTP_PROXY_PORT, JAIL_SOCKS_PROXY_PORT,
};
use super::mounts::{jail_path, MountOperation, MountPlan, MountPlanner};
use super::policy::{
    mandatory_deny_paths, ReadRestrictionConfig, WriteRestrictionConfig,
    DEFAULT_MANDATORY_DENY_SEARCH_DEPTH,
};
use super::proxy_env::generate_proxy_env_vars;
use super::quote::{quote, quote_args};
use super::random_suffix;

/// Everything needed to wrap one command.
#[derive(Debug, Clone, Default)]
pub struct SandboxParams {
    pub command: String,
    pub has_network_restrictions: bool,
    pub has_filesystem_restrictions: bool,

    /// Bridge sockets; required when `has_network_restrictions` is set.
    pub http_socket_path: Option<PathBuf>,
    pub socks_socket_path: Option<PathBuf>,

    /// Host proxy ports behind the bridges. Informational.
    pub http_proxy_port: Option<u16>,
    pub socks_proxy_port: Option<u16>,

    pub read_config: Option<ReadRestrictionConfig>,
    pub write_config: Option<WriteRestrictionConfig>,

    /// Working directory bound into the jail. Defaults to the process cwd.
    pub cwd: Option<PathBuf>,

    /// Where jail roots and scratch files go. Defaults to the system temp dir.
    pub temp_dir: Option<PathBuf>,

    /// Overrides the ripgrep-based mandatory deny scan.
    pub mandatory_deny: Option<Vec<PathBuf>>,
}

impl SandboxParams {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Route networking through running bridges.
    pub fn with_bridges(mut self, bridges: &BridgeContext) -> Self {
        self.has_network_restrictions = true;
        self.http_socket_path = Some(bridges.http.socket_path.clone());
        self.socks_socket_path = Some(bridges.socks.socket_path.clone());
        self.http_proxy_port = Some(bridges.http.port);
        self.socks_proxy_port = Some(bridges.socks.port);
        self
    }

    pub fn is_restricted(&self) -> bool {
        self.has_network_restrictions || self.has_filesystem_restrictions
    }

    fn bridge_sockets(&self) -> Result<Option<(&Path, &Path)>> {
        if !self.has_network_restrictions {
            return Ok(None);
        }
        match (&self.http_socket_path, &self.socks_socket_path) {
            (Some(http), Some(socks)) => Ok(Some((http.as_path(), socks.as_path()))),
            _ => Err(SandboxError::MissingBridgeConfig),
        }
    }
}

/// Name and root directory of one jail. Both are unique per invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailIdentity {
    pub name: String,
    pub root: PathBuf,
}

impl JailIdentity {
    pub fn generate(temp_dir: &Path) -> Self {
        let name = format!("jailwrap-{}", random_suffix());
        let root = temp_dir.join(&name);
        Self { name, root }
    }
}

/// A constructed sandbox: the jail root exists on disk, nothing is mounted.
#[derive(Debug, Clone)]
pub struct PreparedSandbox {
    pub identity: JailIdentity,
    pub network: JailNetwork,
    pub plan: MountPlan,
    pub jail_args: Vec<String>,
    /// Newline-separated wrapper program.
    pub script: String,
}

impl PreparedSandbox {
    /// The wrapper as a single command line: `sh -c '<script>'`.
    pub fn wrapped_command(&self) -> String {
        quote_args(&["sh", "-c", self.script.as_str()])
    }
}

/// Build the jail root and wrapper for `params`.
///
/// Returns `None` for unrestricted params. On error the partially built
/// jail root is removed again.
pub fn prepare_sandbox(params: &SandboxParams) -> Result<Option<PreparedSandbox>> {
    if !params.is_restricted() {
        return Ok(None);
    }

    let sockets = params.bridge_sockets()?;

    let cwd = match &params.cwd {
        Some(cwd) => cwd.clone(),
        None => std::env::current_dir()
            .map_err(|e| SandboxError::io("failed to read current directory", e))?,
    };
    let temp_dir = params.temp_dir.clone().unwrap_or_else(std::env::temp_dir);
    let identity = JailIdentity::generate(&temp_dir);
    debug!("Preparing jail {} at {}", identity.name, identity.root.display());

    match build(params, sockets, &cwd, &temp_dir, identity.clone()) {
        Ok(prepared) => Ok(Some(prepared)),
        Err(e) => {
            try_cleanup("remove partial jail root", || std::fs::remove_dir_all(&identity.root));
            Err(e)
        }
    }
}

fn build(
    params: &SandboxParams,
    sockets: Option<(&Path, &Path)>,
    cwd: &Path,
    temp_dir: &Path,
    identity: JailIdentity,
) -> Result<PreparedSandbox> {
    let (read, write) = if params.has_filesystem_restrictions {
        (params.read_config.as_ref(), params.write_config.as_ref())
    } else {
        (None, None)
    };

    let mandatory_deny = match (&params.mandatory_deny, write) {
        (Some(paths), _) => paths.clone(),
        (None, Some(_)) => {
            let rg = find_tool(RIPGREP_TOOL);
            mandatory_deny_paths(cwd, rg.as_deref(), DEFAULT_MANDATORY_DENY_SEARCH_DEPTH)
        }
        (None, None) => Vec::new(),
    };

    let mut planner = MountPlanner::new(&identity.root, cwd, temp_dir, &mandatory_deny);
    if sockets.is_some() {
        planner = planner.with_network_tools();
    }
    let mut plan = planner.plan(read, write)?;

    let (network, env, program) = match sockets {
        Some((http, socks)) => {
            for socket in [http, socks] {
                plan.push(MountOperation::bridge_socket(
                    socket,
                    jail_path(&identity.root, socket),
                ));
            }
            debug!(
                "Bridging jail {} to host proxy ports {:?}/{:?}",
                identity.name, params.http_proxy_port, params.socks_proxy_port
            );
            (
                JailNetwork::Isolated,
                generate_proxy_env_vars(Some(JAIL_HTTP_PROXY_PORT), Some(JAIL_SOCKS_PROXY_PORT)),
                build_inner_command(http, socks, &params.command),
            )
        }
        None => (JailNetwork::Inherit, Vec::new(), params.command.clone()),
    };

    let jail_args = JailInvocation {
        name: &identity.name,
        root: &identity.root,
        network,
        env: &env,
        program: &program,
    }
    .args();

    let script = wrapper_script(&plan, &jail_args, &identity.root);

    info!(
        "Prepared jail {} ({} mounts, network {:?})",
        identity.name,
        plan.operations().len(),
        network
    );

    Ok(PreparedSandbox {
        identity,
        network,
        plan,
        jail_args,
        script,
    })
}

/// Setup mounts and the jail are `&&`-chained; every teardown line runs
/// regardless of how far setup got, and the script exits with the status
/// of the first failing setup step or of the jail.
fn wrapper_script(plan: &MountPlan, jail_args: &[String], root: &Path) -> String {
    let mut setup = plan.mount_commands();
    setup.push(quote_args(jail_args));

    let mut lines = vec![setup.join(" && "), "EXIT_CODE=$?".to_string()];
    lines.extend(
        plan.unmount_commands()
            .into_iter()
            .map(|cmd| format!("{cmd} 2>/dev/null")),
    );
    if !plan.scratch_files().is_empty() {
        let scratch: Vec<_> = plan
            .scratch_files()
            .iter()
            .map(|p| p.to_string_lossy())
            .collect();
        lines.push(format!("rm -f {} 2>/dev/null", quote_args(&scratch)));
    }
    // -x keeps rm on the root's own filesystem if an unmount failed
    lines.push(format!(
        "rm -rf -x {} 2>/dev/null",
        quote(&root.to_string_lossy())
    ));
    lines.push("exit $EXIT_CODE".to_string());
    lines.join("\n")
}

/// Wrap `params.command` for execution inside a jail.
///
/// Unrestricted params come back unchanged.
pub fn wrap_command_with_sandbox_freebsd(params: &SandboxParams) -> Result<String> {
    Ok(match prepare_sandbox(params)? {
        Some(prepared) => prepared.wrapped_command(),
        None => params.command.clone(),
    })
}
