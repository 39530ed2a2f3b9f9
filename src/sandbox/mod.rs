//! FreeBSD jail sandbox: kernel-enforced isolation for shell commands.
//!
//! A command is wrapped into a self-contained shell script that:
//! 1. nullfs-binds an allow-listed view of the host into a fresh jail root
//!    (tmpfs over denied directories, empty files over denied files),
//! 2. runs the command as the jail's only process, with either the host's
//!    network or an isolated vnet stack whose only way out is a pair of
//!    socat bridges to the host's HTTP and SOCKS proxies,
//! 3. unmounts everything in reverse order, removes the root and exits with
//!    the jailed command's status.
//!
//! Construction (bridges, directory setup, script assembly) happens here;
//! running the script is the caller's business, or [`run_sandboxed`]'s.

pub mod bridge;
pub mod cleanup;
pub mod detect;
pub mod error;
pub mod executor;
pub mod freebsd;
pub mod jail;
pub mod mounts;
pub mod policy;
pub mod proxy_env;
pub mod quote;

pub use bridge::{start_bridges, Bridge, BridgeContext, BridgeOptions};
pub use cleanup::try_cleanup;
pub use detect::{
    detect_capabilities, has_freebsd_sandbox_dependencies, Platform, SandboxCapabilities,
};
pub use error::SandboxError;
pub use executor::run_sandboxed;
pub use freebsd::{
    prepare_sandbox, wrap_command_with_sandbox_freebsd, JailIdentity, PreparedSandbox,
    SandboxParams,
};
pub use jail::{build_inner_command, JailNetwork};
pub use mounts::{MountOperation, MountPlan, MountPlanner, MountPriority, MountSource};
pub use policy::{ReadRestrictionConfig, WriteRestrictionConfig};
pub use proxy_env::generate_proxy_env_vars;

/// 16 lowercase hex characters, used for socket, jail and scratch-file names.
pub(crate) fn random_suffix() -> String {
    let mut hex = uuid::Uuid::new_v4().simple().to_string();
    hex.truncate(16);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_suffix_shape() {
        let a = random_suffix();
        let b = random_suffix();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }
}
