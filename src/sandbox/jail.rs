//! The jail(8) invocation and the program it runs.

use std::path::Path;

use super::quote::quote;

/// In-jail listener for HTTP-style proxy traffic.
pub const JAIL_HTTP_PROXY_PORT: u16 = 3128;
/// In-jail listener for SOCKS-style proxy traffic.
pub const JAIL_SOCKS_PROXY_PORT: u16 = 1080;

/// Brings up loopback in a fresh vnet jail. `/sbin` is bound into
/// network-isolated jails for this.
pub const LOOPBACK_UP: &str = "/sbin/ifconfig lo0 inet 127.0.0.1/8 up >/dev/null 2>&1";

/// Parameters every jail gets, whatever the policy.
pub const HARDENING_PARAMS: &[&str] = &[
    "persist=0",
    "allow.mount=0",
    "allow.set_hostname=0",
    "allow.sysvipc=0",
];

/// How the jail reaches the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JailNetwork {
    /// Private vnet stack; the bridges are the only way out.
    Isolated,
    /// Share the host's IPv4/IPv6 configuration.
    Inherit,
}

impl JailNetwork {
    pub fn params(self) -> &'static [&'static str] {
        match self {
            Self::Isolated => &["vnet", "allow.raw_sockets=1"],
            Self::Inherit => &["ip4=inherit", "ip6=inherit"],
        }
    }
}

/// Build the program that runs as the jail's first process when networking
/// goes through the bridges.
///
/// It brings up loopback, starts socat listeners on the fixed proxy ports
/// forwarding to the bridge sockets, kills them on exit, then `eval`s the
/// user's command.
pub fn build_inner_command(http_socket: &Path, socks_socket: &Path, user_command: &str) -> String {
    let http_target = format!("UNIX-CONNECT:{}", http_socket.display());
    let socks_target = format!("UNIX-CONNECT:{}", socks_socket.display());

    [
        LOOPBACK_UP.to_string(),
        format!(
            "socat TCP-LISTEN:{JAIL_HTTP_PROXY_PORT},fork,reuseaddr {} >/dev/null 2>&1 &",
            quote(&http_target)
        ),
        format!(
            "socat TCP-LISTEN:{JAIL_SOCKS_PROXY_PORT},fork,reuseaddr {} >/dev/null 2>&1 &",
            quote(&socks_target)
        ),
        r#"trap "kill %1 %2 2>/dev/null; exit" EXIT"#.to_string(),
        format!("eval {}", quote(user_command)),
    ]
    .join("\n")
}

/// Arguments for `jail -c`, ending with `command=sh -c <program>`.
#[derive(Debug, Clone)]
pub struct JailInvocation<'a> {
    pub name: &'a str,
    pub root: &'a Path,
    pub network: JailNetwork,
    /// `NAME=VALUE` pairs exported inside the jail.
    pub env: &'a [String],
    pub program: &'a str,
}

impl JailInvocation<'_> {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "jail".to_string(),
            "-c".to_string(),
            format!("name={}", self.name),
            format!("path={}", self.root.display()),
            format!("host.hostname={}", self.name),
        ];
        args.extend(self.network.params().iter().map(|p| p.to_string()));
        args.extend(HARDENING_PARAMS.iter().map(|p| p.to_string()));
        args.extend(self.env.iter().map(|var| format!("env.{var}")));
        // jail(8) treats everything after `command=` as the argv to run
        args.push("command=sh".to_string());
        args.push("-c".to_string());
        args.push(self.program.to_string());
        args
    }
}
