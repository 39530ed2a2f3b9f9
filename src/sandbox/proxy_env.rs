//! Environment variables that point tools at the in-jail proxy listeners.

/// Hosts that must bypass the proxy.
const NO_PROXY_HOSTS: &str = "localhost,127.0.0.1,::1,*.local,.local,169.254.0.0/16,10.0.0.0/8,172.16.0.0/12,192.168.0.0/16";

/// Build `NAME=VALUE` assignments for the given proxy ports.
///
/// The HTTP port backs every HTTP(S)-style variable; the SOCKS port backs the
/// catch-all `ALL_PROXY` and SSH. Either side may be absent.
pub fn generate_proxy_env_vars(http_port: Option<u16>, socks_port: Option<u16>) -> Vec<String> {
    let mut vars = vec!["SANDBOX_RUNTIME=1".to_string(), "TMPDIR=/tmp".to_string()];

    if http_port.is_none() && socks_port.is_none() {
        return vars;
    }

    vars.push(format!("NO_PROXY={NO_PROXY_HOSTS}"));
    vars.push(format!("no_proxy={NO_PROXY_HOSTS}"));

    if let Some(port) = http_port {
        let url = format!("http://localhost:{port}");
        for name in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
            vars.push(format!("{name}={url}"));
        }
    }

    if let Some(port) = socks_port {
        let url = format!("socks5h://localhost:{port}");
        for name in ["ALL_PROXY", "all_proxy", "FTP_PROXY", "ftp_proxy", "GRPC_PROXY", "grpc_proxy"] {
            vars.push(format!("{name}={url}"));
        }
        vars.push(format!("RSYNC_PROXY=localhost:{port}"));
        vars.push(format!(
            "GIT_SSH_COMMAND=ssh -o ProxyCommand='nc -X 5 -x localhost:{port} %h %p'"
        ));
    }

    vars
}
